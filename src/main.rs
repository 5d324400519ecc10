//! llamadrive - streaming chat generation over llama.cpp
//!
//! Single-shot: `llamadrive --model m.gguf "Say hi"`.
//! Interactive: `llamadrive --model m.gguf --interactive --template chatml`.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llamadrive::inference::{
    EngineError, GenerationSession, GenerationSummary, LlamaCppBackend, SessionError, StreamChunk,
};
use llamadrive::storage::{self, StorageError};
use llamadrive::types::{ChatMessage, GenerationConfig, PredictLimit, TemplateMode};

#[derive(Parser, Debug)]
#[command(name = "llamadrive")]
#[command(version)]
#[command(about = "Stream chat completions from a local GGUF model")]
struct Cli {
    /// Path to the GGUF model file
    #[arg(short, long, value_name = "PATH")]
    model: PathBuf,

    /// JSON configuration file (defaults to the one in the data directory)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// System message placed before the conversation
    #[arg(short, long)]
    system: Option<String>,

    /// Role template used to format the transcript
    #[arg(long, value_enum)]
    template: Option<TemplateArg>,

    /// Tokens to generate (-1 = unlimited, -2 = until the context is full)
    #[arg(short = 'n', long, allow_hyphen_values = true)]
    n_predict: Option<i64>,

    /// Context size in tokens
    #[arg(long)]
    ctx_size: Option<u32>,

    /// Sampling temperature (<= 0 samples greedily)
    #[arg(long)]
    temp: Option<f32>,

    /// Layers to offload to the GPU
    #[arg(long)]
    gpu_layers: Option<u32>,

    /// Stop generating when this text appears (repeatable)
    #[arg(short = 'r', long = "antiprompt", value_name = "TEXT")]
    antiprompts: Vec<String>,

    /// Chat on stdin until EOF
    #[arg(short, long)]
    interactive: bool,

    /// Prompt for single-shot mode (read from stdin when omitted)
    prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TemplateArg {
    Plain,
    Instruct,
    Chatml,
}

impl From<TemplateArg> for TemplateMode {
    fn from(arg: TemplateArg) -> Self {
        match arg {
            TemplateArg::Plain => TemplateMode::Plain,
            TemplateArg::Instruct => TemplateMode::Instruct,
            TemplateArg::Chatml => TemplateMode::ChatMl,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid --n-predict value {0}")]
    PredictLimit(i64),
    #[error("Generation thread panicked")]
    Worker,
}

fn main() -> ExitCode {
    // Logs go to stderr so stdout carries only generated text
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("llamadrive=info")),
        )
        .init();

    info!("Starting llamadrive v{}", env!("CARGO_PKG_VERSION"));

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let config = build_config(&cli)?;

    let backend = LlamaCppBackend::new(config.model.numa)?;
    let session = Arc::new(GenerationSession::new(backend));
    let context = config.context.clone();
    session.init_model(config)?;
    session.init_context(context)?;

    let mut transcript = Vec::new();
    if let Some(system) = &cli.system {
        transcript.push(ChatMessage::system(system.as_str()));
    }

    let result = if cli.interactive {
        chat(&session, transcript)
    } else {
        let prompt = match &cli.prompt {
            Some(prompt) => prompt.clone(),
            None => io::read_to_string(io::stdin())?,
        };
        transcript.push(ChatMessage::user(prompt));
        stream_reply(&session, transcript).map(|_| ())
    };

    session.cleanup();
    result
}

/// Stored configuration with command-line overrides applied
fn build_config(cli: &Cli) -> Result<GenerationConfig, CliError> {
    let mut config = match &cli.config {
        Some(path) => storage::load_config(path)?,
        None => match storage::default_config_path() {
            Ok(path) => storage::load_config_or_default(&path),
            Err(e) => {
                tracing::warn!("No data directory, using default config: {}", e);
                GenerationConfig::default()
            }
        },
    };

    config.model.path = cli.model.clone();
    if let Some(template) = cli.template {
        config.prompt.template = template.into();
    }
    if let Some(n) = cli.n_predict {
        config.prompt.n_predict = match n {
            -1 => PredictLimit::Unlimited,
            -2 => PredictLimit::UntilContextFull,
            n => PredictLimit::Tokens(u32::try_from(n).map_err(|_| CliError::PredictLimit(n))?),
        };
    }
    if let Some(n_ctx) = cli.ctx_size {
        config.context.n_ctx = n_ctx;
    }
    if let Some(temp) = cli.temp {
        config.sampling.temp = temp;
    }
    if let Some(layers) = cli.gpu_layers {
        config.model.n_gpu_layers = Some(layers);
    }
    if !cli.antiprompts.is_empty() {
        config.prompt.antiprompts = cli.antiprompts.clone();
    }
    config.prompt.interactive |= cli.interactive;
    Ok(config)
}

/// Generate a reply, printing chunks as they arrive. Returns the full text.
fn stream_reply(
    session: &Arc<GenerationSession<LlamaCppBackend>>,
    transcript: Vec<ChatMessage>,
) -> Result<String, CliError> {
    let (rx, handle) = session.generate_stream(transcript);

    let mut stdout = io::stdout().lock();
    let mut reply = String::new();
    for chunk in rx {
        match chunk {
            StreamChunk::Text(text) => {
                stdout.write_all(text.as_bytes())?;
                stdout.flush()?;
                reply.push_str(&text);
            }
            StreamChunk::Done => break,
        }
    }
    writeln!(stdout)?;

    let summary: GenerationSummary = handle.join().map_err(|_| CliError::Worker)??;
    info!(
        "{:?}: {} prompt tokens, {} generated ({:.1} tokens/s)",
        summary.stop_reason,
        summary.prompt_tokens,
        summary.generated_tokens,
        summary.tokens_per_second()
    );
    Ok(reply)
}

/// Read user turns from stdin, keeping the whole conversation as context
fn chat(
    session: &Arc<GenerationSession<LlamaCppBackend>>,
    mut transcript: Vec<ChatMessage>,
) -> Result<(), CliError> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        io::stderr().flush()?;
        let Some(line) = lines.next().transpose()? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        transcript.push(ChatMessage::user(line));
        let reply = stream_reply(session, transcript.clone())?;
        transcript.push(ChatMessage::assistant(reply.trim()));
    }
    Ok(())
}
