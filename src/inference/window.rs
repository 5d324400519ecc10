//! Context window management
//!
//! Admits the formatted prompt into a bounded context and reclaims cache space
//! when the resident token count would overflow it, either by discarding half of
//! the shiftable region (context shift) or by remapping positions in groups
//! (self-extend).

use crate::inference::backend::{EngineError, KvCache, Token};
use crate::types::{ContextParams, PredictLimit, TemplateMode};

/// Headroom kept free below capacity for the shifting algorithm
pub const CONTEXT_RESERVE: usize = 4;

/// Per-call counters of the generation loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextState {
    /// Tokens resident in the KV cache (`n_past`)
    pub n_past: i32,
    /// Prompt tokens already moved into decode batches (`n_consumed`)
    pub n_consumed: usize,
    /// Remaining generation budget (`n_remain`); negative sentinels never hit zero
    pub n_remain: i64,
    /// Self-extend cursor (`ga_i`)
    pub ga_i: i32,
}

impl ContextState {
    pub fn new(limit: PredictLimit) -> Self {
        Self {
            n_past: 0,
            n_consumed: 0,
            n_remain: limit.initial_budget(),
            ga_i: 0,
        }
    }
}

/// Prompt accepted into the window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedTokens {
    pub tokens: Vec<Token>,
    /// Leading tokens preserved by context shifting
    pub n_keep: usize,
    /// Tokens dropped from the front to fit
    pub truncated: usize,
}

/// Admit a formatted prompt.
///
/// Prepends `bos` when given, drops the oldest content tokens (never the BOS)
/// until the sequence fits in `n_ctx - CONTEXT_RESERVE`, and substitutes a lone
/// BOS for an empty sequence.
pub fn admit(
    mut tokens: Vec<Token>,
    n_ctx: usize,
    bos: Token,
    add_bos: bool,
    configured_keep: i32,
    template: TemplateMode,
) -> Result<AdmittedTokens, usize> {
    if n_ctx <= CONTEXT_RESERVE {
        return Err(n_ctx);
    }
    let max_len = n_ctx - CONTEXT_RESERVE;

    if add_bos {
        tokens.insert(0, bos);
    }

    let mut truncated = 0;
    if tokens.len() > max_len {
        truncated = tokens.len() - max_len;
        let start = usize::from(add_bos);
        tokens.drain(start..start + truncated);
        tracing::warn!(
            "Prompt truncated: dropped {} oldest tokens to fit context of {}",
            truncated,
            n_ctx
        );
    }

    if tokens.is_empty() {
        tracing::debug!("Empty prompt, substituting BOS");
        tokens.push(bos);
    }

    let n_keep = resolve_keep(configured_keep, tokens.len(), template, add_bos);
    Ok(AdmittedTokens {
        tokens,
        n_keep,
        truncated,
    })
}

/// Number of leading tokens preserved across context shifts.
///
/// Templated modes always keep the whole primer; otherwise the configured
/// count plus the BOS token.
pub fn resolve_keep(configured: i32, input_len: usize, template: TemplateMode, add_bos: bool) -> usize {
    match usize::try_from(configured) {
        Ok(keep) if keep <= input_len && !template.is_templated() => {
            (keep + usize::from(add_bos)).min(input_len)
        }
        _ => input_len,
    }
}

/// Strategy chosen by the group-attention factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimStrategy {
    ContextShift,
    SelfExtend { factor: i32, width: i32 },
}

impl ReclaimStrategy {
    pub fn from_params(params: &ContextParams) -> Self {
        if params.grp_attn_n <= 1 {
            ReclaimStrategy::ContextShift
        } else {
            ReclaimStrategy::SelfExtend {
                factor: params.grp_attn_n as i32,
                width: params.grp_attn_w as i32,
            }
        }
    }
}

/// Outcome of one reclaim check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reclaim {
    /// The pending batch fits
    NotNeeded,
    /// Context shift discarded this many positions
    Shifted { discarded: i32 },
    /// Self-extend ran this many grouping passes
    Extended { passes: u32 },
    /// The window is full and the predict limit forbids reclaiming
    Halt,
}

/// Reclaims KV space before a batch is decoded
#[derive(Debug, Clone, Copy)]
pub struct ContextWindow {
    pub n_ctx: i32,
    pub n_keep: i32,
    pub strategy: ReclaimStrategy,
    pub limit: PredictLimit,
}

impl ContextWindow {
    /// Make room for `pending` tokens.
    ///
    /// `guidance_offset` widens the overflow test for the guidance stream and
    /// `guidance_past` is shifted alongside the main counter.
    pub fn reclaim<K: KvCache>(
        &self,
        kv: &mut K,
        state: &mut ContextState,
        pending: usize,
        guidance_offset: i32,
        guidance_past: Option<&mut i32>,
    ) -> Result<Reclaim, EngineError> {
        match self.strategy {
            ReclaimStrategy::ContextShift => {
                let needed = state.n_past + pending as i32 + guidance_offset.max(0);
                if needed <= self.n_ctx {
                    return Ok(Reclaim::NotNeeded);
                }
                if self.limit == PredictLimit::UntilContextFull {
                    return Ok(Reclaim::Halt);
                }
                let discarded = self.shift(kv, state)?;
                if discarded == 0 {
                    return Ok(Reclaim::NotNeeded);
                }
                if let Some(past) = guidance_past {
                    *past -= discarded;
                }
                Ok(Reclaim::Shifted { discarded })
            }
            ReclaimStrategy::SelfExtend { factor, width } => {
                let passes = self_extend(kv, state, factor, width)?;
                if passes == 0 {
                    Ok(Reclaim::NotNeeded)
                } else {
                    Ok(Reclaim::Extended { passes })
                }
            }
        }
    }

    /// Discard half of the positions after `n_keep`. Returns 0 without touching
    /// the cache when nothing beyond the kept prefix is resident.
    fn shift<K: KvCache>(&self, kv: &mut K, state: &mut ContextState) -> Result<i32, EngineError> {
        let n_left = state.n_past - self.n_keep;
        let n_discard = n_left / 2;
        if n_discard <= 0 {
            return Ok(0);
        }

        tracing::debug!(
            "Context shift: n_past = {}, n_left = {}, n_ctx = {}, n_keep = {}, n_discard = {}",
            state.n_past,
            n_left,
            self.n_ctx,
            self.n_keep,
            n_discard
        );

        kv.kv_remove(self.n_keep, self.n_keep + n_discard)?;
        kv.kv_shift(self.n_keep + n_discard, state.n_past, -n_discard)?;
        state.n_past -= n_discard;
        Ok(n_discard)
    }
}

/// Group-attention position remap, repeated until the cursor catches up.
fn self_extend<K: KvCache>(
    kv: &mut K,
    state: &mut ContextState,
    ga_n: i32,
    ga_w: i32,
) -> Result<u32, EngineError> {
    let mut passes = 0;
    while state.n_past >= state.ga_i + ga_w {
        let ib = (ga_n * state.ga_i) / ga_w;
        let bd = (ga_w / ga_n) * (ga_n - 1);
        let dd = (ga_w / ga_n) - ib * bd - ga_w;

        tracing::debug!(
            "Self-extend: ga_i = {}, n_past = {}, ib*bd = {}, dd = {}",
            state.ga_i,
            state.n_past,
            ib * bd,
            dd
        );

        kv.kv_shift(state.ga_i, state.n_past, ib * bd)?;
        kv.kv_divide(state.ga_i + ib * bd, state.ga_i + ib * bd + ga_w, ga_n)?;
        kv.kv_shift(state.ga_i + ib * bd + ga_w, state.n_past + ib * bd, dd)?;

        state.n_past -= bd;
        state.ga_i += ga_w / ga_n;
        passes += 1;
    }
    Ok(passes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingKv {
        ops: Vec<(&'static str, i32, i32, i32)>,
    }

    impl KvCache for RecordingKv {
        fn kv_remove(&mut self, p0: i32, p1: i32) -> Result<(), EngineError> {
            self.ops.push(("rm", p0, p1, 0));
            Ok(())
        }

        fn kv_shift(&mut self, p0: i32, p1: i32, delta: i32) -> Result<(), EngineError> {
            self.ops.push(("add", p0, p1, delta));
            Ok(())
        }

        fn kv_divide(&mut self, p0: i32, p1: i32, divisor: i32) -> Result<(), EngineError> {
            self.ops.push(("div", p0, p1, divisor));
            Ok(())
        }
    }

    const BOS: Token = 1;

    fn shift_window(n_ctx: i32, n_keep: i32, limit: PredictLimit) -> ContextWindow {
        ContextWindow {
            n_ctx,
            n_keep,
            strategy: ReclaimStrategy::ContextShift,
            limit,
        }
    }

    #[test]
    fn test_admit_never_exceeds_capacity_or_returns_empty() {
        for n_ctx in 5..40usize {
            for len in 0..60 {
                let tokens: Vec<Token> = (100..100 + len as Token).collect();
                for add_bos in [false, true] {
                    let admitted =
                        admit(tokens.clone(), n_ctx, BOS, add_bos, 0, TemplateMode::Plain).unwrap();
                    assert!(admitted.tokens.len() <= n_ctx - CONTEXT_RESERVE);
                    assert!(!admitted.tokens.is_empty());
                }
            }
        }
    }

    #[test]
    fn test_admit_drops_oldest_but_keeps_bos() {
        let tokens: Vec<Token> = (100..120).collect();
        let admitted = admit(tokens, 14, BOS, true, 0, TemplateMode::Plain).unwrap();
        assert_eq!(admitted.tokens.len(), 10);
        assert_eq!(admitted.tokens[0], BOS);
        assert_eq!(&admitted.tokens[1..], &(111..120).collect::<Vec<_>>()[..]);
        assert_eq!(admitted.truncated, 11);
    }

    #[test]
    fn test_admit_empty_becomes_bos() {
        let admitted = admit(Vec::new(), 64, BOS, false, 0, TemplateMode::Plain).unwrap();
        assert_eq!(admitted.tokens, vec![BOS]);
    }

    #[test]
    fn test_admit_rejects_tiny_context() {
        assert_eq!(admit(vec![5], 4, BOS, true, 0, TemplateMode::Plain), Err(4));
    }

    #[test]
    fn test_resolve_keep() {
        assert_eq!(resolve_keep(-1, 20, TemplateMode::Plain, true), 20);
        assert_eq!(resolve_keep(30, 20, TemplateMode::Plain, true), 20);
        assert_eq!(resolve_keep(5, 20, TemplateMode::Instruct, true), 20);
        assert_eq!(resolve_keep(5, 20, TemplateMode::ChatMl, false), 20);
        assert_eq!(resolve_keep(5, 20, TemplateMode::Plain, true), 6);
        assert_eq!(resolve_keep(5, 20, TemplateMode::Plain, false), 5);
        assert_eq!(resolve_keep(0, 20, TemplateMode::Plain, true), 1);
    }

    #[test]
    fn test_no_shift_below_threshold() {
        let window = shift_window(64, 4, PredictLimit::Unlimited);
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::Unlimited);
        state.n_past = 63;

        let outcome = window.reclaim(&mut kv, &mut state, 1, 0, None).unwrap();
        assert_eq!(outcome, Reclaim::NotNeeded);
        assert!(kv.ops.is_empty());
        assert_eq!(state.n_past, 63);
    }

    #[test]
    fn test_single_shift_at_boundary() {
        let window = shift_window(64, 4, PredictLimit::Unlimited);
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::Unlimited);
        state.n_past = 64;
        let mut guidance_past = 70;

        // resident + pending == capacity + 1
        let outcome = window
            .reclaim(&mut kv, &mut state, 1, 0, Some(&mut guidance_past))
            .unwrap();
        assert_eq!(outcome, Reclaim::Shifted { discarded: 30 });
        assert_eq!(kv.ops, vec![("rm", 4, 34, 0), ("add", 34, 64, -30)]);
        assert_eq!(state.n_past, 34);
        assert_eq!(guidance_past, 40);

        // the space now fits; no second reclaim
        let again = window.reclaim(&mut kv, &mut state, 1, 0, None).unwrap();
        assert_eq!(again, Reclaim::NotNeeded);
        assert_eq!(kv.ops.len(), 2);
    }

    #[test]
    fn test_guidance_offset_widens_overflow_test() {
        let window = shift_window(64, 0, PredictLimit::Unlimited);
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::Unlimited);
        state.n_past = 60;

        assert_eq!(
            window.reclaim(&mut kv, &mut state, 1, -10, None).unwrap(),
            Reclaim::NotNeeded
        );
        assert!(matches!(
            window.reclaim(&mut kv, &mut state, 1, 5, None).unwrap(),
            Reclaim::Shifted { .. }
        ));
    }

    #[test]
    fn test_no_shift_inside_kept_prefix() {
        // templated prompt: n_keep covers the whole prompt, nothing decoded yet
        let window = shift_window(32, 12, PredictLimit::Unlimited);
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::Unlimited);
        let mut guidance_past = 0;

        let outcome = window
            .reclaim(&mut kv, &mut state, 12, 60, Some(&mut guidance_past))
            .unwrap();
        assert_eq!(outcome, Reclaim::NotNeeded);
        assert!(kv.ops.is_empty());
        assert_eq!(state.n_past, 0);
        assert_eq!(guidance_past, 0);

        // one resident token past the prefix is still too few to halve
        state.n_past = 13;
        let outcome = window.reclaim(&mut kv, &mut state, 30, 0, None).unwrap();
        assert_eq!(outcome, Reclaim::NotNeeded);
        assert!(kv.ops.is_empty());
        assert_eq!(state.n_past, 13);
    }

    #[test]
    fn test_stop_at_capacity_halts_instead_of_shifting() {
        let window = shift_window(64, 4, PredictLimit::UntilContextFull);
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::UntilContextFull);
        state.n_past = 64;

        assert_eq!(window.reclaim(&mut kv, &mut state, 1, 0, None).unwrap(), Reclaim::Halt);
        assert!(kv.ops.is_empty());
        assert_eq!(state.n_past, 64);
    }

    #[test]
    fn test_self_extend_remaps() {
        let window = ContextWindow {
            n_ctx: 4096,
            n_keep: 0,
            strategy: ReclaimStrategy::SelfExtend {
                factor: 4,
                width: 16,
            },
            limit: PredictLimit::Unlimited,
        };
        let mut kv = RecordingKv::default();
        let mut state = ContextState::new(PredictLimit::Unlimited);
        state.n_past = 16;

        let outcome = window.reclaim(&mut kv, &mut state, 1, 0, None).unwrap();
        assert_eq!(outcome, Reclaim::Extended { passes: 1 });
        // ib = 0, bd = 12, dd = 4 - 16 = -12
        assert_eq!(
            kv.ops,
            vec![("add", 0, 16, 0), ("div", 0, 16, 4), ("add", 16, 16, -12)]
        );
        assert_eq!(state.n_past, 4);
        assert_eq!(state.ga_i, 4);
    }

    #[test]
    fn test_self_extend_cursor_increases_and_terminates() {
        for (ga_n, ga_w) in [(2, 2), (2, 8), (4, 16), (8, 512), (3, 9)] {
            let mut kv = RecordingKv::default();
            let mut state = ContextState::new(PredictLimit::Unlimited);
            let mut last_cursor = state.ga_i;
            // grow the resident count one token at a time, as decoding does
            for _ in 0..2000 {
                state.n_past += 1;
                let passes = self_extend(&mut kv, &mut state, ga_n, ga_w).unwrap();
                if passes > 0 {
                    assert!(state.ga_i > last_cursor);
                    last_cursor = state.ga_i;
                }
                assert!(state.n_past < state.ga_i + ga_w);
            }
        }
    }

    #[test]
    fn test_strategy_from_params() {
        let mut params = ContextParams::default();
        assert_eq!(ReclaimStrategy::from_params(&params), ReclaimStrategy::ContextShift);
        params.grp_attn_n = 4;
        params.grp_attn_w = 512;
        assert_eq!(
            ReclaimStrategy::from_params(&params),
            ReclaimStrategy::SelfExtend {
                factor: 4,
                width: 512
            }
        );
    }
}
