//! llamadrive
//!
//! Streaming chat generation driver over llama.cpp.

pub mod inference;
pub mod storage;
pub mod types;

/// Largest char boundary in `s` at or below `idx`, never panics.
pub fn floor_char_boundary(s: &str, idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    // Walk backwards from idx to find a valid char boundary
    let mut end = idx;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    end
}
