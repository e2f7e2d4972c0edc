//! N-gram (prompt lookup) speculative token proposer.
//!
//! Finds the longest suffix of the request's token history that also
//! occurs earlier in the same history, then proposes the tokens that
//! followed that earlier occurrence. Pure CPU, no per-request state.
//!
//! Tie-breaking: a longer match always wins; among matches of equal length
//! the most recent (rightmost) earlier occurrence wins, since recent context
//! predicts the continuation best.

use super::DraftMethod;

/// Configuration for the n-gram proposer.
#[derive(Debug, Clone)]
pub struct NgramConfig {
    /// Minimum n-gram length to match (inclusive).
    pub min_n: usize,
    /// Maximum n-gram length to match (inclusive).
    pub max_n: usize,
    /// Number of speculative tokens to propose (K).
    pub num_speculative_tokens: usize,
}

impl Default for NgramConfig {
    fn default() -> Self {
        Self {
            min_n: 1,
            max_n: 5,
            num_speculative_tokens: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NgramProposer {
    config: NgramConfig,
}

impl NgramProposer {
    pub fn new(config: NgramConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(NgramConfig::default())
    }

    pub fn config(&self) -> &NgramConfig {
        &self.config
    }

    pub fn method(&self) -> DraftMethod {
        DraftMethod::Ngram
    }

    /// Propose up to `max_tokens` (capped by the configured K) tokens.
    pub fn propose(&self, token_ids: &[u32], max_tokens: usize) -> Vec<u32> {
        find_ngram_proposals(
            token_ids,
            self.config.min_n,
            self.config.max_n,
            max_tokens.min(self.config.num_speculative_tokens),
        )
    }
}

/// Core matching routine.
///
/// Tries n from `max_n` down to `min_n`; the first n with an earlier
/// occurrence of the length-n suffix decides the proposal. Returns at most
/// `k` tokens, fewer when the continuation runs into the end of the
/// history. Never pads.
pub(crate) fn find_ngram_proposals(token_ids: &[u32], min_n: usize, max_n: usize, k: usize) -> Vec<u32> {
    let total = token_ids.len();
    let min_n = min_n.max(1);
    if k == 0 || total <= min_n {
        return Vec::new();
    }

    // The earlier occurrence must leave at least one continuation token,
    // so it has to lie entirely inside `token_ids[..total - 1]`.
    let searchable = &token_ids[..total - 1];
    let max_n = max_n.min(total - 1);

    for n in (min_n..=max_n).rev() {
        let suffix = &token_ids[total - n..];
        if let Some(start) = searchable.windows(n).rposition(|w| w == suffix) {
            let from = start + n;
            let to = (from + k).min(total);
            return token_ids[from..to].to_vec();
        }
    }
    Vec::new()
}
