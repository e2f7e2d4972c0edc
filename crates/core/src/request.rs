use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sampling::SamplingParams;

/// Opaque, caller-chosen request identifier.
///
/// Cheap to clone: the string is interned behind an `Arc` so the slot
/// table, batch updates and verification results can all hold copies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Arc<str>);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Per-request mutable record, created on admission and dropped on removal.
///
/// Output tokens are append-only. `num_computed_tokens` never exceeds the
/// number of known tokens (prompt + output).
#[derive(Debug, Clone)]
pub struct CachedRequestState {
    pub req_id: RequestId,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
    pub sampling_params: SamplingParams,
    pub num_computed_tokens: usize,
    /// Draft tokens proposed in the previous step, carried over until the
    /// verifier settles them.
    pub spec_token_ids: Vec<u32>,
    /// Monotonic admission sequence number; distinguishes two admissions
    /// that reuse the same id or slot.
    pub admission_seq: u64,
}

impl CachedRequestState {
    pub fn new(
        req_id: RequestId,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
        admission_seq: u64,
    ) -> Self {
        Self {
            req_id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            sampling_params,
            num_computed_tokens: 0,
            spec_token_ids: Vec::new(),
            admission_seq,
        }
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn num_output_tokens(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Total number of known tokens (prompt + output).
    pub fn num_tokens(&self) -> usize {
        self.prompt_token_ids.len() + self.output_token_ids.len()
    }

    pub fn append_output_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    /// Advance the computed-token counter by `n`, clamped to the number of
    /// known tokens.
    pub fn update_computed_tokens(&mut self, n: usize) {
        let next = self.num_computed_tokens + n;
        debug_assert!(
            next <= self.num_tokens(),
            "computed tokens {next} exceed known tokens {}",
            self.num_tokens()
        );
        self.num_computed_tokens = next.min(self.num_tokens());
    }
}
