//! Sampling parameters and per-request sampling state.
//!
//! This module provides:
//! - [`SamplingParams`]: per-request knobs the slot table scatters into its
//!   struct-of-arrays layout
//! - [`SamplingMetadata`]: the per-step gather of those knobs
//! - Stateful logits processors kept in sync through `BatchUpdate`
//! - The opaque structured-output capability consumed by the grammar processor

pub mod logits_processor;
mod metadata;
pub mod structured_output;

pub use logits_processor::{
    BadWordsProcessor, GrammarProcessor, LogitBiasProcessor, MinTokensProcessor, ProcessorSet,
    StatefulLogitsProcessor,
};
pub use metadata::SamplingMetadata;
pub use structured_output::{GrammarCompiler, GrammarMatcher, StructuredOutputSpec};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Temperatures below this sample greedily.
pub(crate) const GREEDY_TEMPERATURE: f32 = 1e-6;

/// Parameters controlling token sampling behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for logit scaling. 0.0 = greedy, higher = more random.
    pub temperature: f32,
    /// Nucleus sampling threshold (0..1). 1.0 = disabled.
    pub top_p: f32,
    /// Top-K filtering. 0 = disabled.
    pub top_k: u32,
    /// Minimum probability relative to max. 0.0 = disabled.
    pub min_p: f32,
    /// Penalty for repeated tokens. 1.0 = none, >1.0 discourages repeats.
    pub repetition_penalty: f32,
    /// Frequency penalty (OpenAI convention). 0.0 = disabled.
    pub frequency_penalty: f32,
    /// Presence penalty (OpenAI convention). 0.0 = disabled.
    pub presence_penalty: f32,
    /// Optional seed for deterministic sampling.
    pub seed: Option<u64>,
    /// Token logit bias: (token_id, bias_value) pairs.
    pub logit_bias: Option<Vec<(u32, f32)>>,
    /// Minimum number of tokens to generate before allowing EOS.
    /// Requires `eos_token_id` to be set. 0 = disabled.
    pub min_tokens: usize,
    /// EOS token ID for min_tokens enforcement.
    pub eos_token_id: Option<u32>,
    /// Bad words as token ID sequences. Single-token sequences are banned
    /// unconditionally, multi-token sequences ban the last token only when
    /// the output ends with the prefix.
    pub bad_words_token_ids: Option<Vec<Vec<u32>>>,
    /// Structured-output constraint, compiled by an external grammar backend.
    pub structured_output: Option<StructuredOutputSpec>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            top_k: 0,
            min_p: 0.0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: None,
            logit_bias: None,
            min_tokens: 0,
            eos_token_id: None,
            bad_words_token_ids: None,
            structured_output: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Default::default()
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < GREEDY_TEMPERATURE
    }
}

/// Mutable state for sampling (holds RNG per-sequence).
#[derive(Debug, Clone)]
pub struct SamplerState {
    rng: StdRng,
}

impl SamplerState {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    pub fn next_f32(&mut self) -> f32 {
        self.rng.gen::<f32>()
    }
}

pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        let inv_sum = 1.0 / sum;
        for p in probs.iter_mut() {
            *p *= inv_sum;
        }
    }
    probs
}

/// Per-request knobs that reshape the target distribution before
/// acceptance and sampling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Warp {
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub min_p: f32,
}

impl Warp {
    /// Tempered and filtered probabilities of one row of (already
    /// processor-masked) log-probabilities. The result is renormalized;
    /// a row that filters down to nothing keeps its argmax.
    pub fn probs(&self, logprobs: &[f32]) -> Vec<f32> {
        let inv_t = 1.0 / self.temperature.max(GREEDY_TEMPERATURE);
        let scaled: Vec<f32> = logprobs.iter().map(|&l| l * inv_t).collect();
        let mut probs = softmax(&scaled);
        if self.min_p > 0.0 {
            apply_min_p(&mut probs, self.min_p);
        }
        if self.top_k > 0 && (self.top_k as usize) < probs.len() {
            apply_top_k(&mut probs, self.top_k as usize);
        }
        if self.top_p < 1.0 {
            apply_top_p(&mut probs, self.top_p);
        }
        let sum: f32 = probs.iter().sum();
        if sum > 0.0 {
            let inv_sum = 1.0 / sum;
            probs.iter_mut().for_each(|p| *p *= inv_sum);
        } else if let Some(p) = probs.get_mut(argmax(logprobs) as usize) {
            *p = 1.0;
        }
        probs
    }
}

fn apply_min_p(probs: &mut [f32], min_p: f32) {
    let threshold = probs.iter().copied().fold(0.0f32, f32::max) * min_p;
    for p in probs.iter_mut().filter(|p| **p < threshold) {
        *p = 0.0;
    }
}

fn apply_top_k(probs: &mut [f32], k: usize) {
    let mut sorted = probs.to_vec();
    sorted.sort_unstable_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
    let threshold = sorted[k - 1];
    for p in probs.iter_mut().filter(|p| **p < threshold) {
        *p = 0.0;
    }
}

/// Keep the smallest prefix (by descending probability) whose mass
/// exceeds `top_p`.
fn apply_top_p(probs: &mut [f32], top_p: f32) {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        probs[b]
            .partial_cmp(&probs[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut cumsum = 0.0f32;
    let mut keep = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumsum += probs[i];
        if cumsum > top_p {
            keep = rank + 1;
            break;
        }
    }
    for &i in &order[keep..] {
        probs[i] = 0.0;
    }
}

pub(crate) fn argmax(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i as u32)
        .unwrap_or(0)
}

/// Draw an index from a normalized probability vector.
///
/// Falls back to the last non-zero entry if rounding leaves the cumulative
/// sum just short of `r`.
pub(crate) fn sample_from_probs(probs: &[f32], state: &mut SamplerState) -> u32 {
    let r = state.next_f32();
    let mut cumsum = 0.0f32;
    let mut last_nonzero = 0u32;
    for (i, &p) in probs.iter().enumerate() {
        if p > 0.0 {
            last_nonzero = i as u32;
        }
        cumsum += p;
        if r < cumsum {
            return i as u32;
        }
    }
    last_nonzero
}
