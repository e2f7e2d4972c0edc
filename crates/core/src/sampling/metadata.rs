//! Per-step sampling metadata gathered from the slot table.

use super::{Warp, GREEDY_TEMPERATURE};
use crate::batch::{SlotIndex, SlotTable};

/// Sampling scalars in step order plus shortcut flags.
///
/// The flags let a vectorized sampler skip whole code paths: when
/// `no_top_k` is set no request needs a top-k filter, and so on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplingMetadata {
    pub temperature: Vec<f32>,
    pub top_p: Vec<f32>,
    pub top_k: Vec<u32>,
    pub min_p: Vec<f32>,
    pub frequency_penalties: Vec<f32>,
    pub presence_penalties: Vec<f32>,
    pub repetition_penalties: Vec<f32>,
    pub seeds: Vec<Option<u64>>,

    pub all_greedy: bool,
    pub all_random: bool,
    pub no_top_p: bool,
    pub no_top_k: bool,
    pub no_min_p: bool,
    pub no_penalties: bool,

    /// Output tokens per request, present only when some request uses
    /// penalties.
    pub output_token_ids: Option<Vec<Vec<u32>>>,
}

impl SamplingMetadata {
    pub(crate) fn gather(table: &SlotTable, idx_mapping: &[SlotIndex]) -> Self {
        let arrays = &table.sampling;
        let temperature = arrays.temperature.gather(idx_mapping);
        let top_p = arrays.top_p.gather(idx_mapping);
        let top_k = arrays.top_k.gather(idx_mapping);
        let min_p = arrays.min_p.gather(idx_mapping);
        let frequency_penalties = arrays.frequency_penalties.gather(idx_mapping);
        let presence_penalties = arrays.presence_penalties.gather(idx_mapping);
        let repetition_penalties = arrays.repetition_penalties.gather(idx_mapping);
        let seeds = arrays.seeds.gather(idx_mapping);

        let num_greedy = temperature.iter().filter(|&&t| t < GREEDY_TEMPERATURE).count();
        let no_penalties = frequency_penalties.iter().all(|&p| p == 0.0)
            && presence_penalties.iter().all(|&p| p == 0.0)
            && repetition_penalties.iter().all(|&p| p == 1.0);

        let output_token_ids = (!no_penalties).then(|| {
            idx_mapping
                .iter()
                .map(|&idx| table.token_ids(idx)[table.num_prompt_tokens(idx)..].to_vec())
                .collect()
        });

        Self {
            all_greedy: num_greedy == temperature.len(),
            all_random: num_greedy == 0,
            no_top_p: top_p.iter().all(|&p| p >= 1.0),
            no_top_k: top_k.iter().all(|&k| k == 0),
            no_min_p: min_p.iter().all(|&p| p <= 0.0),
            no_penalties,
            temperature,
            top_p,
            top_k,
            min_p,
            frequency_penalties,
            presence_penalties,
            repetition_penalties,
            seeds,
            output_token_ids,
        }
    }

    pub fn num_reqs(&self) -> usize {
        self.temperature.len()
    }

    pub fn is_greedy(&self, i: usize) -> bool {
        self.temperature[i] < GREEDY_TEMPERATURE
    }

    /// Distribution knobs of request `i`; missing entries are disabled.
    pub(crate) fn warp(&self, i: usize) -> Warp {
        Warp {
            temperature: self.temperature.get(i).copied().unwrap_or(1.0),
            top_k: self.top_k.get(i).copied().unwrap_or(0),
            top_p: self.top_p.get(i).copied().unwrap_or(1.0),
            min_p: self.min_p.get(i).copied().unwrap_or(0.0),
        }
    }
}
