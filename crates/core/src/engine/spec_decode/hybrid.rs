//! Adaptive drafter that switches between n-gram lookup and the draft
//! network by trailing acceptance rate.
//!
//! The switch is a hysteresis loop over a fixed-size window of recent
//! verification outcomes. The model path is entered only once the windowed
//! mean rises above `threshold + margin` and left only once it falls below
//! `threshold - margin`; nothing happens until `min_samples` outcomes have
//! been seen. A single outlier step therefore never flips the mode.
//!
//! A draft network without weights is never switched to; the drafter stays
//! on n-gram lookup until weights are loaded.

use std::collections::VecDeque;

use tracing::info;

use super::eagle::EagleProposer;
use super::ngram::NgramProposer;
use super::DraftMethod;

/// Trailing window of per-step acceptance rates.
#[derive(Debug, Clone)]
pub struct AcceptanceWindow {
    rates: VecDeque<f32>,
    capacity: usize,
    sum: f64,
}

impl AcceptanceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rates: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
        }
    }

    /// Record one outcome, evicting the oldest once full. Rates are
    /// clamped into `[0, 1]`; NaN is ignored.
    pub fn push(&mut self, rate: f32) {
        if rate.is_nan() {
            return;
        }
        let rate = rate.clamp(0.0, 1.0);
        if self.rates.len() == self.capacity {
            if let Some(old) = self.rates.pop_front() {
                self.sum -= old as f64;
            }
        }
        self.rates.push_back(rate);
        self.sum += rate as f64;
    }

    pub fn mean(&self) -> Option<f32> {
        if self.rates.is_empty() {
            None
        } else {
            Some((self.sum / self.rates.len() as f64) as f32)
        }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn clear(&mut self) {
        self.rates.clear();
        self.sum = 0.0;
    }
}

#[derive(Debug, Clone)]
pub struct HybridConfig {
    pub threshold: f32,
    /// Half-width of the dead band around `threshold`.
    pub margin: f32,
    pub window: usize,
    pub min_samples: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            margin: 0.05,
            window: 100,
            min_samples: 8,
        }
    }
}

#[derive(Debug)]
pub struct HybridDrafter {
    ngram: NgramProposer,
    eagle: Option<EagleProposer>,
    config: HybridConfig,
    window: AcceptanceWindow,
    use_eagle: bool,
    num_switches: u64,
}

impl HybridDrafter {
    pub fn new(ngram: NgramProposer, eagle: Option<EagleProposer>, config: HybridConfig) -> Self {
        let window = AcceptanceWindow::new(config.window);
        Self {
            ngram,
            eagle,
            config,
            window,
            use_eagle: false,
            num_switches: 0,
        }
    }

    /// Whether proposals currently come from the draft network.
    pub fn use_eagle(&self) -> bool {
        self.use_eagle
    }

    pub fn num_switches(&self) -> u64 {
        self.num_switches
    }

    pub fn window(&self) -> &AcceptanceWindow {
        &self.window
    }

    pub fn eagle_mut(&mut self) -> Option<&mut EagleProposer> {
        self.eagle.as_mut()
    }

    pub fn num_speculative_tokens(&self) -> usize {
        self.ngram.config().num_speculative_tokens
    }

    /// The draft network, only once it has weights.
    fn loaded_model(&self) -> Option<&EagleProposer> {
        self.eagle.as_ref().filter(|eagle| eagle.has_model())
    }

    /// Method the next proposal will be tagged with.
    pub fn method(&self) -> DraftMethod {
        match (self.loaded_model(), self.use_eagle) {
            (Some(eagle), true) => eagle.method(),
            _ => DraftMethod::Ngram,
        }
    }

    /// Feed one verification outcome and re-evaluate the mode.
    pub fn update_acceptance_rate(&mut self, rate: f32) {
        self.window.push(rate);
        if self.loaded_model().is_none() || self.window.len() < self.config.min_samples {
            return;
        }
        let Some(mean) = self.window.mean() else {
            return;
        };

        let next = if self.use_eagle {
            mean >= self.config.threshold - self.config.margin
        } else {
            mean > self.config.threshold + self.config.margin
        };
        if next != self.use_eagle {
            self.use_eagle = next;
            self.num_switches += 1;
            info!(
                use_eagle = next,
                trailing_acceptance = mean,
                "hybrid drafter switched mode"
            );
        }
    }

    pub fn propose(&self, token_ids: &[u32], max_tokens: usize) -> (Vec<u32>, DraftMethod) {
        match (self.loaded_model(), self.use_eagle) {
            (Some(eagle), true) => eagle.propose(token_ids, max_tokens),
            _ => (self.ngram.propose(token_ids, max_tokens), DraftMethod::Ngram),
        }
    }
}
