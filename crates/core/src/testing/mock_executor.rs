use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use candle_core::Device;

use crate::batch::InputBatch;
use crate::engine::spec_decode::{DraftProposal, TargetLogprobs};
use crate::engine::ModelExecutor;
use crate::error::ExecutorError;

type Transition = Box<dyn Fn(u32) -> u32 + Send + Sync>;

/// A target model that is a first-order Markov chain over token ids.
///
/// Every position's distribution puts `confidence` on `transition(prev)`
/// and spreads the rest evenly, where `prev` is the last scheduled token
/// for the first row and the preceding draft token for later rows. Fully
/// deterministic, so tests can predict acceptance exactly.
pub struct MockExecutor {
    vocab_size: usize,
    confidence: f32,
    transition: Transition,
    fail: bool,
    num_calls: AtomicUsize,
}

impl MockExecutor {
    pub fn new(
        vocab_size: usize,
        confidence: f32,
        transition: impl Fn(u32) -> u32 + Send + Sync + 'static,
    ) -> Self {
        Self {
            vocab_size,
            confidence,
            transition: Box::new(transition),
            fail: false,
            num_calls: AtomicUsize::new(0),
        }
    }

    /// Predicts `(prev + 1) % period`.
    pub fn cycle(vocab_size: usize, period: u32) -> Self {
        Self::new(vocab_size, 0.9, move |t| (t + 1) % period)
    }

    /// Fails every call.
    pub fn failing(vocab_size: usize) -> Self {
        Self {
            fail: true,
            ..Self::new(vocab_size, 0.9, |t| t)
        }
    }

    pub fn num_calls(&self) -> usize {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub fn predict(&self, prev: u32) -> u32 {
        (self.transition)(prev) % self.vocab_size as u32
    }

    fn row(&self, peak: u32) -> Vec<f32> {
        let rest = (1.0 - self.confidence) / (self.vocab_size - 1).max(1) as f32;
        (0..self.vocab_size as u32)
            .map(|t| if t == peak { self.confidence.ln() } else { rest.ln() })
            .collect()
    }
}

#[async_trait]
impl ModelExecutor for MockExecutor {
    async fn execute(
        &self,
        batch: &InputBatch,
        proposal: &DraftProposal,
    ) -> Result<TargetLogprobs, ExecutorError> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        if self.fail {
            return Err(ExecutorError::Execution("mock executor failure".to_string()));
        }

        let mut rows = Vec::with_capacity(batch.num_reqs());
        for i in 0..batch.num_reqs() {
            let last = batch.input_ids[batch.logits_indices[i]];
            let drafts = proposal
                .draft_token_ids
                .get(i)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut request_rows = Vec::with_capacity(drafts.len() + 1);
            request_rows.push(self.row(self.predict(last)));
            for &draft in drafts {
                request_rows.push(self.row(self.predict(draft)));
            }
            rows.push(request_rows);
        }
        Ok(TargetLogprobs::from_rows(&rows, &Device::Cpu)?)
    }
}
