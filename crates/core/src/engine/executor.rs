//! Boundary to the external model executor.

use async_trait::async_trait;

use crate::batch::InputBatch;
use crate::error::ExecutorError;

use super::spec_decode::{DraftProposal, TargetLogprobs};

/// Runs the target model for one step.
///
/// The executor receives the step tensors plus every request's draft
/// tokens (appended after the scheduled tokens) and returns one
/// `[num_proposed_i + 1, vocab_size]` log-probability tensor per request,
/// in step order. Attention backend and device placement are its own
/// concern.
#[async_trait]
pub trait ModelExecutor: Send + Sync {
    async fn execute(
        &self,
        batch: &InputBatch,
        proposal: &DraftProposal,
    ) -> Result<TargetLogprobs, ExecutorError>;
}
