use thiserror::Error;

use crate::request::RequestId;

/// Errors surfaced by the slot table and the input-batch builder.
///
/// Capacity errors are caller-correctable: the scheduler shrinks its
/// budget and retries the same step. Identity errors are fatal to the
/// offending call only. Neither kind leaves the slot table partially
/// mutated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch is full: {capacity} slots in use")]
    BatchFull { capacity: usize },

    #[error("batch overflow: {requested} tokens scheduled, limit is {max_num_batched_tokens}")]
    BatchOverflow {
        requested: usize,
        max_num_batched_tokens: usize,
    },

    #[error("request {req_id} needs {required} token slots, max model len is {max_model_len}")]
    ModelLenExceeded {
        req_id: RequestId,
        required: usize,
        max_model_len: usize,
    },

    #[error("request {0} is already active")]
    DuplicateRequest(RequestId),

    #[error("request {0} is not active")]
    UnknownRequest(RequestId),

    #[error("request {0} was scheduled with an empty token budget")]
    EmptyTokenBudget(RequestId),
}

impl BatchError {
    /// Whether the scheduler can recover by shrinking its request or
    /// token budget and retrying the step.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            Self::BatchFull { .. } | Self::BatchOverflow { .. } | Self::ModelLenExceeded { .. }
        )
    }
}

/// Error reported by the external model executor for one step.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("model execution failed: {0}")]
    Execution(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Error raised while loading the auxiliary drafting network.
#[derive(Error, Debug)]
pub enum DraftModelError {
    #[error("draft model config mismatch: {0}")]
    Config(String),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Error surfaced by a full engine step.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}
