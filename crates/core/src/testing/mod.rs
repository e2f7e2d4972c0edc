//! Shared test utilities for specbatch-core.
//!
//! Deterministic stand-ins for the external collaborators of the engine,
//! usable from unit tests and (with the `test-utils` feature) from
//! integration tests.

mod mock_executor;
mod recording_processor;

pub use mock_executor::MockExecutor;
pub use recording_processor::{ProcessorEvent, RecordingProcessor};

use crate::config::BatchConfig;

/// A small batch configuration for tests.
pub fn tiny_batch_config() -> BatchConfig {
    BatchConfig {
        max_num_reqs: 4,
        max_model_len: 64,
        max_num_batched_tokens: 64,
    }
}

/// `len` tokens cycling through `0..period`.
pub fn cyclic_tokens(period: u32, len: usize) -> Vec<u32> {
    (0..len as u32).map(|i| i % period).collect()
}
