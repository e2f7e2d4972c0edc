//! Persistent request batching with speculative decoding.
//!
//! Requests live in fixed slots of a [`batch::SlotTable`] across steps.
//! Each step gathers the scheduled requests into an [`batch::InputBatch`],
//! drafts continuation tokens, hands both to an external
//! [`engine::ModelExecutor`] and commits the verified tokens back into
//! the table.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod request;
pub mod sampling;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
