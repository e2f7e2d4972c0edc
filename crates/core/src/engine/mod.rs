//! Speculative decoding engine.
//!
//! The engine runs one step at a time over the shared slot table:
//!
//! - `spec_decode` drafts tokens (n-gram, suffix, EAGLE, hybrid) and
//!   verifies them against the target distribution
//! - `ModelExecutor` is the boundary to the target model
//! - `SpeculativeEngine` sequences `propose → execute → verify → commit`
//!   and keeps the stateful logits processors in step with the table

pub mod executor;
pub mod spec_decode;
mod speculative;

pub use executor::ModelExecutor;
pub use spec_decode::{
    DraftMethod, DraftProposal, Drafter, SpecDecodingStats, TargetLogprobs, TokenVerifier,
    VerificationResult,
};
pub use speculative::{SpeculativeEngine, StepOutput};
