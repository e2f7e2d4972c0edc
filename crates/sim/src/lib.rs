//! Step driver for specbatch: runs a synthetic workload through the full
//! speculative decoding cycle against a deterministic mock target.

pub mod config;
pub mod logging;
pub mod workload;
