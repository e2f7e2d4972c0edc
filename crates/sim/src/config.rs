//! Simulator configuration.
//!
//! Configuration is resolved with the following priority:
//! 1. CLI arguments (highest priority)
//! 2. Config file (`--config`, else ~/.config/specbatch/config.toml)
//! 3. Default values (lowest priority)
//!
//! The file carries the engine's `[batch]` and `[speculative]` tables plus
//! a `[workload]` table describing the synthetic requests.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};
use specbatch_core::config::{
    AcceptanceMethodKind, BatchConfig, ConfigError, EngineConfig, SpeculativeConfig,
    SpeculativeMethod,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

/// Shape of the synthetic request stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub num_requests: usize,
    pub prompt_len: usize,
    pub max_new_tokens: usize,
    /// Prompts and the mock target both cycle through `0..period`.
    pub period: u32,
    pub vocab_size: usize,
    /// Fraction of prompt tokens replaced by uniform noise.
    pub noise: f32,
    /// Probability mass the mock target puts on its predicted token.
    pub confidence: f32,
    pub temperature: f32,
    /// Delay between admissions; 0 admits as fast as slots free up.
    pub arrival_interval_ms: u64,
    pub compact: bool,
    pub seed: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            num_requests: 32,
            prompt_len: 48,
            max_new_tokens: 64,
            period: 8,
            vocab_size: 512,
            noise: 0.1,
            confidence: 0.9,
            temperature: 0.0,
            arrival_interval_ms: 0,
            compact: false,
            seed: 0,
        }
    }
}

impl WorkloadConfig {
    fn validate(&self, batch: &BatchConfig) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.num_requests == 0 || self.prompt_len == 0 || self.max_new_tokens == 0 {
            return invalid("workload sizes must be positive");
        }
        if self.prompt_len >= batch.max_model_len {
            return invalid("prompt_len must leave room below max_model_len");
        }
        if self.period == 0 || self.period as usize > self.vocab_size {
            return invalid("period must be within 1..=vocab_size");
        }
        if !(0.0..=1.0).contains(&self.noise) {
            return invalid("noise must be within [0, 1]");
        }
        if !(0.0..1.0).contains(&self.confidence) || self.confidence <= 0.0 {
            return invalid("confidence must be within (0, 1)");
        }
        if self.temperature < 0.0 {
            return invalid("temperature must be non-negative");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub batch: BatchConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speculative: Option<SpeculativeConfig>,
    pub workload: WorkloadConfig,
}

impl SimConfig {
    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("specbatch").join("config.toml"))
    }

    /// Load `path`, or the default file when it exists, or defaults.
    ///
    /// Returns the file actually read alongside the config.
    pub fn load(path: Option<&Path>) -> Result<(Self, Option<PathBuf>), SimConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.exists()),
        };
        match path {
            Some(p) => Ok((Self::load_from(&p)?, Some(p))),
            None => Ok((Self::default(), None)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, SimConfigError> {
        let content = fs::read_to_string(path).map_err(|source| SimConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| SimConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SimConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SimConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| SimConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply CLI overrides on top of the loaded values.
    pub fn merge(&mut self, cli: &Overrides) {
        if let Some(n) = cli.max_num_reqs {
            self.batch.max_num_reqs = n;
        }
        if let Some(n) = cli.max_model_len {
            self.batch.max_model_len = n;
        }
        if let Some(n) = cli.max_num_batched_tokens {
            self.batch.max_num_batched_tokens = n;
        }

        if cli.no_spec {
            self.speculative = None;
        } else if cli.method.is_some()
            || cli.num_speculative_tokens.is_some()
            || cli.acceptance.is_some()
            || cli.adaptive_depth
        {
            let spec = self.speculative.get_or_insert_with(SpeculativeConfig::default);
            if let Some(method) = cli.method {
                spec.method = method;
            }
            if let Some(k) = cli.num_speculative_tokens {
                spec.num_speculative_tokens = k;
            }
            if let Some(acceptance) = cli.acceptance {
                spec.draft_token_acceptance_method = acceptance;
            }
            if cli.adaptive_depth {
                spec.adaptive_depth = true;
            }
        }

        let workload = &mut self.workload;
        if let Some(n) = cli.num_requests {
            workload.num_requests = n;
        }
        if let Some(n) = cli.prompt_len {
            workload.prompt_len = n;
        }
        if let Some(n) = cli.max_new_tokens {
            workload.max_new_tokens = n;
        }
        if let Some(t) = cli.temperature {
            workload.temperature = t;
        }
        if let Some(noise) = cli.noise {
            workload.noise = noise;
        }
        if let Some(seed) = cli.seed {
            workload.seed = seed;
        }
        if cli.compact {
            workload.compact = true;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_config().validate()?;
        self.workload.validate(&self.batch)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            batch: self.batch.clone(),
            speculative: self.speculative.clone(),
        }
    }
}

/// Command-line overrides. Unset options keep the file or default value.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Number of request slots
    #[arg(long)]
    pub max_num_reqs: Option<usize>,

    /// Maximum tokens per request history
    #[arg(long)]
    pub max_model_len: Option<usize>,

    /// Token budget per step
    #[arg(long)]
    pub max_num_batched_tokens: Option<usize>,

    /// Speculative method (ngram, suffix, eagle, eagle3, medusa, mtp, draft_model, hybrid)
    #[arg(long)]
    pub method: Option<SpeculativeMethod>,

    /// Draft tokens per request per step
    #[arg(long)]
    pub num_speculative_tokens: Option<usize>,

    /// Verification rule (greedy, rejection_sampler, typical_acceptance_sampler)
    #[arg(long)]
    pub acceptance: Option<AcceptanceMethodKind>,

    /// Move the speculation depth with the acceptance rate
    #[arg(long)]
    pub adaptive_depth: bool,

    /// Disable speculative decoding
    #[arg(long, conflicts_with = "method")]
    pub no_spec: bool,

    /// Number of synthetic requests
    #[arg(long)]
    pub num_requests: Option<usize>,

    /// Prompt length of every request
    #[arg(long)]
    pub prompt_len: Option<usize>,

    /// Tokens generated per request before it finishes
    #[arg(long)]
    pub max_new_tokens: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Fraction of prompt tokens replaced by noise
    #[arg(long)]
    pub noise: Option<f32>,

    /// Workload random seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Close slot holes at every step
    #[arg(long)]
    pub compact: bool,
}
