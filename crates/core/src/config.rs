//! Engine configuration.
//!
//! All types deserialize from TOML with per-field defaults, so a config
//! file only needs to name the values it changes:
//!
//! ```toml
//! [batch]
//! max_num_reqs = 64
//!
//! [speculative]
//! method = "hybrid"
//! num_speculative_tokens = 4
//! draft_token_acceptance_method = "typical_acceptance_sampler"
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

// ─── Batch ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Fixed number of request slots.
    pub max_num_reqs: usize,
    /// Longest token history a slot can hold.
    pub max_model_len: usize,
    /// Token budget of one step across all requests.
    pub max_num_batched_tokens: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_num_reqs: 128,
            max_model_len: 2048,
            max_num_batched_tokens: 2048,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_num_reqs == 0 {
            return Err(invalid("max_num_reqs must be positive"));
        }
        if self.max_model_len == 0 {
            return Err(invalid("max_model_len must be positive"));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(invalid("max_num_batched_tokens must be positive"));
        }
        Ok(())
    }
}

// ─── Speculative decoding ────────────────────────────────────────────────

/// Draft proposal method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeculativeMethod {
    #[default]
    Ngram,
    Eagle,
    Eagle3,
    Medusa,
    Mtp,
    Suffix,
    DraftModel,
    Hybrid,
}

impl SpeculativeMethod {
    /// Whether the method drafts with an auxiliary network.
    pub fn is_model_based(self) -> bool {
        matches!(
            self,
            Self::Eagle | Self::Eagle3 | Self::Medusa | Self::Mtp | Self::DraftModel
        )
    }
}

impl fmt::Display for SpeculativeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ngram => "ngram",
            Self::Eagle => "eagle",
            Self::Eagle3 => "eagle3",
            Self::Medusa => "medusa",
            Self::Mtp => "mtp",
            Self::Suffix => "suffix",
            Self::DraftModel => "draft_model",
            Self::Hybrid => "hybrid",
        };
        f.write_str(name)
    }
}

impl FromStr for SpeculativeMethod {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ngram" => Self::Ngram,
            "eagle" => Self::Eagle,
            "eagle3" => Self::Eagle3,
            "medusa" => Self::Medusa,
            "mtp" => Self::Mtp,
            "suffix" => Self::Suffix,
            "draft_model" => Self::DraftModel,
            "hybrid" => Self::Hybrid,
            other => return Err(invalid(format!("unknown speculative method '{other}'"))),
        })
    }
}

/// Rule used to accept or reject draft tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceMethodKind {
    Greedy,
    #[default]
    RejectionSampler,
    TypicalAcceptanceSampler,
}

impl FromStr for AcceptanceMethodKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "greedy" => Self::Greedy,
            "rejection_sampler" => Self::RejectionSampler,
            "typical_acceptance_sampler" => Self::TypicalAcceptanceSampler,
            other => return Err(invalid(format!("unknown acceptance method '{other}'"))),
        })
    }
}

/// Shape and weights of the auxiliary drafting network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DraftModelConfig {
    /// Safetensors file with the draft weights. Without it the drafter
    /// runs in its degraded mode.
    pub path: Option<PathBuf>,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub vocab_size: usize,
}

impl Default for DraftModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            hidden_size: 256,
            num_layers: 1,
            vocab_size: 32000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeculativeConfig {
    pub method: SpeculativeMethod,
    /// Upper bound on draft tokens per request per step.
    pub num_speculative_tokens: usize,
    /// Shortest n-gram the lookup proposer matches.
    pub prompt_lookup_min: usize,
    /// Longest n-gram the lookup proposer matches.
    pub prompt_lookup_max: usize,
    pub draft_token_acceptance_method: AcceptanceMethodKind,
    /// Typical acceptance: base probability floor.
    pub posterior_threshold: f32,
    /// Typical acceptance: entropy scaling factor.
    pub posterior_alpha: f32,

    /// Move the per-step budget with the trailing acceptance rate.
    pub adaptive_depth: bool,
    pub min_speculative_tokens: usize,
    /// Defaults to `num_speculative_tokens`.
    pub max_speculative_tokens: Option<usize>,
    /// Trailing acceptance rate above which the hybrid drafter uses the
    /// model path and adaptive depth grows the budget.
    pub acceptance_rate_threshold: f32,
    /// Number of recent verification outcomes kept.
    pub acceptance_window: usize,
    /// Half-width of the hysteresis band around the threshold.
    pub acceptance_margin: f32,
    /// Samples needed before the trailing mean is trusted.
    pub min_window_samples: usize,

    /// Longest suffix tracked by the suffix proposer.
    pub suffix_max_tree_depth: usize,
    /// Suffix proposer stops extending when the next-token frequency drops
    /// below this.
    pub suffix_min_token_prob: f32,

    pub draft_model: Option<DraftModelConfig>,
    pub seed: Option<u64>,
}

impl Default for SpeculativeConfig {
    fn default() -> Self {
        Self {
            method: SpeculativeMethod::Ngram,
            num_speculative_tokens: 3,
            prompt_lookup_min: 1,
            prompt_lookup_max: 5,
            draft_token_acceptance_method: AcceptanceMethodKind::RejectionSampler,
            posterior_threshold: 0.09,
            posterior_alpha: 0.3,
            adaptive_depth: false,
            min_speculative_tokens: 1,
            max_speculative_tokens: None,
            acceptance_rate_threshold: 0.5,
            acceptance_window: 100,
            acceptance_margin: 0.05,
            min_window_samples: 8,
            suffix_max_tree_depth: 10,
            suffix_min_token_prob: 0.1,
            draft_model: None,
            seed: None,
        }
    }
}

impl SpeculativeConfig {
    pub fn max_depth(&self) -> usize {
        self.max_speculative_tokens
            .unwrap_or(self.num_speculative_tokens)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_speculative_tokens == 0 {
            return Err(invalid("num_speculative_tokens must be positive"));
        }
        if self.prompt_lookup_min == 0 || self.prompt_lookup_min > self.prompt_lookup_max {
            return Err(invalid(format!(
                "prompt lookup range {}..={} is empty",
                self.prompt_lookup_min, self.prompt_lookup_max
            )));
        }
        if !(0.0..=1.0).contains(&self.acceptance_rate_threshold) {
            return Err(invalid("acceptance_rate_threshold must be within [0, 1]"));
        }
        if self.acceptance_margin < 0.0 {
            return Err(invalid("acceptance_margin must be non-negative"));
        }
        if self.acceptance_window == 0 {
            return Err(invalid("acceptance_window must be positive"));
        }
        if self.adaptive_depth {
            let max = self.max_depth();
            if self.min_speculative_tokens == 0 || self.min_speculative_tokens > max {
                return Err(invalid(format!(
                    "adaptive depth range {}..={max} is empty",
                    self.min_speculative_tokens
                )));
            }
            if self.num_speculative_tokens > max {
                return Err(invalid(
                    "num_speculative_tokens exceeds max_speculative_tokens",
                ));
            }
        }
        if self.suffix_max_tree_depth == 0 {
            return Err(invalid("suffix_max_tree_depth must be positive"));
        }
        if !(0.0..=1.0).contains(&self.suffix_min_token_prob) {
            return Err(invalid("suffix_min_token_prob must be within [0, 1]"));
        }
        if self.draft_token_acceptance_method == AcceptanceMethodKind::TypicalAcceptanceSampler
            && (self.posterior_threshold <= 0.0 || self.posterior_alpha <= 0.0)
        {
            return Err(invalid(
                "typical acceptance needs positive posterior_threshold and posterior_alpha",
            ));
        }
        if let Some(draft) = &self.draft_model {
            if draft.hidden_size == 0 || draft.vocab_size == 0 {
                return Err(invalid("draft model dimensions must be positive"));
            }
        }
        Ok(())
    }
}

// ─── Engine ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub batch: BatchConfig,
    /// Speculation is disabled when absent.
    pub speculative: Option<SpeculativeConfig>,
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        if let Some(spec) = &self.speculative {
            spec.validate()?;
            if spec.max_depth() + 1 > self.batch.max_num_batched_tokens {
                return Err(invalid(
                    "speculation depth does not fit in max_num_batched_tokens",
                ));
            }
        }
        Ok(())
    }
}
