//! Speculative decoding: draft proposal and verification.
//!
//! [`Drafter`] is the closed set of proposal strategies:
//!
//! - [`NgramProposer`]: prompt lookup over the request's own history
//! - [`SuffixProposer`]: incrementally built per-request suffix table
//! - [`EagleProposer`]: feature-level autoregressive draft network
//! - [`HybridDrafter`]: n-gram or draft network, chosen by trailing
//!   acceptance rate
//!
//! The configured method is resolved to one variant at construction time.
//! Every variant proposes per request independently and never more than
//! the per-request limit handed to [`Drafter::propose`].

pub mod eagle;
pub mod hybrid;
pub mod metrics;
pub mod ngram;
pub mod suffix;
pub mod verifier;

use std::time::{Duration, Instant};

use candle_core::Device;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::RequestHistory;
use crate::config::{DraftModelConfig, SpeculativeConfig, SpeculativeMethod};
use crate::error::DraftModelError;
use crate::request::RequestId;

pub use eagle::{EagleConfig, EagleProposer};
pub use hybrid::{AcceptanceWindow, HybridConfig, HybridDrafter};
pub use metrics::SpecDecodingStats;
pub use ngram::{NgramConfig, NgramProposer};
pub use suffix::{SuffixConfig, SuffixProposer};
pub use verifier::{AcceptanceMethod, RequestVerification, TargetLogprobs, TokenVerifier, VerificationResult};

/// Which strategy actually produced a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftMethod {
    Ngram,
    Suffix,
    Eagle,
    /// Model-based path without loaded weights: repeats the last token.
    EagleFallback,
    /// Speculation produced nothing this step.
    None,
}

impl std::fmt::Display for DraftMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Ngram => "ngram",
            Self::Suffix => "suffix",
            Self::Eagle => "eagle",
            Self::EagleFallback => "eagle_fallback",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// Drafter output for one step, in the step's request order.
#[derive(Debug, Clone)]
pub struct DraftProposal {
    pub req_ids: Vec<RequestId>,
    pub draft_token_ids: Vec<Vec<u32>>,
    /// Always `draft_token_ids[i].len()`.
    pub num_proposed: Vec<usize>,
    pub proposal_time: Duration,
    pub method_used: DraftMethod,
}

impl DraftProposal {
    /// A proposal with no draft tokens for any of `req_ids`.
    pub fn empty(req_ids: Vec<RequestId>) -> Self {
        let n = req_ids.len();
        Self {
            req_ids,
            draft_token_ids: vec![Vec::new(); n],
            num_proposed: vec![0; n],
            proposal_time: Duration::ZERO,
            method_used: DraftMethod::None,
        }
    }

    pub fn num_reqs(&self) -> usize {
        self.req_ids.len()
    }

    pub fn total_proposed(&self) -> usize {
        self.num_proposed.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_proposed() == 0
    }

    /// Shorten request `i`'s drafts to at most `len` tokens.
    pub fn truncate(&mut self, i: usize, len: usize) {
        if let Some(drafts) = self.draft_token_ids.get_mut(i) {
            drafts.truncate(len);
            self.num_proposed[i] = drafts.len();
        }
    }
}

/// The configured proposal strategy.
#[derive(Debug)]
pub enum Drafter {
    Ngram(NgramProposer),
    Suffix(SuffixProposer),
    Eagle(EagleProposer),
    Hybrid(HybridDrafter),
}

impl Drafter {
    /// Resolve the configured method to a drafter. Eagle, Eagle3, Medusa,
    /// MTP and standalone draft models share the draft-network variant.
    ///
    /// Weights named by `draft_model.path` are loaded here; without a path
    /// the model-based variants start degraded until
    /// [`load_model`](Self::load_model) is called.
    pub fn from_config(config: &SpeculativeConfig, device: &Device) -> Result<Self, DraftModelError> {
        let k = config.max_depth();
        let ngram = || {
            NgramProposer::new(NgramConfig {
                min_n: config.prompt_lookup_min,
                max_n: config.prompt_lookup_max,
                num_speculative_tokens: k,
            })
        };
        let draft_config = config.draft_model.clone().unwrap_or_default();
        let eagle = |draft: &DraftModelConfig| -> Result<EagleProposer, DraftModelError> {
            let mut proposer = EagleProposer::new(EagleConfig {
                hidden_size: draft.hidden_size,
                num_layers: draft.num_layers,
                vocab_size: draft.vocab_size,
                num_speculative_tokens: k,
            });
            if let Some(path) = &draft.path {
                proposer.load_safetensors(path, device)?;
            }
            Ok(proposer)
        };

        let drafter = match config.method {
            SpeculativeMethod::Ngram => Self::Ngram(ngram()),
            SpeculativeMethod::Suffix => Self::Suffix(SuffixProposer::new(SuffixConfig {
                max_tree_depth: config.suffix_max_tree_depth,
                min_token_prob: config.suffix_min_token_prob,
                num_speculative_tokens: k,
            })),
            SpeculativeMethod::Eagle
            | SpeculativeMethod::Eagle3
            | SpeculativeMethod::Medusa
            | SpeculativeMethod::Mtp
            | SpeculativeMethod::DraftModel => Self::Eagle(eagle(&draft_config)?),
            SpeculativeMethod::Hybrid => {
                let model = match &config.draft_model {
                    Some(draft) => Some(eagle(draft)?),
                    None => None,
                };
                Self::Hybrid(HybridDrafter::new(
                    ngram(),
                    model,
                    HybridConfig {
                        threshold: config.acceptance_rate_threshold,
                        margin: config.acceptance_margin,
                        window: config.acceptance_window,
                        min_samples: config.min_window_samples,
                    },
                ))
            }
        };
        info!(
            configured = %config.method,
            drafter = %drafter.method(),
            num_speculative_tokens = k,
            "drafter constructed"
        );
        Ok(drafter)
    }

    /// Method the next proposal will most likely be tagged with.
    pub fn method(&self) -> DraftMethod {
        match self {
            Self::Ngram(p) => p.method(),
            Self::Suffix(p) => p.method(),
            Self::Eagle(p) => p.method(),
            Self::Hybrid(p) => p.method(),
        }
    }

    /// Load draft-network weights into the model-based path.
    pub fn load_model(&mut self, vb: VarBuilder) -> Result<(), DraftModelError> {
        let method = self.method();
        let eagle = match self {
            Self::Eagle(p) => Some(p),
            Self::Hybrid(p) => p.eagle_mut(),
            Self::Ngram(_) | Self::Suffix(_) => None,
        };
        match eagle {
            Some(p) => p.load_model(vb),
            None => Err(DraftModelError::Config(format!(
                "{method} drafter has no draft network"
            ))),
        }
    }

    /// Propose drafts for every request of the step.
    ///
    /// `limits[i]` caps request `i`; a zero limit skips the request.
    pub fn propose(&mut self, histories: &[RequestHistory], limits: &[usize]) -> DraftProposal {
        debug_assert_eq!(histories.len(), limits.len());
        let start = Instant::now();
        let mut method_used = self.method();
        let mut draft_token_ids = Vec::with_capacity(histories.len());

        for (history, &limit) in histories.iter().zip(limits) {
            if limit == 0 {
                draft_token_ids.push(Vec::new());
                continue;
            }
            let drafts = match self {
                Self::Ngram(p) => p.propose(&history.token_ids, limit),
                Self::Suffix(p) => p.propose(history, limit),
                Self::Eagle(p) => {
                    let (tokens, method) = p.propose(&history.token_ids, limit);
                    method_used = method;
                    tokens
                }
                Self::Hybrid(p) => {
                    let (tokens, method) = p.propose(&history.token_ids, limit);
                    method_used = method;
                    tokens
                }
            };
            debug_assert!(drafts.len() <= limit);
            draft_token_ids.push(drafts);
        }

        let num_proposed: Vec<usize> = draft_token_ids.iter().map(Vec::len).collect();
        if num_proposed.iter().all(|&n| n == 0) {
            method_used = DraftMethod::None;
        }
        let proposal = DraftProposal {
            req_ids: histories.iter().map(|h| h.req_id.clone()).collect(),
            draft_token_ids,
            num_proposed,
            proposal_time: start.elapsed(),
            method_used,
        };
        debug!(
            method = %proposal.method_used,
            num_reqs = proposal.num_reqs(),
            total_proposed = proposal.total_proposed(),
            "proposed drafts"
        );
        proposal
    }

    /// Release per-request state of requests that left the batch.
    pub fn on_requests_removed(&mut self, req_ids: &[RequestId]) {
        if let Self::Suffix(p) = self {
            for id in req_ids {
                p.remove_request(id);
            }
        }
    }

    /// Feed the step's acceptance rate to drafters that adapt to it.
    pub fn observe_acceptance(&mut self, rate: f32) {
        if let Self::Hybrid(p) = self {
            p.update_acceptance_rate(rate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::SlotIndex;
    use candle_core::DType;

    fn history(id: &str, tokens: &[u32]) -> RequestHistory {
        RequestHistory {
            req_id: RequestId::from(id),
            slot: SlotIndex::new(0),
            admission_seq: 0,
            token_ids: tokens.to_vec(),
        }
    }

    fn config(method: SpeculativeMethod) -> SpeculativeConfig {
        SpeculativeConfig {
            method,
            num_speculative_tokens: 2,
            prompt_lookup_min: 1,
            prompt_lookup_max: 3,
            draft_model: Some(DraftModelConfig {
                path: None,
                hidden_size: 8,
                num_layers: 1,
                vocab_size: 32,
            }),
            ..Default::default()
        }
    }

    fn drafter(method: SpeculativeMethod) -> Drafter {
        Drafter::from_config(&config(method), &Device::Cpu).unwrap()
    }

    #[test]
    fn from_config_is_a_single_resolution() {
        assert!(matches!(drafter(SpeculativeMethod::Ngram), Drafter::Ngram(_)));
        assert!(matches!(drafter(SpeculativeMethod::Suffix), Drafter::Suffix(_)));
        assert!(matches!(drafter(SpeculativeMethod::Hybrid), Drafter::Hybrid(_)));
        for method in [
            SpeculativeMethod::Eagle,
            SpeculativeMethod::Eagle3,
            SpeculativeMethod::Medusa,
            SpeculativeMethod::Mtp,
            SpeculativeMethod::DraftModel,
        ] {
            assert!(matches!(drafter(method), Drafter::Eagle(_)));
        }
    }

    #[test]
    fn proposal_shape_matches_histories() {
        let mut d = drafter(SpeculativeMethod::Ngram);
        let histories = [history("a", &[1, 2, 3, 1, 2]), history("b", &[9, 8, 7])];
        let proposal = d.propose(&histories, &[2, 2]);
        assert_eq!(proposal.req_ids, vec![RequestId::from("a"), RequestId::from("b")]);
        assert_eq!(proposal.draft_token_ids, vec![vec![3, 1], vec![]]);
        assert_eq!(proposal.num_proposed, vec![2, 0]);
        assert_eq!(proposal.method_used, DraftMethod::Ngram);
    }

    #[test]
    fn zero_limit_skips_request() {
        let mut d = drafter(SpeculativeMethod::Ngram);
        let proposal = d.propose(&[history("a", &[1, 2, 1, 2])], &[0]);
        assert!(proposal.is_empty());
        assert_eq!(proposal.method_used, DraftMethod::None);
    }

    #[test]
    fn never_exceeds_configured_depth() {
        let mut d = drafter(SpeculativeMethod::Ngram);
        let tokens: Vec<u32> = (0..40).map(|i| i % 4).collect();
        let proposal = d.propose(&[history("a", &tokens)], &[10]);
        assert_eq!(proposal.num_proposed, vec![2]);
    }

    #[test]
    fn unloaded_eagle_is_tagged_fallback() {
        let mut d = drafter(SpeculativeMethod::Eagle);
        let proposal = d.propose(&[history("a", &[3, 4])], &[2]);
        assert_eq!(proposal.draft_token_ids, vec![vec![4, 4]]);
        assert_eq!(proposal.method_used, DraftMethod::EagleFallback);
    }

    #[test]
    fn load_model_switches_off_fallback() {
        let mut d = drafter(SpeculativeMethod::Eagle);
        d.load_model(VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();
        assert_eq!(d.method(), DraftMethod::Eagle);
    }

    #[test]
    fn load_model_on_lookup_drafter_is_error() {
        let mut d = drafter(SpeculativeMethod::Ngram);
        let err = d
            .load_model(VarBuilder::zeros(DType::F32, &Device::Cpu))
            .unwrap_err();
        assert!(matches!(err, DraftModelError::Config(_)));
    }

    #[test]
    fn removed_requests_release_suffix_tables() {
        let mut d = drafter(SpeculativeMethod::Suffix);
        d.propose(&[history("a", &[1, 2, 1]), history("b", &[5, 5])], &[2, 2]);
        d.on_requests_removed(&[RequestId::from("a")]);
        let Drafter::Suffix(p) = &d else {
            panic!("expected suffix drafter");
        };
        assert_eq!(p.num_tracked(), 1);
    }

    #[test]
    fn truncate_keeps_counts_consistent() {
        let mut proposal = DraftProposal {
            req_ids: vec![RequestId::from("a")],
            draft_token_ids: vec![vec![1, 2, 3]],
            num_proposed: vec![3],
            proposal_time: Duration::ZERO,
            method_used: DraftMethod::Ngram,
        };
        proposal.truncate(0, 1);
        assert_eq!(proposal.draft_token_ids[0], vec![1]);
        assert_eq!(proposal.num_proposed[0], 1);
        proposal.truncate(5, 0);
        assert_eq!(proposal.total_proposed(), 1);
    }
}
