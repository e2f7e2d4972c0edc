//! Draft verification against the target model (arxiv:2211.17192).
//!
//! Each request's drafts are walked left to right and the walk stops at the
//! first token the acceptance rule rejects. Every request then gets exactly
//! one extra token from the target distribution: the recovered token at the
//! rejection point, or the bonus token after the last draft when all were
//! accepted. Sampled requests are judged against their tempered and
//! top-k/top-p/min-p filtered distribution. Verification never fails;
//! malformed executor output degrades to zero accepted drafts for that
//! request.

use candle_core::{DType, Device, Tensor};
use tracing::warn;

use crate::config::{AcceptanceMethodKind, SpeculativeConfig};
use crate::request::RequestId;
use crate::sampling::{argmax, sample_from_probs, SamplerState, SamplingMetadata, Warp};

use super::DraftProposal;

/// Acceptance rule for one draft token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcceptanceMethod {
    /// Accept only the target argmax.
    Greedy,
    /// Accept with probability `min(1, p(x) / q(x))`. Lookup drafters have
    /// no draft distribution, so `q` is one-hot on the draft token.
    RejectionSampler,
    /// Accept when `p(x)` exceeds `min(threshold, alpha * exp(-H(p)))`.
    TypicalAcceptance {
        posterior_threshold: f32,
        posterior_alpha: f32,
    },
}

impl AcceptanceMethod {
    pub fn from_config(config: &SpeculativeConfig) -> Self {
        match config.draft_token_acceptance_method {
            AcceptanceMethodKind::Greedy => Self::Greedy,
            AcceptanceMethodKind::RejectionSampler => Self::RejectionSampler,
            AcceptanceMethodKind::TypicalAcceptanceSampler => Self::TypicalAcceptance {
                posterior_threshold: config.posterior_threshold,
                posterior_alpha: config.posterior_alpha,
            },
        }
    }
}

/// Target-model log-probabilities for one step.
///
/// Entry `i` belongs to request `i` of the step and has shape
/// `[num_proposed_i + 1, vocab_size]`: row `j < num_proposed_i` scores the
/// position of draft `j`, the last row scores the bonus position.
#[derive(Debug, Clone)]
pub struct TargetLogprobs {
    pub per_request: Vec<Tensor>,
}

impl TargetLogprobs {
    pub fn new(per_request: Vec<Tensor>) -> Self {
        Self { per_request }
    }

    /// Build from nested `[request][position][vocab]` rows.
    pub fn from_rows(rows: &[Vec<Vec<f32>>], device: &Device) -> candle_core::Result<Self> {
        let per_request = rows
            .iter()
            .map(|positions| {
                let vocab = positions.first().map_or(0, Vec::len);
                let flat: Vec<f32> = positions.iter().flatten().copied().collect();
                Tensor::from_vec(flat, (positions.len(), vocab), device)
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { per_request })
    }

    pub fn num_reqs(&self) -> usize {
        self.per_request.len()
    }
}

/// Verification outcome of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestVerification {
    pub num_proposed: usize,
    pub num_accepted: usize,
    /// The accepted prefix of the drafts.
    pub accepted_token_ids: Vec<u32>,
    /// Recovered or bonus token; `None` only when the executor returned no
    /// usable row for this request.
    pub bonus_token_id: Option<u32>,
}

impl RequestVerification {
    /// Tentatively accepted draft tokens that must be unwound.
    pub fn num_rollback(&self) -> usize {
        self.num_proposed - self.num_accepted
    }

    /// Tokens to append to the request: accepted drafts then the bonus.
    pub fn output_token_ids(&self) -> Vec<u32> {
        let mut out = self.accepted_token_ids.clone();
        out.extend(self.bonus_token_id);
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct VerificationResult {
    pub req_ids: Vec<RequestId>,
    pub requests: Vec<RequestVerification>,
    pub total_proposed: usize,
    pub total_accepted: usize,
}

impl VerificationResult {
    pub fn num_accepted(&self) -> Vec<usize> {
        self.requests.iter().map(|r| r.num_accepted).collect()
    }

    /// Accepted over proposed drafts, `None` when nothing was proposed.
    pub fn acceptance_rate(&self) -> Option<f32> {
        (self.total_proposed > 0).then(|| self.total_accepted as f32 / self.total_proposed as f32)
    }
}

#[derive(Debug)]
pub struct TokenVerifier {
    method: AcceptanceMethod,
    state: SamplerState,
}

impl TokenVerifier {
    pub fn new(method: AcceptanceMethod, seed: Option<u64>) -> Self {
        Self {
            method,
            state: SamplerState::new(seed),
        }
    }

    pub fn method(&self) -> AcceptanceMethod {
        self.method
    }

    /// Verify every request of `proposal` against `target`.
    ///
    /// Requests whose temperature is zero are always verified by argmax
    /// match, whatever the configured rule.
    pub fn verify(
        &mut self,
        proposal: &DraftProposal,
        target: &TargetLogprobs,
        metadata: &SamplingMetadata,
    ) -> VerificationResult {
        let rows = Self::extract_rows(proposal, target);
        self.verify_rows(proposal, rows, metadata)
    }

    /// Copy each request's logprob rows out of the target tensors.
    /// Unreadable or missing entries become `None`.
    pub fn extract_rows(
        proposal: &DraftProposal,
        target: &TargetLogprobs,
    ) -> Vec<Option<Vec<Vec<f32>>>> {
        if target.num_reqs() != proposal.num_reqs() {
            warn!(
                expected = proposal.num_reqs(),
                got = target.num_reqs(),
                "target logprobs do not cover the step"
            );
        }
        proposal
            .req_ids
            .iter()
            .enumerate()
            .map(|(i, req_id)| {
                match target
                    .per_request
                    .get(i)
                    .map(|t| t.to_dtype(DType::F32).and_then(|t| t.to_vec2::<f32>()))
                {
                    Some(Ok(rows)) => Some(rows),
                    Some(Err(e)) => {
                        warn!(request_id = %req_id, error = %e, "unreadable target logprobs");
                        None
                    }
                    None => None,
                }
            })
            .collect()
    }

    /// Verify against rows already extracted (and possibly masked by
    /// logits processors).
    pub fn verify_rows(
        &mut self,
        proposal: &DraftProposal,
        rows: Vec<Option<Vec<Vec<f32>>>>,
        metadata: &SamplingMetadata,
    ) -> VerificationResult {
        let mut result = VerificationResult {
            req_ids: proposal.req_ids.clone(),
            ..Default::default()
        };
        let mut rows = rows.into_iter();
        for (i, drafts) in proposal.draft_token_ids.iter().enumerate() {
            let greedy = self.method == AcceptanceMethod::Greedy
                || (i < metadata.num_reqs() && metadata.is_greedy(i));
            let verified = self.verify_request(
                &proposal.req_ids[i],
                drafts,
                rows.next().flatten(),
                greedy,
                metadata.warp(i),
            );
            debug_assert!(verified.num_accepted <= verified.num_proposed);
            result.total_proposed += verified.num_proposed;
            result.total_accepted += verified.num_accepted;
            result.requests.push(verified);
        }
        result
    }

    fn verify_request(
        &mut self,
        req_id: &RequestId,
        drafts: &[u32],
        rows: Option<Vec<Vec<f32>>>,
        greedy: bool,
        warp: Warp,
    ) -> RequestVerification {
        let k = drafts.len();
        let mut out = RequestVerification {
            num_proposed: k,
            ..Default::default()
        };
        let Some(rows) = rows else {
            return out;
        };

        let vocab = rows.first().map_or(0, Vec::len);
        if vocab == 0 {
            warn!(request_id = %req_id, "empty target logprobs");
            return out;
        }
        if rows.len() != k + 1 {
            warn!(
                request_id = %req_id,
                expected = k + 1,
                got = rows.len(),
                "malformed target logprobs, accepting no drafts"
            );
            out.bonus_token_id = Some(self.sample(&rows[0], greedy, warp));
            return out;
        }

        for (&draft, logprobs) in drafts.iter().zip(&rows) {
            if greedy {
                if argmax(logprobs) == draft {
                    out.accepted_token_ids.push(draft);
                    continue;
                }
                out.bonus_token_id = Some(argmax(logprobs));
                break;
            }

            let probs = warp.probs(logprobs);
            let p_draft = probs.get(draft as usize).copied().unwrap_or(0.0);
            let accepted = match self.method {
                AcceptanceMethod::Greedy => argmax(logprobs) == draft,
                AcceptanceMethod::RejectionSampler => self.state.next_f32() < p_draft,
                AcceptanceMethod::TypicalAcceptance {
                    posterior_threshold,
                    posterior_alpha,
                } => {
                    let threshold =
                        posterior_threshold.min(posterior_alpha * (-entropy(&probs)).exp());
                    p_draft > threshold
                }
            };
            if accepted {
                out.accepted_token_ids.push(draft);
                continue;
            }
            let recovered = match self.method {
                AcceptanceMethod::RejectionSampler => {
                    recovered_token(&probs, draft, &mut self.state)
                }
                _ => argmax(&probs),
            };
            out.bonus_token_id = Some(recovered);
            break;
        }

        out.num_accepted = out.accepted_token_ids.len();
        if out.num_accepted == k {
            out.bonus_token_id = Some(self.sample(&rows[k], greedy, warp));
        }
        out
    }

    fn sample(&mut self, logprobs: &[f32], greedy: bool, warp: Warp) -> u32 {
        if greedy {
            argmax(logprobs)
        } else {
            sample_from_probs(&warp.probs(logprobs), &mut self.state)
        }
    }
}

fn entropy(probs: &[f32]) -> f32 {
    probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| -p * p.ln())
        .sum()
}

/// Sample from the target distribution with the rejected draft zeroed out
/// and the rest renormalized.
fn recovered_token(probs: &[f32], draft: u32, state: &mut SamplerState) -> u32 {
    let mut adjusted = probs.to_vec();
    if let Some(p) = adjusted.get_mut(draft as usize) {
        *p = 0.0;
    }
    let sum: f32 = adjusted.iter().sum();
    if sum <= 0.0 {
        return argmax(probs);
    }
    let inv_sum = 1.0 / sum;
    for p in adjusted.iter_mut() {
        *p *= inv_sum;
    }
    sample_from_probs(&adjusted, state)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::spec_decode::DraftMethod;

    const VOCAB: usize = 5;

    /// Log-probability row peaked on `token` with probability `p`, the
    /// remainder spread evenly.
    fn row(token: u32, p: f32) -> Vec<f32> {
        let rest = (1.0 - p) / (VOCAB - 1) as f32;
        (0..VOCAB as u32)
            .map(|t| if t == token { p.ln() } else { rest.ln() })
            .collect()
    }

    fn proposal(drafts: Vec<Vec<u32>>) -> DraftProposal {
        DraftProposal {
            req_ids: (0..drafts.len()).map(|i| RequestId::from(format!("r{i}"))).collect(),
            num_proposed: drafts.iter().map(Vec::len).collect(),
            draft_token_ids: drafts,
            proposal_time: Duration::ZERO,
            method_used: DraftMethod::Ngram,
        }
    }

    fn target(rows: Vec<Vec<Vec<f32>>>) -> TargetLogprobs {
        TargetLogprobs::from_rows(&rows, &Device::Cpu).unwrap()
    }

    fn metadata(temperatures: Vec<f32>) -> SamplingMetadata {
        SamplingMetadata {
            temperature: temperatures,
            ..Default::default()
        }
    }

    fn verifier(method: AcceptanceMethod) -> TokenVerifier {
        TokenVerifier::new(method, Some(7))
    }

    // ─── Greedy ─────────────────────────────────────────────────────────

    #[test]
    fn greedy_all_match_emits_bonus() {
        let mut v = verifier(AcceptanceMethod::RejectionSampler);
        let result = v.verify(
            &proposal(vec![vec![1, 2]]),
            &target(vec![vec![row(1, 0.9), row(2, 0.9), row(3, 0.9)]]),
            &metadata(vec![0.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.accepted_token_ids, vec![1, 2]);
        assert_eq!(r.bonus_token_id, Some(3));
        assert_eq!(r.num_rollback(), 0);
        assert_eq!(r.output_token_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn greedy_first_mismatch_stops() {
        let mut v = verifier(AcceptanceMethod::Greedy);
        let result = v.verify(
            &proposal(vec![vec![1, 2, 3]]),
            &target(vec![vec![row(1, 0.6), row(4, 0.6), row(3, 0.6), row(0, 0.6)]]),
            &metadata(vec![1.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.num_accepted, 1);
        assert_eq!(r.bonus_token_id, Some(4));
        assert_eq!(r.num_rollback(), 2);
        assert_eq!(result.acceptance_rate(), Some(1.0 / 3.0));
    }

    #[test]
    fn greedy_immediate_reject() {
        let mut v = verifier(AcceptanceMethod::Greedy);
        let result = v.verify(
            &proposal(vec![vec![2]]),
            &target(vec![vec![row(0, 0.9), row(1, 0.9)]]),
            &metadata(vec![0.0]),
        );
        assert_eq!(result.num_accepted(), vec![0]);
        assert_eq!(result.requests[0].bonus_token_id, Some(0));
    }

    // ─── Rejection sampling ─────────────────────────────────────────────

    #[test]
    fn rejection_certain_draft_is_accepted() {
        let mut v = verifier(AcceptanceMethod::RejectionSampler);
        let certain: Vec<f32> = (0..VOCAB).map(|t| if t == 2 { 0.0 } else { f32::NEG_INFINITY }).collect();
        for _ in 0..20 {
            let result = v.verify(
                &proposal(vec![vec![2]]),
                &target(vec![vec![certain.clone(), row(0, 0.9)]]),
                &metadata(vec![1.0]),
            );
            assert_eq!(result.requests[0].num_accepted, 1);
        }
    }

    #[test]
    fn rejection_impossible_draft_recovers_other_token() {
        let mut v = verifier(AcceptanceMethod::RejectionSampler);
        let never: Vec<f32> = (0..VOCAB).map(|t| if t == 3 { f32::NEG_INFINITY } else { 0.0 }).collect();
        for _ in 0..20 {
            let result = v.verify(
                &proposal(vec![vec![3, 3]]),
                &target(vec![vec![never.clone(), row(0, 0.5), row(0, 0.5)]]),
                &metadata(vec![1.0]),
            );
            let r = &result.requests[0];
            assert_eq!(r.num_accepted, 0);
            assert_eq!(r.num_rollback(), 2);
            assert_ne!(r.bonus_token_id, Some(3));
            assert!(r.bonus_token_id.is_some());
        }
    }

    #[test]
    fn recovered_token_zeroes_draft() {
        let mut state = SamplerState::new(Some(1));
        let probs = [0.1, 0.8, 0.1];
        for _ in 0..50 {
            assert_ne!(recovered_token(&probs, 1, &mut state), 1);
        }
    }

    #[test]
    fn seeded_verifiers_agree() {
        let drafts = proposal(vec![vec![1, 2, 3], vec![0, 4]]);
        let logprobs = target(vec![
            vec![row(1, 0.5), row(2, 0.5), row(3, 0.5), row(1, 0.5)],
            vec![row(0, 0.4), row(4, 0.4), row(2, 0.4)],
        ]);
        let meta = metadata(vec![1.0, 1.0]);
        let a = verifier(AcceptanceMethod::RejectionSampler).verify(&drafts, &logprobs, &meta);
        let b = verifier(AcceptanceMethod::RejectionSampler).verify(&drafts, &logprobs, &meta);
        assert_eq!(a.requests, b.requests);
    }

    // ─── Typical acceptance ─────────────────────────────────────────────

    fn typical() -> AcceptanceMethod {
        AcceptanceMethod::TypicalAcceptance {
            posterior_threshold: 0.09,
            posterior_alpha: 0.3,
        }
    }

    #[test]
    fn typical_accepts_likely_token() {
        let mut v = verifier(typical());
        let result = v.verify(
            &proposal(vec![vec![1]]),
            &target(vec![vec![row(1, 0.5), row(2, 0.9)]]),
            &metadata(vec![1.0]),
        );
        assert_eq!(result.requests[0].num_accepted, 1);
    }

    #[test]
    fn typical_rejects_unlikely_token_and_recovers_argmax() {
        let mut v = verifier(typical());
        // Token 1 gets 0.01 while token 0 holds 0.96.
        let logprobs = vec![0.96f32.ln(), 0.01f32.ln(), 0.01f32.ln(), 0.01f32.ln(), 0.01f32.ln()];
        let result = v.verify(
            &proposal(vec![vec![1]]),
            &target(vec![vec![logprobs, row(2, 0.9)]]),
            &metadata(vec![1.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.num_accepted, 0);
        assert_eq!(r.bonus_token_id, Some(0));
    }

    // ─── Tempered distributions ─────────────────────────────────────────

    #[test]
    fn top_k_one_reduces_sampling_to_argmax() {
        let meta = SamplingMetadata {
            temperature: vec![1.0],
            top_k: vec![1],
            ..Default::default()
        };
        for seed in 0..20 {
            let mut v = TokenVerifier::new(AcceptanceMethod::RejectionSampler, Some(seed));
            let result = v.verify(
                &proposal(vec![vec![1, 2]]),
                &target(vec![vec![row(1, 0.4), row(3, 0.4), row(0, 0.4)]]),
                &meta,
            );
            let r = &result.requests[0];
            assert_eq!(r.accepted_token_ids, vec![1]);
            assert_eq!(r.bonus_token_id, Some(3));
        }
    }

    #[test]
    fn cold_temperature_accepts_the_mode() {
        let meta = metadata(vec![0.05]);
        for seed in 0..20 {
            let mut v = TokenVerifier::new(AcceptanceMethod::RejectionSampler, Some(seed));
            let result = v.verify(
                &proposal(vec![vec![2]]),
                &target(vec![vec![row(2, 0.4), row(4, 0.4)]]),
                &meta,
            );
            assert_eq!(result.requests[0].output_token_ids(), vec![2, 4]);
        }
    }

    #[test]
    fn masked_rows_steer_recovery() {
        let mut v = verifier(AcceptanceMethod::Greedy);
        let mut masked = row(1, 0.9);
        masked[1] = f32::NEG_INFINITY;
        let result = v.verify_rows(
            &proposal(vec![vec![1]]),
            vec![Some(vec![masked, row(0, 0.9)])],
            &metadata(vec![0.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.num_accepted, 0);
        assert_ne!(r.bonus_token_id, Some(1));
    }

    // ─── Degradation ────────────────────────────────────────────────────

    #[test]
    fn no_drafts_samples_one_token() {
        let mut v = verifier(AcceptanceMethod::RejectionSampler);
        let result = v.verify(
            &proposal(vec![vec![]]),
            &target(vec![vec![row(4, 0.9)]]),
            &metadata(vec![0.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.num_proposed, 0);
        assert_eq!(r.bonus_token_id, Some(4));
        assert!(result.acceptance_rate().is_none());
    }

    #[test]
    fn wrong_row_count_accepts_nothing() {
        let mut v = verifier(AcceptanceMethod::Greedy);
        let result = v.verify(
            &proposal(vec![vec![1, 2]]),
            &target(vec![vec![row(1, 0.9)]]),
            &metadata(vec![0.0]),
        );
        let r = &result.requests[0];
        assert_eq!(r.num_accepted, 0);
        assert_eq!(r.num_rollback(), 2);
        assert_eq!(r.bonus_token_id, Some(1));
    }

    #[test]
    fn missing_request_logprobs_degrade() {
        let mut v = verifier(AcceptanceMethod::Greedy);
        let result = v.verify(
            &proposal(vec![vec![1], vec![2]]),
            &target(vec![vec![row(1, 0.9), row(0, 0.9)]]),
            &metadata(vec![0.0, 0.0]),
        );
        assert_eq!(result.num_accepted(), vec![1, 0]);
        assert_eq!(result.requests[1].bonus_token_id, None);
        assert_eq!(result.total_proposed, 2);
    }

    #[test]
    fn out_of_vocab_draft_is_rejected() {
        let mut v = verifier(AcceptanceMethod::RejectionSampler);
        let result = v.verify(
            &proposal(vec![vec![VOCAB as u32 + 3]]),
            &target(vec![vec![row(0, 0.9), row(0, 0.9)]]),
            &metadata(vec![1.0]),
        );
        assert_eq!(result.requests[0].num_accepted, 0);
    }

    #[test]
    fn accepted_never_exceeds_proposed() {
        let mut v = TokenVerifier::new(AcceptanceMethod::RejectionSampler, Some(3));
        for step in 0..50u32 {
            let drafts: Vec<u32> = (0..(step % 4)).map(|j| (step + j) % VOCAB as u32).collect();
            let rows: Vec<Vec<f32>> = (0..=drafts.len())
                .map(|j| row((step * 3 + j as u32) % VOCAB as u32, 0.6))
                .collect();
            let result = v.verify(&proposal(vec![drafts]), &target(vec![rows]), &metadata(vec![0.8]));
            let r = &result.requests[0];
            assert!(r.num_accepted <= r.num_proposed);
            assert!(r.bonus_token_id.is_some());
        }
    }
}
