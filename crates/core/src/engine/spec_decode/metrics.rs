//! Speculative decoding statistics.

use std::time::Duration;

use serde::Serialize;

use super::{DraftProposal, VerificationResult};

/// Aggregate draft and acceptance counters.
///
/// A "draft" is one request's non-empty proposal in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpecDecodingStats {
    pub num_spec_tokens: usize,
    pub num_drafts: u64,
    pub num_draft_tokens: u64,
    pub num_accepted_tokens: u64,
    /// `num_accepted_tokens_per_pos[j]` counts drafts whose token `j` was
    /// accepted.
    pub num_accepted_tokens_per_pos: Vec<u64>,
    pub num_fallback_steps: u64,
    pub total_proposal_time_ms: f64,
}

impl SpecDecodingStats {
    pub fn new(num_spec_tokens: usize) -> Self {
        Self {
            num_spec_tokens,
            num_accepted_tokens_per_pos: vec![0; num_spec_tokens],
            ..Default::default()
        }
    }

    /// Record one request's draft outcome.
    pub fn observe_draft(&mut self, num_draft_tokens: usize, num_accepted_tokens: usize) {
        debug_assert!(num_accepted_tokens <= num_draft_tokens);
        if num_draft_tokens == 0 {
            return;
        }
        self.num_drafts += 1;
        self.num_draft_tokens += num_draft_tokens as u64;
        self.num_accepted_tokens += num_accepted_tokens as u64;
        if self.num_accepted_tokens_per_pos.len() < num_accepted_tokens {
            self.num_accepted_tokens_per_pos.resize(num_accepted_tokens, 0);
        }
        for count in &mut self.num_accepted_tokens_per_pos[..num_accepted_tokens] {
            *count += 1;
        }
    }

    pub fn observe_proposal(&mut self, proposal: &DraftProposal) {
        self.add_proposal_time(proposal.proposal_time);
        if proposal.method_used == super::DraftMethod::EagleFallback {
            self.num_fallback_steps += 1;
        }
    }

    pub fn observe_verification(&mut self, result: &VerificationResult) {
        for r in &result.requests {
            self.observe_draft(r.num_proposed, r.num_accepted);
        }
    }

    pub fn add_proposal_time(&mut self, elapsed: Duration) {
        self.total_proposal_time_ms += elapsed.as_secs_f64() * 1e3;
    }

    /// Accepted over proposed draft tokens.
    pub fn acceptance_rate(&self) -> f64 {
        if self.num_draft_tokens == 0 {
            0.0
        } else {
            self.num_accepted_tokens as f64 / self.num_draft_tokens as f64
        }
    }

    /// Tokens emitted per draft, counting the bonus token.
    pub fn mean_acceptance_length(&self) -> f64 {
        if self.num_drafts == 0 {
            0.0
        } else {
            1.0 + self.num_accepted_tokens as f64 / self.num_drafts as f64
        }
    }

    /// Acceptance rate of each draft position.
    pub fn acceptance_rate_per_pos(&self) -> Vec<f64> {
        self.num_accepted_tokens_per_pos
            .iter()
            .map(|&n| {
                if self.num_drafts == 0 {
                    0.0
                } else {
                    n as f64 / self.num_drafts as f64
                }
            })
            .collect()
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.num_spec_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::spec_decode::{DraftMethod, RequestVerification};
    use crate::request::RequestId;

    #[test]
    fn empty_stats_report_zero() {
        let stats = SpecDecodingStats::new(3);
        assert_eq!(stats.acceptance_rate(), 0.0);
        assert_eq!(stats.mean_acceptance_length(), 0.0);
        assert_eq!(stats.acceptance_rate_per_pos(), vec![0.0; 3]);
    }

    #[test]
    fn observe_draft_accumulates() {
        let mut stats = SpecDecodingStats::new(3);
        stats.observe_draft(3, 3);
        stats.observe_draft(3, 1);
        stats.observe_draft(0, 0);
        assert_eq!(stats.num_drafts, 2);
        assert_eq!(stats.num_draft_tokens, 6);
        assert_eq!(stats.num_accepted_tokens, 4);
        assert_eq!(stats.num_accepted_tokens_per_pos, vec![2, 1, 1]);
        assert!((stats.acceptance_rate() - 4.0 / 6.0).abs() < 1e-9);
        assert!((stats.mean_acceptance_length() - 3.0).abs() < 1e-9);
        assert_eq!(stats.acceptance_rate_per_pos(), vec![1.0, 0.5, 0.5]);
    }

    #[test]
    fn observe_verification_and_proposal() {
        let mut stats = SpecDecodingStats::new(2);
        let result = VerificationResult {
            req_ids: vec![RequestId::from("a"), RequestId::from("b")],
            requests: vec![
                RequestVerification {
                    num_proposed: 2,
                    num_accepted: 1,
                    accepted_token_ids: vec![5],
                    bonus_token_id: Some(6),
                },
                RequestVerification::default(),
            ],
            total_proposed: 2,
            total_accepted: 1,
        };
        stats.observe_verification(&result);
        assert_eq!(stats.num_drafts, 1);

        let mut proposal = DraftProposal::empty(vec![RequestId::from("a")]);
        proposal.method_used = DraftMethod::EagleFallback;
        proposal.proposal_time = Duration::from_millis(4);
        stats.observe_proposal(&proposal);
        assert_eq!(stats.num_fallback_steps, 1);
        assert!((stats.total_proposal_time_ms - 4.0).abs() < 1e-6);
    }

    #[test]
    fn serializes_to_json() {
        let mut stats = SpecDecodingStats::new(1);
        stats.observe_draft(1, 1);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["num_accepted_tokens"], 1);
        assert_eq!(json["num_accepted_tokens_per_pos"][0], 1);
    }

    #[test]
    fn reset_keeps_depth() {
        let mut stats = SpecDecodingStats::new(2);
        stats.observe_draft(2, 2);
        stats.reset();
        assert_eq!(stats, SpecDecodingStats::new(2));
    }
}
