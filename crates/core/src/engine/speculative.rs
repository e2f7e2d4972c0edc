//! The per-step `propose → execute → verify → commit` cycle.
//!
//! One [`SpeculativeEngine`] owns the stateful processors, the drafter and
//! the verifier, and shares the slot table with the admission path through
//! [`SharedBatch`]. The table lock is taken twice per step: once to freeze
//! admissions and build the step view, once to commit verified tokens. It
//! is never held across the executor call, so admissions and removals may
//! land while the model runs; results for requests that left their slot in
//! the meantime are discarded at commit.
//!
//! Target rows are masked by the processors before verification. Row `j`
//! of a request is masked with the processors advanced by drafts `0..j`,
//! and the rejected tail is rolled back afterwards, so every processor ends
//! the step advanced by exactly the accepted drafts plus the bonus token.

use candle_core::Device;
use tracing::{debug, info, warn};

use crate::batch::{
    InputBatch, RequestHistory, ScheduledRequest, SharedBatch, SlotIndex, StepSnapshot,
};
use crate::config::{EngineConfig, SpeculativeConfig};
use crate::error::{DraftModelError, StepError};
use crate::request::RequestId;
use crate::sampling::ProcessorSet;

use super::executor::ModelExecutor;
use super::spec_decode::{
    AcceptanceMethod, AcceptanceWindow, DraftMethod, DraftProposal, Drafter, SpecDecodingStats,
    TokenVerifier, VerificationResult,
};

/// What one step did to each scheduled request, in step order.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub req_ids: Vec<RequestId>,
    /// Tokens appended this step: accepted drafts then the bonus token.
    /// Empty for partial prefills and discarded results.
    pub new_token_ids: Vec<Vec<u32>>,
    pub num_proposed: Vec<usize>,
    pub num_accepted: Vec<usize>,
    /// Requests whose result was dropped because they left their slot
    /// while the executor ran.
    pub discarded: Vec<RequestId>,
    pub method_used: DraftMethod,
}

impl StepOutput {
    pub fn num_reqs(&self) -> usize {
        self.req_ids.len()
    }

    pub fn num_new_tokens(&self) -> usize {
        self.new_token_ids.iter().map(Vec::len).sum()
    }
}

/// Moves the per-step speculation budget with the trailing acceptance
/// rate, one token at a time, inside `[min, max]`.
#[derive(Debug)]
struct DepthController {
    adaptive: bool,
    min: usize,
    max: usize,
    current: usize,
    threshold: f32,
    margin: f32,
    min_samples: usize,
    window: AcceptanceWindow,
}

impl DepthController {
    fn new(config: &SpeculativeConfig) -> Self {
        let max = config.max_depth();
        let min = config.min_speculative_tokens.min(max);
        Self {
            adaptive: config.adaptive_depth,
            min,
            max,
            current: config.num_speculative_tokens.clamp(min, max),
            threshold: config.acceptance_rate_threshold,
            margin: config.acceptance_margin,
            min_samples: config.min_window_samples,
            window: AcceptanceWindow::new(config.acceptance_window),
        }
    }

    fn current(&self) -> usize {
        self.current
    }

    fn observe(&mut self, rate: f32) {
        if !self.adaptive {
            return;
        }
        self.window.push(rate);
        if self.window.len() < self.min_samples {
            return;
        }
        let Some(mean) = self.window.mean() else {
            return;
        };
        let next = if mean > self.threshold + self.margin {
            (self.current + 1).min(self.max)
        } else if mean < self.threshold - self.margin {
            self.current.saturating_sub(1).max(self.min)
        } else {
            self.current
        };
        if next != self.current {
            debug!(from = self.current, to = next, trailing_acceptance = mean, "speculation depth changed");
            self.current = next;
            // The old window measured the old depth.
            self.window.clear();
        }
    }
}

struct Speculation {
    drafter: Drafter,
    depth: DepthController,
}

pub struct SpeculativeEngine<E> {
    batch: SharedBatch,
    executor: E,
    processors: ProcessorSet,
    speculation: Option<Speculation>,
    verifier: TokenVerifier,
    stats: SpecDecodingStats,
    max_model_len: usize,
    compact: bool,
    num_steps: u64,
}

impl<E: ModelExecutor> SpeculativeEngine<E> {
    /// Build the engine, resolving and loading the configured drafter.
    pub fn new(
        config: &EngineConfig,
        executor: E,
        processors: ProcessorSet,
        device: &Device,
    ) -> Result<Self, DraftModelError> {
        let drafter = config
            .speculative
            .as_ref()
            .map(|spec| Drafter::from_config(spec, device))
            .transpose()?;
        Ok(Self::with_drafter(config, executor, processors, drafter))
    }

    /// Build the engine around an already constructed drafter.
    pub fn with_drafter(
        config: &EngineConfig,
        executor: E,
        processors: ProcessorSet,
        drafter: Option<Drafter>,
    ) -> Self {
        let spec = config.speculative.clone().unwrap_or_default();
        let speculation = match (drafter, &config.speculative) {
            (Some(drafter), Some(spec)) => Some(Speculation {
                drafter,
                depth: DepthController::new(spec),
            }),
            _ => None,
        };
        let verifier = TokenVerifier::new(AcceptanceMethod::from_config(&spec), spec.seed);
        info!(
            max_num_reqs = config.batch.max_num_reqs,
            max_model_len = config.batch.max_model_len,
            max_num_batched_tokens = config.batch.max_num_batched_tokens,
            speculation = speculation.is_some(),
            processors = ?processors.names(),
            "engine constructed"
        );
        Self {
            batch: SharedBatch::new(&config.batch),
            executor,
            processors,
            speculation,
            verifier,
            stats: SpecDecodingStats::new(spec.max_depth()),
            max_model_len: config.batch.max_model_len,
            compact: false,
            num_steps: 0,
        }
    }

    /// Handle for the admission path.
    pub fn batch(&self) -> &SharedBatch {
        &self.batch
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn processors(&self) -> &ProcessorSet {
        &self.processors
    }

    pub fn drafter(&self) -> Option<&Drafter> {
        self.speculation.as_ref().map(|s| &s.drafter)
    }

    pub fn drafter_mut(&mut self) -> Option<&mut Drafter> {
        self.speculation.as_mut().map(|s| &mut s.drafter)
    }

    pub fn stats(&self) -> &SpecDecodingStats {
        &self.stats
    }

    /// Draft budget the next step will use, 0 without speculation.
    pub fn speculation_depth(&self) -> usize {
        self.speculation.as_ref().map_or(0, |s| s.depth.current())
    }

    pub fn num_steps(&self) -> u64 {
        self.num_steps
    }

    /// Close slot holes at the start of every step. Step views gather
    /// through `idx_mapping` either way.
    pub fn set_compaction(&mut self, compact: bool) {
        self.compact = compact;
    }

    /// Run one full step for `scheduled`.
    ///
    /// Capacity and identity errors leave the table and the pending update
    /// untouched. An executor error leaves the table and the processors'
    /// token state untouched.
    pub async fn step(&mut self, scheduled: &[ScheduledRequest]) -> Result<StepOutput, StepError> {
        let StepSnapshot {
            changes,
            input_batch,
            histories,
        } = self.batch.begin_step(scheduled, self.compact)?;
        if let Some(update) = changes.update {
            self.processors.apply_update(update);
        }
        if let Some(spec) = &mut self.speculation {
            spec.drafter.on_requests_removed(&changes.removed_req_ids);
        }

        let generates = generating_requests(&input_batch, &histories, self.max_model_len);
        let proposal = match &mut self.speculation {
            Some(spec) => {
                let depth = spec.depth.current();
                let limits: Vec<usize> = histories
                    .iter()
                    .zip(&generates)
                    .map(|(h, &generating)| {
                        if generating {
                            // Room for the drafts plus the bonus token.
                            depth.min(self.max_model_len - h.token_ids.len() - 1)
                        } else {
                            0
                        }
                    })
                    .collect();
                spec.drafter.propose(&histories, &limits)
            }
            None => DraftProposal::empty(input_batch.req_ids.clone()),
        };
        let target = match self.executor.execute(&input_batch, &proposal).await {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, num_reqs = input_batch.num_reqs(), "model execution failed");
                return Err(e.into());
            }
        };

        let mut rows = TokenVerifier::extract_rows(&proposal, &target);
        let mut fed = vec![0usize; rows.len()];
        for (i, request_rows) in rows.iter_mut().enumerate() {
            let Some(request_rows) = request_rows.as_mut().filter(|_| generates[i]) else {
                continue;
            };
            fed[i] = self.mask_rows(
                input_batch.idx_mapping[i],
                &proposal.draft_token_ids[i],
                request_rows,
            );
        }

        let result = self
            .verifier
            .verify_rows(&proposal, rows, &input_batch.sampling_metadata);
        for (i, verified) in result.requests.iter().enumerate() {
            let slot = input_batch.idx_mapping[i];
            self.processors
                .rollback(slot, fed[i].saturating_sub(verified.num_accepted));
            if generates[i] {
                if let Some(bonus) = verified.bonus_token_id {
                    self.processors.accept_tokens(slot, &[bonus]);
                }
            }
        }

        let output = self.commit(&input_batch, &histories, &proposal, &result, &generates);

        if let Some(spec) = &mut self.speculation {
            self.stats.observe_proposal(&proposal);
            self.stats.observe_verification(&result);
            if let Some(rate) = result.acceptance_rate() {
                spec.drafter.observe_acceptance(rate);
                spec.depth.observe(rate);
            }
        }
        self.num_steps += 1;
        debug!(
            step = self.num_steps,
            num_reqs = output.num_reqs(),
            new_tokens = output.num_new_tokens(),
            proposed = result.total_proposed,
            accepted = result.total_accepted,
            discarded = output.discarded.len(),
            method = %output.method_used,
            "step committed"
        );
        Ok(output)
    }

    /// Mask one request's target rows, feeding each draft to the processors
    /// after the row that scores it. Returns how many drafts were fed.
    ///
    /// Rows that do not line up with the drafts only get the first row
    /// masked, since verification will sample from it alone.
    fn mask_rows(&mut self, slot: SlotIndex, drafts: &[u32], rows: &mut [Vec<f32>]) -> usize {
        if rows.len() != drafts.len() + 1 {
            if let Some(first) = rows.first_mut() {
                self.processors.apply(slot, first);
            }
            return 0;
        }
        for (j, row) in rows.iter_mut().enumerate() {
            self.processors.apply(slot, row);
            if let Some(&draft) = drafts.get(j) {
                self.processors.accept_tokens(slot, &[draft]);
            }
        }
        drafts.len()
    }

    /// Apply verified tokens to the table under one lock.
    fn commit(
        &self,
        input_batch: &InputBatch,
        histories: &[RequestHistory],
        proposal: &DraftProposal,
        result: &VerificationResult,
        generates: &[bool],
    ) -> StepOutput {
        let num_reqs = input_batch.num_reqs();
        let mut output = StepOutput {
            req_ids: input_batch.req_ids.clone(),
            new_token_ids: Vec::with_capacity(num_reqs),
            num_proposed: proposal.num_proposed.clone(),
            num_accepted: Vec::with_capacity(num_reqs),
            discarded: Vec::new(),
            method_used: proposal.method_used,
        };

        let mut table = self.batch.lock();
        for i in 0..num_reqs {
            let req_id = &input_batch.req_ids[i];
            let slot = input_batch.idx_mapping[i];
            let live = table.slot_of(req_id) == Some(slot)
                && table.admission_seq_at(slot) == input_batch.admission_seqs[i];
            if !live {
                warn!(
                    request_id = %req_id,
                    slot = slot.get(),
                    "request left its slot during the step, discarding result"
                );
                output.discarded.push(req_id.clone());
                output.new_token_ids.push(Vec::new());
                output.num_accepted.push(0);
                continue;
            }

            let verified = &result.requests[i];
            let known = histories[i].token_ids.len();
            let mut advance = input_batch.num_scheduled_tokens[i].min(known - input_batch.seq_lens[i]);
            let mut appended = Vec::new();
            if generates[i] {
                for token in verified.output_token_ids() {
                    if let Err(e) = table.append_output_token(req_id, token) {
                        warn!(request_id = %req_id, error = %e, "dropping tokens past max model len");
                        break;
                    }
                    appended.push(token);
                }
                // Accepted drafts went through the model in this pass.
                advance += verified.num_accepted.min(appended.len());
            }
            if let Err(e) = table.update_computed_tokens(req_id, advance) {
                warn!(request_id = %req_id, error = %e, "failed to advance computed tokens");
            }
            if let Err(e) = table.set_spec_token_ids(req_id, proposal.draft_token_ids[i].clone()) {
                warn!(request_id = %req_id, error = %e, "failed to record draft tokens");
            }
            output.num_accepted.push(verified.num_accepted);
            output.new_token_ids.push(appended);
        }
        output
    }
}

/// A request generates this step when its scheduled chunk reaches the end
/// of its known tokens and there is room for one more token.
fn generating_requests(
    input_batch: &InputBatch,
    histories: &[RequestHistory],
    max_model_len: usize,
) -> Vec<bool> {
    histories
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let known = h.token_ids.len();
            input_batch.seq_lens[i] + input_batch.num_scheduled_tokens[i] >= known && known < max_model_len
        })
        .collect()
}
