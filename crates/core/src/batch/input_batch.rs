//! Step-scoped tensors handed to the model executor.
//!
//! Construction always gathers through `idx_mapping` (step position →
//! slot), so the slot table does not need to be dense. The build is
//! read-only on the table and validates the whole schedule before
//! producing anything.

use std::collections::HashSet;

use crate::error::BatchError;
use crate::request::RequestId;
use crate::sampling::SamplingMetadata;

use super::{SlotIndex, SlotTable};

/// One scheduler decision: run `num_tokens` tokens of `req_id` this step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledRequest {
    pub req_id: RequestId,
    pub num_tokens: usize,
}

impl ScheduledRequest {
    pub fn new(req_id: impl Into<RequestId>, num_tokens: usize) -> Self {
        Self {
            req_id: req_id.into(),
            num_tokens,
        }
    }
}

/// Immutable copy of one request's known tokens, handed to drafters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHistory {
    pub req_id: RequestId,
    pub slot: SlotIndex,
    pub admission_seq: u64,
    pub token_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct InputBatch {
    pub req_ids: Vec<RequestId>,
    /// Step position → slot.
    pub idx_mapping: Vec<SlotIndex>,
    /// Admission sequence of each request at build time.
    pub admission_seqs: Vec<u64>,
    pub num_scheduled_tokens: Vec<usize>,
    /// Flattened token ids; tokens not yet known are placeholder zeros.
    pub input_ids: Vec<u32>,
    pub positions: Vec<usize>,
    /// Exclusive prefix sum of `num_scheduled_tokens`, length `num_reqs + 1`.
    pub query_start_loc: Vec<usize>,
    pub seq_lens: Vec<usize>,
    /// Offset of the last scheduled token of each request.
    pub logits_indices: Vec<usize>,
    pub sampling_metadata: SamplingMetadata,
}

impl InputBatch {
    /// Check the schedule against the table without building anything.
    ///
    /// Returns the total number of scheduled tokens.
    pub fn validate(table: &SlotTable, scheduled: &[ScheduledRequest]) -> Result<usize, BatchError> {
        let mut seen = HashSet::with_capacity(scheduled.len());
        let mut total = 0usize;
        for req in scheduled {
            let idx = table
                .slot_of(&req.req_id)
                .ok_or_else(|| BatchError::UnknownRequest(req.req_id.clone()))?;
            if !seen.insert(&req.req_id) {
                return Err(BatchError::DuplicateRequest(req.req_id.clone()));
            }
            if req.num_tokens == 0 {
                return Err(BatchError::EmptyTokenBudget(req.req_id.clone()));
            }
            let required = table.num_computed_tokens(idx) + req.num_tokens;
            if required > table.max_model_len() {
                return Err(BatchError::ModelLenExceeded {
                    req_id: req.req_id.clone(),
                    required,
                    max_model_len: table.max_model_len(),
                });
            }
            total += req.num_tokens;
        }
        if total > table.max_num_batched_tokens() {
            return Err(BatchError::BatchOverflow {
                requested: total,
                max_num_batched_tokens: table.max_num_batched_tokens(),
            });
        }
        Ok(total)
    }

    /// Build the step view for `scheduled`, in scheduler order.
    pub fn build(table: &SlotTable, scheduled: &[ScheduledRequest]) -> Result<Self, BatchError> {
        let total_tokens = Self::validate(table, scheduled)?;
        let num_reqs = scheduled.len();

        let mut req_ids = Vec::with_capacity(num_reqs);
        let mut idx_mapping = Vec::with_capacity(num_reqs);
        let mut admission_seqs = Vec::with_capacity(num_reqs);
        let mut num_scheduled_tokens = Vec::with_capacity(num_reqs);
        let mut seq_lens = Vec::with_capacity(num_reqs);
        let mut query_start_loc = Vec::with_capacity(num_reqs + 1);
        let mut logits_indices = Vec::with_capacity(num_reqs);
        let mut input_ids = Vec::with_capacity(total_tokens);
        let mut positions = Vec::with_capacity(total_tokens);

        query_start_loc.push(0);
        for req in scheduled {
            // Resolved by `validate` above.
            let Some(idx) = table.slot_of(&req.req_id) else {
                return Err(BatchError::UnknownRequest(req.req_id.clone()));
            };
            let computed = table.num_computed_tokens(idx);
            let known = table.token_ids(idx);
            for pos in computed..computed + req.num_tokens {
                input_ids.push(known.get(pos).copied().unwrap_or(0));
                positions.push(pos);
            }

            let end = query_start_loc[query_start_loc.len() - 1] + req.num_tokens;
            query_start_loc.push(end);
            logits_indices.push(end - 1);

            req_ids.push(req.req_id.clone());
            idx_mapping.push(idx);
            admission_seqs.push(table.admission_seq_at(idx));
            num_scheduled_tokens.push(req.num_tokens);
            seq_lens.push(computed);
        }

        let sampling_metadata = SamplingMetadata::gather(table, &idx_mapping);
        debug_assert_eq!(input_ids.len(), total_tokens);

        Ok(Self {
            req_ids,
            idx_mapping,
            admission_seqs,
            num_scheduled_tokens,
            input_ids,
            positions,
            query_start_loc,
            seq_lens,
            logits_indices,
            sampling_metadata,
        })
    }

    pub fn num_reqs(&self) -> usize {
        self.req_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.req_ids.is_empty()
    }

    pub fn total_num_scheduled_tokens(&self) -> usize {
        self.input_ids.len()
    }

    /// Copy every scheduled request's known tokens, in step order.
    pub fn histories(&self, table: &SlotTable) -> Vec<RequestHistory> {
        self.req_ids
            .iter()
            .zip(&self.idx_mapping)
            .zip(&self.admission_seqs)
            .map(|((req_id, &slot), &admission_seq)| RequestHistory {
                req_id: req_id.clone(),
                slot,
                admission_seq,
                token_ids: table.token_ids(slot).to_vec(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::sampling::SamplingParams;

    fn table_with(prompts: &[(&str, Vec<u32>)]) -> SlotTable {
        let mut table = SlotTable::new(&BatchConfig {
            max_num_reqs: 8,
            max_model_len: 32,
            max_num_batched_tokens: 16,
        });
        for (id, prompt) in prompts {
            table
                .add(RequestId::from(*id), prompt.clone(), SamplingParams::default())
                .unwrap();
        }
        table
    }

    #[test]
    fn offsets_follow_token_budgets() {
        let table = table_with(&[
            ("a", vec![1, 2, 3, 4]),
            ("b", vec![5, 6]),
            ("c", vec![7, 8, 9, 10, 11, 12]),
        ]);
        let scheduled = [
            ScheduledRequest::new("a", 4),
            ScheduledRequest::new("b", 2),
            ScheduledRequest::new("c", 6),
        ];
        let batch = InputBatch::build(&table, &scheduled).unwrap();
        assert_eq!(batch.query_start_loc, vec![0, 4, 6, 12]);
        assert_eq!(batch.logits_indices, vec![3, 5, 11]);
        assert_eq!(batch.total_num_scheduled_tokens(), 12);
        assert_eq!(batch.input_ids, (1..=12).collect::<Vec<u32>>());
        assert_eq!(batch.positions[..4], [0, 1, 2, 3]);
        assert_eq!(batch.seq_lens, vec![0, 0, 0]);
    }

    #[test]
    fn decode_step_uses_computed_offsets() {
        let mut table = table_with(&[("a", vec![1, 2, 3])]);
        let id = RequestId::from("a");
        table.update_computed_tokens(&id, 3).unwrap();
        table.append_output_token(&id, 42).unwrap();

        let batch = InputBatch::build(&table, &[ScheduledRequest::new("a", 2)]).unwrap();
        assert_eq!(batch.positions, vec![3, 4]);
        // Position 3 holds the sampled token; position 4 is not known yet.
        assert_eq!(batch.input_ids, vec![42, 0]);
        assert_eq!(batch.seq_lens, vec![3]);
        assert_eq!(batch.logits_indices, vec![1]);
    }

    #[test]
    fn step_order_is_scheduler_order() {
        let table = table_with(&[("a", vec![1]), ("b", vec![2])]);
        let batch = InputBatch::build(
            &table,
            &[ScheduledRequest::new("b", 1), ScheduledRequest::new("a", 1)],
        )
        .unwrap();
        assert_eq!(batch.idx_mapping, vec![SlotIndex::new(1), SlotIndex::new(0)]);
        assert_eq!(batch.input_ids, vec![2, 1]);
    }

    #[test]
    fn unknown_request_is_rejected() {
        let table = table_with(&[("a", vec![1])]);
        let err = InputBatch::build(&table, &[ScheduledRequest::new("zzz", 1)]).unwrap_err();
        assert_eq!(err, BatchError::UnknownRequest(RequestId::from("zzz")));
    }

    #[test]
    fn overflow_is_rejected() {
        let table = table_with(&[("a", vec![1; 10]), ("b", vec![1; 10])]);
        let err = InputBatch::build(
            &table,
            &[ScheduledRequest::new("a", 10), ScheduledRequest::new("b", 10)],
        )
        .unwrap_err();
        assert_eq!(
            err,
            BatchError::BatchOverflow {
                requested: 20,
                max_num_batched_tokens: 16
            }
        );
    }

    #[test]
    fn zero_budget_is_rejected() {
        let table = table_with(&[("a", vec![1])]);
        let err = InputBatch::build(&table, &[ScheduledRequest::new("a", 0)]).unwrap_err();
        assert_eq!(err, BatchError::EmptyTokenBudget(RequestId::from("a")));
    }

    #[test]
    fn duplicate_schedule_entry_is_rejected() {
        let table = table_with(&[("a", vec![1, 2])]);
        let err = InputBatch::build(
            &table,
            &[ScheduledRequest::new("a", 1), ScheduledRequest::new("a", 1)],
        )
        .unwrap_err();
        assert_eq!(err, BatchError::DuplicateRequest(RequestId::from("a")));
    }

    #[test]
    fn histories_are_copies() {
        let table = table_with(&[("a", vec![4, 5, 6])]);
        let batch = InputBatch::build(&table, &[ScheduledRequest::new("a", 3)]).unwrap();
        let mut histories = batch.histories(&table);
        histories[0].token_ids.push(99);
        assert_eq!(table.token_ids(SlotIndex::new(0)), &[4, 5, 6]);
        assert_eq!(histories[0].slot, SlotIndex::new(0));
    }

    #[test]
    fn sparse_slots_need_no_compaction() {
        let mut table = table_with(&[("a", vec![1]), ("b", vec![2]), ("c", vec![3])]);
        table.remove(&RequestId::from("b")).unwrap();
        let batch = InputBatch::build(
            &table,
            &[ScheduledRequest::new("a", 1), ScheduledRequest::new("c", 1)],
        )
        .unwrap();
        assert_eq!(batch.idx_mapping, vec![SlotIndex::new(0), SlotIndex::new(2)]);
        assert_eq!(batch.input_ids, vec![1, 3]);
    }
}
