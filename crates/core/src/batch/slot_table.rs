//! Fixed-capacity request slot table.
//!
//! Owns the request ↔ slot mapping, the per-slot token matrix
//! `[max_num_reqs, max_model_len]` and the struct-of-arrays sampling
//! scalars. Every structural change is recorded in the owned
//! [`BatchUpdateBuilder`], so the pair can only be observed together.
//!
//! Index stability: between two `compact()` calls a request keeps its
//! slot unless it is explicitly swapped.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::request::{CachedRequestState, RequestId};
use crate::sampling::{SamplingParams, GREEDY_TEMPERATURE};

use super::update::{AddedRequest, BatchUpdate, BatchUpdateBuilder};
use super::{SlotArray, SlotIndex};

/// Row-per-slot token storage.
#[derive(Debug)]
struct TokenMatrix {
    row_len: usize,
    data: Vec<u32>,
}

impl TokenMatrix {
    fn new(rows: usize, row_len: usize) -> Self {
        Self {
            row_len,
            data: vec![0; rows * row_len],
        }
    }

    fn row(&self, idx: SlotIndex) -> &[u32] {
        let start = idx.get() * self.row_len;
        &self.data[start..start + self.row_len]
    }

    fn row_mut(&mut self, idx: SlotIndex) -> &mut [u32] {
        let start = idx.get() * self.row_len;
        &mut self.data[start..start + self.row_len]
    }

    fn swap_rows(&mut self, a: SlotIndex, b: SlotIndex) {
        if a == b {
            return;
        }
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        let row_len = self.row_len;
        let (left, right) = self.data.split_at_mut(hi.get() * row_len);
        let lo_start = lo.get() * row_len;
        left[lo_start..lo_start + row_len].swap_with_slice(&mut right[..row_len]);
    }

    /// Copy the first `len` tokens of `from` into `to`.
    fn copy_row(&mut self, from: SlotIndex, to: SlotIndex, len: usize) {
        let src = from.get() * self.row_len;
        self.data
            .copy_within(src..src + len, to.get() * self.row_len);
    }

    fn clear_row(&mut self, idx: SlotIndex) {
        self.row_mut(idx).fill(0);
    }
}

/// Slot-indexed sampling scalars, kept as parallel arrays so the sampler
/// can operate on whole vectors.
#[derive(Debug)]
pub(crate) struct SamplingArrays {
    pub(crate) temperature: SlotArray<f32>,
    pub(crate) top_p: SlotArray<f32>,
    pub(crate) top_k: SlotArray<u32>,
    pub(crate) min_p: SlotArray<f32>,
    pub(crate) frequency_penalties: SlotArray<f32>,
    pub(crate) presence_penalties: SlotArray<f32>,
    pub(crate) repetition_penalties: SlotArray<f32>,
    pub(crate) seeds: SlotArray<Option<u64>>,
}

impl SamplingArrays {
    fn new(capacity: usize) -> Self {
        let defaults = SamplingParams::default();
        Self {
            temperature: SlotArray::filled(capacity, defaults.temperature),
            top_p: SlotArray::filled(capacity, defaults.top_p),
            top_k: SlotArray::filled(capacity, defaults.top_k),
            min_p: SlotArray::filled(capacity, defaults.min_p),
            frequency_penalties: SlotArray::filled(capacity, defaults.frequency_penalty),
            presence_penalties: SlotArray::filled(capacity, defaults.presence_penalty),
            repetition_penalties: SlotArray::filled(capacity, defaults.repetition_penalty),
            seeds: SlotArray::filled(capacity, None),
        }
    }

    fn set(&mut self, idx: SlotIndex, params: &SamplingParams) {
        self.temperature[idx] = params.temperature;
        self.top_p[idx] = params.top_p;
        self.top_k[idx] = params.top_k;
        self.min_p[idx] = params.min_p;
        self.frequency_penalties[idx] = params.frequency_penalty;
        self.presence_penalties[idx] = params.presence_penalty;
        self.repetition_penalties[idx] = params.repetition_penalty;
        self.seeds[idx] = params.seed;
    }

    fn clear(&mut self, idx: SlotIndex) {
        self.set(idx, &SamplingParams::default());
    }

    fn swap(&mut self, a: SlotIndex, b: SlotIndex) {
        self.temperature.swap(a, b);
        self.top_p.swap(a, b);
        self.top_k.swap(a, b);
        self.min_p.swap(a, b);
        self.frequency_penalties.swap(a, b);
        self.presence_penalties.swap(a, b);
        self.repetition_penalties.swap(a, b);
        self.seeds.swap(a, b);
    }
}

/// Structural changes handed to the step owner: the frozen update plus the
/// ids of requests that left the batch, so per-request drafter state can be
/// released.
#[derive(Debug, Default)]
pub struct StructuralChanges {
    pub update: Option<BatchUpdate>,
    pub removed_req_ids: Vec<RequestId>,
}

#[derive(Debug)]
pub struct SlotTable {
    max_num_reqs: usize,
    max_model_len: usize,
    max_num_batched_tokens: usize,

    req_ids: SlotArray<Option<RequestId>>,
    req_id_to_index: HashMap<RequestId, SlotIndex>,
    requests: HashMap<RequestId, CachedRequestState>,
    free_slots: BTreeSet<SlotIndex>,

    token_ids: TokenMatrix,
    num_tokens: SlotArray<usize>,
    num_prompt_tokens: SlotArray<usize>,
    num_computed_tokens: SlotArray<usize>,
    admission_seq: SlotArray<u64>,
    pub(crate) sampling: SamplingArrays,

    next_admission_seq: u64,
    builder: BatchUpdateBuilder,
    removed_this_step: Vec<RequestId>,
}

impl SlotTable {
    pub fn new(config: &BatchConfig) -> Self {
        let capacity = config.max_num_reqs;
        Self {
            max_num_reqs: capacity,
            max_model_len: config.max_model_len,
            max_num_batched_tokens: config.max_num_batched_tokens,
            req_ids: SlotArray::filled(capacity, None),
            req_id_to_index: HashMap::with_capacity(capacity),
            requests: HashMap::with_capacity(capacity),
            free_slots: (0..capacity).map(SlotIndex::new).collect(),
            token_ids: TokenMatrix::new(capacity, config.max_model_len),
            num_tokens: SlotArray::filled(capacity, 0),
            num_prompt_tokens: SlotArray::filled(capacity, 0),
            num_computed_tokens: SlotArray::filled(capacity, 0),
            admission_seq: SlotArray::filled(capacity, 0),
            sampling: SamplingArrays::new(capacity),
            next_admission_seq: 0,
            builder: BatchUpdateBuilder::new(),
            removed_this_step: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_num_reqs
    }

    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }

    pub fn max_num_batched_tokens(&self) -> usize {
        self.max_num_batched_tokens
    }

    pub fn num_active(&self) -> usize {
        self.req_id_to_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.req_id_to_index.is_empty()
    }

    pub fn contains(&self, req_id: &RequestId) -> bool {
        self.req_id_to_index.contains_key(req_id)
    }

    pub fn slot_of(&self, req_id: &RequestId) -> Option<SlotIndex> {
        self.req_id_to_index.get(req_id).copied()
    }

    pub fn req_id_at(&self, idx: SlotIndex) -> Option<&RequestId> {
        self.req_ids[idx].as_ref()
    }

    pub fn request(&self, req_id: &RequestId) -> Option<&CachedRequestState> {
        self.requests.get(req_id)
    }

    pub fn admission_seq_at(&self, idx: SlotIndex) -> u64 {
        self.admission_seq[idx]
    }

    /// Occupied slots in ascending index order.
    pub fn occupied_slots(&self) -> Vec<SlotIndex> {
        self.req_ids
            .iter()
            .filter(|(_, id)| id.is_some())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// Whether the occupant of `idx` samples greedily.
    pub fn is_greedy_at(&self, idx: SlotIndex) -> bool {
        self.sampling.temperature[idx] < GREEDY_TEMPERATURE
    }

    /// Known tokens (prompt + output) of the request in `idx`.
    pub fn token_ids(&self, idx: SlotIndex) -> &[u32] {
        &self.token_ids.row(idx)[..self.num_tokens[idx]]
    }

    pub fn num_tokens(&self, idx: SlotIndex) -> usize {
        self.num_tokens[idx]
    }

    pub fn num_prompt_tokens(&self, idx: SlotIndex) -> usize {
        self.num_prompt_tokens[idx]
    }

    pub fn num_computed_tokens(&self, idx: SlotIndex) -> usize {
        self.num_computed_tokens[idx]
    }

    /// Admit a request into the first free slot.
    pub fn add(
        &mut self,
        req_id: RequestId,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) -> Result<SlotIndex, BatchError> {
        if self.req_id_to_index.contains_key(&req_id) {
            return Err(BatchError::DuplicateRequest(req_id));
        }
        if prompt_token_ids.len() > self.max_model_len {
            return Err(BatchError::ModelLenExceeded {
                req_id,
                required: prompt_token_ids.len(),
                max_model_len: self.max_model_len,
            });
        }
        let Some(&idx) = self.free_slots.iter().next() else {
            return Err(BatchError::BatchFull {
                capacity: self.max_num_reqs,
            });
        };
        self.free_slots.remove(&idx);

        let num_prompt = prompt_token_ids.len();
        self.token_ids.row_mut(idx)[..num_prompt].copy_from_slice(&prompt_token_ids);
        self.num_tokens[idx] = num_prompt;
        self.num_prompt_tokens[idx] = num_prompt;
        self.num_computed_tokens[idx] = 0;
        self.sampling.set(idx, &sampling_params);

        let seq = self.next_admission_seq;
        self.next_admission_seq += 1;
        self.admission_seq[idx] = seq;

        self.builder.record_add(AddedRequest {
            index: idx,
            req_id: req_id.clone(),
            sampling_params: sampling_params.clone(),
            prompt_token_ids: prompt_token_ids.clone(),
            output_token_ids: Vec::new(),
        });

        let greedy = sampling_params.is_greedy();
        let state = CachedRequestState::new(req_id.clone(), prompt_token_ids, sampling_params, seq);
        self.requests.insert(req_id.clone(), state);
        self.req_ids[idx] = Some(req_id.clone());
        self.req_id_to_index.insert(req_id.clone(), idx);

        debug!(request_id = %req_id, slot = idx.get(), greedy, "admitted request");
        Ok(idx)
    }

    /// Free the request's slot. Does not compact.
    pub fn remove(&mut self, req_id: &RequestId) -> Result<CachedRequestState, BatchError> {
        let idx = self
            .req_id_to_index
            .remove(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        let state = self
            .requests
            .remove(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;

        self.clear_slot(idx);
        self.free_slots.insert(idx);
        self.builder.record_remove(idx);
        self.removed_this_step.push(req_id.clone());

        debug!(request_id = %req_id, slot = idx.get(), "removed request");
        Ok(state)
    }

    /// Exchange the contents of two slots.
    ///
    /// When only one side is occupied the occupant is moved instead, since
    /// a swap record implies two live requests. Swapping two empty slots
    /// (or a slot with itself) is a no-op.
    pub fn swap(&mut self, a: SlotIndex, b: SlotIndex) {
        if a == b {
            return;
        }
        match (self.req_ids[a].is_some(), self.req_ids[b].is_some()) {
            (true, true) => {
                self.swap_slots(a, b);
                self.builder.record_swap(a, b);
            }
            (true, false) => self.move_slot(a, b),
            (false, true) => self.move_slot(b, a),
            (false, false) => {}
        }
    }

    /// Shift occupied slots down over the holes left by `remove`,
    /// preserving their relative order. Returns the number of moves.
    pub fn compact(&mut self) -> usize {
        let mut moves = 0;
        let mut dst = 0usize;
        for src in 0..self.max_num_reqs {
            let src_idx = SlotIndex::new(src);
            if self.req_ids[src_idx].is_none() {
                continue;
            }
            if src != dst {
                self.move_slot(src_idx, SlotIndex::new(dst));
                moves += 1;
            }
            dst += 1;
        }
        if moves > 0 {
            debug!(moves, num_active = self.num_active(), "compacted slot table");
        }
        moves
    }

    /// Append one generated token to the request's history.
    pub fn append_output_token(
        &mut self,
        req_id: &RequestId,
        token_id: u32,
    ) -> Result<(), BatchError> {
        let idx = self
            .slot_of(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        let pos = self.num_tokens[idx];
        if pos >= self.max_model_len {
            return Err(BatchError::ModelLenExceeded {
                req_id: req_id.clone(),
                required: pos + 1,
                max_model_len: self.max_model_len,
            });
        }
        let state = self
            .requests
            .get_mut(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        state.append_output_token(token_id);
        self.token_ids.row_mut(idx)[pos] = token_id;
        self.num_tokens[idx] = pos + 1;
        Ok(())
    }

    /// Advance the request's computed-token counter after a model step.
    pub fn update_computed_tokens(
        &mut self,
        req_id: &RequestId,
        num_tokens: usize,
    ) -> Result<(), BatchError> {
        let idx = self
            .slot_of(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        let state = self
            .requests
            .get_mut(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        state.update_computed_tokens(num_tokens);
        self.num_computed_tokens[idx] = state.num_computed_tokens;
        Ok(())
    }

    /// Record the draft tokens proposed for the request this step.
    pub fn set_spec_token_ids(
        &mut self,
        req_id: &RequestId,
        spec_token_ids: Vec<u32>,
    ) -> Result<(), BatchError> {
        let state = self
            .requests
            .get_mut(req_id)
            .ok_or_else(|| BatchError::UnknownRequest(req_id.clone()))?;
        state.spec_token_ids = spec_token_ids;
        Ok(())
    }

    /// Freeze this step's structural changes and start a fresh builder.
    pub fn take_changes(&mut self) -> StructuralChanges {
        StructuralChanges {
            update: self.builder.build(self.num_active()),
            removed_req_ids: std::mem::take(&mut self.removed_this_step),
        }
    }

    /// Verify the mutual-inverse invariant of the identity maps.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut occupied = 0;
        for (idx, id) in self.req_ids.iter() {
            if let Some(id) = id {
                occupied += 1;
                if self.req_id_to_index.get(id) != Some(&idx) {
                    return Err(format!("slot {idx} holds {id} but the map disagrees"));
                }
                if !self.requests.contains_key(id) {
                    return Err(format!("slot {idx} holds {id} without request state"));
                }
                if self.free_slots.contains(&idx) {
                    return Err(format!("occupied slot {idx} is on the free list"));
                }
            } else if !self.free_slots.contains(&idx) {
                return Err(format!("empty slot {idx} missing from the free list"));
            }
        }
        if occupied != self.req_id_to_index.len() || occupied != self.requests.len() {
            return Err(format!(
                "{occupied} occupied slots, {} mapped ids, {} states",
                self.req_id_to_index.len(),
                self.requests.len()
            ));
        }
        for (id, &idx) in &self.req_id_to_index {
            if self.req_ids[idx].as_ref() != Some(id) {
                return Err(format!("{id} maps to slot {idx} which holds another request"));
            }
        }
        Ok(())
    }

    fn clear_slot(&mut self, idx: SlotIndex) {
        self.req_ids[idx] = None;
        self.token_ids.clear_row(idx);
        self.num_tokens[idx] = 0;
        self.num_prompt_tokens[idx] = 0;
        self.num_computed_tokens[idx] = 0;
        self.admission_seq[idx] = 0;
        self.sampling.clear(idx);
    }

    fn swap_slots(&mut self, a: SlotIndex, b: SlotIndex) {
        self.req_ids.swap(a, b);
        self.token_ids.swap_rows(a, b);
        self.num_tokens.swap(a, b);
        self.num_prompt_tokens.swap(a, b);
        self.num_computed_tokens.swap(a, b);
        self.admission_seq.swap(a, b);
        self.sampling.swap(a, b);
        for idx in [a, b] {
            if let Some(id) = self.req_ids[idx].clone() {
                self.req_id_to_index.insert(id, idx);
            }
        }
    }

    /// Move the occupant of `from` into the empty slot `to`.
    fn move_slot(&mut self, from: SlotIndex, to: SlotIndex) {
        debug_assert!(self.req_ids[to].is_none(), "move target {to} is occupied");
        let len = self.num_tokens[from];
        self.token_ids.copy_row(from, to, len);
        self.req_ids.swap(from, to);
        self.num_tokens.swap(from, to);
        self.num_prompt_tokens.swap(from, to);
        self.num_computed_tokens.swap(from, to);
        self.admission_seq.swap(from, to);
        self.sampling.swap(from, to);
        self.clear_slot(from);

        if let Some(id) = self.req_ids[to].clone() {
            self.req_id_to_index.insert(id, to);
        }
        self.free_slots.remove(&to);
        self.free_slots.insert(from);
        self.builder.record_move(from, to);
    }
}
