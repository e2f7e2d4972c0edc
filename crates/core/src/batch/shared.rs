//! The single lock around the slot table and its pending batch update.
//!
//! Admission and removal may arrive from an async intake path while a step
//! is in flight. Both go through this lock, and a step takes ownership of
//! the accumulated [`BatchUpdate`](super::BatchUpdate) in the same critical
//! section that builds its [`InputBatch`], so a step never observes half of
//! an intake burst.
//!
//! The lock is never held across an `.await`. Reorders (scheduler swaps,
//! compaction) may interleave with admissions and removals; the pending
//! update stays replayable whatever the order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::request::{CachedRequestState, RequestId};
use crate::sampling::SamplingParams;

use super::{InputBatch, RequestHistory, ScheduledRequest, SlotIndex, SlotTable, StructuralChanges};

/// Everything a step needs, captured atomically at step start.
#[derive(Debug)]
pub struct StepSnapshot {
    pub changes: StructuralChanges,
    pub input_batch: InputBatch,
    pub histories: Vec<RequestHistory>,
}

#[derive(Debug, Clone)]
pub struct SharedBatch {
    inner: Arc<Mutex<SlotTable>>,
}

impl SharedBatch {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotTable::new(config))),
        }
    }

    /// Lock the table. A panic while holding the lock cannot leave the
    /// table half-mutated (every mutation validates first), so poisoning
    /// is recovered rather than propagated.
    pub(crate) fn lock(&self) -> MutexGuard<'_, SlotTable> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(
        &self,
        req_id: impl Into<RequestId>,
        prompt_token_ids: Vec<u32>,
        sampling_params: SamplingParams,
    ) -> Result<SlotIndex, BatchError> {
        self.lock()
            .add(req_id.into(), prompt_token_ids, sampling_params)
    }

    pub fn remove(&self, req_id: &RequestId) -> Result<CachedRequestState, BatchError> {
        self.lock().remove(req_id)
    }

    /// Exchange the slots of two active requests.
    ///
    /// Slots are resolved under the lock, so a scheduler never swaps by a
    /// stale index. Swapping a request with itself is a no-op.
    pub fn swap(&self, a: &RequestId, b: &RequestId) -> Result<(), BatchError> {
        let mut table = self.lock();
        let slot_a = table
            .slot_of(a)
            .ok_or_else(|| BatchError::UnknownRequest(a.clone()))?;
        let slot_b = table
            .slot_of(b)
            .ok_or_else(|| BatchError::UnknownRequest(b.clone()))?;
        table.swap(slot_a, slot_b);
        Ok(())
    }

    /// Reorder so greedy requests occupy the lowest occupied slots.
    ///
    /// Keeps greedy and random requests in two contiguous runs of the
    /// occupied slots, which lets a sampler treat each run as one batch.
    /// Returns the number of swaps.
    pub fn partition_greedy(&self) -> usize {
        let mut guard = self.lock();
        let table = &mut *guard;
        let slots = table.occupied_slots();
        let (mut lo, mut hi) = (0usize, slots.len());
        let mut swaps = 0;
        while lo < hi {
            if table.is_greedy_at(slots[lo]) {
                lo += 1;
            } else if !table.is_greedy_at(slots[hi - 1]) {
                hi -= 1;
            } else {
                table.swap(slots[lo], slots[hi - 1]);
                swaps += 1;
                lo += 1;
                hi -= 1;
            }
        }
        if swaps > 0 {
            debug!(swaps, "partitioned greedy requests");
        }
        swaps
    }

    pub fn num_active(&self) -> usize {
        self.lock().num_active()
    }

    pub fn contains(&self, req_id: &RequestId) -> bool {
        self.lock().contains(req_id)
    }

    /// Clone of the request's state, if it is active.
    pub fn request(&self, req_id: &RequestId) -> Option<CachedRequestState> {
        self.lock().request(req_id).cloned()
    }

    /// Run `f` against a read-only view of the table.
    pub fn with_table<R>(&self, f: impl FnOnce(&SlotTable) -> R) -> R {
        f(&self.lock())
    }

    /// Freeze admissions/removals and build the step view.
    ///
    /// The schedule is validated first; on error nothing changes and the
    /// pending update stays queued for the next attempt. When `compact` is
    /// set, holes are closed before the build and the resulting moves ride
    /// along in this step's update.
    pub fn begin_step(
        &self,
        scheduled: &[ScheduledRequest],
        compact: bool,
    ) -> Result<StepSnapshot, BatchError> {
        let mut table = self.lock();
        InputBatch::validate(&table, scheduled)?;
        if compact {
            table.compact();
        }
        let input_batch = InputBatch::build(&table, scheduled)?;
        let histories = input_batch.histories(&table);
        let changes = table.take_changes();
        debug!(
            num_reqs = input_batch.num_reqs(),
            num_tokens = input_batch.total_num_scheduled_tokens(),
            num_active = table.num_active(),
            has_update = changes.update.is_some(),
            "began step"
        );
        Ok(StepSnapshot {
            changes,
            input_batch,
            histories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> SharedBatch {
        SharedBatch::new(&BatchConfig {
            max_num_reqs: 4,
            max_model_len: 16,
            max_num_batched_tokens: 8,
        })
    }

    #[test]
    fn begin_step_takes_pending_update() {
        let batch = shared();
        batch.add("a", vec![1, 2], SamplingParams::default()).unwrap();
        batch.add("b", vec![3], SamplingParams::default()).unwrap();

        let snap = batch
            .begin_step(
                &[ScheduledRequest::new("a", 2), ScheduledRequest::new("b", 1)],
                false,
            )
            .unwrap();
        let update = snap.changes.update.unwrap();
        assert_eq!(update.added().len(), 2);
        assert_eq!(snap.histories[1].token_ids, vec![3]);

        let again = batch
            .begin_step(&[ScheduledRequest::new("a", 1)], false)
            .unwrap();
        assert!(again.changes.update.is_none());
    }

    #[test]
    fn failed_step_keeps_update_queued() {
        let batch = shared();
        batch.add("a", vec![1; 10], SamplingParams::default()).unwrap();
        let err = batch
            .begin_step(&[ScheduledRequest::new("a", 10)], true)
            .unwrap_err();
        assert!(err.is_capacity());

        let snap = batch
            .begin_step(&[ScheduledRequest::new("a", 8)], true)
            .unwrap();
        assert_eq!(snap.changes.update.unwrap().added().len(), 1);
    }

    #[test]
    fn compaction_moves_ride_in_step_update() {
        let batch = shared();
        for id in ["a", "b", "c"] {
            batch.add(id, vec![1], SamplingParams::default()).unwrap();
        }
        batch.begin_step(&[], false).unwrap();
        batch.remove(&RequestId::from("a")).unwrap();

        let snap = batch
            .begin_step(&[ScheduledRequest::new("c", 1)], true)
            .unwrap();
        assert_eq!(snap.input_batch.idx_mapping, vec![SlotIndex::new(1)]);
        let update = snap.changes.update.unwrap();
        assert_eq!(update.removed(), &[SlotIndex::new(0)]);
        assert_eq!(update.moved().len(), 2);
        assert_eq!(snap.changes.removed_req_ids, vec![RequestId::from("a")]);
    }

    #[test]
    fn swap_resolves_requests_under_lock() {
        let batch = shared();
        batch.add("a", vec![1], SamplingParams::default()).unwrap();
        batch.add("b", vec![2, 3], SamplingParams::default()).unwrap();
        batch.begin_step(&[], false).unwrap();

        batch.swap(&RequestId::from("a"), &RequestId::from("b")).unwrap();
        batch.with_table(|t| {
            assert_eq!(t.slot_of(&RequestId::from("b")), Some(SlotIndex::new(0)));
            assert_eq!(t.token_ids(SlotIndex::new(0)), &[2, 3]);
        });
        let err = batch
            .swap(&RequestId::from("a"), &RequestId::from("ghost"))
            .unwrap_err();
        assert_eq!(err, BatchError::UnknownRequest(RequestId::from("ghost")));

        // Removing a swapped request in the same step keeps the update
        // consistent with the table.
        batch.remove(&RequestId::from("b")).unwrap();
        let update = batch.begin_step(&[], false).unwrap().changes.update.unwrap();
        assert_eq!(update.removed(), &[SlotIndex::new(1)]);
        assert_eq!(update.moved().len(), 1);
        assert_eq!(update.moved()[0].from, SlotIndex::new(0));
        assert_eq!(update.moved()[0].to, SlotIndex::new(1));
    }

    #[test]
    fn partition_greedy_groups_greedy_first() {
        let batch = shared();
        let random = SamplingParams {
            temperature: 0.7,
            ..Default::default()
        };
        batch.add("r0", vec![1], random.clone()).unwrap();
        batch.add("g0", vec![1], SamplingParams::greedy()).unwrap();
        batch.add("r1", vec![1], random).unwrap();
        batch.add("g1", vec![1], SamplingParams::greedy()).unwrap();

        assert_eq!(batch.partition_greedy(), 1);
        batch.with_table(|t| {
            let greedy: Vec<bool> = t
                .occupied_slots()
                .into_iter()
                .map(|s| t.is_greedy_at(s))
                .collect();
            assert_eq!(greedy, vec![true, true, false, false]);
            t.check_invariants().unwrap();
        });
        assert_eq!(batch.partition_greedy(), 0);
    }

    #[test]
    fn concurrent_intake_is_serialized() {
        let batch = shared();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let batch = batch.clone();
                std::thread::spawn(move || {
                    batch
                        .add(format!("r{i}"), vec![i], SamplingParams::default())
                        .unwrap()
                })
            })
            .collect();
        let mut slots: Vec<SlotIndex> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        slots.sort();
        assert_eq!(slots, (0..4).map(SlotIndex::new).collect::<Vec<_>>());
        batch.with_table(|t| t.check_invariants()).unwrap();
    }
}
