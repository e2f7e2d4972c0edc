//! Per-step structural diff of the slot table.
//!
//! Every stateful per-request component replays a [`BatchUpdate`] exactly
//! once per step, in the order removed → added → moved. Removed and added
//! indices name slots before the step's moves are applied.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::request::RequestId;
use crate::sampling::SamplingParams;

use super::SlotIndex;

/// How a request moved between slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirectionality {
    /// Source slot becomes empty, destination had no live occupant.
    Unidirectional,
    /// Both slots had occupants and exchanged them.
    Swap,
}

#[derive(Debug, Clone)]
pub struct AddedRequest {
    pub index: SlotIndex,
    pub req_id: RequestId,
    pub sampling_params: SamplingParams,
    pub prompt_token_ids: Vec<u32>,
    pub output_token_ids: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MovedRequest {
    pub from: SlotIndex,
    pub to: SlotIndex,
    pub directionality: MoveDirectionality,
}

/// Frozen structural diff for one step.
#[derive(Debug, Clone)]
pub struct BatchUpdate {
    step: u64,
    batch_size: usize,
    removed: Vec<SlotIndex>,
    added: Vec<AddedRequest>,
    moved: Vec<MovedRequest>,
}

impl BatchUpdate {
    /// Sequence number of this update; consecutive updates differ by one.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Number of live requests after the update is applied.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn removed(&self) -> &[SlotIndex] {
        &self.removed
    }

    pub fn added(&self) -> &[AddedRequest] {
        &self.added
    }

    pub fn moved(&self) -> &[MovedRequest] {
        &self.moved
    }

    /// Every slot index touched by this update.
    pub fn touched_indices(&self) -> Vec<SlotIndex> {
        let mut indices: Vec<SlotIndex> = self
            .removed
            .iter()
            .copied()
            .chain(self.added.iter().map(|a| a.index))
            .chain(self.moved.iter().flat_map(|m| [m.from, m.to]))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }
}

/// Accumulates structural changes during one step.
///
/// Calls may interleave freely. Reorders are kept as a net permutation from
/// base slots (the layout after removals and admissions) to current slots;
/// a removal or admission recorded after a reorder is mapped back to its
/// base slot, and the move list is derived from the permutation on
/// [`build`](Self::build). Replaying removed → added → moved therefore
/// always reproduces the current layout.
#[derive(Debug, Default)]
pub struct BatchUpdateBuilder {
    next_step: u64,
    removed: Vec<SlotIndex>,
    added: Vec<AddedRequest>,
    /// Current slot → (base slot whose content it holds, occupied now).
    /// Slots never reordered this step are absent.
    reordered: BTreeMap<SlotIndex, (SlotIndex, bool)>,
}

impl BatchUpdateBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty()
            && self.added.is_empty()
            && self.reordered.iter().all(|(cur, (base, _))| cur == base)
    }

    /// Base slot holding what is at `index` now.
    fn base_of(&self, index: SlotIndex) -> SlotIndex {
        self.reordered.get(&index).map_or(index, |&(base, _)| base)
    }

    fn set_occupied(&mut self, index: SlotIndex, occupied: bool) {
        if let Some(entry) = self.reordered.get_mut(&index) {
            entry.1 = occupied;
        }
    }

    /// Record an admission into the currently empty slot `added.index`.
    pub fn record_add(&mut self, mut added: AddedRequest) {
        self.set_occupied(added.index, true);
        added.index = self.base_of(added.index);
        debug_assert!(
            !self.added.iter().any(|a| a.index == added.index),
            "slot {} added twice in one step",
            added.index
        );
        self.added.push(added);
    }

    /// Record that the occupant of `index` left the batch.
    ///
    /// A request both added and removed within the same step never
    /// becomes visible to consumers.
    pub fn record_remove(&mut self, index: SlotIndex) {
        self.set_occupied(index, false);
        let base = self.base_of(index);
        if let Some(pos) = self.added.iter().position(|a| a.index == base) {
            // The slot held either nothing or an occupant whose removal is
            // already recorded; both cases need no new entry.
            self.added.remove(pos);
            return;
        }
        if !self.removed.contains(&base) {
            self.removed.push(base);
        }
    }

    /// Two occupied slots exchanged their requests.
    pub fn record_swap(&mut self, a: SlotIndex, b: SlotIndex) {
        self.exchange(a, true, b, true);
    }

    /// The occupant of `from` moved into the empty slot `to`.
    pub fn record_move(&mut self, from: SlotIndex, to: SlotIndex) {
        self.exchange(from, true, to, false);
    }

    fn exchange(&mut self, a: SlotIndex, a_occupied: bool, b: SlotIndex, b_occupied: bool) {
        if a == b {
            return;
        }
        let ea = *self.reordered.entry(a).or_insert((a, a_occupied));
        let eb = *self.reordered.entry(b).or_insert((b, b_occupied));
        debug_assert_eq!(ea.1, a_occupied, "slot {a} occupancy disagrees");
        debug_assert_eq!(eb.1, b_occupied, "slot {b} occupancy disagrees");
        self.reordered.insert(a, eb);
        self.reordered.insert(b, ea);
    }

    /// Moves that carry every base-slot occupant to its current slot.
    ///
    /// Each emitted move settles at least one occupant: a swap when the
    /// destination is still held by an unsettled occupant, a
    /// unidirectional move when it is free.
    fn derive_moves(&self) -> Vec<MovedRequest> {
        // Base slot → destination, for occupants that were reordered.
        let mut pending: BTreeMap<SlotIndex, SlotIndex> = self
            .reordered
            .iter()
            .filter(|(_, (_, occupied))| *occupied)
            .map(|(&cur, &(base, _))| (base, cur))
            .collect();
        let sources: Vec<SlotIndex> = pending.keys().copied().collect();
        let mut moved = Vec::new();
        for src in sources {
            while let Some(&dst) = pending.get(&src) {
                if dst == src {
                    break;
                }
                match pending.get(&dst).copied() {
                    Some(displaced) => {
                        moved.push(MovedRequest {
                            from: src,
                            to: dst,
                            directionality: MoveDirectionality::Swap,
                        });
                        pending.insert(dst, dst);
                        pending.insert(src, displaced);
                    }
                    None => {
                        moved.push(MovedRequest {
                            from: src,
                            to: dst,
                            directionality: MoveDirectionality::Unidirectional,
                        });
                        pending.remove(&src);
                        pending.insert(dst, dst);
                    }
                }
            }
        }
        moved
    }

    /// Freeze the accumulated changes and reset for the next step.
    ///
    /// Returns `None` when nothing changed; the step counter only advances
    /// when an update is produced.
    pub fn build(&mut self, batch_size: usize) -> Option<BatchUpdate> {
        if self.is_empty() {
            self.reset();
            return None;
        }
        let moved = self.derive_moves();
        let mut removed = std::mem::take(&mut self.removed);
        removed.sort_unstable();
        let update = BatchUpdate {
            step: self.next_step,
            batch_size,
            removed,
            added: std::mem::take(&mut self.added),
            moved,
        };
        self.reordered.clear();
        self.next_step += 1;
        Some(update)
    }

    /// Discard pending changes without producing an update.
    pub fn reset(&mut self) {
        self.removed.clear();
        self.added.clear();
        self.reordered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(index: usize, id: &str) -> AddedRequest {
        AddedRequest {
            index: SlotIndex::new(index),
            req_id: RequestId::from(id),
            sampling_params: SamplingParams::default(),
            prompt_token_ids: vec![1, 2],
            output_token_ids: Vec::new(),
        }
    }

    #[test]
    fn empty_builder_builds_nothing() {
        let mut builder = BatchUpdateBuilder::new();
        assert!(builder.build(0).is_none());
    }

    #[test]
    fn build_resets_and_advances_step() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_add(added(0, "a"));
        let first = builder.build(1).unwrap();
        assert_eq!(first.step(), 0);
        assert_eq!(first.added().len(), 1);
        assert!(builder.is_empty());

        builder.record_remove(SlotIndex::new(0));
        let second = builder.build(0).unwrap();
        assert_eq!(second.step(), 1);
        assert_eq!(second.removed(), &[SlotIndex::new(0)]);
    }

    #[test]
    fn add_then_remove_same_step_is_invisible() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_add(added(3, "a"));
        builder.record_remove(SlotIndex::new(3));
        assert!(builder.is_empty());
        assert!(builder.build(0).is_none());
    }

    #[test]
    fn replace_then_remove_keeps_original_removal() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_remove(SlotIndex::new(1));
        builder.record_add(added(1, "b"));
        builder.record_remove(SlotIndex::new(1));
        let update = builder.build(0).unwrap();
        assert_eq!(update.removed(), &[SlotIndex::new(1)]);
        assert!(update.added().is_empty());
    }

    #[test]
    fn removed_indices_are_sorted_and_unique() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_remove(SlotIndex::new(4));
        builder.record_remove(SlotIndex::new(1));
        builder.record_remove(SlotIndex::new(4));
        let update = builder.build(0).unwrap();
        assert_eq!(update.removed(), &[SlotIndex::new(1), SlotIndex::new(4)]);
    }

    #[test]
    fn touched_indices_cover_all_sections() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_remove(SlotIndex::new(0));
        builder.record_add(added(2, "x"));
        builder.record_move(SlotIndex::new(2), SlotIndex::new(0));
        builder.record_swap(SlotIndex::new(0), SlotIndex::new(5));
        let update = builder.build(2).unwrap();
        assert_eq!(
            update.touched_indices(),
            vec![SlotIndex::new(0), SlotIndex::new(2), SlotIndex::new(5)]
        );
        // x (added at 2) ends in 5, the old occupant of 5 ends in 0.
        assert_eq!(
            update.moved(),
            &[
                MovedRequest {
                    from: SlotIndex::new(2),
                    to: SlotIndex::new(5),
                    directionality: MoveDirectionality::Swap,
                },
                MovedRequest {
                    from: SlotIndex::new(2),
                    to: SlotIndex::new(0),
                    directionality: MoveDirectionality::Unidirectional,
                },
            ]
        );
    }

    // ─── Structural changes after a reorder ─────────────────────────────

    #[test]
    fn remove_after_swap_targets_the_base_slot() {
        // a@0, b@1 swapped, then a (now in 1) leaves.
        let mut builder = BatchUpdateBuilder::new();
        builder.record_swap(SlotIndex::new(0), SlotIndex::new(1));
        builder.record_remove(SlotIndex::new(1));
        let update = builder.build(1).unwrap();
        assert_eq!(update.removed(), &[SlotIndex::new(0)]);
        assert_eq!(
            update.moved(),
            &[MovedRequest {
                from: SlotIndex::new(1),
                to: SlotIndex::new(0),
                directionality: MoveDirectionality::Unidirectional,
            }]
        );
    }

    #[test]
    fn add_after_move_lands_in_vacated_base_slot() {
        // a moves 2 -> 0, then z is admitted into the freed slot 2.
        let mut builder = BatchUpdateBuilder::new();
        builder.record_move(SlotIndex::new(2), SlotIndex::new(0));
        builder.record_add(added(2, "z"));
        let update = builder.build(2).unwrap();
        assert_eq!(update.added()[0].index, SlotIndex::new(0));
        assert_eq!(
            update.moved(),
            &[MovedRequest {
                from: SlotIndex::new(0),
                to: SlotIndex::new(2),
                directionality: MoveDirectionality::Swap,
            }]
        );
    }

    #[test]
    fn swap_and_swap_back_cancel_out() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_swap(SlotIndex::new(1), SlotIndex::new(3));
        builder.record_swap(SlotIndex::new(3), SlotIndex::new(1));
        assert!(builder.is_empty());
        assert!(builder.build(2).is_none());
    }

    #[test]
    fn reset_discards_pending() {
        let mut builder = BatchUpdateBuilder::new();
        builder.record_add(added(0, "a"));
        builder.reset();
        assert!(builder.build(0).is_none());
    }
}
