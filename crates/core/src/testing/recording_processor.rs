use std::sync::{Arc, Mutex};

use crate::batch::{AddedRequest, MovedRequest, SlotIndex};
use crate::sampling::StatefulLogitsProcessor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorEvent {
    Removed(SlotIndex),
    Added(SlotIndex),
    Moved { from: SlotIndex, to: SlotIndex },
    Accepted(SlotIndex, Vec<u32>),
    RolledBack(SlotIndex, usize),
}

/// Processor that leaves logits alone and records every call it receives.
///
/// Clones share the same log, so a test can keep one handle while the
/// engine owns the other.
#[derive(Debug, Clone, Default)]
pub struct RecordingProcessor {
    events: Arc<Mutex<Vec<ProcessorEvent>>>,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProcessorEvent> {
        self.log().clone()
    }

    pub fn clear(&self) {
        self.log().clear();
    }

    fn log(&self) -> std::sync::MutexGuard<'_, Vec<ProcessorEvent>> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl StatefulLogitsProcessor for RecordingProcessor {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn on_removed(&mut self, index: SlotIndex) {
        self.log().push(ProcessorEvent::Removed(index));
    }

    fn on_added(&mut self, added: &AddedRequest) {
        self.log().push(ProcessorEvent::Added(added.index));
    }

    fn on_moved(&mut self, moved: &MovedRequest) {
        self.log().push(ProcessorEvent::Moved {
            from: moved.from,
            to: moved.to,
        });
    }

    fn apply(&self, _index: SlotIndex, _logits: &mut [f32]) {}

    fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]) {
        self.log()
            .push(ProcessorEvent::Accepted(index, token_ids.to_vec()));
    }

    fn rollback(&mut self, index: SlotIndex, num_tokens: usize) {
        self.log().push(ProcessorEvent::RolledBack(index, num_tokens));
    }
}
