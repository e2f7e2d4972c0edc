//! Stateful per-request logits processors.
//!
//! Every processor keeps its own per-slot state and stays synchronized with
//! the slot table by replaying each [`BatchUpdate`] exactly once, in the
//! order removed → added → moved. The [`ProcessorSet`] owns that replay:
//! it consumes the update by value, so an update cannot be applied twice.
//!
//! Speculative decoding feeds draft tokens through `accept_tokens` before
//! verification and unwinds the rejected tail with `rollback`. For every
//! processor `accept(n); rollback(n - k)` leaves the same state as
//! `accept(k)`.
//!
//! # Usage
//! ```ignore
//! let mut processors = ProcessorSet::with_defaults(None);
//! if let Some(update) = changes.update {
//!     processors.apply_update(update);
//! }
//! processors.apply(slot, &mut logits);
//! ```

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::batch::{AddedRequest, BatchUpdate, MoveDirectionality, MovedRequest, SlotIndex};

use super::structured_output::{GrammarCompiler, GrammarMatcher};

/// A logits transformation that carries per-request state across steps.
pub trait StatefulLogitsProcessor: Send {
    /// Human-readable name for debugging and metrics.
    fn name(&self) -> &'static str;

    fn on_removed(&mut self, index: SlotIndex);

    fn on_added(&mut self, added: &AddedRequest);

    fn on_moved(&mut self, moved: &MovedRequest);

    /// Transform the logits of the request in `index`.
    fn apply(&self, index: SlotIndex, logits: &mut [f32]);

    /// Tentatively advance the request's state by `token_ids`.
    fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]);

    /// Undo the last `num_tokens` accepted tokens, most recent first.
    fn rollback(&mut self, index: SlotIndex, num_tokens: usize);
}

/// Per-slot state map shared by the processors in this module.
#[derive(Debug)]
struct SlotStates<S> {
    states: HashMap<SlotIndex, S>,
}

impl<S> Default for SlotStates<S> {
    fn default() -> Self {
        Self {
            states: HashMap::new(),
        }
    }
}

impl<S> SlotStates<S> {
    fn get(&self, index: SlotIndex) -> Option<&S> {
        self.states.get(&index)
    }

    fn get_mut(&mut self, index: SlotIndex) -> Option<&mut S> {
        self.states.get_mut(&index)
    }

    fn insert(&mut self, index: SlotIndex, state: S) {
        self.states.insert(index, state);
    }

    fn remove(&mut self, index: SlotIndex) {
        self.states.remove(&index);
    }

    fn apply_move(&mut self, moved: &MovedRequest) {
        match moved.directionality {
            MoveDirectionality::Swap => {
                let a = self.states.remove(&moved.from);
                let b = self.states.remove(&moved.to);
                if let Some(a) = a {
                    self.states.insert(moved.to, a);
                }
                if let Some(b) = b {
                    self.states.insert(moved.from, b);
                }
            }
            MoveDirectionality::Unidirectional => {
                self.states.remove(&moved.to);
                if let Some(state) = self.states.remove(&moved.from) {
                    self.states.insert(moved.to, state);
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.states.len()
    }
}

// ─── Bad words ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct BadWordsState {
    bad_words: Vec<Vec<u32>>,
    past_tokens: Vec<u32>,
}

/// Bad-words (multi-token sequence) processor.
///
/// - Single-token words: unconditionally set to -inf
/// - Multi-token words: only ban the last token when the output so far ends
///   with the word's prefix
#[derive(Debug, Default)]
pub struct BadWordsProcessor {
    slots: SlotStates<BadWordsState>,
}

impl BadWordsProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatefulLogitsProcessor for BadWordsProcessor {
    fn name(&self) -> &'static str {
        "bad_words"
    }

    fn on_removed(&mut self, index: SlotIndex) {
        self.slots.remove(index);
    }

    fn on_added(&mut self, added: &AddedRequest) {
        let Some(words) = &added.sampling_params.bad_words_token_ids else {
            self.slots.remove(added.index);
            return;
        };
        let bad_words: Vec<Vec<u32>> = words.iter().filter(|w| !w.is_empty()).cloned().collect();
        if bad_words.is_empty() {
            self.slots.remove(added.index);
            return;
        }
        self.slots.insert(
            added.index,
            BadWordsState {
                bad_words,
                past_tokens: added.output_token_ids.clone(),
            },
        );
    }

    fn on_moved(&mut self, moved: &MovedRequest) {
        self.slots.apply_move(moved);
    }

    fn apply(&self, index: SlotIndex, logits: &mut [f32]) {
        let Some(state) = self.slots.get(index) else {
            return;
        };
        for word in &state.bad_words {
            let (&last, prefix) = match word.split_last() {
                Some(split) => split,
                None => continue,
            };
            if prefix.len() > state.past_tokens.len() {
                continue;
            }
            let tail = &state.past_tokens[state.past_tokens.len() - prefix.len()..];
            if tail == prefix {
                if let Some(logit) = logits.get_mut(last as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }
    }

    fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]) {
        if let Some(state) = self.slots.get_mut(index) {
            state.past_tokens.extend_from_slice(token_ids);
        }
    }

    fn rollback(&mut self, index: SlotIndex, num_tokens: usize) {
        if let Some(state) = self.slots.get_mut(index) {
            debug_assert!(
                num_tokens <= state.past_tokens.len(),
                "rollback of {num_tokens} exceeds {} accepted tokens",
                state.past_tokens.len()
            );
            let keep = state.past_tokens.len().saturating_sub(num_tokens);
            state.past_tokens.truncate(keep);
        }
    }
}

// ─── Logit bias ─────────────────────────────────────────────────────────

/// Logit bias processor: adds per-token bias values.
#[derive(Debug, Default)]
pub struct LogitBiasProcessor {
    slots: SlotStates<Vec<(u32, f32)>>,
}

impl LogitBiasProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatefulLogitsProcessor for LogitBiasProcessor {
    fn name(&self) -> &'static str {
        "logit_bias"
    }

    fn on_removed(&mut self, index: SlotIndex) {
        self.slots.remove(index);
    }

    fn on_added(&mut self, added: &AddedRequest) {
        match &added.sampling_params.logit_bias {
            Some(biases) if !biases.is_empty() => self.slots.insert(added.index, biases.clone()),
            _ => self.slots.remove(added.index),
        }
    }

    fn on_moved(&mut self, moved: &MovedRequest) {
        self.slots.apply_move(moved);
    }

    fn apply(&self, index: SlotIndex, logits: &mut [f32]) {
        let Some(biases) = self.slots.get(index) else {
            return;
        };
        for &(token_id, bias) in biases {
            if let Some(logit) = logits.get_mut(token_id as usize) {
                *logit += bias;
            }
        }
    }

    fn accept_tokens(&mut self, _index: SlotIndex, _token_ids: &[u32]) {}

    fn rollback(&mut self, _index: SlotIndex, _num_tokens: usize) {}
}

// ─── Min tokens ─────────────────────────────────────────────────────────

#[derive(Debug)]
struct MinTokensState {
    min_tokens: usize,
    eos_token_id: u32,
    num_output_tokens: usize,
}

/// Min-tokens processor: prevents EOS until `min_tokens` were generated.
#[derive(Debug, Default)]
pub struct MinTokensProcessor {
    slots: SlotStates<MinTokensState>,
}

impl MinTokensProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatefulLogitsProcessor for MinTokensProcessor {
    fn name(&self) -> &'static str {
        "min_tokens"
    }

    fn on_removed(&mut self, index: SlotIndex) {
        self.slots.remove(index);
    }

    fn on_added(&mut self, added: &AddedRequest) {
        let params = &added.sampling_params;
        match params.eos_token_id {
            Some(eos_token_id) if params.min_tokens > 0 => self.slots.insert(
                added.index,
                MinTokensState {
                    min_tokens: params.min_tokens,
                    eos_token_id,
                    num_output_tokens: added.output_token_ids.len(),
                },
            ),
            _ => self.slots.remove(added.index),
        }
    }

    fn on_moved(&mut self, moved: &MovedRequest) {
        self.slots.apply_move(moved);
    }

    fn apply(&self, index: SlotIndex, logits: &mut [f32]) {
        let Some(state) = self.slots.get(index) else {
            return;
        };
        if state.num_output_tokens < state.min_tokens {
            if let Some(logit) = logits.get_mut(state.eos_token_id as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]) {
        if let Some(state) = self.slots.get_mut(index) {
            state.num_output_tokens += token_ids.len();
        }
    }

    fn rollback(&mut self, index: SlotIndex, num_tokens: usize) {
        if let Some(state) = self.slots.get_mut(index) {
            debug_assert!(num_tokens <= state.num_output_tokens);
            state.num_output_tokens = state.num_output_tokens.saturating_sub(num_tokens);
        }
    }
}

// ─── Grammar ────────────────────────────────────────────────────────────

struct GrammarState {
    matcher: Box<dyn GrammarMatcher>,
    /// One entry per token offered to the matcher; `false` when the matcher
    /// refused it, so rollback only unwinds what actually advanced.
    advanced: Vec<bool>,
}

/// Structured-output processor over an opaque grammar backend.
///
/// Without a compiler, or when the compiler cannot handle a request's
/// spec, the request decodes unconstrained.
pub struct GrammarProcessor {
    compiler: Option<Box<dyn GrammarCompiler>>,
    slots: SlotStates<GrammarState>,
}

impl GrammarProcessor {
    pub fn new(compiler: Option<Box<dyn GrammarCompiler>>) -> Self {
        Self {
            compiler,
            slots: SlotStates::default(),
        }
    }

    pub fn num_constrained(&self) -> usize {
        self.slots.len()
    }
}

impl std::fmt::Debug for GrammarProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrammarProcessor")
            .field("has_compiler", &self.compiler.is_some())
            .field("num_constrained", &self.slots.len())
            .finish()
    }
}

impl StatefulLogitsProcessor for GrammarProcessor {
    fn name(&self) -> &'static str {
        "grammar"
    }

    fn on_removed(&mut self, index: SlotIndex) {
        self.slots.remove(index);
    }

    fn on_added(&mut self, added: &AddedRequest) {
        self.slots.remove(added.index);
        let Some(spec) = &added.sampling_params.structured_output else {
            return;
        };
        let Some(compiler) = &self.compiler else {
            warn!(
                request_id = %added.req_id,
                kind = %spec,
                "no grammar backend available, decoding unconstrained"
            );
            return;
        };
        let Some(mut matcher) = compiler.compile(spec) else {
            warn!(
                request_id = %added.req_id,
                kind = %spec,
                "grammar backend rejected spec, decoding unconstrained"
            );
            return;
        };
        let mut advanced = Vec::with_capacity(added.output_token_ids.len());
        for &token in &added.output_token_ids {
            advanced.push(matcher.accept_token(token));
        }
        self.slots
            .insert(added.index, GrammarState { matcher, advanced });
    }

    fn on_moved(&mut self, moved: &MovedRequest) {
        self.slots.apply_move(moved);
    }

    fn apply(&self, index: SlotIndex, logits: &mut [f32]) {
        let Some(state) = self.slots.get(index) else {
            return;
        };
        for (token_id, logit) in logits.iter_mut().enumerate() {
            if !state.matcher.is_token_allowed(token_id as u32) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]) {
        let Some(state) = self.slots.get_mut(index) else {
            return;
        };
        for &token in token_ids {
            let ok = state.matcher.accept_token(token);
            if !ok {
                debug!(slot = index.get(), token, "grammar refused token");
            }
            state.advanced.push(ok);
        }
    }

    fn rollback(&mut self, index: SlotIndex, num_tokens: usize) {
        let Some(state) = self.slots.get_mut(index) else {
            return;
        };
        debug_assert!(num_tokens <= state.advanced.len());
        let keep = state.advanced.len().saturating_sub(num_tokens);
        let undone = state.advanced.drain(keep..).filter(|&ok| ok).count();
        if undone > 0 {
            state.matcher.rollback(undone);
        }
    }
}

// ─── Processor set ──────────────────────────────────────────────────────

/// All stateful processors of one engine, synchronized as a unit.
pub struct ProcessorSet {
    processors: Vec<Box<dyn StatefulLogitsProcessor>>,
    last_step: Option<u64>,
}

impl ProcessorSet {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
            last_step: None,
        }
    }

    /// Bad words, logit bias, min tokens and grammar, in that order.
    pub fn with_defaults(grammar_compiler: Option<Box<dyn GrammarCompiler>>) -> Self {
        let mut set = Self::new();
        set.push(Box::new(BadWordsProcessor::new()));
        set.push(Box::new(LogitBiasProcessor::new()));
        set.push(Box::new(MinTokensProcessor::new()));
        set.push(Box::new(GrammarProcessor::new(grammar_compiler)));
        set
    }

    pub fn push(&mut self, processor: Box<dyn StatefulLogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Replay one step's structural diff on every processor.
    pub fn apply_update(&mut self, update: BatchUpdate) {
        debug_assert!(
            self.last_step.map_or(true, |last| update.step() > last),
            "batch update {} applied after {:?}",
            update.step(),
            self.last_step
        );
        self.last_step = Some(update.step());

        for processor in &mut self.processors {
            for &index in update.removed() {
                processor.on_removed(index);
            }
            for added in update.added() {
                processor.on_added(added);
            }
            for moved in update.moved() {
                processor.on_moved(moved);
            }
        }
    }

    pub fn apply(&self, index: SlotIndex, logits: &mut [f32]) {
        for processor in &self.processors {
            processor.apply(index, logits);
        }
    }

    pub fn accept_tokens(&mut self, index: SlotIndex, token_ids: &[u32]) {
        if token_ids.is_empty() {
            return;
        }
        for processor in &mut self.processors {
            processor.accept_tokens(index, token_ids);
        }
    }

    /// Unwind rejected draft tokens. Processors are visited in reverse
    /// registration order.
    pub fn rollback(&mut self, index: SlotIndex, num_tokens: usize) {
        if num_tokens == 0 {
            return;
        }
        for processor in self.processors.iter_mut().rev() {
            processor.rollback(index, num_tokens);
        }
    }
}

impl Default for ProcessorSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessorSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorSet")
            .field("processors", &self.names())
            .field("last_step", &self.last_step)
            .finish()
    }
}
