//! Opaque structured-output capability.
//!
//! Grammar dialects (JSON schema, regex, EBNF) are compiled by an external
//! backend. This core only needs a matcher that can accept tokens, report
//! which tokens are legal next, and roll back tentatively accepted tokens
//! after draft rejection.

use std::fmt;

/// Structured-output request attached to a request's sampling params.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuredOutputSpec {
    JsonSchema(String),
    Regex(String),
    Grammar(String),
    Choice(Vec<String>),
}

impl fmt::Display for StructuredOutputSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JsonSchema(_) => f.write_str("json_schema"),
            Self::Regex(_) => f.write_str("regex"),
            Self::Grammar(_) => f.write_str("grammar"),
            Self::Choice(_) => f.write_str("choice"),
        }
    }
}

/// Per-request grammar state machine.
pub trait GrammarMatcher: Send {
    /// Advance by one token. Returns `false` (and leaves the state
    /// unchanged) when the token is illegal in the current state.
    fn accept_token(&mut self, token_id: u32) -> bool;

    /// Undo the last `num_tokens` accepted tokens, most recent first.
    fn rollback(&mut self, num_tokens: usize);

    /// Whether `token_id` is legal in the current state.
    fn is_token_allowed(&self, token_id: u32) -> bool;

    /// Whether the grammar has reached an accepting terminal state.
    fn is_terminated(&self) -> bool;
}

/// Compiles a [`StructuredOutputSpec`] into a fresh matcher.
///
/// Returning `None` means the backend cannot handle this spec; the
/// request then decodes unconstrained.
pub trait GrammarCompiler: Send {
    fn compile(&self, spec: &StructuredOutputSpec) -> Option<Box<dyn GrammarMatcher>>;
}
