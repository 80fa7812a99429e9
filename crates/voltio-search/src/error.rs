//! Contract errors of the conversation state machine.
//!
//! Upstream failures (completion service, search, catalog) never show up
//! here: every component recovers from those locally. What remains are
//! violations of the state machine's own invariants, which indicate a bug.

use thiserror::Error;

use crate::conversation::SearchState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionStateError {
    #[error("invalid search state transition {from:?} -> {to:?}")]
    InvalidTransition { from: SearchState, to: SearchState },

    #[error("search state {state:?} does not match search context presence (has_context={has_context})")]
    ContextMismatch { state: SearchState, has_context: bool },

    #[error("no open search context while in {state:?}")]
    MissingContext { state: SearchState },

    #[error("attempt budget of {max} exhausted")]
    AttemptBudgetExceeded { max: usize },

    #[error("query '{query}' was already attempted in this episode")]
    DuplicateQuery { query: String },

    #[error("clarification count {count} exceeds the single allowed question")]
    ClarificationLimit { count: u32 },
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Session state broke an invariant; nothing from the turn was committed.
    #[error("session '{session_id}' is in an invalid state: {source}")]
    InvalidSessionState {
        session_id: String,
        #[source]
        source: SessionStateError,
    },
}

impl OrchestratorError {
    pub fn invalid_state(session_id: impl Into<String>, source: SessionStateError) -> Self {
        Self::InvalidSessionState {
            session_id: session_id.into(),
            source,
        }
    }
}
