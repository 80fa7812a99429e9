//! Per-session conversation memory and the search state machine.
//!
//! A [`ConversationState`] is only ever mutated by the turn that holds the
//! session lock. Every transition goes through [`ConversationState::set_search_state`]
//! so the state/context coupling cannot drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::error::SessionStateError;
use crate::text::query_key;
use crate::types::{Channel, Intent, RankedItem};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub turn_index: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SearchState {
    #[default]
    Initial,
    Analyzing,
    NeedsInfo,
    Searching,
    Validating,
    Refining,
    Completed,
    Failed,
}

impl SearchState {
    /// States in which a search episode is open and a context must exist.
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::Analyzing | Self::NeedsInfo | Self::Searching | Self::Validating | Self::Refining
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Legal edges of the episode state machine. Any state may start a new
    /// episode by moving to `Analyzing`.
    pub fn can_transition_to(self, to: SearchState) -> bool {
        use SearchState::*;
        if to == Analyzing {
            return true;
        }
        matches!(
            (self, to),
            (Analyzing, Searching)
                | (Analyzing, NeedsInfo)
                | (NeedsInfo, Searching)
                | (Searching, Validating)
                | (Validating, Completed)
                | (Validating, NeedsInfo)
                | (Validating, Refining)
                | (Validating, Failed)
                | (Refining, Searching)
        )
    }
}

/// One executed query and how validation judged it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchAttempt {
    pub query: String,
    pub result_count: usize,
    pub accepted: bool,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchContext {
    /// Literal request, with the clarification answer appended once given.
    pub original_query: String,
    pub product_type: Option<String>,
    pub extracted_info: BTreeMap<String, String>,
    pub missing_info: Vec<String>,
    pub attempts: Vec<SearchAttempt>,
    pub has_clarified: bool,
    pub clarification_count: u32,
    pub refinement_feedback: Vec<String>,
}

impl SearchContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            original_query: query.into(),
            ..Self::default()
        }
    }

    pub fn attempted_queries(&self) -> Vec<String> {
        self.attempts.iter().map(|a| a.query.clone()).collect()
    }

    pub fn has_attempted(&self, query: &str) -> bool {
        let key = query_key(query);
        self.attempts.iter().any(|a| query_key(&a.query) == key)
    }
}

/// How `open_or_continue_search_context` treated the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextOpening {
    /// A new episode started; the state is now `Analyzing`.
    Started,
    /// The request answered a pending clarification; the state is now `Searching`.
    Continued,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub session_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub messages: Vec<Message>,
    pub current_intent: Option<Intent>,
    pub intent_confidence: f32,
    pub search_state: SearchState,
    pub search_context: Option<SearchContext>,
    pub turn_count: u32,
    /// Items shown in the last result reply; follow-ups like "el primero" refer to these.
    #[serde(default)]
    pub last_results: Vec<RankedItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>, channel: Channel) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            channel,
            messages: Vec::new(),
            current_intent: None,
            intent_confidence: 0.0,
            search_state: SearchState::Initial,
            search_context: None,
            turn_count: 0,
            last_results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append to the message log. A user message opens a new turn.
    pub fn add_message(&mut self, role: Role, text: impl Into<String>) {
        if role == Role::User {
            self.turn_count += 1;
        }
        let now = Utc::now();
        self.messages.push(Message {
            role,
            text: text.into(),
            timestamp: now,
            turn_index: self.turn_count,
        });
        self.updated_at = now;
    }

    /// Last `n` messages, oldest first.
    pub fn recent_history(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    pub fn set_intent(&mut self, intent: Intent, confidence: f32) {
        self.current_intent = Some(intent);
        self.intent_confidence = confidence.clamp(0.0, 1.0);
    }

    /// Move the episode state machine. Terminal states discard the context.
    pub fn set_search_state(&mut self, to: SearchState) -> Result<(), SessionStateError> {
        let from = self.search_state;
        if !from.can_transition_to(to) {
            return Err(SessionStateError::InvalidTransition { from, to });
        }
        if to.is_open() && self.search_context.is_none() {
            return Err(SessionStateError::MissingContext { state: to });
        }
        tracing::debug!(session_id = %self.session_id, ?from, ?to, "search state transition");
        self.search_state = to;
        if to.is_terminal() {
            self.search_context = None;
        }
        Ok(())
    }

    /// Continue a pending clarification or start a new episode.
    ///
    /// In `NeedsInfo` the answer is appended to the original request,
    /// `has_clarified` is set, attempts are reset and the state moves to
    /// `Searching`. Otherwise any open context is replaced and the state moves
    /// to `Analyzing`.
    pub fn open_or_continue_search_context(
        &mut self,
        query: &str,
    ) -> Result<ContextOpening, SessionStateError> {
        if self.search_state == SearchState::NeedsInfo {
            let ctx = self
                .search_context
                .as_mut()
                .ok_or(SessionStateError::MissingContext { state: SearchState::NeedsInfo })?;
            let answer = query.trim();
            if !answer.is_empty() {
                ctx.original_query = format!("{} {}", ctx.original_query.trim_end(), answer);
            }
            ctx.has_clarified = true;
            ctx.attempts.clear();
            self.set_search_state(SearchState::Searching)?;
            return Ok(ContextOpening::Continued);
        }
        self.start_search_context(query)?;
        Ok(ContextOpening::Started)
    }

    /// Discard whatever episode is open and start a new one for `query`.
    pub fn start_search_context(&mut self, query: &str) -> Result<(), SessionStateError> {
        self.search_context = Some(SearchContext::new(query.trim()));
        self.set_search_state(SearchState::Analyzing)
    }

    pub fn search_context_mut(&mut self) -> Result<&mut SearchContext, SessionStateError> {
        let state = self.search_state;
        self.search_context
            .as_mut()
            .ok_or(SessionStateError::MissingContext { state })
    }

    /// Append an attempt, rejecting budget overruns and repeated queries.
    pub fn record_attempt(
        &mut self,
        attempt: SearchAttempt,
        max_attempts: usize,
    ) -> Result<(), SessionStateError> {
        let ctx = self.search_context_mut()?;
        if ctx.attempts.len() >= max_attempts {
            return Err(SessionStateError::AttemptBudgetExceeded { max: max_attempts });
        }
        if ctx.has_attempted(&attempt.query) {
            return Err(SessionStateError::DuplicateQuery { query: attempt.query });
        }
        ctx.attempts.push(attempt);
        Ok(())
    }

    /// Count the single clarifying question of this episode.
    pub fn mark_clarification_asked(&mut self) -> Result<(), SessionStateError> {
        let ctx = self.search_context_mut()?;
        if ctx.clarification_count >= 1 {
            return Err(SessionStateError::ClarificationLimit {
                count: ctx.clarification_count + 1,
            });
        }
        ctx.clarification_count += 1;
        Ok(())
    }

    /// Verify the structural invariants of the episode.
    pub fn check_invariants(&self, max_attempts: usize) -> Result<(), SessionStateError> {
        let has_context = self.search_context.is_some();
        if self.search_state.is_open() != has_context {
            return Err(SessionStateError::ContextMismatch {
                state: self.search_state,
                has_context,
            });
        }
        if let Some(ctx) = &self.search_context {
            if ctx.attempts.len() > max_attempts {
                return Err(SessionStateError::AttemptBudgetExceeded { max: max_attempts });
            }
            let mut seen = HashSet::new();
            for attempt in &ctx.attempts {
                if !seen.insert(query_key(&attempt.query)) {
                    return Err(SessionStateError::DuplicateQuery {
                        query: attempt.query.clone(),
                    });
                }
            }
            if ctx.clarification_count > 1 {
                return Err(SessionStateError::ClarificationLimit {
                    count: ctx.clarification_count,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(query: &str) -> SearchAttempt {
        SearchAttempt {
            query: query.to_string(),
            result_count: 0,
            accepted: false,
            feedback: String::new(),
        }
    }

    #[test]
    fn test_new_state_is_initial_without_context() {
        let state = ConversationState::new("s1", "u1", Channel::Web);
        assert_eq!(state.search_state, SearchState::Initial);
        assert!(state.search_context.is_none());
        assert!(state.check_invariants(3).is_ok());
    }

    #[test]
    fn test_add_message_counts_user_turns() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.add_message(Role::User, "hola");
        state.add_message(Role::Assistant, "¡Hola!");
        state.add_message(Role::User, "busco cable");
        assert_eq!(state.turn_count, 2);
        assert_eq!(state.messages[1].turn_index, 1);
        assert_eq!(state.recent_history(2)[0].text, "¡Hola!");
    }

    #[test]
    fn test_invalid_transition_is_rejected() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        let err = state.set_search_state(SearchState::Validating).unwrap_err();
        assert_eq!(
            err,
            SessionStateError::InvalidTransition {
                from: SearchState::Initial,
                to: SearchState::Validating
            }
        );
        assert_eq!(state.search_state, SearchState::Initial);
    }

    #[test]
    fn test_terminal_state_clears_context() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.open_or_continue_search_context("cable 2.5mm2").unwrap();
        state.set_search_state(SearchState::Searching).unwrap();
        state.set_search_state(SearchState::Validating).unwrap();
        state.set_search_state(SearchState::Completed).unwrap();
        assert!(state.search_context.is_none());
        assert!(state.check_invariants(3).is_ok());
    }

    #[test]
    fn test_clarification_answer_is_merged() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        assert_eq!(
            state.open_or_continue_search_context("necesito un automático").unwrap(),
            ContextOpening::Started
        );
        state.set_search_state(SearchState::NeedsInfo).unwrap();
        state.mark_clarification_asked().unwrap();

        assert_eq!(
            state.open_or_continue_search_context("de 16A").unwrap(),
            ContextOpening::Continued
        );
        let ctx = state.search_context.as_ref().unwrap();
        assert_eq!(ctx.original_query, "necesito un automático de 16A");
        assert!(ctx.has_clarified);
        assert_eq!(ctx.clarification_count, 1);
        assert_eq!(state.search_state, SearchState::Searching);
    }

    #[test]
    fn test_second_clarification_is_rejected() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.open_or_continue_search_context("automático").unwrap();
        state.mark_clarification_asked().unwrap();
        assert!(matches!(
            state.mark_clarification_asked(),
            Err(SessionStateError::ClarificationLimit { count: 2 })
        ));
    }

    #[test]
    fn test_record_attempt_enforces_budget_and_distinctness() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.open_or_continue_search_context("diferencial").unwrap();
        state.record_attempt(attempt("diferencial 40A"), 2).unwrap();
        assert!(matches!(
            state.record_attempt(attempt("Diferencial 40a"), 2),
            Err(SessionStateError::DuplicateQuery { .. })
        ));
        state.record_attempt(attempt("id 40A"), 2).unwrap();
        assert!(matches!(
            state.record_attempt(attempt("rcd 40A"), 2),
            Err(SessionStateError::AttemptBudgetExceeded { max: 2 })
        ));
    }

    #[test]
    fn test_record_attempt_without_context() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        assert!(matches!(
            state.record_attempt(attempt("cable"), 3),
            Err(SessionStateError::MissingContext { .. })
        ));
    }

    #[test]
    fn test_check_invariants_detects_mismatch() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.search_context = Some(SearchContext::new("cable"));
        assert!(matches!(
            state.check_invariants(3),
            Err(SessionStateError::ContextMismatch { has_context: true, .. })
        ));
    }

    #[test]
    fn test_new_episode_replaces_open_context() {
        let mut state = ConversationState::new("s1", "u1", Channel::Web);
        state.open_or_continue_search_context("automático").unwrap();
        state.set_search_state(SearchState::NeedsInfo).unwrap();
        state.start_search_context("cable 2.5mm2").unwrap();
        let ctx = state.search_context.as_ref().unwrap();
        assert_eq!(ctx.original_query, "cable 2.5mm2");
        assert!(!ctx.has_clarified);
        assert_eq!(state.search_state, SearchState::Analyzing);
    }
}
