//! Turn orchestration: escalation gate, intent routing and the bounded
//! search episode.
//!
//! Each turn works on a copy of the session state and commits it in one
//! `save` at the end, so a dropped turn future leaves the stored session as
//! it was. Turns of one session are serialized by a per-session mutex.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{
    clarification_question, clean_answer, format_results, general_prompt, item_summary,
    no_match_message, order_not_found, order_status_message, resolve_reference, spec_sheet,
    technical_prompt, TurnResponse, ASK_WHICH_ITEM, GENERAL_FALLBACK_TEXT, GREETING_TEXT,
    NOTHING_SHOWN_TEXT, ORDER_LOOKUP_FAILED, ORDER_NUMBER_REQUEST,
};
use crate::backend::{CatalogService, EscalationSink, SearchService};
use crate::config::AssistantConfig;
use crate::conversation::{
    ContextOpening, ConversationState, Role, SearchAttempt, SearchContext, SearchState,
    SessionStore,
};
use crate::error::{OrchestratorError, SessionStateError};
use crate::escalation::{EscalationDetector, EscalationReason};
use crate::llm::LLMManager;
use crate::search::analyzer::{detect_product_type, extract_specs};
use crate::search::intent::extract_order_number;
use crate::search::validator::unique_in_order;
use crate::search::{
    execute_query_set, ClassificationResult, IntentClassifier, QueryGenerator, ResultValidator,
    SearchAnalyzer, SearchRefiner, ValidationResult,
};
use crate::synonyms::SynonymIndex;
use crate::text::{extract_keywords, normalize};
use crate::types::{Channel, Intent, ItemDetail, RankedItem, SearchFilters};

/// Prior messages handed to the classifier, analyzer and general answers.
const HISTORY_WINDOW: usize = 6;
const ANSWER_MAX_TOKENS: usize = 300;

pub struct SearchOrchestrator {
    config: AssistantConfig,
    llm: Arc<LLMManager>,
    classifier: IntentClassifier,
    analyzer: SearchAnalyzer,
    generator: QueryGenerator,
    validator: ResultValidator,
    refiner: SearchRefiner,
    escalation: EscalationDetector,
    search: Arc<dyn SearchService>,
    catalog: Arc<dyn CatalogService>,
    sink: Arc<dyn EscalationSink>,
    store: Arc<dyn SessionStore>,
    session_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

/// Exclusive hold on one session for the length of a turn. Dropping it,
/// including when the turn future is cancelled, releases the lock and
/// forgets the session's mutex once no other turn is queued on it.
struct SessionTurn<'a> {
    locks: &'a DashMap<String, Arc<AsyncMutex<()>>>,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.session_id.as_str(), |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl SearchOrchestrator {
    pub fn new(
        config: AssistantConfig,
        llm: Arc<LLMManager>,
        synonyms: Arc<SynonymIndex>,
        search: Arc<dyn SearchService>,
        catalog: Arc<dyn CatalogService>,
        sink: Arc<dyn EscalationSink>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            classifier: IntentClassifier::new(Arc::clone(&llm), Arc::clone(&synonyms)),
            analyzer: SearchAnalyzer::new(Arc::clone(&llm)),
            generator: QueryGenerator::new(Arc::clone(&llm), Arc::clone(&synonyms)),
            validator: ResultValidator::new(
                Arc::clone(&llm),
                Arc::clone(&synonyms),
                config.validation.clone(),
            ),
            refiner: SearchRefiner::new(Arc::clone(&llm), synonyms),
            escalation: EscalationDetector::new(config.escalation.failure_threshold),
            config,
            llm,
            search,
            catalog,
            sink,
            store,
            session_locks: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AssistantConfig {
        &self.config
    }

    /// `HandleTurn(sessionID, userID, channel, messageText)`.
    ///
    /// Upstream failures never surface here; the only error is a broken
    /// session invariant, in which case nothing from the turn is stored.
    pub async fn handle_turn(
        &self,
        session_id: &str,
        user_id: &str,
        channel: Channel,
        text: &str,
    ) -> Result<TurnResponse, OrchestratorError> {
        let _turn = self.begin_turn(session_id).await;

        let mut state = match self.store.load(session_id).await {
            Ok(Some(state)) => state,
            Ok(None) => ConversationState::new(session_id, user_id, channel),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Session load failed, starting a fresh conversation");
                ConversationState::new(session_id, user_id, channel)
            }
        };

        let max_attempts = self.config.search.max_attempts;
        state
            .check_invariants(max_attempts)
            .map_err(|e| contract_violation(session_id, e))?;

        let response = self
            .run_turn(&mut state, text)
            .await
            .map_err(|e| contract_violation(session_id, e))?;

        state
            .check_invariants(max_attempts)
            .map_err(|e| contract_violation(session_id, e))?;

        if let Err(e) = self.store.save(state).await {
            tracing::warn!(session_id = %session_id, error = %e, "Session save failed");
        }
        Ok(response)
    }

    async fn begin_turn(&self, session_id: &str) -> SessionTurn<'_> {
        let lock = Arc::clone(
            self.session_locks
                .entry(session_id.to_string())
                .or_default()
                .value(),
        );
        let guard = lock.lock_owned().await;
        SessionTurn {
            locks: &self.session_locks,
            session_id: session_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Sessions with a turn in progress or queued.
    pub fn active_sessions(&self) -> usize {
        self.session_locks.len()
    }

    async fn run_turn(
        &self,
        state: &mut ConversationState,
        text: &str,
    ) -> Result<TurnResponse, SessionStateError> {
        let session_id = state.session_id.clone();

        let decision = self.escalation.should_escalate(text, &session_id, false);
        if let (true, Some(reason)) = (decision.escalate, decision.reason) {
            let handoff = decision
                .suggested_handoff_text
                .unwrap_or_else(|| reason.handoff_text().to_string());
            self.dispatch_escalation(&session_id, reason, &handoff);
            state.add_message(Role::User, text);
            state.add_message(Role::Assistant, handoff.clone());
            return Ok(TurnResponse {
                text: handoff,
                intent: None,
                search_state: state.search_state,
                escalation: Some(reason),
                results: Vec::new(),
                episode: state.search_context.clone(),
            });
        }

        let classification = self
            .classifier
            .classify(text, state.recent_history(HISTORY_WINDOW))
            .await;

        // A pending question absorbs whatever is not clearly another request.
        let pending = state.search_state == SearchState::NeedsInfo;
        let intent = match classification.intent {
            Intent::TechnicalInfo | Intent::GeneralQuestion if pending => Intent::ProductSearch,
            other => other,
        };
        state.set_intent(intent, classification.confidence);
        tracing::info!(
            session_id = %session_id,
            intent = ?intent,
            classified = ?classification.intent,
            confidence = classification.confidence,
            source = ?classification.source,
            pending_clarification = pending,
            "Routing turn"
        );

        let mut response = match intent {
            Intent::ProductSearch => self.handle_product_search(state, text).await?,
            Intent::Greeting => reply(state, GREETING_TEXT.to_string()),
            Intent::OrderInquiry => {
                let answer = self.handle_order(text, &classification).await;
                reply(state, answer)
            }
            Intent::TechnicalInfo => {
                let answer = self.handle_technical(state, text).await;
                reply(state, answer)
            }
            Intent::GeneralQuestion => {
                let answer = self.answer_general(state, text, GENERAL_FALLBACK_TEXT).await;
                reply(state, answer)
            }
        };
        response.intent = Some(intent);

        state.add_message(Role::User, text);
        state.add_message(Role::Assistant, response.text.clone());
        Ok(response)
    }

    // ------------------------------------------------------------------
    // Product search
    // ------------------------------------------------------------------

    async fn handle_product_search(
        &self,
        state: &mut ConversationState,
        text: &str,
    ) -> Result<TurnResponse, SessionStateError> {
        let session_id = state.session_id.clone();
        let pending = state.search_state == SearchState::NeedsInfo;
        let opening = if pending && names_other_category(state.search_context.as_ref(), text) {
            tracing::info!(session_id = %session_id, "Different product requested while a question was pending, starting over");
            state.start_search_context(text)?;
            ContextOpening::Started
        } else {
            state.open_or_continue_search_context(text)?
        };

        let mut desirable = Vec::new();
        match opening {
            ContextOpening::Started => {
                let analysis = self
                    .analyzer
                    .analyze(text, state.recent_history(HISTORY_WINDOW))
                    .await;
                let ctx = state.search_context_mut()?;
                ctx.product_type = analysis.product_type;
                ctx.extracted_info = analysis.specs;
                ctx.missing_info = analysis.missing_info;
                desirable = analysis.desirable_info;

                if !analysis.has_enough_info && ctx.clarification_count == 0 {
                    let mut attributes = ctx.missing_info.clone();
                    attributes.extend(desirable);
                    return self.ask_clarification(state, attributes);
                }
                state.set_search_state(SearchState::Searching)?;
            }
            ContextOpening::Continued => {
                let ctx = state.search_context_mut()?;
                ctx.extracted_info.extend(extract_specs(&ctx.original_query));
                if ctx.product_type.is_none() {
                    ctx.product_type = detect_product_type(&ctx.original_query).map(str::to_string);
                }
                ctx.missing_info.retain(|k| !ctx.extracted_info.contains_key(k));
                tracing::info!(
                    session_id = %session_id,
                    query = %ctx.original_query,
                    "Clarification merged into request"
                );
            }
        }

        self.run_episode(state, desirable).await
    }

    fn ask_clarification(
        &self,
        state: &mut ConversationState,
        attributes: Vec<String>,
    ) -> Result<TurnResponse, SessionStateError> {
        state.mark_clarification_asked()?;
        state.set_search_state(SearchState::NeedsInfo)?;
        let attributes = unique_in_order(attributes);

        let product_type = state.search_context_mut()?.product_type.clone();
        let question = clarification_question(product_type.as_deref(), &attributes);
        tracing::info!(
            session_id = %state.session_id,
            product_type = ?product_type,
            attributes = ?attributes,
            "Asking clarification"
        );
        Ok(reply(state, question))
    }

    /// Attempt loop: search, validate, then accept, ask, refine or give up.
    /// Entered in `Searching`; leaves the session in `Completed`,
    /// `NeedsInfo` or `Failed`.
    async fn run_episode(
        &self,
        state: &mut ConversationState,
        desirable: Vec<String>,
    ) -> Result<TurnResponse, SessionStateError> {
        let settings = &self.config.search;
        let session_id = state.session_id.clone();

        let ctx = state.search_context_mut()?.clone();
        let mut query_set = self
            .generator
            .generate(&ctx.original_query, &ctx.extracted_info, ctx.product_type.as_deref())
            .await;

        let mut closest: Vec<RankedItem> = Vec::new();
        let mut every_call_failed = true;

        loop {
            let ctx = state.search_context_mut()?.clone();
            let run = execute_query_set(
                self.search.as_ref(),
                &query_set,
                &filters_for(&ctx, settings.results_per_query),
                settings.target_results,
                settings.max_alternates_per_attempt,
                settings.search_timeout(),
            )
            .await;
            every_call_failed &= run.all_failed();

            state.set_search_state(SearchState::Validating)?;
            let validation = self
                .validator
                .validate(&ctx.original_query, &run.items, &ctx.extracted_info)
                .await;
            state.record_attempt(
                SearchAttempt {
                    query: query_set.primary.clone(),
                    result_count: run.items.len(),
                    accepted: validation.accepted,
                    feedback: validation.reason.clone(),
                },
                settings.max_attempts,
            )?;
            tracing::debug!(
                session_id = %session_id,
                attempt = ctx.attempts.len() + 1,
                query = %query_set.primary,
                strategy = ?query_set.strategy,
                results = run.items.len(),
                accepted = validation.accepted,
                too_general = validation.too_general,
                "Search attempt"
            );

            let ranked = best_first(&run.items, &validation);
            if top_score(&ranked) > top_score(&closest) {
                closest = ranked.clone();
            }

            // A broad set is worth one question even when it matches.
            if validation.too_general {
                let ctx = state.search_context_mut()?;
                if ctx.clarification_count == 0 {
                    let mut attributes = ctx.missing_info.clone();
                    attributes.extend(desirable.iter().cloned());
                    return self.ask_clarification(state, attributes);
                }
            }
            if validation.accepted || validation.too_general {
                return self.complete(state, ranked, !validation.accepted);
            }

            let ctx = state.search_context_mut()?.clone();
            if ctx.attempts.len() >= settings.max_attempts {
                return self.fail(state, closest, every_call_failed);
            }

            let plan = self
                .refiner
                .refine(&ctx.original_query, &ctx, &validation, &ctx.attempts)
                .await;
            match self
                .generator
                .refine(&ctx.attempted_queries(), &plan, &ctx.extracted_info)
            {
                Some(next) => {
                    tracing::debug!(
                        session_id = %session_id,
                        strategy = ?plan.strategy,
                        next = %next.primary,
                        reasoning = %plan.reasoning,
                        "Refining search"
                    );
                    state
                        .search_context_mut()?
                        .refinement_feedback
                        .push(plan.reasoning);
                    state.set_search_state(SearchState::Refining)?;
                    state.set_search_state(SearchState::Searching)?;
                    query_set = next;
                }
                None => {
                    tracing::warn!(session_id = %session_id, "No untried query left, ending search early");
                    return self.fail(state, closest, every_call_failed);
                }
            }
        }
    }

    fn complete(
        &self,
        state: &mut ConversationState,
        ranked: Vec<RankedItem>,
        best_effort: bool,
    ) -> Result<TurnResponse, SessionStateError> {
        let episode = state.search_context.clone();
        let label = episode
            .as_ref()
            .map(|ctx| query_label(&ctx.original_query))
            .unwrap_or_default();
        state.set_search_state(SearchState::Completed)?;
        self.escalation.reset(&state.session_id);

        let shown: Vec<RankedItem> = ranked
            .into_iter()
            .take(self.config.display.limit_for(state.channel))
            .collect();
        tracing::info!(
            session_id = %state.session_id,
            attempts = episode.as_ref().map(|c| c.attempts.len()).unwrap_or(0),
            shown = shown.len(),
            best_effort,
            "Search completed"
        );
        state.last_results = shown.clone();

        Ok(TurnResponse {
            text: format_results(&label, &shown),
            intent: None,
            search_state: state.search_state,
            escalation: None,
            results: shown,
            episode,
        })
    }

    fn fail(
        &self,
        state: &mut ConversationState,
        closest: Vec<RankedItem>,
        upstream_down: bool,
    ) -> Result<TurnResponse, SessionStateError> {
        let episode = state.search_context.clone();
        let label = episode
            .as_ref()
            .map(|ctx| query_label(&ctx.original_query))
            .unwrap_or_default();
        state.set_search_state(SearchState::Failed)?;

        let session_id = state.session_id.clone();
        let failures = self.escalation.record_failure(&session_id);
        let shown: Vec<RankedItem> = closest
            .into_iter()
            .take(self.config.display.limit_for(state.channel))
            .collect();
        if !shown.is_empty() {
            state.last_results = shown.clone();
        }
        tracing::info!(
            session_id = %session_id,
            attempts = episode.as_ref().map(|c| c.attempts.len()).unwrap_or(0),
            failures,
            upstream_down,
            "Search failed"
        );

        let mut text = no_match_message(&label, &shown);
        let decision = self.escalation.check_counter(&session_id, upstream_down);
        let escalation = match (decision.escalate, decision.reason) {
            (true, Some(reason)) => {
                let handoff = decision
                    .suggested_handoff_text
                    .unwrap_or_else(|| reason.handoff_text().to_string());
                self.dispatch_escalation(&session_id, reason, &handoff);
                text = if upstream_down {
                    handoff
                } else {
                    format!("{}\n\n{}", text, handoff)
                };
                Some(reason)
            }
            _ => None,
        };

        Ok(TurnResponse {
            text,
            intent: None,
            search_state: state.search_state,
            escalation,
            results: shown,
            episode,
        })
    }

    /// Notify the human channel without waiting on it.
    fn dispatch_escalation(&self, session_id: &str, reason: EscalationReason, handoff: &str) {
        self.escalation.reset(session_id);
        let sink = Arc::clone(&self.sink);
        let session_id = session_id.to_string();
        let handoff = handoff.to_string();
        tokio::spawn(async move {
            if let Err(e) = sink.notify(&session_id, &reason, &handoff).await {
                tracing::warn!(session_id = %session_id, reason = %reason, error = %e, "Escalation notification failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Other intents
    // ------------------------------------------------------------------

    async fn handle_order(&self, text: &str, classification: &ClassificationResult) -> String {
        let Some(order_id) = extract_order_number(text)
            .or_else(|| classification.entities.get("order_id").cloned())
        else {
            return ORDER_NUMBER_REQUEST.to_string();
        };

        let timeout = self.config.search.catalog_timeout();
        match tokio::time::timeout(timeout, self.catalog.lookup_order(&order_id)).await {
            Ok(Ok(Some(order))) => order_status_message(&order),
            Ok(Ok(None)) => order_not_found(&order_id),
            Ok(Err(e)) => {
                tracing::warn!(order_id = %order_id, error = %e, "Order lookup failed");
                ORDER_LOOKUP_FAILED.to_string()
            }
            Err(_) => {
                tracing::warn!(order_id = %order_id, "Order lookup timed out");
                ORDER_LOOKUP_FAILED.to_string()
            }
        }
    }

    async fn handle_technical(&self, state: &ConversationState, text: &str) -> String {
        let shown = &state.last_results;
        let item = resolve_reference(text, shown).or(match shown.as_slice() {
            [only] => Some(only),
            _ => None,
        });
        let Some(item) = item else {
            if shown.is_empty() {
                return self.answer_general(state, text, NOTHING_SHOWN_TEXT).await;
            }
            return ASK_WHICH_ITEM.to_string();
        };

        let Some(detail) = self.lookup_item(&item.id).await else {
            return item_summary(item);
        };
        if self.llm.is_enabled() {
            match self
                .llm
                .generate_custom(&technical_prompt(text, &detail), ANSWER_MAX_TOKENS)
                .await
            {
                Ok(raw) => {
                    if let Some(answer) = clean_answer(&raw) {
                        return answer;
                    }
                    tracing::warn!(item_id = %detail.id, "Empty technical answer, showing the spec sheet");
                }
                Err(e) => {
                    tracing::warn!(item_id = %detail.id, error = %e, "Technical answer failed, showing the spec sheet");
                }
            }
        }
        spec_sheet(&detail)
    }

    async fn lookup_item(&self, id: &str) -> Option<ItemDetail> {
        let timeout = self.config.search.catalog_timeout();
        match tokio::time::timeout(timeout, self.catalog.lookup_item(id)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(item_id = %id, error = %e, "Catalog item lookup failed");
                None
            }
            Err(_) => {
                tracing::warn!(item_id = %id, "Catalog item lookup timed out");
                None
            }
        }
    }

    async fn answer_general(&self, state: &ConversationState, text: &str, fallback: &str) -> String {
        if self.llm.is_enabled() {
            let prompt = general_prompt(text, state.recent_history(HISTORY_WINDOW));
            match self.llm.generate_custom(&prompt, ANSWER_MAX_TOKENS).await {
                Ok(raw) => {
                    if let Some(answer) = clean_answer(&raw) {
                        return answer;
                    }
                    tracing::warn!("Empty general answer, using canned reply");
                }
                Err(e) => tracing::warn!(error = %e, "General answer failed, using canned reply"),
            }
        }
        fallback.to_string()
    }
}

fn contract_violation(session_id: &str, source: SessionStateError) -> OrchestratorError {
    tracing::error!(session_id = %session_id, error = %source, "Session state contract violated, turn discarded");
    OrchestratorError::invalid_state(session_id, source)
}

fn reply(state: &ConversationState, text: String) -> TurnResponse {
    TurnResponse {
        text,
        intent: None,
        search_state: state.search_state,
        escalation: None,
        results: Vec::new(),
        episode: state.search_context.clone(),
    }
}

/// A pending clarification is abandoned when the message names a different
/// product than the one being clarified.
fn names_other_category(ctx: Option<&SearchContext>, text: &str) -> bool {
    let Some(current) = ctx.and_then(|c| c.product_type.as_deref()) else {
        return false;
    };
    match detect_product_type(text) {
        Some(named) => normalize(named) != normalize(current),
        None => false,
    }
}

fn filters_for(ctx: &SearchContext, limit: usize) -> SearchFilters {
    SearchFilters {
        category: ctx.product_type.clone(),
        brand: ctx.extracted_info.get("marca").cloned(),
        in_stock_only: false,
        limit,
    }
}

/// Validator's picks first; the full set when it picked nothing.
fn best_first(items: &[RankedItem], validation: &ValidationResult) -> Vec<RankedItem> {
    if validation.best_indices.is_empty() {
        return items.to_vec();
    }
    validation
        .best_indices
        .iter()
        .filter_map(|&i| items.get(i).cloned())
        .collect()
}

fn top_score(items: &[RankedItem]) -> f32 {
    items.first().map(|i| i.score).unwrap_or(f32::MIN)
}

fn query_label(original_query: &str) -> String {
    match extract_keywords(original_query) {
        k if k.is_empty() => original_query.trim().to_string(),
        k => k,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::InMemorySessionStore;
    use crate::llm::{LLMConfig, LLMProvider};
    use crate::testing::{
        FailingProvider, RecordingSink, ScriptedProvider, ScriptedSearch, StaticCatalog,
    };
    use std::time::Duration;

    struct Harness {
        orchestrator: Arc<SearchOrchestrator>,
        search: Arc<ScriptedSearch>,
        sink: Arc<RecordingSink>,
        store: Arc<InMemorySessionStore>,
    }

    fn test_config() -> AssistantConfig {
        let mut config = AssistantConfig::default();
        // One search call per attempt keeps call counting exact.
        config.search.max_alternates_per_attempt = 0;
        config.search.search_timeout_ms = 1000;
        config.search.catalog_timeout_ms = 1000;
        config
    }

    fn harness_with(
        config: AssistantConfig,
        llm: LLMManager,
        search: ScriptedSearch,
        catalog: StaticCatalog,
    ) -> Harness {
        let search = Arc::new(search);
        let sink = Arc::new(RecordingSink::new());
        let store = Arc::new(InMemorySessionStore::new());
        let orchestrator = SearchOrchestrator::new(
            config,
            Arc::new(llm),
            Arc::new(SynonymIndex::builtin()),
            search.clone(),
            Arc::new(catalog),
            sink.clone(),
            store.clone(),
        );
        Harness {
            orchestrator: Arc::new(orchestrator),
            search,
            sink,
            store,
        }
    }

    fn harness(search: ScriptedSearch) -> Harness {
        harness_with(test_config(), LLMManager::disabled(), search, StaticCatalog::new())
    }

    fn breakers() -> Vec<RankedItem> {
        vec![
            RankedItem::new("A1", "Automático Hager 1P+N 16A curva C", 0.91).with_metadata("brand", "Hager"),
            RankedItem::new("A2", "Automático Schneider 2P 16A curva C", 0.84),
            RankedItem::new("A3", "Automático ABB 1P+N 16A curva B", 0.77),
        ]
    }

    fn rcds() -> Vec<RankedItem> {
        vec![
            RankedItem::new("D1", "Diferencial Hager 2P 40A 30mA clase AC", 0.93),
            RankedItem::new("D2", "Diferencial Schneider 2P 40A 30mA clase A", 0.88),
        ]
    }

    async fn turn(h: &Harness, text: &str) -> TurnResponse {
        h.orchestrator
            .handle_turn("s1", "u1", Channel::Web, text)
            .await
            .unwrap()
    }

    async fn stored(h: &Harness) -> ConversationState {
        h.store.load("s1").await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_vague_request_asks_one_question() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(breakers())));
        let response = turn(&h, "necesito un automático").await;

        assert_eq!(response.search_state, SearchState::NeedsInfo);
        assert_eq!(response.intent, Some(Intent::ProductSearch));
        assert!(response.text.contains("amperaje"));
        assert!(response.text.contains("curva"));
        assert!(response.text.contains("polos"));
        assert!(h.search.calls().is_empty());

        let state = stored(&h).await;
        let ctx = state.search_context.as_ref().unwrap();
        assert_eq!(ctx.clarification_count, 1);
        assert_eq!(ctx.product_type.as_deref(), Some("automatico"));
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_clarification_answer_is_merged_and_searched() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(breakers())));
        turn(&h, "necesito un automático").await;
        let response = turn(&h, "de 16A").await;

        assert_eq!(response.search_state, SearchState::Completed);
        let episode = response.episode.unwrap();
        assert_eq!(episode.original_query, "necesito un automático de 16A");
        assert_eq!(episode.clarification_count, 1);
        assert!(episode.has_clarified);
        assert_eq!(episode.extracted_info.get("amperaje").map(String::as_str), Some("16A"));
        assert_eq!(episode.attempts.len(), 1);
        assert_eq!(h.search.calls(), vec!["automático 16A".to_string()]);
        assert!(response.text.contains("1. Automático"));

        let state = stored(&h).await;
        assert!(state.search_context.is_none());
        assert_eq!(state.last_results.len(), 3);
    }

    #[tokio::test]
    async fn test_complete_request_searches_immediately() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(rcds())));
        let response = turn(&h, "busco diferencial 2P 40A 30mA").await;

        assert_eq!(response.search_state, SearchState::Completed);
        assert_eq!(h.search.calls().len(), 1);
        let episode = response.episode.unwrap();
        assert_eq!(episode.clarification_count, 0);
        assert_eq!(episode.attempts.len(), 1);
        assert!(episode.attempts[0].accepted);
        assert_eq!(response.results[0].id, "D1");
    }

    #[tokio::test]
    async fn test_results_on_third_attempt() {
        let fans = vec![
            RankedItem::new("F1", "Ventilador industrial de pared 450mm", 0.8),
            RankedItem::new("F2", "Ventilador industrial de pie 500mm", 0.7),
        ];
        let h = harness(ScriptedSearch::sequence(vec![Vec::new(), Vec::new(), fans]));
        let response = turn(&h, "busco un ventilador industrial").await;

        assert_eq!(response.search_state, SearchState::Completed);
        let episode = response.episode.unwrap();
        assert_eq!(episode.attempts.len(), 3);
        let mut queries = episode.attempted_queries();
        queries.dedup();
        assert_eq!(queries.len(), 3);
        assert_eq!(episode.attempts[0].result_count, 0);
        assert_eq!(episode.attempts[1].result_count, 0);
        assert!(episode.attempts[2].accepted);
        assert_eq!(h.search.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_gracefully() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(Vec::new())));
        let response = turn(&h, "busco un ventilador industrial").await;

        assert_eq!(response.search_state, SearchState::Failed);
        assert!(response.text.contains("no he encontrado"));
        assert!(response.escalation.is_none());
        let episode = response.episode.unwrap();
        assert_eq!(episode.attempts.len(), 3);
        let calls = h.search.calls();
        let unique: std::collections::HashSet<&String> = calls.iter().collect();
        assert_eq!(unique.len(), calls.len());

        let state = stored(&h).await;
        assert!(state.search_context.is_none());
        assert!(state.check_invariants(3).is_ok());
    }

    #[tokio::test]
    async fn test_human_request_escalates_before_pipeline() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(breakers())));
        let response = turn(&h, "quiero hablar con una persona").await;

        assert_eq!(response.escalation, Some(EscalationReason::HumanRequest));
        assert_eq!(response.intent, None);
        assert_eq!(response.search_state, SearchState::Initial);
        assert!(h.search.calls().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = h.sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "s1");
        assert_eq!(events[0].1, EscalationReason::HumanRequest);

        let state = stored(&h).await;
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_escalation_keeps_pending_clarification() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(breakers())));
        turn(&h, "necesito un automático").await;
        let response = turn(&h, "esto es urgente").await;

        assert_eq!(response.escalation, Some(EscalationReason::Urgency));
        assert_eq!(response.search_state, SearchState::NeedsInfo);
        let state = stored(&h).await;
        assert_eq!(state.search_state, SearchState::NeedsInfo);
        assert_eq!(state.search_context.unwrap().clarification_count, 1);
    }

    #[tokio::test]
    async fn test_new_category_replaces_pending_clarification() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(rcds())));
        turn(&h, "necesito un automático").await;
        let response = turn(&h, "mejor busco un diferencial 2P 40A 30mA").await;

        assert_eq!(response.search_state, SearchState::Completed);
        let episode = response.episode.unwrap();
        assert_eq!(episode.original_query, "mejor busco un diferencial 2P 40A 30mA");
        assert_eq!(episode.product_type.as_deref(), Some("diferencial"));
        assert!(!episode.has_clarified);
        assert_eq!(episode.clarification_count, 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_escalate() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(Vec::new())));
        let first = turn(&h, "busco un ventilador industrial").await;
        assert!(first.escalation.is_none());

        let second = turn(&h, "busco un proyector led exterior").await;
        assert_eq!(second.search_state, SearchState::Failed);
        assert_eq!(second.escalation, Some(EscalationReason::RepeatedFailure));
        assert!(second.text.contains(EscalationReason::RepeatedFailure.handoff_text()));
    }

    #[tokio::test]
    async fn test_unreachable_search_escalates_upstream_error() {
        let h = harness(ScriptedSearch::new(|_, _| Err(anyhow::anyhow!("connection refused"))));
        let response = turn(&h, "busco diferencial 2P 40A 30mA").await;

        assert_eq!(response.search_state, SearchState::Failed);
        assert_eq!(response.escalation, Some(EscalationReason::UpstreamError));
        assert_eq!(response.text, EscalationReason::UpstreamError.handoff_text());
    }

    #[tokio::test]
    async fn test_too_general_asks_then_presents_best_effort() {
        let flat: Vec<RankedItem> = (0..25)
            .map(|i| RankedItem::new(format!("E{i}"), format!("Enchufe schuko blanco modelo {i}"), 0.5))
            .collect();
        let h = harness(ScriptedSearch::new(move |_, _| Ok(flat.clone())));

        let first = turn(&h, "busco un enchufe").await;
        assert_eq!(first.search_state, SearchState::NeedsInfo);
        assert_eq!(first.episode.as_ref().unwrap().clarification_count, 1);

        let second = turn(&h, "para la cocina").await;
        assert_eq!(second.search_state, SearchState::Completed);
        assert_eq!(second.episode.unwrap().clarification_count, 1);
        assert_eq!(second.results.len(), 6);
    }

    #[tokio::test]
    async fn test_whatsapp_display_cap() {
        let many: Vec<RankedItem> = (0..8)
            .map(|i| RankedItem::new(format!("D{i}"), "Diferencial 2P 40A 30mA", 0.9 - i as f32 * 0.05))
            .collect();
        let h = harness(ScriptedSearch::new(move |_, _| Ok(many.clone())));
        let response = h
            .orchestrator
            .handle_turn("wa", "u1", Channel::WhatsApp, "busco diferencial 2P 40A 30mA")
            .await
            .unwrap();
        assert_eq!(response.search_state, SearchState::Completed);
        assert_eq!(response.results.len(), 3);
    }

    #[tokio::test]
    async fn test_greeting_and_order_flows() {
        let catalog = StaticCatalog::new().with_order("100234", "enviado");
        let h = harness_with(
            test_config(),
            LLMManager::disabled(),
            ScriptedSearch::new(|_, _| Ok(Vec::new())),
            catalog,
        );

        let hello = turn(&h, "hola").await;
        assert_eq!(hello.intent, Some(Intent::Greeting));
        assert_eq!(hello.text, GREETING_TEXT);

        let ask = turn(&h, "quería saber cómo va mi pedido").await;
        assert_eq!(ask.intent, Some(Intent::OrderInquiry));
        assert_eq!(ask.text, ORDER_NUMBER_REQUEST);

        let found = turn(&h, "mi pedido es el 100234").await;
        assert!(found.text.starts_with("Tu pedido 100234 está: enviado."));

        let missing = turn(&h, "y el pedido 999999?").await;
        assert!(missing.text.contains("999999"));
        assert!(h.search.calls().is_empty());
    }

    #[tokio::test]
    async fn test_order_lookup_failure_is_graceful() {
        let h = harness_with(
            test_config(),
            LLMManager::disabled(),
            ScriptedSearch::new(|_, _| Ok(Vec::new())),
            StaticCatalog::failing(),
        );
        let response = turn(&h, "¿dónde está mi pedido 100234?").await;
        assert_eq!(response.text, ORDER_LOOKUP_FAILED);
    }

    #[tokio::test]
    async fn test_technical_followup_uses_catalog_and_model() {
        let provider = Arc::new(
            ScriptedProvider::new().on("### task: technical_answer", "Sí, tiene curva C y poder de corte de 6kA."),
        );
        let catalog = StaticCatalog::new().with_item("A1", "Automático Hager 1P+N 16A curva C");
        let h = harness_with(
            test_config(),
            LLMManager::with_provider(LLMConfig::default(), provider.clone() as Arc<dyn LLMProvider>),
            ScriptedSearch::new(|_, _| Ok(breakers())),
            catalog,
        );

        let listed = turn(&h, "busco automático 16A curva C").await;
        assert_eq!(listed.search_state, SearchState::Completed);

        let answer = turn(&h, "¿el primero tiene poder de corte de 6kA?").await;
        assert_eq!(answer.intent, Some(Intent::TechnicalInfo));
        assert_eq!(answer.text, "Sí, tiene curva C y poder de corte de 6kA.");
        assert!(provider
            .prompts()
            .iter()
            .any(|p| p.contains("### task: technical_answer") && p.contains("Ficha de Automático Hager")));
    }

    #[tokio::test]
    async fn test_technical_followup_falls_back_to_spec_sheet() {
        let catalog = StaticCatalog::new().with_item("A2", "Automático Schneider 2P 16A curva C");
        let h = harness_with(
            test_config(),
            LLMManager::disabled(),
            ScriptedSearch::new(|_, _| Ok(breakers())),
            catalog,
        );
        turn(&h, "busco automático 16A curva C").await;

        let answer = turn(&h, "¿qué características tiene el 2?").await;
        assert_eq!(answer.intent, Some(Intent::TechnicalInfo));
        assert!(answer.text.starts_with("Ficha de Automático Schneider 2P 16A curva C"));

        // not in the catalog: summary from the result list
        let summary = turn(&h, "¿y las características del tercero?").await;
        assert!(summary.text.contains("Automático ABB"));
    }

    #[tokio::test]
    async fn test_every_intent_survives_failing_model() {
        let catalog = StaticCatalog::new()
            .with_item("A1", "Automático Hager 1P+N 16A curva C")
            .with_order("100234", "en preparación");
        let h = harness_with(
            test_config(),
            LLMManager::with_provider(LLMConfig::default(), Arc::new(FailingProvider)),
            ScriptedSearch::new(|_, _| Ok(breakers())),
            catalog,
        );

        for message in [
            "hola",
            "necesito un automático de 16A curva C",
            "¿el primero es compatible con mi cuadro?",
            "¿dónde está mi pedido 100234?",
            "¿qué horario tenéis los sábados?",
            "necesito un automático",
        ] {
            let response = tokio::time::timeout(Duration::from_secs(10), turn(&h, message))
                .await
                .expect("turn finished in time");
            assert!(!response.text.trim().is_empty(), "empty reply for {message}");
        }
        let state = stored(&h).await;
        assert_eq!(state.turn_count, 6);
        assert!(state.check_invariants(3).is_ok());
    }

    #[tokio::test]
    async fn test_turns_of_one_session_are_serialized() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(rcds())));
        let a = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .handle_turn("s1", "u1", Channel::Web, "busco diferencial 2P 40A 30mA")
                    .await
            })
        };
        let b = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.handle_turn("s1", "u1", Channel::Web, "hola").await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
        assert_eq!(h.orchestrator.active_sessions(), 0);

        let state = stored(&h).await;
        assert_eq!(state.turn_count, 2);
        let roles: Vec<Role> = state.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
    }

    #[tokio::test]
    async fn test_cancelled_turn_commits_nothing() {
        let search = ScriptedSearch::new(|_, _| Ok(rcds())).with_delay(Duration::from_secs(5));
        let h = harness(search);
        turn(&h, "hola").await;
        let before = stored(&h).await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            h.orchestrator
                .handle_turn("s1", "u1", Channel::Web, "busco diferencial 2P 40A 30mA"),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(h.search.calls().len(), 1);

        let after = stored(&h).await;
        assert_eq!(after.turn_count, before.turn_count);
        assert_eq!(after.messages.len(), before.messages.len());
        assert_eq!(after.search_state, SearchState::Initial);
        assert!(after.search_context.is_none());
        assert_eq!(h.orchestrator.active_sessions(), 0);

        // The session is not left locked.
        let next = tokio::time::timeout(Duration::from_secs(1), turn(&h, "hola")).await;
        assert!(next.is_ok());
        assert_eq!(stored(&h).await.turn_count, before.turn_count + 1);
    }

    #[tokio::test]
    async fn test_finished_sessions_release_their_lock() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(rcds())));
        for i in 0..50 {
            h.orchestrator
                .handle_turn(&format!("s{i}"), "u1", Channel::Web, "hola")
                .await
                .unwrap();
        }
        assert_eq!(h.orchestrator.active_sessions(), 0);
        assert_eq!(h.store.len(), 50);
    }

    #[tokio::test]
    async fn test_broken_session_is_rejected_without_commit() {
        let h = harness(ScriptedSearch::new(|_, _| Ok(rcds())));
        let mut broken = ConversationState::new("s1", "u1", Channel::Web);
        broken.search_state = SearchState::Searching;
        h.store.save(broken).await.unwrap();

        let err = h
            .orchestrator
            .handle_turn("s1", "u1", Channel::Web, "hola")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidSessionState { .. }));
        assert!(stored(&h).await.messages.is_empty());
    }
}
