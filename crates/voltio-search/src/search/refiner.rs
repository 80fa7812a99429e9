//! Refinement strategy selection after a rejected attempt.
//!
//! Looks at how the previous attempts under- or over-matched and proposes
//! new queries that have not been tried in this episode.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

use crate::conversation::{SearchAttempt, SearchContext};
use crate::llm::LLMManager;
use crate::search::analyzer::detect_product_type;
use crate::search::query_generator::introduces_unstated_specs;
use crate::search::validator::ValidationResult;
use crate::synonyms::SynonymIndex;
use crate::text::{extract_keywords, has_digit, normalize, query_key, tokenize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefinementStrategy {
    /// Fewer constraints: drop qualifiers and values.
    Broaden,
    /// More constraints: add the stated specifications and usage.
    Narrow,
    /// Same meaning, different trade vocabulary.
    Resynonymize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementPlan {
    pub strategy: RefinementStrategy,
    pub new_queries: Vec<String>,
    pub avoid_terms: Vec<String>,
    pub reasoning: String,
}

const REFINE_PROMPT: &str = r#"### task: refine_search
A product search in an electrical supplies catalog did not return good results.
Propose new catalog search queries following the given strategy:
- BROADEN: remove qualifiers so more products match.
- NARROW: add the details the customer gave so fewer, better products match.
- RESYNONYMIZE: use other trade names for the same product.
Never add values, sizes or brands the customer did not mention.
Never repeat a query that was already tried."#;

const REFINE_SCHEMA: &str = r#"{"queries":["..."],"reasoning":"one sentence"}"#;

#[derive(Debug, Deserialize)]
struct RefineReply {
    #[serde(default)]
    queries: Vec<String>,
    #[serde(default)]
    reasoning: String,
}

pub struct SearchRefiner {
    llm: Arc<LLMManager>,
    synonyms: Arc<SynonymIndex>,
}

impl SearchRefiner {
    pub fn new(llm: Arc<LLMManager>, synonyms: Arc<SynonymIndex>) -> Self {
        Self { llm, synonyms }
    }

    /// `Refine(originalQuery, context, validatorFeedback, attemptHistory)`.
    /// Returned queries never appear in `attempt_history`.
    pub async fn refine(
        &self,
        original_query: &str,
        context: &SearchContext,
        feedback: &ValidationResult,
        attempt_history: &[SearchAttempt],
    ) -> RefinementPlan {
        let keywords = extract_keywords(original_query);
        let strategy = choose_strategy(&keywords, context, feedback, attempt_history);

        let tried: HashSet<String> = attempt_history.iter().map(|a| query_key(&a.query)).collect();
        let mut seen = tried.clone();
        let mut new_queries = Vec::new();
        let mut push = |candidate: String| {
            let candidate = candidate.split_whitespace().collect::<Vec<_>>().join(" ");
            if !candidate.is_empty() && seen.insert(query_key(&candidate)) {
                new_queries.push(candidate);
            }
        };

        let mut reasoning = match strategy {
            RefinementStrategy::Broaden => "previous queries matched too little, dropping qualifiers",
            RefinementStrategy::Narrow => "previous results were too loose, adding stated details",
            RefinementStrategy::Resynonymize => "trying other trade names for the same product",
        }
        .to_string();

        if self.llm.is_enabled() {
            match self
                .refine_with_llm(original_query, strategy, attempt_history, feedback)
                .await
            {
                Ok(reply) => {
                    for q in reply.queries {
                        if !introduces_unstated_specs(&q, original_query) {
                            push(q);
                        }
                    }
                    if !reply.reasoning.trim().is_empty() {
                        reasoning = reply.reasoning;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "LLM refinement failed, using rule-based queries"),
            }
        }

        for candidate in self.rule_candidates(strategy, &keywords, context, attempt_history) {
            push(candidate);
        }
        // Vocabulary swaps as a last resort so a fresh query almost always exists.
        if strategy != RefinementStrategy::Resynonymize {
            for candidate in self.resynonymize(&keywords, attempt_history) {
                push(candidate);
            }
        }

        let avoid_terms = avoid_terms(strategy, &keywords, attempt_history);
        let plan = RefinementPlan {
            strategy,
            new_queries,
            avoid_terms,
            reasoning,
        };
        tracing::debug!(
            strategy = ?plan.strategy,
            queries = ?plan.new_queries,
            avoid = ?plan.avoid_terms,
            "Refinement plan"
        );
        plan
    }

    async fn refine_with_llm(
        &self,
        original_query: &str,
        strategy: RefinementStrategy,
        attempt_history: &[SearchAttempt],
        feedback: &ValidationResult,
    ) -> Result<RefineReply> {
        let tried = attempt_history
            .iter()
            .map(|a| format!("- \"{}\" ({} results): {}", a.query, a.result_count, a.feedback))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}\n\nCustomer request: \"{}\"\nStrategy: {:?}\nValidator feedback: {}\nAlready tried:\n{}",
            REFINE_PROMPT, original_query, strategy, feedback.reason, tried
        );
        self.llm
            .complete_structured::<RefineReply>(&prompt, REFINE_SCHEMA, 200)
            .await
            .context("refinement call failed")
    }

    fn rule_candidates(
        &self,
        strategy: RefinementStrategy,
        keywords: &str,
        context: &SearchContext,
        attempt_history: &[SearchAttempt],
    ) -> Vec<String> {
        match strategy {
            RefinementStrategy::Broaden => broaden(keywords),
            RefinementStrategy::Narrow => narrow(keywords, context),
            RefinementStrategy::Resynonymize => self.resynonymize(keywords, attempt_history),
        }
    }

    /// Synonym rewrites of the request, then of the product word alone.
    fn resynonymize(&self, keywords: &str, attempt_history: &[SearchAttempt]) -> Vec<String> {
        let mut candidates = self.synonyms.expand(keywords, 8);
        if let Some(product_word) = product_word(keywords) {
            candidates.extend(self.synonyms.synonyms(&product_word));
        }
        // Rewrites of the last tried query reach combinations the original cannot.
        if let Some(last) = attempt_history.last() {
            candidates.extend(self.synonyms.expand(&last.query, 4));
        }
        candidates
    }
}

fn choose_strategy(
    keywords: &str,
    context: &SearchContext,
    feedback: &ValidationResult,
    attempt_history: &[SearchAttempt],
) -> RefinementStrategy {
    let zero_streak = attempt_history
        .iter()
        .rev()
        .take_while(|a| a.result_count == 0)
        .count();
    let base = feedback.hint.unwrap_or(RefinementStrategy::Resynonymize);
    match base {
        // Broadening twice in a row with nothing to show means the vocabulary is off.
        RefinementStrategy::Broaden if zero_streak >= 2 => RefinementStrategy::Resynonymize,
        RefinementStrategy::Broaden if tokenize(keywords).len() <= 1 => {
            RefinementStrategy::Resynonymize
        }
        RefinementStrategy::Narrow if narrowing_terms(keywords, context).is_empty() => {
            RefinementStrategy::Resynonymize
        }
        other => other,
    }
}

/// Drop value tokens first, then trailing qualifiers, keeping the product word.
fn broaden(keywords: &str) -> Vec<String> {
    let tokens = tokenize(keywords);
    let mut candidates = Vec::new();

    let without_values: Vec<String> = tokens.iter().filter(|t| !has_digit(t)).cloned().collect();
    if !without_values.is_empty() && without_values.len() < tokens.len() {
        candidates.push(without_values.join(" "));
    }
    if let Some(word) = product_word(keywords) {
        candidates.push(word);
    }
    for end in (1..without_values.len()).rev() {
        candidates.push(without_values[..end].join(" "));
    }
    candidates
}

/// Stated specs and usage qualifiers not already in the keywords.
fn narrowing_terms(keywords: &str, context: &SearchContext) -> Vec<String> {
    let present: HashSet<String> = tokenize(&normalize(keywords)).into_iter().collect();
    context
        .extracted_info
        .values()
        .filter(|v| !present.contains(&normalize(v)))
        .cloned()
        .collect()
}

fn narrow(keywords: &str, context: &SearchContext) -> Vec<String> {
    let extra = narrowing_terms(keywords, context);
    let mut candidates = Vec::new();
    if !extra.is_empty() {
        candidates.push(format!("{} {}", keywords, extra.join(" ")));
        if let Some(word) = product_word(keywords) {
            candidates.push(format!("{} {}", word, extra.join(" ")));
        }
    }
    candidates
}

/// Terms that previous failed attempts introduced and that should not come back.
fn avoid_terms(
    strategy: RefinementStrategy,
    keywords: &str,
    attempt_history: &[SearchAttempt],
) -> Vec<String> {
    let original: HashSet<String> = tokenize(&normalize(keywords)).into_iter().collect();
    match strategy {
        RefinementStrategy::Narrow => Vec::new(),
        RefinementStrategy::Broaden | RefinementStrategy::Resynonymize => {
            let mut out = Vec::new();
            let mut seen = HashSet::new();
            for attempt in attempt_history.iter().filter(|a| a.result_count == 0) {
                for token in tokenize(&normalize(&attempt.query)) {
                    if !original.contains(&token) && seen.insert(token.clone()) {
                        out.push(token);
                    }
                }
            }
            out
        }
    }
}

/// The word of `keywords` that names the product category, in its surface form.
fn product_word(keywords: &str) -> Option<String> {
    let category = detect_product_type(keywords)?;
    tokenize(keywords)
        .into_iter()
        .find(|t| detect_product_type(t) == Some(category))
}
