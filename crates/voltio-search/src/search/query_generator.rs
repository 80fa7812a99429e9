//! Search query generation.
//!
//! Turns a customer request into one primary catalog query plus alternates:
//! filler words stripped, obvious typos corrected against the trade
//! vocabulary, then synonym rewrites. Nothing the customer did not say is
//! ever added.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::llm::LLMManager;
use crate::search::analyzer::{category_vocabulary, KNOWN_BRANDS};
use crate::search::refiner::{RefinementPlan, RefinementStrategy};
use crate::synonyms::SynonymIndex;
use crate::text::{compact, extract_keywords, has_digit, normalize, query_key, tokenize};

const MAX_ALTERNATIVES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    Keywords,
    SpellingCorrected,
    Broaden,
    Narrow,
    Resynonymize,
}

impl From<RefinementStrategy> for QueryStrategy {
    fn from(strategy: RefinementStrategy) -> Self {
        match strategy {
            RefinementStrategy::Broaden => Self::Broaden,
            RefinementStrategy::Narrow => Self::Narrow,
            RefinementStrategy::Resynonymize => Self::Resynonymize,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySet {
    pub primary: String,
    pub alternatives: Vec<String>,
    pub strategy: QueryStrategy,
}

/// True when `candidate` carries a number or brand absent from `query`.
pub fn introduces_unstated_specs(candidate: &str, query: &str) -> bool {
    let query_compact = compact(query);
    let query_norm = normalize(query);
    let candidate_norm = normalize(candidate);

    let new_value = tokenize(&candidate_norm)
        .iter()
        .filter(|t| has_digit(t))
        .any(|t| !query_compact.contains(t.as_str()));
    let new_brand = KNOWN_BRANDS
        .iter()
        .any(|b| candidate_norm.contains(b) && !query_norm.contains(b));
    new_value || new_brand
}

const ALTERNATES_PROMPT: &str = r#"### task: generate_queries
Write alternative catalog search queries for an electrical supplies store.
Use trade synonyms and alternative product names. Keep every value the
customer gave (amperage, sizes, brand) and never add new ones. Short keyword
queries only, no sentences."#;

const ALTERNATES_SCHEMA: &str = r#"{"queries":["..."]}"#;

#[derive(Debug, Deserialize)]
struct AlternatesReply {
    #[serde(default)]
    queries: Vec<String>,
}

pub struct QueryGenerator {
    llm: Arc<LLMManager>,
    synonyms: Arc<SynonymIndex>,
    /// Normalized single words the spelling corrector may snap to.
    vocabulary: BTreeSet<String>,
}

impl QueryGenerator {
    pub fn new(llm: Arc<LLMManager>, synonyms: Arc<SynonymIndex>) -> Self {
        let mut vocabulary = synonyms.vocabulary();
        vocabulary.extend(category_vocabulary().map(str::to_string));
        vocabulary.extend(
            KNOWN_BRANDS
                .iter()
                .filter(|b| !b.contains(' '))
                .map(|b| b.to_string()),
        );
        Self {
            llm,
            synonyms,
            vocabulary,
        }
    }

    /// `Generate(query, specs, productType)`.
    pub async fn generate(
        &self,
        query: &str,
        specs: &BTreeMap<String, String>,
        product_type: Option<&str>,
    ) -> QuerySet {
        let keywords = match extract_keywords(query) {
            k if k.is_empty() => query.trim().to_string(),
            k => k,
        };

        let corrected = self.correct_spelling(&keywords);
        let (primary, strategy, mut candidates) = if query_key(&corrected) != query_key(&keywords) {
            tracing::debug!(from = %keywords, to = %corrected, "Spelling corrected");
            (corrected, QueryStrategy::SpellingCorrected, vec![keywords])
        } else {
            (keywords, QueryStrategy::Keywords, Vec::new())
        };

        candidates.extend(self.synonyms.expand(&primary, MAX_ALTERNATIVES));

        if self.llm.is_enabled() {
            match self.llm_alternates(query, &primary, specs, product_type).await {
                Ok(extra) => candidates.extend(
                    extra
                        .into_iter()
                        .filter(|q| !introduces_unstated_specs(q, query)),
                ),
                Err(e) => tracing::warn!(error = %e, "LLM query alternates failed, using synonyms only"),
            }
        }

        let alternatives = dedup_excluding(&primary, candidates, &HashSet::new());
        let set = QuerySet {
            primary,
            alternatives,
            strategy,
        };
        tracing::debug!(primary = %set.primary, alternatives = ?set.alternatives, "Generated queries");
        set
    }

    /// `Refine(previousQueries, feedback, specs)`. `None` when every candidate
    /// of the plan was already tried.
    pub fn refine(
        &self,
        previous_queries: &[String],
        plan: &RefinementPlan,
        specs: &BTreeMap<String, String>,
    ) -> Option<QuerySet> {
        let avoid: HashSet<String> = plan.avoid_terms.iter().map(|t| normalize(t)).collect();
        let tried: HashSet<String> = previous_queries.iter().map(|q| query_key(q)).collect();

        let candidates: Vec<String> = plan
            .new_queries
            .iter()
            .map(|q| match plan.strategy {
                RefinementStrategy::Narrow => with_specs(q, specs),
                _ => q.clone(),
            })
            .filter(|q| !tokenize(&normalize(q)).iter().any(|t| avoid.contains(t)))
            .filter(|q| !tried.contains(&query_key(q)))
            .collect();

        let mut iter = candidates.into_iter();
        let primary = iter.next()?;
        let alternatives = dedup_excluding(&primary, iter.collect(), &tried);
        Some(QuerySet {
            primary,
            alternatives,
            strategy: plan.strategy.into(),
        })
    }

    /// Snap misspelled words onto the trade vocabulary. Short words, values
    /// and words already known are left alone.
    pub fn correct_spelling(&self, keywords: &str) -> String {
        tokenize(keywords)
            .into_iter()
            .map(|word| self.correct_word(&word).unwrap_or(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn correct_word(&self, word: &str) -> Option<String> {
        let key = normalize(word);
        let len = key.chars().count();
        if len < 5 || has_digit(&key) || self.vocabulary.contains(&key) {
            return None;
        }
        let max_distance = if len <= 6 { 1 } else { 2 };
        let first = key.chars().next()?;

        let (best, distance) = self
            .vocabulary
            .iter()
            .filter(|v| v.starts_with(first))
            .map(|v| (v, strsim::levenshtein(&key, v)))
            .min_by_key(|(_, d)| *d)?;
        if distance == 0 || distance > max_distance {
            return None;
        }
        Some(self.synonyms.surface_form(best).unwrap_or_else(|| best.clone()))
    }

    async fn llm_alternates(
        &self,
        query: &str,
        primary: &str,
        specs: &BTreeMap<String, String>,
        product_type: Option<&str>,
    ) -> Result<Vec<String>> {
        let specs_line = specs
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "{}\n\nCustomer request: \"{}\"\nMain query: \"{}\"\nProduct type: {}\nStated specs: {}",
            ALTERNATES_PROMPT,
            query,
            primary,
            product_type.unwrap_or("unknown"),
            if specs_line.is_empty() { "none" } else { specs_line.as_str() }
        );
        let reply: AlternatesReply = self
            .llm
            .complete_structured(&prompt, ALTERNATES_SCHEMA, 150)
            .await
            .context("query alternates call failed")?;
        Ok(reply.queries)
    }
}

/// `query` with every stated spec value appended unless already present.
fn with_specs(query: &str, specs: &BTreeMap<String, String>) -> String {
    let present = compact(query);
    let mut out = query.to_string();
    for value in specs.values() {
        if !present.contains(&compact(value)) {
            out.push(' ');
            out.push_str(value);
        }
    }
    out
}

fn dedup_excluding(primary: &str, candidates: Vec<String>, excluded: &HashSet<String>) -> Vec<String> {
    let mut seen: HashSet<String> = excluded.clone();
    seen.insert(query_key(primary));
    candidates
        .into_iter()
        .map(|c| c.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|c| !c.is_empty() && seen.insert(query_key(c)))
        .take(MAX_ALTERNATIVES)
        .collect()
}
