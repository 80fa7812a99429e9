//! Relevance validation of a candidate result set.
//!
//! Rule-based scoring checks how much of the request (key terms, with
//! synonyms, and stated spec values) each item covers. Spec values are read
//! from the item text with the same extractor used on requests, so "bipolar"
//! in a title satisfies a stated "2P". A completion call may grade the set
//! instead; a model grade above poor is demoted when no item is even related
//! to the request.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::config::ValidationSettings;
use crate::llm::LLMManager;
use crate::search::analyzer::extract_specs;
use crate::search::refiner::RefinementStrategy;
use crate::synonyms::SynonymIndex;
use crate::text::{compact, extract_keywords, has_digit, normalize, tokenize};
use crate::types::RankedItem;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    Poor,
    Acceptable,
    Good,
    Excellent,
}

impl QualityClass {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "excellent" => Some(Self::Excellent),
            "good" => Some(Self::Good),
            "acceptable" => Some(Self::Acceptable),
            "poor" => Some(Self::Poor),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub accepted: bool,
    pub quality: QualityClass,
    /// Indices into the validated result list, best first.
    pub best_indices: Vec<usize>,
    pub needs_refinement: bool,
    pub too_general: bool,
    pub reason: String,
    /// Suggested refinement direction when the set is rejected.
    pub hint: Option<RefinementStrategy>,
}

// Usage and purchase length describe the buyer, not catalog titles.
const UNMATCHED_SPECS: &[&str] = &["uso", "longitud"];

/// Per-item match against the request.
#[derive(Debug, Clone, Copy)]
struct ItemMatch {
    coverage: f32,
    all_specs: bool,
}

const VALIDATE_PROMPT: &str = r#"### task: validate_results
Grade how well these catalog results answer the customer's request.
- "excellent": several results are exactly what was asked for.
- "good": at least one result is exactly what was asked for.
- "acceptable": results are related and at least one is a reasonable option.
- "poor": results do not match the request.
List the indices of the best results, best first."#;

const VALIDATE_SCHEMA: &str =
    r#"{"quality":"excellent|good|acceptable|poor","best_indices":[0],"reason":"one sentence"}"#;

#[derive(Debug, Deserialize)]
struct ValidationReply {
    quality: String,
    #[serde(default)]
    best_indices: Vec<usize>,
    #[serde(default)]
    reason: String,
}

pub struct ResultValidator {
    llm: Arc<LLMManager>,
    synonyms: Arc<SynonymIndex>,
    settings: ValidationSettings,
}

impl ResultValidator {
    pub fn new(llm: Arc<LLMManager>, synonyms: Arc<SynonymIndex>, settings: ValidationSettings) -> Self {
        Self {
            llm,
            synonyms,
            settings,
        }
    }

    /// `Validate(originalQuery, results, specs)`. Never fails.
    pub async fn validate(
        &self,
        original_query: &str,
        results: &[RankedItem],
        specs: &BTreeMap<String, String>,
    ) -> ValidationResult {
        if results.is_empty() {
            return ValidationResult {
                accepted: false,
                quality: QualityClass::Poor,
                best_indices: Vec::new(),
                needs_refinement: true,
                too_general: false,
                reason: "la búsqueda no devolvió resultados".to_string(),
                hint: Some(RefinementStrategy::Broaden),
            };
        }

        let specs: BTreeMap<String, String> = specs
            .iter()
            .filter(|(k, _)| !UNMATCHED_SPECS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let specs = &specs;
        let terms = key_terms(original_query);
        let matches: Vec<ItemMatch> = results
            .iter()
            .map(|item| self.match_item(item, &terms, specs))
            .collect();
        let too_general = self.is_too_general(results, &terms, specs);

        let rule_quality = classify(&matches);
        let related = matches.iter().any(|m| m.coverage >= 0.5);
        let (quality, llm_best, llm_reason) = if self.llm.is_enabled() {
            match self.validate_with_llm(original_query, results).await {
                Ok(reply) => match QualityClass::parse(&reply.quality) {
                    Some(q) if q > QualityClass::Poor && !related => {
                        tracing::warn!(quality = ?q, "LLM grade contradicts item matching, treating set as poor");
                        (QualityClass::Poor, Vec::new(), None)
                    }
                    Some(q) => (q, reply.best_indices, Some(reply.reason)),
                    None => {
                        tracing::warn!(quality = %reply.quality, "Unknown quality class from LLM, using rules");
                        (rule_quality, Vec::new(), None)
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "LLM validation failed, using rule-based scoring");
                    (rule_quality, Vec::new(), None)
                }
            }
        } else {
            (rule_quality, Vec::new(), None)
        };

        let accepted = match quality {
            QualityClass::Excellent | QualityClass::Good => true,
            QualityClass::Acceptable => matches.iter().any(|m| m.all_specs && m.coverage >= 0.5),
            QualityClass::Poor => false,
        };

        let mut best_indices = unique_in_order(llm_best.into_iter().filter(|&i| i < results.len()));
        if best_indices.is_empty() {
            best_indices = rank_indices(results, &matches);
        }
        best_indices.truncate(self.settings.max_best_results);

        let needs_refinement = !accepted && !too_general;
        let hint = if accepted {
            None
        } else if results.len() >= self.settings.too_general_min_results && quality == QualityClass::Poor {
            Some(RefinementStrategy::Narrow)
        } else {
            Some(RefinementStrategy::Resynonymize)
        };

        let reason = llm_reason.filter(|r| !r.trim().is_empty()).unwrap_or_else(|| {
            let full = matches.iter().filter(|m| m.coverage >= 1.0).count();
            format!(
                "{} de {} resultados coinciden por completo (calidad {:?})",
                full,
                results.len(),
                quality
            )
        });

        let result = ValidationResult {
            accepted,
            quality,
            best_indices,
            needs_refinement,
            too_general,
            reason,
            hint,
        };
        tracing::debug!(
            accepted = result.accepted,
            quality = ?result.quality,
            too_general = result.too_general,
            results = results.len(),
            "Validated result set"
        );
        result
    }

    fn match_item(&self, item: &RankedItem, terms: &[String], specs: &BTreeMap<String, String>) -> ItemMatch {
        let searchable = item.searchable_text();
        let text = compact(&searchable);
        let item_specs = extract_specs(&searchable);
        let term_hits = terms.iter().filter(|t| self.term_matches(&text, t)).count();
        let spec_hits = specs
            .iter()
            .filter(|(key, value)| match item_specs.get(key.as_str()) {
                Some(found) => compact(found) == compact(value),
                None => text.contains(&compact(value)),
            })
            .count();
        let total = terms.len() + specs.len();
        let coverage = if total == 0 {
            1.0
        } else {
            (term_hits + spec_hits) as f32 / total as f32
        };
        ItemMatch {
            coverage,
            all_specs: spec_hits == specs.len(),
        }
    }

    fn term_matches(&self, text: &str, term: &str) -> bool {
        if text.contains(term) {
            return true;
        }
        self.synonyms
            .synonyms(term)
            .iter()
            .any(|s| text.contains(&compact(s)))
    }

    /// Large, flat-scored set for a request with nothing to tell items apart.
    fn is_too_general(&self, results: &[RankedItem], terms: &[String], specs: &BTreeMap<String, String>) -> bool {
        if results.len() < self.settings.too_general_min_results || !specs.is_empty() || terms.len() > 2 {
            return false;
        }
        let top = &results[..results.len().min(10)];
        let (min, max) = top.iter().fold((f32::MAX, f32::MIN), |(lo, hi), r| {
            (lo.min(r.score), hi.max(r.score))
        });
        max - min <= self.settings.uniform_score_spread
    }

    async fn validate_with_llm(&self, original_query: &str, results: &[RankedItem]) -> Result<ValidationReply> {
        let listing = results
            .iter()
            .take(self.settings.max_best_results.max(5))
            .enumerate()
            .map(|(i, r)| format!("[{}] {} (score {:.2})", i, r.title, r.score))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "{}\n\nCustomer request: \"{}\"\nResults:\n{}",
            VALIDATE_PROMPT, original_query, listing
        );
        self.llm
            .complete_structured::<ValidationReply>(&prompt, VALIDATE_SCHEMA, 200)
            .await
            .context("result validation call failed")
    }
}

/// Normalized request words that identify the product; values are matched as specs.
fn key_terms(query: &str) -> Vec<String> {
    unique_in_order(
        tokenize(&normalize(&extract_keywords(query)))
            .into_iter()
            .filter(|t| !has_digit(t)),
    )
}

/// Drop repeated values, keeping the first occurrence of each.
pub(crate) fn unique_in_order<T, I>(values: I) -> Vec<T>
where
    T: Clone + Eq + std::hash::Hash,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

fn classify(matches: &[ItemMatch]) -> QualityClass {
    let full = matches.iter().filter(|m| m.coverage >= 1.0).count();
    let best = matches.iter().map(|m| m.coverage).fold(0.0f32, f32::max);
    if full >= 3 {
        QualityClass::Excellent
    } else if full >= 1 {
        QualityClass::Good
    } else if best >= 0.5 {
        QualityClass::Acceptable
    } else {
        QualityClass::Poor
    }
}

/// Relevant items first by coverage, then by search score; unrelated items dropped.
fn rank_indices(results: &[RankedItem], matches: &[ItemMatch]) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..results.len())
        .filter(|&i| matches[i].coverage >= 0.5)
        .collect();
    indices.sort_by(|&a, &b| {
        matches[b]
            .coverage
            .total_cmp(&matches[a].coverage)
            .then(results[b].score.total_cmp(&results[a].score))
    });
    indices
}
