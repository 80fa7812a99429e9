//! Query-set execution and result merging.

use futures::future::join_all;
use std::collections::HashSet;
use std::time::Duration;

use crate::backend::SearchService;
use crate::search::query_generator::QuerySet;
use crate::types::{RankedItem, SearchFilters};

/// Outcome of running one attempt's queries.
#[derive(Debug, Clone, Default)]
pub struct SearchRun {
    /// Merged, de-duplicated items in first-seen order.
    pub items: Vec<RankedItem>,
    pub queries_run: Vec<String>,
    /// Calls that errored or timed out.
    pub failures: usize,
}

impl SearchRun {
    /// Every call of this run failed at the transport level.
    pub fn all_failed(&self) -> bool {
        !self.queries_run.is_empty() && self.failures == self.queries_run.len()
    }
}

/// Merge batches keeping the first occurrence of every id.
pub fn merge_results(batches: Vec<Vec<RankedItem>>) -> Vec<RankedItem> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for item in batches.into_iter().flatten() {
        if seen.insert(item.id.clone()) {
            merged.push(item);
        }
    }
    merged
}

async fn search_bounded(
    search: &dyn SearchService,
    query: &str,
    filters: &SearchFilters,
    timeout: Duration,
) -> Option<Vec<RankedItem>> {
    match tokio::time::timeout(timeout, search.search(query, filters)).await {
        Ok(Ok(items)) => Some(items),
        Ok(Err(e)) => {
            tracing::warn!(query = %query, error = %e, "Search call failed");
            None
        }
        Err(_) => {
            tracing::warn!(query = %query, timeout_ms = timeout.as_millis() as u64, "Search call timed out");
            None
        }
    }
}

/// Run the primary query and, when it returns fewer than `target_results`,
/// up to `max_alternates` alternates concurrently.
pub async fn execute_query_set(
    search: &dyn SearchService,
    set: &QuerySet,
    filters: &SearchFilters,
    target_results: usize,
    max_alternates: usize,
    timeout: Duration,
) -> SearchRun {
    let mut run = SearchRun::default();

    let primary = search_bounded(search, &set.primary, filters, timeout).await;
    run.queries_run.push(set.primary.clone());
    if primary.is_none() {
        run.failures += 1;
    }
    let mut batches = vec![primary.unwrap_or_default()];

    if batches[0].len() < target_results && max_alternates > 0 {
        let alternates: Vec<&String> = set.alternatives.iter().take(max_alternates).collect();
        let outcomes = join_all(
            alternates
                .iter()
                .map(|q| search_bounded(search, q.as_str(), filters, timeout)),
        )
        .await;
        for (query, outcome) in alternates.into_iter().zip(outcomes) {
            run.queries_run.push(query.clone());
            match outcome {
                Some(items) => batches.push(items),
                None => run.failures += 1,
            }
        }
    }

    run.items = merge_results(batches);
    tracing::debug!(
        primary = %set.primary,
        queries = run.queries_run.len(),
        failures = run.failures,
        results = run.items.len(),
        "Executed query set"
    );
    run
}
