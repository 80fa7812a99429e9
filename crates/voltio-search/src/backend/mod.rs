//! Collaborator seams: search execution, catalog lookup and escalation.
//!
//! The orchestrator only sees these traits. `http` holds the production
//! adapters; tests plug in scripted fakes.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::escalation::EscalationReason;
use crate::types::{ItemDetail, OrderDetail, RankedItem, SearchFilters};

pub mod http;

pub use http::{HttpCatalogService, HttpSearchService, WebhookEscalationSink};

/// `ExecuteSearch(queryText, filters) -> []RankedItem`
#[async_trait]
pub trait SearchService: Send + Sync {
    async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<RankedItem>>;
}

/// Store backend lookups. `Ok(None)` means not found.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn lookup_item(&self, id: &str) -> Result<Option<ItemDetail>>;
    async fn lookup_order(&self, order_id: &str) -> Result<Option<OrderDetail>>;
}

/// Hand-off to the human-staffed channel. Callers never wait on the outcome.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn notify(
        &self,
        session_id: &str,
        reason: &EscalationReason,
        handoff_text: &str,
    ) -> Result<()>;
}

/// Sink used when no escalation webhook is configured.
pub struct LogEscalationSink;

#[async_trait]
impl EscalationSink for LogEscalationSink {
    async fn notify(
        &self,
        session_id: &str,
        reason: &EscalationReason,
        handoff_text: &str,
    ) -> Result<()> {
        tracing::warn!(
            session_id = %session_id,
            reason = %reason,
            handoff = %handoff_text,
            "Escalation requested (no webhook configured)"
        );
        Ok(())
    }
}

/// LRU cache of item details in front of any catalog. Orders are not cached
/// since their status changes.
pub struct CachedCatalog {
    inner: Arc<dyn CatalogService>,
    items: RwLock<lru::LruCache<String, ItemDetail>>,
}

impl CachedCatalog {
    pub fn new(inner: Arc<dyn CatalogService>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            items: RwLock::new(lru::LruCache::new(capacity)),
        }
    }

    pub fn cached_items(&self) -> usize {
        self.items.read().len()
    }
}

#[async_trait]
impl CatalogService for CachedCatalog {
    async fn lookup_item(&self, id: &str) -> Result<Option<ItemDetail>> {
        if let Some(hit) = self.items.write().get(id) {
            return Ok(Some(hit.clone()));
        }
        let detail = self.inner.lookup_item(id).await?;
        if let Some(detail) = &detail {
            self.items.write().put(id.to_string(), detail.clone());
        }
        Ok(detail)
    }

    async fn lookup_order(&self, order_id: &str) -> Result<Option<OrderDetail>> {
        self.inner.lookup_order(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticCatalog;

    #[tokio::test]
    async fn test_cached_catalog_hits_inner_once() {
        let inner = Arc::new(StaticCatalog::new().with_item("P1", "Automático 1P+N 16A curva C"));
        let cached = CachedCatalog::new(inner.clone(), 8);

        let first = cached.lookup_item("P1").await.unwrap().unwrap();
        let second = cached.lookup_item("P1").await.unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.item_lookups(), 1);
        assert_eq!(cached.cached_items(), 1);
    }

    #[tokio::test]
    async fn test_cached_catalog_does_not_cache_misses() {
        let inner = Arc::new(StaticCatalog::new());
        let cached = CachedCatalog::new(inner.clone(), 8);
        assert!(cached.lookup_item("nope").await.unwrap().is_none());
        assert!(cached.lookup_item("nope").await.unwrap().is_none());
        assert_eq!(inner.item_lookups(), 2);
    }

    #[tokio::test]
    async fn test_log_sink_never_fails() {
        let sink = LogEscalationSink;
        assert!(sink
            .notify("s1", &EscalationReason::HumanRequest, "Te paso con un asesor")
            .await
            .is_ok());
    }
}
