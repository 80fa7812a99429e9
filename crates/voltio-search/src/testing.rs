//! Scripted collaborators for unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::{CatalogService, EscalationSink, SearchService};
use crate::escalation::EscalationReason;
use crate::llm::{GenerationConfig, LLMProvider, ProviderInfo};
use crate::types::{ItemDetail, OrderDetail, RankedItem, SearchFilters};

/// Answers prompts by the first registered marker they contain.
#[derive(Default)]
pub struct ScriptedProvider {
    rules: Vec<(String, String)>,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, marker: &str, response: &str) -> Self {
        self.rules.push((marker.to_string(), response.to_string()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn generate(&self, prompt: &str, _config: &GenerationConfig) -> Result<String> {
        self.prompts.lock().push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.rules
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, response)| response.clone())
            .ok_or_else(|| anyhow!("no scripted response for prompt"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "scripted".to_string(),
            model: "test".to_string(),
        }
    }
}

/// Every call errors, as an unreachable completion service would.
pub struct FailingProvider;

#[async_trait]
impl LLMProvider for FailingProvider {
    async fn generate(&self, _prompt: &str, _config: &GenerationConfig) -> Result<String> {
        Err(anyhow!("completion service unavailable"))
    }

    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            name: "failing".to_string(),
            model: "none".to_string(),
        }
    }
}

type SearchFn = dyn Fn(&str, &SearchFilters) -> Result<Vec<RankedItem>> + Send + Sync;

/// Search service driven by a closure; records every query it receives.
pub struct ScriptedSearch {
    respond: Box<SearchFn>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&str, &SearchFilters) -> Result<Vec<RankedItem>> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answers the n-th call (0-based) with `responses[n]`, empty afterwards.
    pub fn sequence(responses: Vec<Vec<RankedItem>>) -> Self {
        let counter = AtomicUsize::new(0);
        Self::new(move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(responses.get(n).cloned().unwrap_or_default())
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SearchService for ScriptedSearch {
    async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<RankedItem>> {
        self.calls.lock().push(query.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.respond)(query, filters)
    }
}

/// In-memory catalog with lookup counting.
#[derive(Default)]
pub struct StaticCatalog {
    items: HashMap<String, ItemDetail>,
    orders: HashMap<String, OrderDetail>,
    item_lookups: AtomicUsize,
    fail: bool,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn with_item(mut self, id: &str, title: &str) -> Self {
        let mut specs = HashMap::new();
        specs.insert("referencia".to_string(), id.to_string());
        self.items.insert(
            id.to_string(),
            ItemDetail {
                id: id.to_string(),
                title: title.to_string(),
                description: format!("{} para cuadro eléctrico", title),
                brand: Some("Hager".to_string()),
                price: Some(12.5),
                currency: "EUR".to_string(),
                stock: Some(7),
                specs,
                url: None,
            },
        );
        self
    }

    pub fn with_order(mut self, order_id: &str, status: &str) -> Self {
        self.orders.insert(
            order_id.to_string(),
            OrderDetail {
                order_id: order_id.to_string(),
                status: status.to_string(),
                items: vec!["Diferencial 2P 40A 30mA".to_string()],
                estimated_delivery: Some("2026-10-20".to_string()),
                tracking_url: None,
            },
        );
        self
    }

    pub fn item_lookups(&self) -> usize {
        self.item_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogService for StaticCatalog {
    async fn lookup_item(&self, id: &str) -> Result<Option<ItemDetail>> {
        self.item_lookups.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("catalog unavailable"));
        }
        Ok(self.items.get(id).cloned())
    }

    async fn lookup_order(&self, order_id: &str) -> Result<Option<OrderDetail>> {
        if self.fail {
            return Err(anyhow!("catalog unavailable"));
        }
        Ok(self.orders.get(order_id).cloned())
    }
}

/// Escalation sink that remembers what it was sent.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, EscalationReason, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, EscalationReason, String)> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EscalationSink for RecordingSink {
    async fn notify(
        &self,
        session_id: &str,
        reason: &EscalationReason,
        handoff_text: &str,
    ) -> Result<()> {
        self.events
            .lock()
            .push((session_id.to_string(), *reason, handoff_text.to_string()));
        Ok(())
    }
}
