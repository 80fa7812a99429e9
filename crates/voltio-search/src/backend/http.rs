//! HTTP adapters for the search service, the store catalog and the
//! escalation webhook.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{CatalogService, EscalationSink, SearchService};
use crate::escalation::EscalationReason;
use crate::types::{ItemDetail, OrderDetail, RankedItem, SearchFilters};

fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .build()
        .context("Failed to build HTTP client")
}

fn trim_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    filters: &'a SearchFilters,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<RankedItem>,
}

/// `POST {base}/search` with `{query, filters}` returning `{items: [...]}`.
pub struct HttpSearchService {
    client: Client,
    base_url: String,
}

impl HttpSearchService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }
}

#[async_trait]
impl SearchService for HttpSearchService {
    async fn search(&self, query: &str, filters: &SearchFilters) -> Result<Vec<RankedItem>> {
        let endpoint = format!("{}/search", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .json(&SearchRequest { query, filters })
            .send()
            .await
            .with_context(|| format!("search request to {} failed", endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("search service error ({}): {}", status, body));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .with_context(|| format!("malformed search response from {}", endpoint))?;
        tracing::debug!(query = %query, results = parsed.items.len(), "search service answered");
        Ok(parsed.items)
    }
}

/// `GET {base}/items/{id}` and `GET {base}/orders/{id}`; 404 is not-found.
pub struct HttpCatalogService {
    client: Client,
    base_url: String,
}

impl HttpCatalogService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: trim_base(base_url),
        })
    }

    async fn get_optional<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let endpoint = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&endpoint)
            .send()
            .await
            .with_context(|| format!("catalog request to {} failed", endpoint))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let value = response
                    .json::<T>()
                    .await
                    .with_context(|| format!("malformed catalog response from {}", endpoint))?;
                Ok(Some(value))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(anyhow!("catalog error ({}): {}", status, body))
            }
        }
    }
}

#[async_trait]
impl CatalogService for HttpCatalogService {
    async fn lookup_item(&self, id: &str) -> Result<Option<ItemDetail>> {
        self.get_optional(&format!("items/{}", id.trim())).await
    }

    async fn lookup_order(&self, order_id: &str) -> Result<Option<OrderDetail>> {
        self.get_optional(&format!("orders/{}", order_id.trim())).await
    }
}

#[derive(Debug, Serialize)]
struct EscalationPayload<'a> {
    session_id: &'a str,
    reason: &'a EscalationReason,
    handoff_text: &'a str,
    timestamp: String,
}

/// Posts escalations to a helpdesk webhook.
pub struct WebhookEscalationSink {
    client: Client,
    url: String,
}

impl WebhookEscalationSink {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl EscalationSink for WebhookEscalationSink {
    async fn notify(
        &self,
        session_id: &str,
        reason: &EscalationReason,
        handoff_text: &str,
    ) -> Result<()> {
        let payload = EscalationPayload {
            session_id,
            reason,
            handoff_text,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("escalation webhook unreachable")?;
        if !response.status().is_success() {
            return Err(anyhow!("escalation webhook returned {}", response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TIMEOUT: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_search_posts_query_and_filters() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .and(body_partial_json(json!({"query": "diferencial 40A"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"id": "D1", "title": "Diferencial 2P 40A 30mA", "score": 0.91},
                    {"id": "D2", "title": "Diferencial 4P 40A 300mA", "score": 0.72,
                     "metadata": {"brand": "Hager"}}
                ]
            })))
            .mount(&server)
            .await;

        let service = HttpSearchService::new(&format!("{}/", server.uri()), TIMEOUT).unwrap();
        let items = service
            .search("diferencial 40A", &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].metadata.get("brand").map(String::as_str), Some("Hager"));
    }

    #[tokio::test]
    async fn test_search_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let service = HttpSearchService::new(&server.uri(), TIMEOUT).unwrap();
        assert!(service.search("cable", &SearchFilters::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_catalog_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items/X9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/100234"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order_id": "100234",
                "status": "enviado",
                "tracking_url": "https://track.example/100234"
            })))
            .mount(&server)
            .await;

        let catalog = HttpCatalogService::new(&server.uri(), TIMEOUT).unwrap();
        assert!(catalog.lookup_item("X9").await.unwrap().is_none());
        let order = catalog.lookup_order("100234").await.unwrap().unwrap();
        assert_eq!(order.status, "enviado");
        assert!(order.items.is_empty());
    }

    #[tokio::test]
    async fn test_webhook_sink_posts_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/escalate"))
            .and(body_partial_json(json!({"session_id": "s1", "reason": "human_request"})))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sink =
            WebhookEscalationSink::new(&format!("{}/hooks/escalate", server.uri()), TIMEOUT).unwrap();
        sink.notify("s1", &EscalationReason::HumanRequest, "Te paso con un asesor")
            .await
            .unwrap();
    }
}
