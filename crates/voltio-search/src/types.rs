use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Messaging surface a session arrived on. Only used to pick how many
/// results fit in one reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    #[default]
    Web,
    WhatsApp,
    Telegram,
}

impl Channel {
    /// Lenient parse for transport payloads; unknown names map to `Web`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "whatsapp" | "wa" => Self::WhatsApp,
            "telegram" | "tg" => Self::Telegram,
            _ => Self::Web,
        }
    }
}

/// Closed set of things a customer message can be asking for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    ProductSearch,
    TechnicalInfo,
    OrderInquiry,
    Greeting,
    GeneralQuestion,
}

impl Intent {
    /// Accepts the spellings completion models tend to produce:
    /// `product_search`, `PRODUCT_SEARCH`, `product-search`, `ProductSearch`.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        match key.as_str() {
            "productsearch" | "search" | "product" => Some(Self::ProductSearch),
            "technicalinfo" | "technical" | "technicalquestion" => Some(Self::TechnicalInfo),
            "orderinquiry" | "order" | "orderstatus" => Some(Self::OrderInquiry),
            "greeting" => Some(Self::Greeting),
            "generalquestion" | "general" => Some(Self::GeneralQuestion),
            _ => None,
        }
    }
}

/// One candidate returned by the search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedItem {
    pub id: String,
    pub title: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RankedItem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            score,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Title plus metadata values, used for relevance matching.
    pub fn searchable_text(&self) -> String {
        let mut values: Vec<&String> = self.metadata.values().collect();
        values.sort();
        let mut text = self.title.clone();
        for v in values {
            text.push(' ');
            text.push_str(v);
        }
        text
    }
}

/// Filters forwarded verbatim to the search collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SearchFilters {
    pub category: Option<String>,
    pub brand: Option<String>,
    pub in_stock_only: bool,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemDetail {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub brand: Option<String>,
    pub price: Option<f64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub stock: Option<u32>,
    #[serde(default)]
    pub specs: HashMap<String, String>,
    pub url: Option<String>,
}

fn default_currency() -> String {
    "EUR".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderDetail {
    pub order_id: String,
    pub status: String,
    #[serde(default)]
    pub items: Vec<String>,
    pub estimated_delivery: Option<String>,
    pub tracking_url: Option<String>,
}
