//! Intent classification for inbound customer messages.
//!
//! One short completion call decides the intent; when the model is disabled,
//! fails or answers nonsense, a keyword heuristic takes over. Classification
//! never fails.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use crate::conversation::{Message, Role};
use crate::llm::structured::{extract_json_number, extract_json_string, json_object_span};
use crate::llm::LLMManager;
use crate::search::analyzer::detect_product_type;
use crate::synonyms::SynonymIndex;
use crate::text::{normalize, normalized_tokens};
use crate::types::Intent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Llm,
    Heuristic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: Intent,
    pub confidence: f32,
    pub entities: HashMap<String, String>,
    pub reasoning: String,
    pub source: ClassificationSource,
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

const CLASSIFY_PROMPT: &str = r#"### task: classify_intent
You classify messages sent to the chat assistant of an electrical supplies store.
Pick exactly one intent:
- "product_search": wants to find or buy a product, or is answering a question about product details.
- "technical_info": asks about characteristics, compatibility or installation of a product, often one just shown.
- "order_inquiry": asks about an existing order, shipment, delivery or invoice.
- "greeting": greets or says goodbye without asking anything.
- "general_question": anything else (opening hours, payment methods, the store itself).
Extract entities you see (product_type, brand, order_id, reference) as strings."#;

const CLASSIFY_SCHEMA: &str = r#"{"intent":"product_search|technical_info|order_inquiry|greeting|general_question","confidence":0.0,"entities":{},"reasoning":"one sentence"}"#;

fn build_classify_prompt(message: &str, history: &[Message]) -> String {
    let mut parts = Vec::with_capacity(4);
    parts.push(CLASSIFY_PROMPT.to_string());

    if !history.is_empty() {
        let transcript = history
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "Customer",
                    Role::Assistant => "Assistant",
                };
                let text: String = m.text.chars().take(400).collect();
                format!("{}: {}", who, text)
            })
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("\nRecent conversation:\n{}", transcript));
    }

    parts.push(format!("\nCustomer message: \"{}\"", message));
    parts.push(format!(
        "\nRespond ONLY with a JSON object of this shape, nothing else:\n{}\nJSON:",
        CLASSIFY_SCHEMA
    ));
    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct IntentReply {
    intent: String,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    entities: HashMap<String, serde_json::Value>,
    #[serde(default)]
    reasoning: String,
}

fn parse_intent_reply(raw: &str) -> Result<ClassificationResult> {
    let json_str = json_object_span(raw);

    // Strict parse first
    if let Ok(reply) = serde_json::from_str::<IntentReply>(json_str) {
        let intent = Intent::parse(&reply.intent)
            .ok_or_else(|| anyhow!("unknown intent '{}'", reply.intent))?;
        let entities = reply
            .entities
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some((k, s)),
                serde_json::Value::Number(n) => Some((k, n.to_string())),
                _ => None,
            })
            .collect();
        return Ok(ClassificationResult {
            intent,
            confidence: reply.confidence.unwrap_or(0.7).clamp(0.0, 1.0),
            entities,
            reasoning: reply.reasoning,
            source: ClassificationSource::Llm,
        });
    }

    // Lenient parse: salvage the intent field from partial output
    let raw_intent =
        extract_json_string(json_str, "intent").ok_or_else(|| anyhow!("no intent in completion"))?;
    let intent =
        Intent::parse(&raw_intent).ok_or_else(|| anyhow!("unknown intent '{}'", raw_intent))?;
    Ok(ClassificationResult {
        intent,
        confidence: extract_json_number(json_str, "confidence")
            .map(|c| c as f32)
            .unwrap_or(0.6)
            .clamp(0.0, 1.0),
        entities: HashMap::new(),
        reasoning: extract_json_string(json_str, "reasoning")
            .unwrap_or_else(|| "intent classifier (partial parse)".to_string()),
        source: ClassificationSource::Llm,
    })
}

// ---------------------------------------------------------------------------
// Heuristic patterns (normalized text)
// ---------------------------------------------------------------------------

static GREETING_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^\W*(hola|buenas|buenos dias|buenas tardes|buenas noches|hey|hello|hi|saludos|que tal|adios|chao|chau|hasta luego|gracias|muchas gracias)\b",
    )
    .expect("greeting regex is valid")
});

static ORDER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(pedido|pedidos|envio|seguimiento|factura|mi compra|mi orden|numero de orden|tracking|order|entrega|repartidor|paquete)\b",
    )
    .expect("order regex is valid")
});

static ORDER_NUMBER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)(?:pedido|orden|order|factura|n[º°o]\.?|#)\s*(?:n[º°o]\.?|numero|número)?\s*#?\s*([a-z]{0,3}-?\d{4,})",
    )
    .expect("order number regex is valid")
});

static BARE_NUMBER_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b(\d{5,})\b").expect("bare number regex is valid"));

static REFERENCE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(el|la|los|las) (primero|primera|primer|segundo|segunda|tercero|tercera|tercer|cuarto|cuarta|quinto|quinta|ultimo|ultima)\b|\b(opcion|numero|producto|el|la) \d\b|\b(ese|esa|este|esta|eso|esos|esas)\b",
    )
    .expect("reference regex is valid")
});

static TECHNICAL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(ficha tecnica|caracteristicas|especificaciones|compatible|compatibilidad|sirve para|vale para|diferencia entre|como se instala|instalacion|instalar|conectar|consumo|cuanto consume|que significa|garantia|medidas|dimensiones|datasheet)\b",
    )
    .expect("technical regex is valid")
});

static SEARCH_VERB_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(busco|buscando|necesito|quiero|quisiera|tienen|tienes|venden|hay|precio|cuesta|comprar|recomienda|recomiendas|recomendar|stock|disponible)\b",
    )
    .expect("search verb regex is valid")
});

static SPEC_VALUE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b\d+(?:[.,]\d+)?\s*(a|ma|mm2|mm²|v|w|kw|kva|p|m)\b|\bcurva [bcd]\b")
        .expect("spec value regex is valid")
});

/// Order number mentioned in a message, if any ("pedido 100234", "#A-20931").
pub fn extract_order_number(message: &str) -> Option<String> {
    if let Some(caps) = ORDER_NUMBER_RE.captures(message) {
        return caps.get(1).map(|m| m.as_str().to_uppercase());
    }
    BARE_NUMBER_RE
        .captures(message)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Whether an assistant message presented a numbered result list.
pub fn shows_result_list(message: &Message) -> bool {
    message.role == Role::Assistant
        && message
            .text
            .lines()
            .any(|l| l.trim_start().starts_with("1."))
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub struct IntentClassifier {
    llm: Arc<LLMManager>,
    synonyms: Arc<SynonymIndex>,
    history_window: usize,
}

impl IntentClassifier {
    pub fn new(llm: Arc<LLMManager>, synonyms: Arc<SynonymIndex>) -> Self {
        Self {
            llm,
            synonyms,
            history_window: 3,
        }
    }

    /// `Classify(message, recentHistory)`. Only the last few history turns are used.
    pub async fn classify(&self, message: &str, recent_history: &[Message]) -> ClassificationResult {
        let start = recent_history.len().saturating_sub(self.history_window);
        let history = &recent_history[start..];

        if self.llm.is_enabled() {
            match self.classify_with_llm(message, history).await {
                Ok(result) => {
                    tracing::info!(
                        intent = ?result.intent,
                        confidence = result.confidence,
                        reasoning = %result.reasoning,
                        "LLM intent decision"
                    );
                    return result;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Intent classification failed, using keyword heuristic");
                }
            }
        }

        let result = self.classify_heuristic(message, history);
        tracing::info!(intent = ?result.intent, confidence = result.confidence, "Heuristic intent decision");
        result
    }

    async fn classify_with_llm(
        &self,
        message: &str,
        history: &[Message],
    ) -> Result<ClassificationResult> {
        let prompt = build_classify_prompt(message, history);
        let raw = self
            .llm
            .generate_custom(&prompt, 200)
            .await
            .context("intent classifier call failed")?;
        let mut result = parse_intent_reply(&raw)?;
        if result.intent == Intent::OrderInquiry && !result.entities.contains_key("order_id") {
            if let Some(order_id) = extract_order_number(message) {
                result.entities.insert("order_id".to_string(), order_id);
            }
        }
        Ok(result)
    }

    /// Deterministic keyword fallback.
    pub fn classify_heuristic(&self, message: &str, history: &[Message]) -> ClassificationResult {
        let text = normalize(message);
        let mut entities = HashMap::new();

        let heuristic = |intent, confidence: f32, reasoning: &str, entities| ClassificationResult {
            intent,
            confidence,
            entities,
            reasoning: reasoning.to_string(),
            source: ClassificationSource::Heuristic,
        };

        if ORDER_RE.is_match(&text) {
            if let Some(order_id) = extract_order_number(message) {
                entities.insert("order_id".to_string(), order_id);
            }
            return heuristic(Intent::OrderInquiry, 0.8, "order keyword", entities);
        }

        let follows_results = history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(shows_result_list)
            .unwrap_or(false);
        if follows_results && (REFERENCE_RE.is_match(&text) || TECHNICAL_RE.is_match(&text)) {
            return heuristic(
                Intent::TechnicalInfo,
                0.7,
                "follow-up about shown results",
                entities,
            );
        }

        if TECHNICAL_RE.is_match(&text) && !SEARCH_VERB_RE.is_match(&text) {
            return heuristic(Intent::TechnicalInfo, 0.6, "technical question", entities);
        }

        let product_type = detect_product_type(&text);
        let known_term = normalized_tokens(&text)
            .iter()
            .any(|t| !self.synonyms.synonyms(t).is_empty());
        if let Some(product_type) = product_type {
            entities.insert("product_type".to_string(), product_type.to_string());
        }
        let product_signal = !entities.is_empty()
            || known_term
            || SEARCH_VERB_RE.is_match(&text)
            || SPEC_VALUE_RE.is_match(&text);
        if product_signal {
            return heuristic(Intent::ProductSearch, 0.75, "product keyword", entities);
        }

        if GREETING_RE.is_match(&text) && text.split_whitespace().count() <= 4 {
            return heuristic(Intent::Greeting, 0.9, "greeting", entities);
        }

        heuristic(Intent::GeneralQuestion, 0.5, "no specific signal", entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LLMConfig;
    use crate::testing::{FailingProvider, ScriptedProvider};
    use chrono::Utc;

    fn heuristic_classifier() -> IntentClassifier {
        IntentClassifier::new(Arc::new(LLMManager::disabled()), Arc::new(SynonymIndex::builtin()))
    }

    fn msg(role: Role, text: &str) -> Message {
        Message {
            role,
            text: text.to_string(),
            timestamp: Utc::now(),
            turn_index: 1,
        }
    }

    #[tokio::test]
    async fn test_heuristic_intents() {
        let c = heuristic_classifier();
        let cases = [
            ("hola", Intent::Greeting),
            ("necesito un automático", Intent::ProductSearch),
            ("busco diferencial 2P 40A 30mA", Intent::ProductSearch),
            ("de 16A", Intent::ProductSearch),
            ("¿dónde está mi pedido 100234?", Intent::OrderInquiry),
            ("¿a qué hora abren el sábado?", Intent::GeneralQuestion),
            ("¿qué diferencia entre curva B y C?", Intent::TechnicalInfo),
        ];
        for (text, expected) in cases {
            let result = c.classify(text, &[]).await;
            assert_eq!(result.intent, expected, "{text}");
            assert_eq!(result.source, ClassificationSource::Heuristic);
        }
    }

    #[tokio::test]
    async fn test_greeting_with_request_is_search() {
        let c = heuristic_classifier();
        let result = c.classify("hola, busco un ventilador", &[]).await;
        assert_eq!(result.intent, Intent::ProductSearch);
    }

    #[tokio::test]
    async fn test_follow_up_on_results_is_technical() {
        let c = heuristic_classifier();
        let history = vec![
            msg(Role::User, "busco diferencial 40A"),
            msg(
                Role::Assistant,
                "Encontré estas opciones:\n1. Diferencial 2P 40A 30mA\n2. Diferencial 4P 40A 30mA",
            ),
        ];
        let result = c.classify("¿el primero sirve para mi casa?", &history).await;
        assert_eq!(result.intent, Intent::TechnicalInfo);
    }

    #[tokio::test]
    async fn test_order_number_entity() {
        let c = heuristic_classifier();
        let result = c.classify("estado del pedido nº 100234", &[]).await;
        assert_eq!(result.entities.get("order_id").map(String::as_str), Some("100234"));
    }

    #[test]
    fn test_extract_order_number() {
        assert_eq!(extract_order_number("pedido #A-20931").as_deref(), Some("A-20931"));
        assert_eq!(extract_order_number("mi número es 5567123").as_deref(), Some("5567123"));
        assert_eq!(extract_order_number("mi pedido no llega"), None);
    }

    #[tokio::test]
    async fn test_llm_classification() {
        let provider = ScriptedProvider::new().on(
            "classify_intent",
            r#"{"intent":"ORDER_INQUIRY","confidence":0.92,"entities":{"order_id":"100234"},"reasoning":"asks about shipment"}"#,
        );
        let llm = LLMManager::with_provider(LLMConfig::default(), Arc::new(provider));
        let c = IntentClassifier::new(Arc::new(llm), Arc::new(SynonymIndex::builtin()));
        let result = c.classify("¿cuándo llega lo mío?", &[]).await;
        assert_eq!(result.intent, Intent::OrderInquiry);
        assert_eq!(result.source, ClassificationSource::Llm);
        assert_eq!(result.entities.get("order_id").map(String::as_str), Some("100234"));
    }

    #[tokio::test]
    async fn test_llm_failure_falls_back() {
        let llm = LLMManager::with_provider(LLMConfig::default(), Arc::new(FailingProvider));
        let c = IntentClassifier::new(Arc::new(llm), Arc::new(SynonymIndex::builtin()));
        let result = c.classify("busco cable de 2.5mm2", &[]).await;
        assert_eq!(result.intent, Intent::ProductSearch);
        assert_eq!(result.source, ClassificationSource::Heuristic);
    }

    #[tokio::test]
    async fn test_unknown_llm_intent_falls_back() {
        let provider =
            ScriptedProvider::new().on("classify_intent", r#"{"intent":"weather","confidence":1}"#);
        let llm = LLMManager::with_provider(LLMConfig::default(), Arc::new(provider));
        let c = IntentClassifier::new(Arc::new(llm), Arc::new(SynonymIndex::builtin()));
        assert_eq!(c.classify("hola", &[]).await.intent, Intent::Greeting);
    }

    #[test]
    fn test_lenient_reply_parse() {
        let partial = r#"Sure: {"intent": "technical_info", "confidence": 0.8, "entities": {"brand": "#;
        let result = parse_intent_reply(partial).unwrap();
        assert_eq!(result.intent, Intent::TechnicalInfo);
        assert!((result.confidence - 0.8).abs() < 1e-6);
    }
}
