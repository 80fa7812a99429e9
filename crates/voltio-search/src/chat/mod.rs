pub mod engine;

use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::conversation::{Message, Role, SearchContext, SearchState};
use crate::escalation::EscalationReason;
use crate::text::{is_stop_word, normalize, normalized_tokens};
use crate::types::{Intent, ItemDetail, OrderDetail, RankedItem};

// Matched against normalized text ("el número 2" -> "el numero 2").
static ITEM_NUMBER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(?:el|la|opcion|numero|producto|articulo|item)\s+(?:numero\s+)?#?(\d{1,2})\b|^\s*#?(\d{1,2})\s*[.?!]?\s*$")
        .expect("item number regex is valid")
});
static ORDINAL_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(primer|primero|primera|segundo|segunda|tercer|tercero|tercera|cuarto|cuarta|quinto|quinta|sexto|sexta|ultimo|ultima)\b")
        .expect("ordinal regex is valid")
});

// ============================================================================
// Types
// ============================================================================

/// What one call to `handle_turn` produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub text: String,
    /// Intent the turn was routed on; `None` when escalation pre-empted routing.
    pub intent: Option<Intent>,
    pub search_state: SearchState,
    pub escalation: Option<EscalationReason>,
    /// Items listed in `text`, in display order.
    pub results: Vec<RankedItem>,
    /// Snapshot of the episode as the turn left it, taken before a terminal
    /// state discards the context.
    pub episode: Option<SearchContext>,
}

// ============================================================================
// Canned texts
// ============================================================================

pub const GREETING_TEXT: &str = "¡Hola! Soy el asistente de Voltio. Puedo ayudarte a encontrar material eléctrico, resolver dudas técnicas sobre nuestros productos o consultar el estado de tu pedido. ¿Qué necesitas?";

pub const GENERAL_FALLBACK_TEXT: &str = "Puedo ayudarte a buscar productos de nuestro catálogo (automáticos, diferenciales, cable, iluminación...), darte información técnica de los artículos que te muestre o consultar un pedido. Si necesitas otra cosa, dime y te paso con un asesor.";

pub const APOLOGY_TEXT: &str = "Lo siento, ha ocurrido un problema al procesar tu mensaje. ¿Puedes intentarlo de nuevo en unos minutos?";

pub const ORDER_NUMBER_REQUEST: &str = "Claro, te ayudo con tu pedido. ¿Me indicas el número de pedido? Lo encontrarás en el correo de confirmación de la compra.";

pub const ORDER_LOOKUP_FAILED: &str = "Ahora mismo no puedo consultar el estado de los pedidos. Inténtalo de nuevo en unos minutos o, si lo prefieres, te paso con un asesor.";

pub const ASK_WHICH_ITEM: &str = "¿Sobre cuál de los productos que te mostré quieres información? Puedes indicarme su número de la lista.";

pub const NOTHING_SHOWN_TEXT: &str = "Para darte información técnica necesito saber de qué producto se trata. ¿Me dices cuál buscas (tipo, marca o referencia)?";

// ============================================================================
// Result formatting
// ============================================================================

/// Spanish price notation for euros ("12,50 €"); other currencies keep their code.
pub fn format_price(price: f64, currency: &str) -> String {
    let amount = format!("{:.2}", price).replace('.', ",");
    if currency.eq_ignore_ascii_case("EUR") {
        format!("{} €", amount)
    } else {
        format!("{} {}", amount, currency.to_uppercase())
    }
}

fn format_stock(stock: u32) -> String {
    if stock == 0 {
        "sin stock".to_string()
    } else {
        format!("en stock ({} uds.)", stock)
    }
}

/// One list line: title plus brand, price and stock when the search
/// collaborator sent them.
fn result_line(index: usize, item: &RankedItem) -> String {
    let mut parts = vec![item.title.clone()];
    if let Some(brand) = item.metadata.get("brand").filter(|b| !b.is_empty()) {
        parts.push(brand.clone());
    }
    if let Some(price) = item.metadata.get("price").and_then(|p| p.replace(',', ".").parse::<f64>().ok()) {
        let currency = item.metadata.get("currency").map(String::as_str).unwrap_or("EUR");
        parts.push(format_price(price, currency));
    }
    if let Some(stock) = item.metadata.get("stock").and_then(|s| s.parse::<u32>().ok()) {
        parts.push(format_stock(stock));
    }
    format!("{}. {}", index + 1, parts.join(" · "))
}

fn numbered_list(items: &[RankedItem]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| result_line(i, item))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_results(query: &str, items: &[RankedItem]) -> String {
    format!(
        "Estas son las opciones que mejor encajan con \"{}\":\n{}\n\n¿Quieres más detalles de alguna? Dime su número.",
        query.trim(),
        numbered_list(items)
    )
}

/// Graceful end of a failed episode, with the closest items if any.
pub fn no_match_message(query: &str, partial: &[RankedItem]) -> String {
    let mut text = format!(
        "Lo siento, no he encontrado ningún producto que coincida exactamente con \"{}\".",
        query.trim()
    );
    if partial.is_empty() {
        text.push_str(" ¿Puedes darme más detalles (marca, referencia o características) para intentarlo de nuevo?");
    } else {
        text.push_str("\nEstas son las opciones más cercanas que he encontrado:\n");
        text.push_str(&numbered_list(partial));
        text.push_str("\n\nSi ninguna te sirve, dime más detalles y lo intento otra vez.");
    }
    text
}

// ============================================================================
// Clarification
// ============================================================================

fn attribute_label(attribute: &str) -> String {
    match normalize(attribute).as_str() {
        "amperaje" | "intensidad" | "corriente" => "el amperaje (por ejemplo 16A o 25A)".to_string(),
        "curva" => "la curva de disparo (B, C o D)".to_string(),
        "polos" => "el número de polos (1P+N, 2P, 4P...)".to_string(),
        "sensibilidad" => "la sensibilidad (30mA o 300mA)".to_string(),
        "seccion" => "la sección del cable (1,5 mm², 2,5 mm²...)".to_string(),
        "voltaje" | "tension" => "la tensión (230V, 24V...)".to_string(),
        "potencia" => "la potencia (W o kVA)".to_string(),
        "longitud" => "la longitud que necesitas".to_string(),
        "uso" => "el uso que le vas a dar (doméstico, industrial, exterior...)".to_string(),
        "marca" => "si prefieres alguna marca".to_string(),
        "ip" => "el grado de protección IP".to_string(),
        other => other.replace('_', " "),
    }
}

/// Display name plus whether the Spanish noun is feminine.
fn product_label(product_type: &str) -> (String, bool) {
    match normalize(product_type).as_str() {
        "automatico" => ("automático".to_string(), false),
        "bombilla" | "luminaria" | "regleta" => (product_type.to_string(), true),
        other => (other.to_string(), false),
    }
}

fn join_spanish(parts: &[String]) -> String {
    match parts {
        [] => String::new(),
        [one] => one.clone(),
        [init @ .., last] => format!("{} y {}", init.join(", "), last),
    }
}

/// The single targeted question of an episode.
pub fn clarification_question(product_type: Option<&str>, attributes: &[String]) -> String {
    let labels: Vec<String> = attributes.iter().take(3).map(|a| attribute_label(a)).collect();
    let ask = if labels.is_empty() {
        "algún detalle más (marca, medidas o características técnicas)".to_string()
    } else {
        join_spanish(&labels)
    };
    match product_type {
        Some(pt) => {
            let (name, feminine) = product_label(pt);
            let (article, ending) = if feminine { ("la", "a") } else { ("el", "o") };
            format!(
                "Para recomendarte {} {} adecuad{}, ¿me indicas {}?",
                article, name, ending, ask
            )
        }
        None => format!("Para afinar la búsqueda, ¿me indicas {}?", ask),
    }
}

// ============================================================================
// Orders
// ============================================================================

pub fn order_status_message(order: &OrderDetail) -> String {
    let mut text = format!("Tu pedido {} está: {}.", order.order_id, order.status);
    if !order.items.is_empty() {
        text.push_str(&format!("\nArtículos: {}.", order.items.join(", ")));
    }
    if let Some(eta) = &order.estimated_delivery {
        text.push_str(&format!("\nEntrega estimada: {}.", eta));
    }
    if let Some(url) = &order.tracking_url {
        text.push_str(&format!("\nPuedes seguir el envío aquí: {}", url));
    }
    text
}

pub fn order_not_found(order_id: &str) -> String {
    format!(
        "No he encontrado ningún pedido con el número {}. ¿Puedes revisarlo? Lo encontrarás en el correo de confirmación.",
        order_id
    )
}

// ============================================================================
// Technical info
// ============================================================================

/// Which of the previously shown items a follow-up refers to: an explicit
/// number ("el 2"), an ordinal word ("el primero", "el último") or, failing
/// those, the one item whose title shares the most words with the message.
pub fn resolve_reference<'a>(message: &str, shown: &'a [RankedItem]) -> Option<&'a RankedItem> {
    if shown.is_empty() {
        return None;
    }
    let text = normalize(message);

    if let Some(caps) = ITEM_NUMBER_RE.captures(&text) {
        let n = caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse::<usize>().ok());
        if let Some(n) = n {
            return n.checked_sub(1).and_then(|i| shown.get(i));
        }
    }

    if let Some(word) = ORDINAL_RE.captures(&text).and_then(|c| c.get(1)) {
        let index = match word.as_str() {
            "primer" | "primero" | "primera" => Some(0),
            "segundo" | "segunda" => Some(1),
            "tercer" | "tercero" | "tercera" => Some(2),
            "cuarto" | "cuarta" => Some(3),
            "quinto" | "quinta" => Some(4),
            "sexto" | "sexta" => Some(5),
            _ => shown.len().checked_sub(1),
        };
        return index.and_then(|i| shown.get(i));
    }

    let words: Vec<String> = normalized_tokens(message)
        .into_iter()
        .filter(|w| w.chars().count() >= 3 && !is_stop_word(w))
        .collect();
    if words.is_empty() {
        return None;
    }
    let scores: Vec<usize> = shown
        .iter()
        .map(|item| {
            let title = normalized_tokens(&item.searchable_text());
            words.iter().filter(|w| title.contains(w)).count()
        })
        .collect();
    let best = scores.iter().copied().max().unwrap_or(0);
    if best == 0 || scores.iter().filter(|&&s| s == best).count() > 1 {
        return None;
    }
    scores.iter().position(|&s| s == best).and_then(|i| shown.get(i))
}

/// Specification sheet used when no model answer is available.
pub fn spec_sheet(item: &ItemDetail) -> String {
    let mut lines = vec![format!("Ficha de {} (ref. {}):", item.title, item.id)];
    if !item.description.trim().is_empty() {
        lines.push(item.description.trim().to_string());
    }
    if let Some(brand) = &item.brand {
        lines.push(format!("- Marca: {}", brand));
    }
    let mut specs: Vec<(&String, &String)> = item.specs.iter().collect();
    specs.sort();
    for (key, value) in specs {
        lines.push(format!("- {}: {}", key, value));
    }
    if let Some(price) = item.price {
        lines.push(format!("- Precio: {}", format_price(price, &item.currency)));
    }
    if let Some(stock) = item.stock {
        lines.push(format!("- Disponibilidad: {}", format_stock(stock)));
    }
    if let Some(url) = &item.url {
        lines.push(format!("Más información: {}", url));
    }
    lines.join("\n")
}

/// What is known about an item from the result list alone.
pub fn item_summary(item: &RankedItem) -> String {
    let mut lines = vec![format!("Esto es lo que tengo de {}:", item.title)];
    let mut metadata: Vec<(&String, &String)> = item.metadata.iter().collect();
    metadata.sort();
    for (key, value) in metadata {
        lines.push(format!("- {}: {}", key, value));
    }
    if lines.len() == 1 {
        lines.push("No tengo más datos técnicos de este artículo ahora mismo. Si quieres, te paso con un asesor.".to_string());
    }
    lines.join("\n")
}

// ============================================================================
// Prompts
// ============================================================================

pub fn technical_prompt(question: &str, item: &ItemDetail) -> String {
    format!(
        r#"### task: technical_answer
You are the technical assistant of Voltio, an electrical supplies store. Answer the
customer's question in Spanish, briefly, using ONLY the product data below. If the
data does not contain the answer, say so and offer to contact an advisor.

Product data:
{}

Customer question: "{}"

Answer:"#,
        spec_sheet(item),
        question
    )
}

pub fn general_prompt(question: &str, history: &[Message]) -> String {
    let history_text = history
        .iter()
        .map(|m| {
            let who = match m.role {
                Role::User => "Customer",
                Role::Assistant => "Assistant",
            };
            format!("{}: {}", who, m.text)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"### task: general_answer
You are the customer assistant of Voltio, an online electrical supplies store. Answer
in Spanish, in at most three sentences. Do not invent prices, stock or policies; when
unsure, offer to put the customer in touch with an advisor.

Recent conversation:
{}

Customer: "{}"

Answer:"#,
        history_text, question
    )
}

/// Trimmed model answer, or `None` when the reply is unusable.
pub fn clean_answer(raw: &str) -> Option<String> {
    let text = raw.trim().trim_start_matches("Answer:").trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}
