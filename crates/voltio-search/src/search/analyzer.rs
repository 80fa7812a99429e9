//! Request completeness analysis.
//!
//! Decides whether a product request can be searched precisely or needs one
//! clarifying question. The analyzer is permissive: only a missing
//! selection-critical attribute (rated current of a breaker, sensitivity of
//! a residual-current device, cross-section of a cable) makes a request
//! insufficient.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use crate::conversation::{Message, Role};
use crate::llm::LLMManager;
use crate::text::{attach_units, compact, has_digit, normalize, normalized_tokens};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisResult {
    pub product_type: Option<String>,
    pub specs: BTreeMap<String, String>,
    pub has_enough_info: bool,
    /// Required attributes that are absent.
    pub missing_info: Vec<String>,
    /// Attributes worth asking for alongside the required ones.
    pub desirable_info: Vec<String>,
}

// ---------------------------------------------------------------------------
// Category rules
// ---------------------------------------------------------------------------

struct CategoryRule {
    product_type: &'static str,
    triggers: &'static [&'static str],
    required: &'static [&'static str],
    desirable: &'static [&'static str],
    /// A stated usage ("doméstico", "exterior") is enough to pick a product.
    usage_is_enough: bool,
}

// Order matters: "interruptor diferencial" must resolve before "interruptor".
const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        product_type: "diferencial",
        triggers: &["diferencial", "diferenciales", "rcd", "disyuntor"],
        required: &["amperaje", "sensibilidad"],
        desirable: &["polos"],
        usage_is_enough: false,
    },
    CategoryRule {
        product_type: "automatico",
        triggers: &[
            "automatico",
            "automaticos",
            "magnetotermico",
            "magnetotermicos",
            "pia",
            "termomagnetico",
            "breaker",
        ],
        required: &["amperaje"],
        desirable: &["curva", "polos"],
        usage_is_enough: false,
    },
    CategoryRule {
        product_type: "guardamotor",
        triggers: &["guardamotor", "guardamotores"],
        required: &["amperaje"],
        desirable: &[],
        usage_is_enough: false,
    },
    CategoryRule {
        product_type: "contactor",
        triggers: &["contactor", "contactores", "telerruptor"],
        required: &["amperaje"],
        desirable: &["voltaje"],
        usage_is_enough: false,
    },
    CategoryRule {
        product_type: "cable",
        triggers: &["cable", "cables", "conductor", "hilo", "manguera"],
        required: &["seccion"],
        desirable: &["longitud"],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "transformador",
        triggers: &["transformador", "transformadores", "trafo"],
        required: &["potencia"],
        desirable: &["voltaje"],
        usage_is_enough: false,
    },
    CategoryRule {
        product_type: "ventilador",
        triggers: &["ventilador", "ventiladores", "extractor", "extractores"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "bombilla",
        triggers: &["bombilla", "bombillas", "lampara", "lamparas", "foco", "focos", "ampolleta"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "luminaria",
        triggers: &["luminaria", "luminarias", "aplique", "plafon", "pantalla", "proyector", "reflector", "fluorescente"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "enchufe",
        triggers: &["enchufe", "enchufes", "tomacorriente", "toma"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "interruptor",
        triggers: &["interruptor", "interruptores", "pulsador", "conmutador"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "regleta",
        triggers: &["regleta", "regletas", "alargador", "zapatilla"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "tubo",
        triggers: &["tubo", "corrugado", "conduit"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "sensor",
        triggers: &["sensor", "sensores", "detector"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
    CategoryRule {
        product_type: "temporizador",
        triggers: &["temporizador", "programador", "timer"],
        required: &[],
        desirable: &[],
        usage_is_enough: true,
    },
];

fn rule_for(product_type: &str) -> Option<&'static CategoryRule> {
    let key = normalize(product_type);
    CATEGORY_RULES
        .iter()
        .find(|r| r.product_type == key || r.triggers.contains(&key.as_str()))
}

/// Every trigger word of the category table, normalized.
pub fn category_vocabulary() -> impl Iterator<Item = &'static str> {
    CATEGORY_RULES.iter().flat_map(|r| r.triggers.iter().copied())
}

/// Product category named in `text`, if any.
pub fn detect_product_type(text: &str) -> Option<&'static str> {
    let tokens = normalized_tokens(text);
    CATEGORY_RULES
        .iter()
        .find(|rule| tokens.iter().any(|t| rule.triggers.contains(&t.as_str())))
        .map(|rule| rule.product_type)
}

// ---------------------------------------------------------------------------
// Spec extraction
// ---------------------------------------------------------------------------

static AMPERAGE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(\d+(?:[.,]\d+)?)\s*a\b").expect("amperage regex is valid")
});

// "c16" style breaker notation carries curve and rated current
static CURVE_RATING_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b([bcd])(\d{1,3})\b").expect("curve rating regex is valid")
});

static CURVE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\bcurva\s*([bcd])\b").expect("curve regex is valid"));

static POLES_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b([1-4])\s*p(\s*\+\s*n)?\b|\b(unipolar|bipolar|tripolar|tetrapolar)\b")
        .expect("poles regex is valid")
});

static SENSITIVITY_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b(\d+)\s*ma\b").expect("sensitivity regex is valid"));

static SECTION_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(\d+(?:[.,]\d+)?)\s*(mm2\b|mm²|mm\b)").expect("section regex is valid")
});

static VOLTAGE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b(\d+)\s*v\b").expect("voltage regex is valid"));

static POWER_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(\d+(?:[.,]\d+)?)\s*(w|kw|kva)\b").expect("power regex is valid")
});

static IP_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\bip\s*(\d{2})\b").expect("ip regex is valid"));

static LENGTH_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\b(\d+)\s*(m|metros|mts)\b").expect("length regex is valid")
});

static USAGE_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(domestico|domestica|hogar|vivienda|casa|industrial|profesional|exterior|intemperie|interior|enterrado|solar|jardin|bano|cocina)\b",
    )
    .expect("usage regex is valid")
});

pub const KNOWN_BRANDS: &[&str] = &[
    "schneider", "abb", "legrand", "siemens", "hager", "simon", "chint", "philips", "osram",
    "ledvance", "orbis", "bticino", "jung", "niessen", "gewiss", "prysmian", "steinel", "eaton",
    "general cable", "top cable",
];

static BRAND_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    let alternatives = KNOWN_BRANDS
        .iter()
        .map(|b| regex::escape(b))
        .collect::<Vec<_>>()
        .join("|");
    regex::Regex::new(&format!(r"\b({})\b", alternatives)).expect("brand regex is valid")
});

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn decimal(raw: &str) -> String {
    raw.replace(',', ".")
}

/// Specifications literally stated in `query`, keyed by attribute name.
pub fn extract_specs(query: &str) -> BTreeMap<String, String> {
    let text = attach_units(&normalize(query));
    let mut specs = BTreeMap::new();

    if let Some(c) = CURVE_RATING_RE.captures(&text) {
        specs.insert("curva".to_string(), c[1].to_uppercase());
        specs.insert("amperaje".to_string(), format!("{}A", &c[2]));
    }
    if let Some(c) = AMPERAGE_RE.captures(&text) {
        specs.insert("amperaje".to_string(), format!("{}A", decimal(&c[1])));
    }
    if let Some(c) = CURVE_RE.captures(&text) {
        specs.insert("curva".to_string(), c[1].to_uppercase());
    }
    if let Some(c) = POLES_RE.captures(&text) {
        let poles = if let Some(n) = c.get(1) {
            if c.get(2).is_some() {
                format!("{}P+N", n.as_str())
            } else {
                format!("{}P", n.as_str())
            }
        } else {
            match c.get(3).map(|m| m.as_str()) {
                Some("unipolar") => "1P",
                Some("bipolar") => "2P",
                Some("tripolar") => "3P",
                _ => "4P",
            }
            .to_string()
        };
        specs.insert("polos".to_string(), poles);
    }
    if let Some(c) = SENSITIVITY_RE.captures(&text) {
        specs.insert("sensibilidad".to_string(), format!("{}mA", &c[1]));
    }
    if let Some(c) = SECTION_RE.captures(&text) {
        specs.insert("seccion".to_string(), format!("{}mm2", decimal(&c[1])));
    }
    if let Some(c) = VOLTAGE_RE.captures(&text) {
        specs.insert("voltaje".to_string(), format!("{}V", &c[1]));
    }
    if let Some(c) = POWER_RE.captures(&text) {
        let unit = match &c[2] {
            "kw" => "kW",
            "kva" => "kVA",
            _ => "W",
        };
        specs.insert("potencia".to_string(), format!("{}{}", decimal(&c[1]), unit));
    }
    if let Some(c) = IP_RE.captures(&text) {
        specs.insert("ip".to_string(), format!("IP{}", &c[1]));
    }
    if let Some(c) = LENGTH_RE.captures(&text) {
        specs.insert("longitud".to_string(), format!("{}m", &c[1]));
    }
    if let Some(c) = USAGE_RE.captures(&text) {
        specs.insert("uso".to_string(), c[1].to_string());
    }
    if let Some(c) = BRAND_RE.captures(&text) {
        specs.insert(
            "marca".to_string(),
            c[1].split(' ').map(title_case).collect::<Vec<_>>().join(" "),
        );
    }

    specs
}

/// Rule-based completeness decision for a known or unknown product type.
fn judge(product_type: Option<&str>, specs: &BTreeMap<String, String>) -> (bool, Vec<String>, Vec<String>) {
    let Some(rule) = product_type.and_then(rule_for) else {
        return (true, Vec::new(), Vec::new());
    };
    let absent = |keys: &[&str]| -> Vec<String> {
        keys.iter()
            .filter(|k| !specs.contains_key(**k))
            .map(|k| k.to_string())
            .collect()
    };
    let desirable = absent(rule.desirable);
    if rule.usage_is_enough && specs.contains_key("uso") {
        return (true, Vec::new(), desirable);
    }
    let missing = absent(rule.required);
    (missing.is_empty(), missing, desirable)
}

// ---------------------------------------------------------------------------
// LLM path
// ---------------------------------------------------------------------------

const ANALYZE_PROMPT: &str = r#"### task: analyze_request
You help customers of an electrical supplies store find products.
Decide if the request below has enough detail to search the catalog precisely.
Be permissive: generic but usable requests are sufficient. Only flag a request
when a safety or selection-critical attribute is missing (for example the rated
current of a circuit breaker, or the sensitivity of a residual-current device).
Only list specs that the customer literally stated."#;

const ANALYZE_SCHEMA: &str = r#"{"product_type":"string or null","specs":{"attribute":"value"},"has_enough_info":true,"missing_info":["attribute"]}"#;

#[derive(Debug, Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    product_type: Option<String>,
    #[serde(default)]
    specs: HashMap<String, serde_json::Value>,
    has_enough_info: bool,
    #[serde(default)]
    missing_info: Vec<String>,
}

pub struct SearchAnalyzer {
    llm: Arc<LLMManager>,
}

impl SearchAnalyzer {
    pub fn new(llm: Arc<LLMManager>) -> Self {
        Self { llm }
    }

    /// `Analyze(query, history)`. Never fails; a failed completion means
    /// "enough information".
    pub async fn analyze(&self, query: &str, history: &[Message]) -> AnalysisResult {
        let specs = extract_specs(query);
        let product_type = detect_product_type(query).map(str::to_string);

        if !self.llm.is_enabled() {
            let (has_enough_info, missing_info, desirable_info) =
                judge(product_type.as_deref(), &specs);
            let result = AnalysisResult {
                product_type,
                specs,
                has_enough_info,
                missing_info,
                desirable_info,
            };
            tracing::info!(
                product_type = ?result.product_type,
                specs = ?result.specs,
                has_enough_info = result.has_enough_info,
                missing = ?result.missing_info,
                "Rule-based request analysis"
            );
            return result;
        }

        match self.analyze_with_llm(query, history).await {
            Ok(reply) => {
                let result = merge_llm_analysis(query, product_type, specs, reply);
                tracing::info!(
                    product_type = ?result.product_type,
                    specs = ?result.specs,
                    has_enough_info = result.has_enough_info,
                    missing = ?result.missing_info,
                    "LLM request analysis"
                );
                result
            }
            Err(e) => {
                tracing::warn!(error = %e, "Request analysis failed, treating request as complete");
                AnalysisResult {
                    product_type,
                    specs,
                    has_enough_info: true,
                    missing_info: Vec::new(),
                    desirable_info: Vec::new(),
                }
            }
        }
    }

    async fn analyze_with_llm(&self, query: &str, history: &[Message]) -> Result<AnalysisReply> {
        let mut prompt = ANALYZE_PROMPT.to_string();
        let earlier: Vec<String> = history
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| format!("- {}", m.text))
            .collect();
        if !earlier.is_empty() {
            prompt.push_str(&format!("\n\nEarlier customer messages:\n{}", earlier.join("\n")));
        }
        prompt.push_str(&format!("\n\nRequest: \"{}\"", query));

        self.llm
            .complete_structured::<AnalysisReply>(&prompt, ANALYZE_SCHEMA, 250)
            .await
            .context("request analysis call failed")
    }
}

/// Whether `value` literally appears in `query`: as a whole token, or, for
/// values carrying a number, anywhere once whitespace is ignored ("16 A").
fn is_stated(query: &str, value: &str) -> bool {
    let needle = compact(value);
    if needle.is_empty() {
        return false;
    }
    if normalized_tokens(&attach_units(query)).contains(&needle) {
        return true;
    }
    has_digit(&needle) && compact(query).contains(&needle)
}

/// Combine rule-extracted specs with the model's view. Model specs are kept
/// only when their value literally appears in the request.
fn merge_llm_analysis(
    query: &str,
    rule_type: Option<String>,
    mut specs: BTreeMap<String, String>,
    reply: AnalysisReply,
) -> AnalysisResult {
    for (key, value) in reply.specs {
        let value = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            _ => continue,
        };
        if !is_stated(query, &value) {
            tracing::debug!(key = %key, value = %value, "Dropping ungrounded spec from analysis");
            continue;
        }
        specs.entry(normalize(&key)).or_insert(value);
    }

    let product_type = rule_type.or_else(|| {
        reply
            .product_type
            .map(|p| normalize(p.trim()))
            .filter(|p| !p.is_empty() && p != "null")
    });
    let desirable_info = product_type
        .as_deref()
        .map(|p| judge(Some(p), &specs).2)
        .unwrap_or_default();
    let missing_info = if reply.has_enough_info {
        Vec::new()
    } else {
        reply.missing_info
    };

    AnalysisResult {
        product_type,
        specs,
        has_enough_info: reply.has_enough_info,
        missing_info,
        desirable_info,
    }
}
