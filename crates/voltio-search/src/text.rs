//! Text helpers shared by the search pipeline.
//!
//! Everything that compares user text against catalog text goes through
//! [`normalize`] so that "Automático", "automatico" and "AUTOMÁTICO" meet.

use std::collections::HashSet;
use std::sync::LazyLock;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Filler words stripped before a request becomes a keyword query.
/// Spanish first (the store's language), then the English words customers mix in.
static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        // articles, prepositions, pronouns
        "el", "la", "los", "las", "un", "una", "unos", "unas", "de", "del", "al", "a", "en",
        "con", "por", "para", "que", "y", "o", "u", "me", "mi", "mis", "te", "se", "lo", "le",
        "su", "sus", "es", "son", "hay", "algo", "algun", "alguno", "alguna", "este", "esta",
        "ese", "esa", "eso", "esto", "muy", "mas", "tambien", "pero", "si", "no", "yo",
        // request fillers
        "necesito", "necesitaria", "busco", "buscando", "quiero", "quisiera", "queria",
        "tienen", "tienes", "tenes", "venden", "vendeis", "hola", "buenas", "buenos", "dias",
        "tardes", "noches", "favor", "porfa", "porfavor", "gracias", "comprar", "precio",
        "cuanto", "cuesta", "vale", "donde", "encuentro", "consigo", "puedo", "podria",
        "podrian", "podes", "puedes", "ayuda", "ayudar", "ayudame", "saber", "ver", "mostrar",
        "muestrame", "ensename", "dame", "favor", "ustedes",
        // english
        "i", "need", "want", "looking", "for", "the", "an", "of", "to", "do", "you", "have",
        "please", "some", "any", "with", "is", "are", "me", "my", "find", "show", "get",
        "buy",
    ]
    .into_iter()
    .collect()
});

// "16 A" -> "16A", "30 mA" -> "30mA" so units stay attached to their value.
static UNIT_SPACING_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)\b(\d+(?:[.,]\d+)?)\s+(ma|mm2|mm²|mm|a|v|w|kw|kva|p|m)\b")
        .expect("unit spacing regex is valid")
});

/// Lower-case and strip diacritics ("Automático" -> "automatico").
/// `ñ` is kept because it distinguishes words in Spanish.
pub fn normalize(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c) || *c == '\u{303}')
        .collect::<String>()
        .nfc()
        .collect::<String>()
        .to_lowercase()
}

/// Split on whitespace and trim surrounding punctuation, keeping inner
/// separators so that "2.5mm2", "1p+n" and "c16" survive intact.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Glue measurement units to the number before them.
pub fn attach_units(text: &str) -> String {
    UNIT_SPACING_RE.replace_all(text, "$1$2").into_owned()
}

/// Normalized tokens of `text`.
pub fn normalized_tokens(text: &str) -> Vec<String> {
    tokenize(&normalize(text))
}

pub fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(normalize(token).as_str())
}

/// Minimal keyword form of a request: filler and stop words removed,
/// original order and surface form kept.
///
/// "necesito un automático de 16A" -> "automático 16A"
pub fn extract_keywords(query: &str) -> String {
    tokenize(&attach_units(query))
        .into_iter()
        .filter(|w| !is_stop_word(w))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Case- and accent-insensitive equality key for query strings.
pub fn query_key(query: &str) -> String {
    normalized_tokens(query).join(" ")
}

/// `haystack` with all whitespace removed, for spec matching that must see
/// "16 A" and "16A" as the same thing.
pub fn compact(text: &str) -> String {
    normalize(text).chars().filter(|c| !c.is_whitespace()).collect()
}

pub fn has_digit(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}
