//! Domain synonym index.
//!
//! Groups of interchangeable trade terms ("automático", "magnetotérmico",
//! "PIA", ...). Loaded once at startup and shared read-only behind an `Arc`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::text::{normalize, tokenize};

/// Built-in table for an electrical supplies catalog (Spanish trade vocabulary).
/// Order inside a group matters: the first entries are preferred replacements.
const BUILTIN_GROUPS: &[&[&str]] = &[
    &["automático", "magnetotérmico", "pia", "termomagnético", "breaker"],
    &["diferencial", "id", "rcd", "disyuntor"],
    &["cable", "conductor", "hilo", "manguera"],
    &["enchufe", "toma", "tomacorriente", "base"],
    &["bombilla", "lámpara", "foco", "ampolleta"],
    &["ventilador", "extractor"],
    &["regleta", "zapatilla", "alargador", "ladron"],
    &["tubo", "corrugado", "conduit"],
    &["canaleta", "canal", "moldura"],
    &["caja", "registro"],
    &["interruptor", "llave", "pulsador"],
    &["luminaria", "aplique", "plafón", "pantalla"],
    &["sensor", "detector"],
    &["temporizador", "timer", "programador"],
    &["transformador", "trafo"],
    &["contactor", "telerruptor"],
    &["relé", "relevador", "relay"],
    &["guardamotor", "protector"],
    &["fluorescente", "tubo led"],
    &["foco led", "proyector", "reflector"],
    &["doméstico", "hogar", "vivienda"],
    &["industrial", "profesional"],
    &["exterior", "intemperie"],
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SynonymFile {
    groups: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SynonymIndex {
    groups: Vec<Vec<String>>,
    /// normalized single-word term -> group indices containing it
    lookup: HashMap<String, Vec<usize>>,
}

impl SynonymIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index over the built-in electrical trade table.
    pub fn builtin() -> Self {
        Self::from_groups(
            BUILTIN_GROUPS
                .iter()
                .map(|g| g.iter().map(|t| t.to_string()).collect())
                .collect(),
        )
    }

    pub fn from_groups(groups: Vec<Vec<String>>) -> Self {
        let mut index = Self::default();
        for group in groups {
            let group: Vec<String> = group
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect();
            if group.len() < 2 {
                continue;
            }
            let idx = index.groups.len();
            for term in &group {
                // Multi-word entries are valid replacements but never lookup keys,
                // since expansion swaps exactly one word.
                if term.split_whitespace().count() == 1 {
                    let entry = index.lookup.entry(normalize(term)).or_default();
                    if !entry.contains(&idx) {
                        entry.push(idx);
                    }
                }
            }
            index.groups.push(group);
        }
        index
    }

    /// Load `{"groups": [["automático", "magnetotérmico"], ...]}`.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read synonym file {}: {}", path.display(), e))?;
        let file: SynonymFile = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse synonym file {}: {}", path.display(), e))?;
        let index = Self::from_groups(file.groups);
        tracing::info!(
            path = %path.display(),
            groups = index.groups.len(),
            terms = index.lookup.len(),
            "Loaded synonym index"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Other members of every group containing `term`, in table order,
    /// without duplicates. Empty for unknown terms.
    pub fn synonyms(&self, term: &str) -> Vec<String> {
        let key = normalize(term.trim());
        let Some(group_ids) = self.lookup.get(&key) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        seen.insert(key);
        let mut out = Vec::new();
        for &gid in group_ids {
            for candidate in &self.groups[gid] {
                if seen.insert(normalize(candidate)) {
                    out.push(candidate.clone());
                }
            }
        }
        out
    }

    /// Up to `max_variants` rewrites of `query`, each with exactly one word
    /// replaced by a synonym. Words are visited left to right and synonyms in
    /// table order, so the output is fully determined by the index contents.
    pub fn expand(&self, query: &str, max_variants: usize) -> Vec<String> {
        if max_variants == 0 {
            return Vec::new();
        }
        let words = tokenize(query);
        let original_key = normalize(&words.join(" "));
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(original_key);

        let mut variants = Vec::new();
        for (i, word) in words.iter().enumerate() {
            for syn in self.synonyms(word) {
                let mut rewritten = words.clone();
                rewritten[i] = syn;
                let variant = rewritten.join(" ");
                if seen.insert(normalize(&variant)) {
                    variants.push(variant);
                    if variants.len() >= max_variants {
                        return variants;
                    }
                }
            }
        }
        variants
    }

    /// Every single-word term in the index, normalized and sorted.
    /// Used as the reference vocabulary for spelling correction.
    pub fn vocabulary(&self) -> BTreeSet<String> {
        self.lookup.keys().cloned().collect()
    }

    /// Surface form of a normalized vocabulary term ("automatico" -> "automático").
    pub fn surface_form(&self, normalized_term: &str) -> Option<String> {
        let gids = self.lookup.get(normalized_term)?;
        self.groups[gids[0]]
            .iter()
            .find(|t| normalize(t) == normalized_term)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synonyms_lookup_is_accent_insensitive() {
        let index = SynonymIndex::builtin();
        let syns = index.synonyms("automatico");
        assert_eq!(syns[0], "magnetotérmico");
        assert!(syns.contains(&"pia".to_string()));
        assert!(!syns.iter().any(|s| normalize(s) == "automatico"));
    }

    #[test]
    fn test_unknown_term_has_no_synonyms() {
        let index = SynonymIndex::builtin();
        assert!(index.synonyms("unicornio").is_empty());
    }

    #[test]
    fn test_expand_replaces_exactly_one_word() {
        let index = SynonymIndex::builtin();
        let variants = index.expand("automático 16A", 3);
        assert_eq!(variants.len(), 3);
        for v in &variants {
            let words: Vec<&str> = v.split_whitespace().collect();
            assert_eq!(words.last(), Some(&"16A"));
            assert_ne!(normalize(words[0]), "automatico");
        }
    }

    #[test]
    fn test_expand_is_deterministic() {
        let index = SynonymIndex::builtin();
        let a = index.expand("cable doméstico exterior", 5);
        let b = index.expand("cable doméstico exterior", 5);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[test]
    fn test_expand_zero_variants() {
        let index = SynonymIndex::builtin();
        assert!(index.expand("cable", 0).is_empty());
    }

    #[test]
    fn test_multi_word_entries_are_replacements_only() {
        let index = SynonymIndex::builtin();
        assert!(index.synonyms("fluorescente").contains(&"tubo led".to_string()));
        assert!(index.synonyms("tubo led").is_empty());
    }

    #[test]
    fn test_from_groups_skips_singletons() {
        let index = SynonymIndex::from_groups(vec![
            vec!["solo".to_string()],
            vec!["borne".to_string(), "terminal".to_string()],
        ]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.synonyms("Borne"), vec!["terminal".to_string()]);
    }
}
