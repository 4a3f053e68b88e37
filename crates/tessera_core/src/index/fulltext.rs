//! Inverted index holding the entries of one index.
//!
//! Every field keeps two posting maps:
//! - terms: normalized term → entry keys
//! - numbers: sortable encoding of the numeric value → entry keys
//!
//! Entries are kept whole so removal can recompute their terms and
//! queries can sort and project without going back to the documents.

use crate::index::definition::{FieldIndexing, DOCUMENT_ID_FIELD, REDUCE_KEY_FIELD};
use crate::types::JsonObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Term stored for `null` values.
pub const NULL_VALUE: &str = "NULL_VALUE";

/// Term stored for empty strings.
pub const EMPTY_STRING: &str = "EMPTY_STRING";

/// One entry of an index: a mapped document or a reduced group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Entry key: the lowercased document key, or the reduce key.
    pub key: String,
    /// Source document key for map entries.
    pub document_key: Option<String>,
    /// Field values.
    pub fields: BTreeMap<String, Vec<Value>>,
}

impl IndexEntry {
    /// The entry as a JSON object, without bookkeeping fields. Single
    /// values are unwrapped.
    #[must_use]
    pub fn to_object(&self) -> JsonObject {
        self.fields
            .iter()
            .filter(|(name, _)| !is_bookkeeping(name))
            .map(|(name, values)| {
                let value = match values.as_slice() {
                    [single] => single.clone(),
                    many => Value::Array(many.to_vec()),
                };
                (name.clone(), value)
            })
            .collect()
    }

    /// First value of a field.
    #[must_use]
    pub fn first(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|v| v.first())
    }
}

fn is_bookkeeping(field: &str) -> bool {
    field == DOCUMENT_ID_FIELD || field == REDUCE_KEY_FIELD
}

/// Configuration for the analyzer.
#[derive(Debug, Clone)]
pub struct TokenizerConfig {
    /// Minimum token length to index.
    pub min_token_length: usize,
    /// Maximum token length to index.
    pub max_token_length: usize,
    /// Additional characters to treat as separators.
    pub extra_separators: Vec<char>,
}

impl Default for TokenizerConfig {
    fn default() -> Self {
        Self {
            min_token_length: 1,
            max_token_length: 256,
            extra_separators: vec![],
        }
    }
}

impl TokenizerConfig {
    /// Splits text on whitespace and punctuation, lowercasing tokens.
    #[must_use]
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();

        for c in text.chars() {
            let is_separator = c.is_whitespace()
                || (c.is_ascii_punctuation() && c != '*')
                || self.extra_separators.contains(&c);

            if is_separator {
                self.push_token(&mut tokens, &mut current);
            } else {
                current.push(c);
            }
        }
        self.push_token(&mut tokens, &mut current);
        tokens
    }

    fn push_token(&self, tokens: &mut Vec<String>, current: &mut String) {
        if current.is_empty() {
            return;
        }
        let len = current.chars().count();
        if len >= self.min_token_length && len <= self.max_token_length {
            tokens.push(current.to_lowercase());
        }
        current.clear();
    }
}

/// A range bound value.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeValue {
    /// Compared lexicographically against terms.
    Text(String),
    /// Compared numerically against numeric values.
    Number(f64),
}

/// Order-preserving encoding of an `f64` into a `u64`.
#[must_use]
pub fn sortable_f64(value: f64) -> u64 {
    let bits = value.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// The searchable contents of one index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullTextIndex {
    entries: BTreeMap<String, IndexEntry>,
    terms: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    numbers: BTreeMap<String, BTreeMap<u64, BTreeSet<String>>>,
    #[serde(skip)]
    modes: BTreeMap<String, FieldIndexing>,
    #[serde(skip)]
    tokenizer: TokenizerConfig,
}

impl FullTextIndex {
    /// Creates an empty index with per-field indexing modes.
    #[must_use]
    pub fn new(modes: BTreeMap<String, FieldIndexing>) -> Self {
        Self {
            modes,
            ..Self::default()
        }
    }

    /// Replaces the indexing modes, used after loading a snapshot.
    pub fn set_modes(&mut self, modes: BTreeMap<String, FieldIndexing>) {
        self.modes = modes;
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the index has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.terms.clear();
        self.numbers.clear();
    }

    fn mode(&self, field: &str) -> Option<FieldIndexing> {
        if is_bookkeeping(field) {
            return Some(FieldIndexing::NotAnalyzed);
        }
        self.modes.get(field).copied()
    }

    /// Terms a value produces in a field.
    fn terms_of(&self, field: &str, value: &Value) -> Vec<String> {
        let mode = self.mode(field);
        if mode == Some(FieldIndexing::No) {
            return Vec::new();
        }
        match value {
            Value::Null => vec![NULL_VALUE.to_string()],
            Value::String(s) if s.is_empty() => vec![EMPTY_STRING.to_string()],
            Value::String(s) => self.normalize(mode, s),
            Value::Bool(b) => vec![b.to_string()],
            Value::Number(n) => vec![n.to_string()],
            other => self.normalize(mode, &other.to_string()),
        }
    }

    fn normalize(&self, mode: Option<FieldIndexing>, text: &str) -> Vec<String> {
        match mode {
            Some(FieldIndexing::Analyzed) => self.tokenizer.tokenize(text),
            Some(FieldIndexing::NotAnalyzed) => vec![text.to_string()],
            Some(FieldIndexing::No) => Vec::new(),
            None => vec![text.to_lowercase()],
        }
    }

    /// Adds or replaces an entry.
    pub fn index(&mut self, entry: IndexEntry) {
        self.remove(&entry.key);
        for (field, values) in &entry.fields {
            for value in values {
                for term in self.terms_of(field, value) {
                    self.terms
                        .entry(field.clone())
                        .or_default()
                        .entry(term)
                        .or_default()
                        .insert(entry.key.clone());
                }
                if let Some(n) = value.as_f64() {
                    self.numbers
                        .entry(field.clone())
                        .or_default()
                        .entry(sortable_f64(n))
                        .or_default()
                        .insert(entry.key.clone());
                }
            }
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Removes an entry, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(key)?;
        for (field, values) in &entry.fields {
            for value in values {
                for term in self.terms_of(field, value) {
                    remove_posting(self.terms.get_mut(field), &term, key);
                }
                if let Some(n) = value.as_f64() {
                    remove_posting(self.numbers.get_mut(field), &sortable_f64(n), key);
                }
            }
        }
        Some(entry)
    }

    /// Entry by key.
    #[must_use]
    pub fn entry(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    /// Every entry key.
    #[must_use]
    pub fn all(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    /// Entries matching a value in a field. Analyzed fields require every
    /// token of the value.
    #[must_use]
    pub fn term(&self, field: &str, value: &str) -> BTreeSet<String> {
        let Some(postings) = self.terms.get(field) else {
            return BTreeSet::new();
        };
        let terms = if value == NULL_VALUE || value == EMPTY_STRING {
            vec![value.to_string()]
        } else {
            self.normalize(self.mode(field), value)
        };
        let mut result: Option<BTreeSet<String>> = None;
        for term in terms {
            let keys = postings.get(&term).cloned().unwrap_or_default();
            result = Some(match result {
                Some(acc) => acc.intersection(&keys).cloned().collect(),
                None => keys,
            });
        }
        result.unwrap_or_default()
    }

    /// Entries with a term in `field` starting with `prefix`.
    #[must_use]
    pub fn prefix(&self, field: &str, prefix: &str) -> BTreeSet<String> {
        let Some(postings) = self.terms.get(field) else {
            return BTreeSet::new();
        };
        let prefix = match self.mode(field) {
            Some(FieldIndexing::NotAnalyzed) => prefix.to_string(),
            _ => prefix.to_lowercase(),
        };
        postings
            .range::<String, _>((Bound::Included(&prefix), Bound::Unbounded))
            .take_while(|(term, _)| term.starts_with(&prefix))
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Entries with a value in `field` between the bounds. Numeric bounds
    /// search numeric values, text bounds search terms.
    #[must_use]
    pub fn range(
        &self,
        field: &str,
        lower: Bound<RangeValue>,
        upper: Bound<RangeValue>,
    ) -> BTreeSet<String> {
        let numeric = matches!(lower, Bound::Included(RangeValue::Number(_)) | Bound::Excluded(RangeValue::Number(_)))
            || matches!(upper, Bound::Included(RangeValue::Number(_)) | Bound::Excluded(RangeValue::Number(_)));

        if numeric {
            let Some(postings) = self.numbers.get(field) else {
                return BTreeSet::new();
            };
            let to_key = |v: RangeValue| match v {
                RangeValue::Number(n) => sortable_f64(n),
                RangeValue::Text(t) => t.parse::<f64>().map_or(0, sortable_f64),
            };
            let lower = lower.map(to_key);
            let upper = upper.map(to_key);
            if !valid_bounds(&lower, &upper) {
                return BTreeSet::new();
            }
            return postings
                .range((lower, upper))
                .flat_map(|(_, keys)| keys.iter().cloned())
                .collect();
        }

        let Some(postings) = self.terms.get(field) else {
            return BTreeSet::new();
        };
        let case_sensitive = self.mode(field) == Some(FieldIndexing::NotAnalyzed);
        let to_term = |v: RangeValue| match v {
            RangeValue::Text(t) if case_sensitive => t,
            RangeValue::Text(t) => t.to_lowercase(),
            RangeValue::Number(n) => n.to_string(),
        };
        let lower = lower.map(to_term);
        let upper = upper.map(to_term);
        if !valid_bounds(&lower, &upper) {
            return BTreeSet::new();
        }
        postings
            .range((lower, upper))
            .filter(|(term, _)| term.as_str() != NULL_VALUE)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Every distinct term of a field.
    pub fn terms_for_field(&self, field: &str) -> impl Iterator<Item = &str> {
        self.terms
            .get(field)
            .into_iter()
            .flat_map(|postings| postings.keys().map(String::as_str))
            .filter(|t| *t != NULL_VALUE && *t != EMPTY_STRING)
    }
}

fn remove_posting<K: Ord>(field: Option<&mut BTreeMap<K, BTreeSet<String>>>, term: &K, key: &str) {
    let Some(postings) = field else {
        return;
    };
    if let Some(keys) = postings.get_mut(term) {
        keys.remove(key);
        if keys.is_empty() {
            postings.remove(term);
        }
    }
}

fn valid_bounds<T: Ord>(lower: &Bound<T>, upper: &Bound<T>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l <= u,
        (Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u)) => l < u,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, fields: &[(&str, Value)]) -> IndexEntry {
        let mut map = BTreeMap::new();
        for (name, value) in fields {
            let values = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            map.insert((*name).to_string(), values);
        }
        map.insert(DOCUMENT_ID_FIELD.into(), vec![json!(key)]);
        IndexEntry {
            key: key.to_lowercase(),
            document_key: Some(key.into()),
            fields: map,
        }
    }

    fn keys(set: BTreeSet<String>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn tokenizer_splits_and_lowercases() {
        let tokens = TokenizerConfig::default().tokenize("Hello, World! It's rust-lang");
        assert_eq!(tokens, vec!["hello", "world", "it", "s", "rust", "lang"]);
    }

    #[test]
    fn default_mode_matches_whole_value_case_insensitively() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        index.index(entry("users/1", &[("Name", json!("Ayende Rahien"))]));

        assert_eq!(keys(index.term("Name", "ayende rahien")), vec!["users/1"]);
        assert!(index.term("Name", "ayende").is_empty());
    }

    #[test]
    fn analyzed_field_matches_tokens() {
        let mut modes = BTreeMap::new();
        modes.insert("Body".to_string(), FieldIndexing::Analyzed);
        let mut index = FullTextIndex::new(modes);
        index.index(entry("posts/1", &[("Body", json!("The quick brown fox"))]));
        index.index(entry("posts/2", &[("Body", json!("A quick turtle"))]));

        assert_eq!(keys(index.term("Body", "QUICK")), vec!["posts/1", "posts/2"]);
        assert_eq!(keys(index.term("Body", "quick fox")), vec!["posts/1"]);
        assert_eq!(keys(index.prefix("Body", "tur")), vec!["posts/2"]);
    }

    #[test]
    fn not_analyzed_is_exact() {
        let mut modes = BTreeMap::new();
        modes.insert("Code".to_string(), FieldIndexing::NotAnalyzed);
        let mut index = FullTextIndex::new(modes);
        index.index(entry("a", &[("Code", json!("AbC"))]));

        assert_eq!(keys(index.term("Code", "AbC")), vec!["a"]);
        assert!(index.term("Code", "abc").is_empty());
    }

    #[test]
    fn no_indexing_is_not_searchable() {
        let mut modes = BTreeMap::new();
        modes.insert("Secret".to_string(), FieldIndexing::No);
        let mut index = FullTextIndex::new(modes);
        index.index(entry("a", &[("Secret", json!("x"))]));
        assert!(index.term("Secret", "x").is_empty());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn nulls_are_searchable() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        index.index(entry("a", &[("Name", Value::Null)]));
        assert_eq!(keys(index.term("Name", NULL_VALUE)), vec!["a"]);
    }

    #[test]
    fn reindex_replaces_old_terms() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        index.index(entry("a", &[("Name", json!("old"))]));
        index.index(entry("a", &[("Name", json!("new"))]));

        assert!(index.term("Name", "old").is_empty());
        assert_eq!(keys(index.term("Name", "new")), vec!["a"]);
        assert_eq!(index.len(), 1);

        assert!(index.remove("a").is_some());
        assert!(index.remove("a").is_none());
        assert!(index.is_empty());
        assert_eq!(index.terms_for_field("Name").count(), 0);
    }

    #[test]
    fn numeric_range() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        for (key, age) in [("a", json!(5)), ("b", json!(-3)), ("c", json!(12.5)), ("d", json!(40))] {
            index.index(entry(key, &[("Age", age)]));
        }

        let hits = index.range(
            "Age",
            Bound::Included(RangeValue::Number(-3.0)),
            Bound::Excluded(RangeValue::Number(40.0)),
        );
        assert_eq!(keys(hits), vec!["a", "b", "c"]);

        let open = index.range("Age", Bound::Excluded(RangeValue::Number(5.0)), Bound::Unbounded);
        assert_eq!(keys(open), vec!["c", "d"]);

        let inverted = index.range(
            "Age",
            Bound::Included(RangeValue::Number(10.0)),
            Bound::Included(RangeValue::Number(1.0)),
        );
        assert!(inverted.is_empty());
    }

    #[test]
    fn text_range_is_lexicographic() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        for (key, name) in [("1", "apple"), ("2", "Banana"), ("3", "cherry")] {
            index.index(entry(key, &[("Name", json!(name))]));
        }
        let hits = index.range(
            "Name",
            Bound::Included(RangeValue::Text("B".into())),
            Bound::Unbounded,
        );
        assert_eq!(keys(hits), vec!["2", "3"]);
    }

    #[test]
    fn entry_object_hides_bookkeeping() {
        let e = entry("users/1", &[("Name", json!("x")), ("Tags", json!(["a", "b"]))]);
        let object = e.to_object();
        assert_eq!(object.get("Name"), Some(&json!("x")));
        assert_eq!(object.get("Tags"), Some(&json!(["a", "b"])));
        assert!(!object.contains_key(DOCUMENT_ID_FIELD));
    }

    #[test]
    fn sortable_encoding_preserves_order() {
        let values = [-1e9, -2.5, -0.0, 0.0, 1.0, 3.25, 1e12];
        for pair in values.windows(2) {
            assert!(sortable_f64(pair[0]) <= sortable_f64(pair[1]), "{pair:?}");
        }
    }

    #[test]
    fn cbor_round_trip_keeps_postings() {
        let mut index = FullTextIndex::new(BTreeMap::new());
        index.index(entry("a", &[("Name", json!("x")), ("Age", json!(3))]));
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&index, &mut bytes).unwrap();
        let back: FullTextIndex = ciborium::de::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(keys(back.term("Name", "x")), vec!["a"]);
        assert_eq!(
            keys(back.range("Age", Bound::Included(RangeValue::Number(3.0)), Bound::Unbounded)),
            vec!["a"]
        );
    }
}
