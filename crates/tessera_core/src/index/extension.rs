//! Per-index extensions and the term suggestion dictionary.

use crate::index::fulltext::IndexEntry;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Hook attached to one index, told about entries as they are written.
pub trait IndexExtension: Send + Sync {
    /// Called after a batch of entries was added to the index.
    fn on_documents_indexed(&self, entries: &[IndexEntry]);
}

/// A request for terms close to a misspelled one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionQuery {
    /// The term to find neighbours of.
    pub term: String,
    /// Field whose terms are the dictionary.
    pub field: String,
    /// Maximum number of suggestions.
    pub max_suggestions: usize,
    /// Minimum similarity in `0.0..=1.0`.
    pub accuracy: f64,
}

impl SuggestionQuery {
    /// A query with ten suggestions and an accuracy of 0.5.
    pub fn new(term: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            field: field.into(),
            max_suggestions: 10,
            accuracy: 0.5,
        }
    }

    /// Sets the maximum number of suggestions.
    #[must_use]
    pub fn max_suggestions(mut self, max: usize) -> Self {
        self.max_suggestions = max;
        self
    }

    /// Sets the minimum similarity.
    #[must_use]
    pub fn accuracy(mut self, accuracy: f64) -> Self {
        self.accuracy = accuracy;
        self
    }
}

/// Suggested terms, best first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionQueryResult {
    /// Suggested terms.
    pub suggestions: Vec<String>,
}

/// Dictionary of the terms of one field, queried by edit distance.
#[derive(Debug, Default)]
pub struct SuggestionIndexExtension {
    field: String,
    words: RwLock<BTreeSet<String>>,
}

impl SuggestionIndexExtension {
    /// Creates a dictionary seeded with existing terms.
    pub fn new<'a>(field: impl Into<String>, terms: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            field: field.into(),
            words: RwLock::new(terms.into_iter().map(str::to_lowercase).collect()),
        }
    }

    /// The field this dictionary covers.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of known words.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.read().len()
    }

    /// Returns true if no word is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.read().is_empty()
    }

    /// Suggests words for the query term. A `<<a b>>` term is a list of
    /// terms, each suggested for separately.
    #[must_use]
    pub fn query(&self, query: &SuggestionQuery) -> SuggestionQueryResult {
        let term = query.term.trim();
        let terms: Vec<&str> = match term.strip_prefix("<<").and_then(|t| t.strip_suffix(">>")) {
            Some(list) => list.split_whitespace().collect(),
            None => vec![term],
        };

        let words = self.words.read();
        let mut scored: Vec<(f64, &str)> = Vec::new();
        for term in terms {
            let term = term.to_lowercase();
            for word in words.iter() {
                if *word == term {
                    continue;
                }
                let similarity = similarity(&term, word);
                if similarity >= query.accuracy {
                    scored.push((similarity, word));
                }
            }
        }

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        let mut seen = BTreeSet::new();
        let suggestions = scored
            .into_iter()
            .filter(|(_, word)| seen.insert(*word))
            .take(query.max_suggestions)
            .map(|(_, word)| word.to_string())
            .collect();
        SuggestionQueryResult { suggestions }
    }
}

impl IndexExtension for SuggestionIndexExtension {
    fn on_documents_indexed(&self, entries: &[IndexEntry]) {
        let mut words = self.words.write();
        for entry in entries {
            let Some(values) = entry.fields.get(&self.field) else {
                continue;
            };
            for value in values {
                if let Some(text) = value.as_str() {
                    words.extend(text.split_whitespace().map(str::to_lowercase));
                }
            }
        }
    }
}

/// `1 - distance / longest length`.
fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

/// Levenshtein distance over chars.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev_row: Vec<usize> = (0..=b.len()).collect();
    let mut curr_row = vec![0; b.len() + 1];
    for i in 1..=a.len() {
        curr_row[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr_row[j] = (prev_row[j] + 1)
                .min(curr_row[j - 1] + 1)
                .min(prev_row[j - 1] + cost);
        }
        std::mem::swap(&mut prev_row, &mut curr_row);
    }
    prev_row[b.len()]
}
