//! Parsed query clauses.

use crate::index::RangeValue;
use std::ops::Bound;

/// A parsed query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// A single value in a field.
    Term(TermQuery),
    /// A quoted value in a field.
    Phrase(PhraseQuery),
    /// A term prefix, written `field:pre*`.
    Prefix(PrefixQuery),
    /// A range, written `field:[a TO b]` or `field:{a TO b}`.
    Range(RangeQuery),
    /// Boolean combination of clauses.
    Bool(BoolQuery),
    /// Every entry, written `*:*` or as an empty query.
    MatchAll,
}

/// Single term query.
#[derive(Debug, Clone, PartialEq)]
pub struct TermQuery {
    /// Field.
    pub field: String,
    /// Unescaped value.
    pub value: String,
}

/// Phrase query: every word of the phrase must match.
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseQuery {
    /// Field.
    pub field: String,
    /// Text between the quotes.
    pub phrase: String,
}

/// Prefix query.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefixQuery {
    /// Field.
    pub field: String,
    /// Prefix, without the trailing `*`.
    pub prefix: String,
}

/// Range query.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeQuery {
    /// Field, without a `_Range` suffix for numeric ranges.
    pub field: String,
    /// Lower bound.
    pub lower: Bound<RangeValue>,
    /// Upper bound.
    pub upper: Bound<RangeValue>,
}

/// Boolean query with must/should/must_not clauses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoolQuery {
    /// All must match.
    pub must: Vec<Query>,
    /// At least one must match when there is no `must` clause.
    pub should: Vec<Query>,
    /// None may match.
    pub must_not: Vec<Query>,
}

impl Query {
    /// Fields the query reads.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Term(q) => vec![q.field.as_str()],
            Self::Phrase(q) => vec![q.field.as_str()],
            Self::Prefix(q) => vec![q.field.as_str()],
            Self::Range(q) => vec![q.field.as_str()],
            Self::Bool(q) => q
                .must
                .iter()
                .chain(&q.should)
                .chain(&q.must_not)
                .flat_map(Query::fields)
                .collect(),
            Self::MatchAll => Vec::new(),
        }
    }
}
