//! Index queries.
//!
//! A query string is parsed by [`parser::QueryParser`] into a [`Query`],
//! evaluated against an index's contents by [`engine::execute`], then
//! sorted, paged and re-hydrated by the database.

pub mod ast;
pub mod engine;
pub mod parser;
pub mod ranges;

pub use ast::{BoolQuery, PhraseQuery, PrefixQuery, Query, RangeQuery, TermQuery};
pub use parser::{get_fields, get_fields_for_dynamic_query, translate_field, QueryParser};

use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 128;

pub(crate) fn cached_regex(
    cell: &'static OnceLock<Result<Regex, regex::Error>>,
    pattern: &str,
) -> CoreResult<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern))
        .as_ref()
        .map_err(|e| CoreError::invalid_query(format!("invalid pattern {pattern}: {e}")))
}

/// One sort key; a leading `-` sorts descending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedField {
    /// Field name.
    pub field: String,
    /// Sort descending.
    pub descending: bool,
}

impl SortedField {
    /// Parses `Name` or `-Name`.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: text.strip_prefix('+').unwrap_or(text).to_string(),
                descending: false,
            },
        }
    }
}

/// A query against one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexQuery {
    /// Query string.
    pub query: String,
    /// Results to skip.
    pub start: usize,
    /// Maximum number of results.
    pub page_size: usize,
    /// The index counts as stale if it was not indexed since this time (ms).
    pub cutoff: Option<u64>,
    /// The index counts as stale if documents up to this etag are not
    /// indexed yet.
    pub cutoff_etag: Option<Etag>,
    /// Block until the index is not stale, at most this long.
    pub wait_for_non_stale_results: Option<Duration>,
    /// Project these fields instead of returning documents.
    pub fields_to_fetch: Vec<String>,
    /// Sort keys.
    pub sorted_fields: Vec<SortedField>,
    /// Field searched by bare terms.
    pub default_field: Option<String>,
}

impl Default for IndexQuery {
    fn default() -> Self {
        Self {
            query: String::new(),
            start: 0,
            page_size: DEFAULT_PAGE_SIZE,
            cutoff: None,
            cutoff_etag: None,
            wait_for_non_stale_results: None,
            fields_to_fetch: Vec::new(),
            sorted_fields: Vec::new(),
            default_field: None,
        }
    }
}

impl IndexQuery {
    /// A query for the first page.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    /// Sets the paging window.
    #[must_use]
    pub fn page(mut self, start: usize, page_size: usize) -> Self {
        self.start = start;
        self.page_size = page_size;
        self
    }

    /// Sets the default field.
    #[must_use]
    pub fn default_field(mut self, field: impl Into<String>) -> Self {
        self.default_field = Some(field.into());
        self
    }

    /// Adds a sort key such as `-Age`.
    #[must_use]
    pub fn sort_by(mut self, field: &str) -> Self {
        self.sorted_fields.push(SortedField::parse(field));
        self
    }

    /// Adds a projected field.
    #[must_use]
    pub fn fetch(mut self, field: impl Into<String>) -> Self {
        self.fields_to_fetch.push(field.into());
        self
    }

    /// Waits for the index to catch up, at most `timeout`.
    #[must_use]
    pub fn wait_for_non_stale_results(mut self, timeout: Duration) -> Self {
        self.wait_for_non_stale_results = Some(timeout);
        self
    }

    /// Sets the staleness cutoffs.
    #[must_use]
    pub fn cutoff(mut self, cutoff_ms: Option<u64>, cutoff_etag: Option<Etag>) -> Self {
        self.cutoff = cutoff_ms;
        self.cutoff_etag = cutoff_etag;
        self
    }

    /// Parses the query string.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidQuery`] if the string does not parse.
    pub fn parse(&self) -> CoreResult<Query> {
        QueryParser::new(self.default_field.as_deref()).parse(&self.query)
    }
}

/// A page of query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Documents, projections or reduced entries.
    pub results: Vec<Value>,
    /// Whether the index had not caught up when the query ran.
    pub is_stale: bool,
    /// When the index last indexed (ms).
    pub index_timestamp_ms: u64,
    /// Etag of the index state.
    pub index_etag: Etag,
    /// Hash of the result etags.
    pub result_etag: Etag,
    /// Matches before paging, minus skipped ones.
    pub total_results: usize,
    /// Matches dropped by read triggers or de-duplication.
    pub skipped_results: usize,
}

/// Document keys matching a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDocumentIds {
    /// Matching document keys.
    pub ids: BTreeSet<String>,
    /// Whether the index had not caught up.
    pub is_stale: bool,
}
