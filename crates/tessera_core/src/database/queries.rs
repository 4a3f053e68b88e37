//! Index queries.

use super::Database;
use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::index::{Index, IndexEntry, DOCUMENT_ID_FIELD};
use crate::query::{engine, IndexQuery, QueryDocumentIds, QueryResult};
use crate::storage::IndexStats;
use crate::triggers::{read_veto_of, IndexQueryTrigger, ReadOperation};
use crate::types::{JsonDocument, JsonObject};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Instant;
use tracing::debug;

impl Database {
    /// Runs a query against an index.
    ///
    /// Map indexes answer with the matching documents, read through the
    /// read triggers; map-reduce indexes answer with their reduced entries.
    /// With `wait_for_non_stale_results` the call blocks until the index
    /// caught up or the timeout passed, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns `IndexNotFound` for an unknown index, `IndexDisabled` when
    /// its failure rate crossed the threshold and `InvalidQuery` when the
    /// query text does not parse.
    pub fn query(&self, index_name: &str, query: IndexQuery) -> CoreResult<QueryResult> {
        self.ensure_open()?;
        let index = self
            .index_storage()
            .get(index_name)
            .ok_or_else(|| CoreError::index_not_found(index_name))?;

        let mut query = query;
        for trigger in self.env.triggers.active::<dyn IndexQueryTrigger>() {
            trigger.process_query(index_name, &mut query);
        }
        let parsed = query.parse()?;

        let (is_stale, stats) = self.wait_for_index(index_name, &query)?;

        let entries = matching_entries(&index, &parsed, &query);
        let total = entries.len();
        let page = self.storage().read(|actions| {
            let mut page = Page::new(query.start, query.page_size);
            let mut seen = HashSet::new();
            for entry in &entries {
                if page.is_full() {
                    break;
                }
                let Some(document_key) = entry.document_key.as_deref() else {
                    page.push(project_entry(entry, &query.fields_to_fetch), None);
                    continue;
                };
                if !seen.insert(document_key.to_string()) {
                    page.skip();
                    continue;
                }
                let doc = actions
                    .document_by_key(document_key, None)?
                    .and_then(|doc| self.env.triggers.process_read(doc, ReadOperation::Query, None));
                match doc {
                    Some(doc) => {
                        let etag = doc.etag;
                        page.push(project_document(&index, entry, &doc, &query.fields_to_fetch), Some(etag));
                    }
                    None => page.skip(),
                }
            }
            Ok(page)
        })?;

        self.stats.record_query();
        let index_etag = self.get_index_etag(index_name, None)?;
        debug!(
            index = index_name,
            total,
            returned = page.results.len(),
            skipped = page.skipped,
            is_stale,
            "query executed"
        );
        Ok(QueryResult {
            result_etag: page.result_etag(),
            results: page.results,
            is_stale,
            index_timestamp_ms: stats.map_or(0, |s| s.last_indexed_timestamp_ms),
            index_etag,
            total_results: total.saturating_sub(page.skipped),
            skipped_results: page.skipped,
        })
    }

    /// Keys of the documents matching a query, without paging or hydration.
    ///
    /// # Errors
    ///
    /// Same as [`Database::query`].
    pub fn query_document_ids(&self, index_name: &str, query: &IndexQuery) -> CoreResult<QueryDocumentIds> {
        self.ensure_open()?;
        let index = self
            .index_storage()
            .get(index_name)
            .ok_or_else(|| CoreError::index_not_found(index_name))?;
        let parsed = query.parse()?;
        let (is_stale, stats) = self.storage().read(|actions| {
            Ok((
                actions.is_stale(index_name, query.cutoff, query.cutoff_etag)?,
                actions.index_stats(index_name)?,
            ))
        })?;
        self.ensure_enabled(index_name, stats.as_ref())?;

        let contents = index.contents();
        let ids = engine::execute(&contents, &parsed)
            .into_iter()
            .filter_map(|key| contents.entry(&key))
            .map(|entry| entry.document_key.clone().unwrap_or_else(|| entry.key.clone()))
            .collect();
        Ok(QueryDocumentIds { ids, is_stale })
    }

    /// Waits for the index to catch up, failing as soon as it is disabled.
    fn wait_for_index(
        &self,
        index_name: &str,
        query: &IndexQuery,
    ) -> CoreResult<(bool, Option<IndexStats>)> {
        let deadline = query.wait_for_non_stale_results.map(|t| Instant::now() + t);
        loop {
            let generation = self.env.context.progress_generation();
            let (is_stale, stats) = self.storage().read(|actions| {
                Ok((
                    actions.is_stale(index_name, query.cutoff, query.cutoff_etag)?,
                    actions.index_stats(index_name)?,
                ))
            })?;
            self.ensure_enabled(index_name, stats.as_ref())?;
            let Some(deadline) = deadline.filter(|_| is_stale) else {
                return Ok((is_stale, stats));
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok((is_stale, stats));
            }
            self.env.context.notify_about_work();
            self.env
                .context
                .wait_for_index_progress(generation, deadline - now);
        }
    }

    fn ensure_enabled(&self, index_name: &str, stats: Option<&IndexStats>) -> CoreResult<()> {
        let Some(stats) = stats else {
            return Ok(());
        };
        let config = &self.env.config;
        let failure =
            stats.failure_rate(config.index_failure_threshold, config.index_failure_min_attempts);
        if !failure.is_invalid() {
            return Ok(());
        }
        let reduce_failed = failure.reduce_failure_rate() > failure.failure_rate();
        let (attempts, errors, failure_rate) = if reduce_failed {
            (failure.reduce_attempts, failure.reduce_errors, failure.reduce_failure_rate())
        } else {
            (failure.attempts, failure.errors, failure.failure_rate())
        };
        Err(CoreError::IndexDisabled {
            index: index_name.to_string(),
            attempts,
            errors,
            failure_rate,
        })
    }
}

/// Matching entries in result order, copied out of the index so no index
/// lock is held while documents are read.
fn matching_entries(
    index: &Index,
    parsed: &crate::query::Query,
    query: &IndexQuery,
) -> Vec<IndexEntry> {
    let contents = index.contents();
    let keys = engine::execute(&contents, parsed);
    let mut entries: Vec<&IndexEntry> = keys.iter().filter_map(|k| contents.entry(k)).collect();
    engine::sort(&mut entries, &query.sorted_fields);
    entries.into_iter().cloned().collect()
}

fn project_entry(entry: &IndexEntry, fields: &[String]) -> Value {
    let object = entry.to_object();
    if fields.is_empty() {
        return Value::Object(object);
    }
    Value::Object(
        object
            .into_iter()
            .filter(|(name, _)| fields.contains(name))
            .collect(),
    )
}

fn project_document(index: &Index, entry: &IndexEntry, doc: &JsonDocument, fields: &[String]) -> Value {
    if fields.is_empty() || read_veto_of(&doc.metadata).is_some() {
        return doc.to_json();
    }
    let mut projection = JsonObject::new();
    for field in fields {
        let value = if index.compiled().is_stored(field) {
            entry.first(field).cloned()
        } else {
            doc.data.get(field).cloned()
        };
        if let Some(value) = value {
            projection.insert(field.clone(), value);
        }
    }
    projection.insert(DOCUMENT_ID_FIELD.into(), Value::String(doc.key.clone()));
    Value::Object(projection)
}

/// Accumulates one page of results while counting what was dropped.
struct Page {
    start: usize,
    page_size: usize,
    position: usize,
    skipped: usize,
    results: Vec<Value>,
    hasher: Sha256,
}

impl Page {
    fn new(start: usize, page_size: usize) -> Self {
        Self {
            start,
            page_size,
            position: 0,
            skipped: 0,
            results: Vec::new(),
            hasher: Sha256::new(),
        }
    }

    fn is_full(&self) -> bool {
        self.results.len() >= self.page_size
    }

    fn skip(&mut self) {
        self.skipped += 1;
    }

    fn push(&mut self, value: Value, etag: Option<Etag>) {
        let position = self.position;
        self.position += 1;
        if position < self.start {
            return;
        }
        match etag {
            Some(etag) => self.hasher.update(etag.as_bytes()),
            None => self.hasher.update(value.to_string().as_bytes()),
        }
        self.results.push(value);
    }

    fn result_etag(&self) -> Etag {
        let digest = self.hasher.clone().finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Etag::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{db, entity, obj};
    use super::*;
    use crate::index::{AggregateDefinition, FieldStorage, IndexDefinition};
    use crate::triggers::ReadTrigger;
    use crate::types::TransactionInformation;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn seeded() -> Database {
        let db = db();
        db.put_index(
            "Users/ByName",
            IndexDefinition::new()
                .from_entity("Users")
                .map_field("Name", "Name")
                .map_field("City", "City")
                .store("City", FieldStorage::Yes),
        )
        .unwrap();
        for (key, name, city) in [
            ("users/1", "oren", "hadera"),
            ("users/2", "ayende", "tel aviv"),
            ("users/3", "arava", "hadera"),
        ] {
            db.put(key, None, obj(json!({ "Name": name, "City": city })), entity("Users"), None)
                .unwrap();
        }
        db.run_background_work().unwrap();
        db
    }

    fn names(result: &QueryResult) -> Vec<String> {
        result
            .results
            .iter()
            .map(|v| v["Name"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn term_query_returns_documents() {
        let db = seeded();
        let result = db
            .query("Users/ByName", IndexQuery::new("City:hadera").sort_by("Name"))
            .unwrap();
        assert!(!result.is_stale);
        assert_eq!(names(&result), vec!["arava", "oren"]);
        assert_eq!(result.total_results, 2);
        assert_eq!(result.results[0]["@metadata"]["@id"], json!("users/3"));
    }

    #[test]
    fn paging_and_sorting() {
        let db = seeded();
        let result = db
            .query("Users/ByName", IndexQuery::new("").sort_by("-Name").page(1, 1))
            .unwrap();
        assert_eq!(names(&result), vec!["ayende"]);
        assert_eq!(result.total_results, 3);
    }

    #[test]
    fn projections_prefer_stored_fields() {
        let db = seeded();
        let result = db
            .query("Users/ByName", IndexQuery::new("Name:oren").fetch("City").fetch("Name"))
            .unwrap();
        assert_eq!(
            result.results,
            vec![json!({"City": "hadera", "Name": "oren", "__document_id": "users/1"})]
        );
    }

    #[test]
    fn stale_until_indexed_and_wait_times_out() {
        let db = seeded();
        db.put("users/4", None, obj(json!({"Name": "new"})), entity("Users"), None)
            .unwrap();
        let started = Instant::now();
        let result = db
            .query(
                "Users/ByName",
                IndexQuery::new("").wait_for_non_stale_results(Duration::from_millis(50)),
            )
            .unwrap();
        assert!(result.is_stale);
        assert!(started.elapsed() >= Duration::from_millis(50));

        db.run_background_work().unwrap();
        let result = db.query("Users/ByName", IndexQuery::new("")).unwrap();
        assert!(!result.is_stale);
        assert_eq!(result.total_results, 4);
    }

    #[test]
    fn result_etag_tracks_the_answer() {
        let db = seeded();
        let first = db.query("Users/ByName", IndexQuery::new("City:hadera")).unwrap();
        let again = db.query("Users/ByName", IndexQuery::new("City:hadera")).unwrap();
        assert_eq!(first.result_etag, again.result_etag);

        db.put("users/1", None, obj(json!({"Name": "oren", "City": "hadera"})), entity("Users"), None)
            .unwrap();
        db.run_background_work().unwrap();
        let changed = db.query("Users/ByName", IndexQuery::new("City:hadera")).unwrap();
        assert_ne!(changed.result_etag, first.result_etag);
    }

    struct HideOren;

    impl ReadTrigger for HideOren {
        fn allow_read(
            &self,
            key: &str,
            _metadata: &JsonObject,
            _operation: ReadOperation,
            _tx: Option<&TransactionInformation>,
        ) -> crate::triggers::ReadVetoResult {
            if key == "users/1" {
                crate::triggers::ReadVetoResult::Ignore
            } else {
                crate::triggers::ReadVetoResult::Allowed
            }
        }
    }

    #[test]
    fn ignored_documents_count_as_skipped() {
        let db = seeded();
        db.register_trigger::<dyn ReadTrigger>(Arc::new(HideOren));
        let result = db.query("Users/ByName", IndexQuery::new("City:hadera")).unwrap();
        assert_eq!(names(&result), vec!["arava"]);
        assert_eq!(result.skipped_results, 1);
        assert_eq!(result.total_results, 1);
    }

    #[test]
    fn map_reduce_returns_reduced_entries() {
        let db = seeded();
        db.put_index(
            "Users/CountByCity",
            IndexDefinition::new()
                .from_entity("Users")
                .map_field("City", "City")
                .reduce_by(["City"], [AggregateDefinition::count("Count")]),
        )
        .unwrap();
        db.run_background_work().unwrap();
        let result = db
            .query("Users/CountByCity", IndexQuery::new("City:hadera"))
            .unwrap();
        assert_eq!(result.results, vec![json!({"City": "hadera", "Count": 2})]);
    }

    #[test]
    fn document_ids_and_errors() {
        let db = seeded();
        let ids = db
            .query_document_ids("Users/ByName", &IndexQuery::new("City:hadera"))
            .unwrap();
        assert_eq!(ids.ids.len(), 2);
        assert!(ids.ids.contains("users/1"));

        assert!(matches!(
            db.query("Missing", IndexQuery::new("")),
            Err(CoreError::IndexNotFound { .. })
        ));
        assert!(db.query("Users/ByName", IndexQuery::new("Name:")).is_err());
    }

    #[test]
    fn failing_index_is_disabled() {
        let db = seeded();
        db.storage()
            .batch(|actions| {
                actions.update_index_stats("Users/ByName", |s| {
                    s.indexing_attempts = 200;
                    s.indexing_errors = 150;
                })
            })
            .unwrap();
        let err = db.query("Users/ByName", IndexQuery::new("")).unwrap_err();
        let CoreError::IndexDisabled { attempts, errors, .. } = err else {
            panic!("expected IndexDisabled, got {err:?}");
        };
        assert_eq!((attempts, errors), (200, 150));
    }

    #[test]
    fn disabled_index_fails_without_waiting() {
        let db = seeded();
        db.storage()
            .batch(|actions| {
                actions.update_index_stats("Users/ByName", |s| {
                    s.indexing_attempts = 200;
                    s.indexing_errors = 150;
                })
            })
            .unwrap();
        db.put("users/4", None, obj(json!({"Name": "new"})), entity("Users"), None)
            .unwrap();

        let started = Instant::now();
        let err = db
            .query(
                "Users/ByName",
                IndexQuery::new("").wait_for_non_stale_results(Duration::from_secs(5)),
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::IndexDisabled { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
