//! Index management.

use super::Database;
use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::index::{IndexCreationOptions, IndexDefinition, SuggestionQuery, SuggestionQueryResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// An index definition with its name, as listed by
/// [`Database::get_indexes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedIndexDefinition {
    /// Index name.
    pub name: String,
    /// Its definition.
    pub definition: IndexDefinition,
}

impl Database {
    /// Creates an index, or replaces the index of that name when the
    /// definition differs. Returns the name, trimmed and without trailing
    /// slashes.
    ///
    /// A new index starts empty; the indexing worker fills it from the
    /// existing documents. Concurrent calls are serialized.
    ///
    /// # Errors
    ///
    /// Returns `InvalidIndexDefinition` if the definition does not compile.
    pub fn put_index(&self, name: &str, definition: IndexDefinition) -> CoreResult<String> {
        self.ensure_open()?;
        let name = normalize_index_name(name);
        let _creating = self.index_creation.lock();
        let indexes = self.index_storage();
        match indexes.find_creation_options(name, &definition) {
            IndexCreationOptions::Noop => return Ok(name.to_string()),
            IndexCreationOptions::Update => {
                definition.compile(name)?;
                info!(index = name, "replacing index definition");
                self.remove_index(name)?;
            }
            IndexCreationOptions::Create => {}
        }

        let compiled = definition.compile(name)?;
        let is_map_reduce = compiled.is_map_reduce();
        let index = indexes.create(compiled)?;
        self.storage()
            .batch(|actions| actions.add_index(name, is_map_reduce))?;
        indexes.register(index);
        self.env.context.clear_errors_for(name);
        self.env.context.notify_about_work();
        info!(index = name, is_map_reduce, "index created");
        Ok(name.to_string())
    }

    /// Deletes an index with its stats, tasks and mapped results. Unknown
    /// names are ignored.
    ///
    /// Concurrency conflicts are retried up to `delete_index_retries`
    /// times. When they never clear, the stats row is left behind and
    /// removed on the next open.
    ///
    /// # Errors
    ///
    /// Returns any other storage error.
    pub fn delete_index(&self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let _creating = self.index_creation.lock();
        self.remove_index(normalize_index_name(name))
    }

    fn remove_index(&self, name: &str) -> CoreResult<()> {
        let removed = self.index_storage().remove(name)?;
        let config = &self.env.config;
        let deleted = retry_on_concurrency(
            name,
            config.delete_index_retries,
            config.delete_index_retry_delay,
            || self.storage().batch(|actions| actions.delete_index(name)),
        );
        match deleted {
            Ok(()) => {}
            Err(e) if e.is_concurrency() => {
                warn!(index = name, error = %e, "leaving orphaned index stats");
            }
            Err(e) => return Err(e),
        }
        self.env.context.clear_errors_for(name);
        if removed {
            info!(index = name, "index deleted");
        }
        Ok(())
    }

    /// Drops every entry and statistic of an index so it is rebuilt from
    /// the documents.
    ///
    /// The in-memory contents are cleared when the reset commits.
    ///
    /// # Errors
    ///
    /// Returns `IndexNotFound` for an unknown name.
    pub fn reset_index(&self, name: &str) -> CoreResult<()> {
        self.ensure_open()?;
        let name = normalize_index_name(name);
        let index = self
            .index_storage()
            .get(name)
            .ok_or_else(|| CoreError::index_not_found(name))?;
        let is_map_reduce = index.compiled().is_map_reduce();
        self.storage().batch(|actions| {
            actions.delete_index(name)?;
            actions.add_index(name, is_map_reduce)?;
            actions.on_commit(move || index.reset())
        })?;
        self.env.context.clear_errors_for(name);
        self.env.context.notify_about_work();
        info!(index = name, "index reset");
        Ok(())
    }

    /// A page of index definitions, ordered by name.
    #[must_use]
    pub fn get_indexes(&self, start: usize, page_size: usize) -> Vec<NamedIndexDefinition> {
        self.index_storage()
            .all()
            .into_iter()
            .skip(start)
            .take(page_size)
            .map(|index| NamedIndexDefinition {
                name: index.name().to_string(),
                definition: index.compiled().definition().clone(),
            })
            .collect()
    }

    /// A page of index names, ordered.
    #[must_use]
    pub fn get_index_names(&self, start: usize, page_size: usize) -> Vec<String> {
        self.index_storage()
            .names()
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect()
    }

    /// Fields a query against the index can address.
    #[must_use]
    pub fn get_index_fields(&self, name: &str) -> Option<Vec<String>> {
        self.index_storage()
            .get(name)
            .map(|index| index.compiled().definition().output_fields())
    }

    /// Definition of an index.
    #[must_use]
    pub fn get_index_definition(&self, name: &str) -> Option<IndexDefinition> {
        self.index_storage()
            .get(name)
            .map(|index| index.compiled().definition().clone())
    }

    /// An etag that changes whenever the answers of the index may change.
    ///
    /// An unknown index, or a `previous` etag that no longer matches, yields
    /// a random etag so that cached answers are never reused.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseClosed` after dispose.
    pub fn get_index_etag(&self, name: &str, previous: Option<Etag>) -> CoreResult<Etag> {
        let Some(index) = self.index_storage().get(name) else {
            return Ok(Etag::random());
        };
        let (is_stale, last_doc_etag, stats) = self.storage().read(|actions| {
            Ok((
                actions.is_stale(name, None, None)?,
                actions.last_document_etag()?,
                actions.index_stats(name)?,
            ))
        })?;

        let mut hasher = Sha256::new();
        hasher.update(index.compiled().hash());
        hasher.update(name.as_bytes());
        hasher.update(last_doc_etag.unwrap_or_default().as_bytes());
        if let Some(stats) = &stats {
            hasher.update(stats.touch_count.to_le_bytes());
            if let Some(reduced) = stats.last_reduced_etag {
                hasher.update(reduced.as_bytes());
            }
        }
        hasher.update([u8::from(is_stale)]);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        let etag = Etag::from_bytes(bytes);

        Ok(match previous {
            Some(previous) if previous != etag => Etag::random(),
            _ => etag,
        })
    }

    /// Terms of an index field close to the query term.
    ///
    /// # Errors
    ///
    /// Returns `IndexNotFound` for an unknown index.
    pub fn suggest(&self, index: &str, query: &SuggestionQuery) -> CoreResult<SuggestionQueryResult> {
        let index = self
            .index_storage()
            .get(index)
            .ok_or_else(|| CoreError::index_not_found(index))?;
        Ok(index.suggestions_for(&query.field).query(query))
    }
}

/// Index names are compared without surrounding whitespace or trailing
/// slashes.
fn normalize_index_name(name: &str) -> &str {
    name.trim().trim_end_matches('/')
}

/// Runs `op`, retrying concurrency conflicts until `attempts` runs were
/// made, sleeping `delay` between them. Other errors return at once.
fn retry_on_concurrency<T>(
    index: &str,
    attempts: usize,
    delay: Duration,
    mut op: impl FnMut() -> CoreResult<T>,
) -> CoreResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_concurrency() && attempt < attempts => {
                warn!(index, attempt, error = %e, "index operation conflicted, retrying");
                attempt += 1;
                thread::sleep(delay);
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{db, entity, obj};
    use super::*;
    use crate::index::AppliedEtags;
    use serde_json::json;
    use tempfile::tempdir;

    fn by_name() -> IndexDefinition {
        IndexDefinition::new()
            .from_entity("Users")
            .map_field("Name", "Name")
    }

    #[test]
    fn put_index_creates_replaces_and_skips() {
        let db = db();
        assert_eq!(db.put_index("Users/ByName", by_name()).unwrap(), "Users/ByName");
        assert_eq!(db.put_index("Users/ByName", by_name()).unwrap(), "Users/ByName");
        assert_eq!(db.get_index_names(0, 10), vec!["Users/ByName"]);
        assert_eq!(db.get_index_fields("Users/ByName"), Some(vec!["Name".to_string()]));

        let replaced = by_name().map_field("Age", "Age");
        db.put_index("Users/ByName", replaced.clone()).unwrap();
        assert_eq!(db.get_index_definition("Users/ByName"), Some(replaced));
        assert_eq!(db.get_indexes(0, 10).len(), 1);

        assert!(matches!(
            db.put_index("", by_name()),
            Err(CoreError::InvalidIndexDefinition { .. })
        ));
        assert!(matches!(
            db.put_index("Users/ByName", IndexDefinition::new()),
            Err(CoreError::InvalidIndexDefinition { .. })
        ));
        assert!(db.get_index_definition("Users/ByName").is_some());
    }

    #[test]
    fn delete_and_reset() {
        let db = db();
        db.put_index("Users/ByName", by_name()).unwrap();
        db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), None)
            .unwrap();
        db.run_background_work().unwrap();
        assert_eq!(db.index_storage().get("Users/ByName").unwrap().contents().len(), 1);

        db.reset_index("Users/ByName").unwrap();
        assert!(db.index_storage().get("Users/ByName").unwrap().contents().is_empty());
        db.run_background_work().unwrap();
        assert_eq!(db.index_storage().get("Users/ByName").unwrap().contents().len(), 1);

        db.delete_index("Users/ByName").unwrap();
        db.delete_index("Users/ByName").unwrap();
        assert!(db.get_index_names(0, 10).is_empty());
        assert!(matches!(
            db.reset_index("Users/ByName"),
            Err(CoreError::IndexNotFound { .. })
        ));
    }

    #[test]
    fn put_index_normalizes_the_name() {
        let db = db();
        assert_eq!(db.put_index("  Users/ByName// ", by_name()).unwrap(), "Users/ByName");
        assert_eq!(db.put_index("Users/ByName", by_name()).unwrap(), "Users/ByName");
        assert_eq!(db.get_index_names(0, 10), vec!["Users/ByName"]);
        assert!(db.storage().read(|a| a.index_stats("Users/ByName")).unwrap().is_some());

        db.reset_index("Users/ByName/").unwrap();
        db.delete_index(" Users/ByName/").unwrap();
        assert!(db.get_index_names(0, 10).is_empty());
    }

    #[test]
    fn concurrent_put_index_registers_one_index() {
        let db = db();
        thread::scope(|scope| {
            for i in 0..8 {
                let db = &db;
                scope.spawn(move || {
                    let definition = if i % 2 == 0 {
                        by_name()
                    } else {
                        by_name().map_field("Age", "Age")
                    };
                    assert_eq!(db.put_index("Users/ByName", definition).unwrap(), "Users/ByName");
                });
            }
        });

        assert_eq!(db.get_indexes(0, 10).len(), 1);
        let registered = db.get_index_definition("Users/ByName").unwrap();
        let stats = db.storage().read(|a| a.index_stats("Users/ByName")).unwrap();
        assert!(stats.is_some());
        db.put("users/1", None, obj(json!({"Name": "a", "Age": 3})), entity("Users"), None)
            .unwrap();
        db.run_background_work().unwrap();
        assert_eq!(db.index_storage().get("Users/ByName").unwrap().contents().len(), 1);
        assert_eq!(db.get_index_definition("Users/ByName"), Some(registered));
    }

    #[test]
    fn reset_clears_contents_only_when_it_commits() {
        let db = db();
        db.put_index("Users/ByName", by_name()).unwrap();
        db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), None)
            .unwrap();
        db.run_background_work().unwrap();
        let index = db.index_storage().get("Users/ByName").unwrap();

        let rolled_back = db.storage().batch(|_| -> CoreResult<()> {
            db.reset_index("Users/ByName")?;
            Err(CoreError::invalid_operation("rollback"))
        });
        assert!(rolled_back.is_err());
        assert_eq!(index.contents().len(), 1);
        let stats = db.storage().read(|a| a.index_stats("Users/ByName")).unwrap().unwrap();
        assert_ne!(stats.last_indexed_etag, Etag::EMPTY);

        db.storage()
            .batch(|_| {
                db.reset_index("Users/ByName")?;
                assert_eq!(index.contents().len(), 1);
                Ok(())
            })
            .unwrap();
        assert!(index.contents().is_empty());
        assert_eq!(index.applied(), AppliedEtags::default());
    }

    #[test]
    fn retries_only_concurrency_conflicts() {
        let conflict = || CoreError::etag_mismatch("DELETE", Etag::new(1, 1), Some(Etag::new(1, 2)));

        let mut calls = 0;
        let result = retry_on_concurrency("Idx", 5, Duration::ZERO, || {
            calls += 1;
            if calls < 3 { Err(conflict()) } else { Ok(calls) }
        });
        assert_eq!(result.unwrap(), 3);

        let mut calls = 0;
        let result: CoreResult<()> = retry_on_concurrency("Idx", 5, Duration::ZERO, || {
            calls += 1;
            Err(CoreError::invalid_operation("broken"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);

        let mut calls = 0;
        let result: CoreResult<()> = retry_on_concurrency("Idx", 4, Duration::ZERO, || {
            calls += 1;
            Err(conflict())
        });
        assert!(result.unwrap_err().is_concurrency());
        assert_eq!(calls, 4);
    }

    #[test]
    fn index_etag_changes_with_the_data() {
        let db = db();
        db.put_index("Users/ByName", by_name()).unwrap();
        let before = db.get_index_etag("Users/ByName", None).unwrap();
        assert_eq!(db.get_index_etag("Users/ByName", Some(before)).unwrap(), before);

        db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), None)
            .unwrap();
        let after = db.get_index_etag("Users/ByName", None).unwrap();
        assert_ne!(after, before);
        assert_ne!(db.get_index_etag("Users/ByName", Some(before)).unwrap(), after);
        assert_ne!(
            db.get_index_etag("Missing", None).unwrap(),
            db.get_index_etag("Missing", None).unwrap()
        );
    }

    #[test]
    fn suggestions_come_from_indexed_terms() {
        let db = db();
        db.put_index("Users/ByName", by_name()).unwrap();
        for (key, name) in [("users/1", "oren"), ("users/2", "ayende"), ("users/3", "orin")] {
            db.put(key, None, obj(json!({ "Name": name })), entity("Users"), None)
                .unwrap();
        }
        db.run_background_work().unwrap();
        let result = db
            .suggest("Users/ByName", &SuggestionQuery::new("oran", "Name"))
            .unwrap();
        assert!(result.suggestions.contains(&"oren".to_string()));
        assert!(!result.suggestions.contains(&"ayende".to_string()));
        assert!(db.suggest("Missing", &SuggestionQuery::new("x", "Name")).is_err());
    }

    #[test]
    fn definitions_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = super::super::tests::quiet_config();
        {
            let db = Database::open_with_config(dir.path(), config.clone()).unwrap();
            db.put_index("Users/ByName", by_name()).unwrap();
            db.put("users/1", None, obj(json!({"Name": "a"})), entity("Users"), None)
                .unwrap();
            db.run_background_work().unwrap();
        }
        let db = Database::open_with_config(dir.path(), config).unwrap();
        assert_eq!(db.get_index_definition("Users/ByName"), Some(by_name()));
        let index = db.index_storage().get("Users/ByName").unwrap();
        assert!(index.is_restored());
        assert_eq!(index.contents().len(), 1);
    }
}
