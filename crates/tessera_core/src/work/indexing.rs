//! The indexing pass: removals first, then mapping of new documents.

use super::{is_system_document, WorkEnvironment};
use crate::error::CoreResult;
use crate::etag::Etag;
use crate::index::Index;
use crate::storage::{IndexStats, MappedResult, StorageActions};
use crate::tasks::{Task, TaskKind, MAX_REDUCE_KEYS_PER_TASK};
use crate::triggers::{read_veto_of, IndexUpdateTrigger, ReadOperation};
use crate::types::{now_ms, JsonDocument};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A document read for this pass. `doc` is `None` when a read trigger or
/// the system prefix keeps it out of every index.
struct Candidate {
    key: String,
    etag: Etag,
    doc: Option<JsonDocument>,
}

/// Counters of one index over one pass.
#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    attempts: u64,
    errors: u64,
}

impl Outcome {
    fn record(self, stats: &mut IndexStats, last_etag: Etag) {
        stats.last_indexed_etag = stats.last_indexed_etag.max(last_etag);
        stats.last_indexed_timestamp_ms = now_ms();
        stats.indexing_attempts += self.attempts;
        stats.indexing_errors += self.errors;
        stats.indexing_successes += self.attempts - self.errors;
    }
}

pub(super) fn execute(env: &WorkEnvironment) -> CoreResult<bool> {
    let removed = execute_removals(env)?;
    let indexed = index_documents(env)?;
    Ok(removed || indexed)
}

fn execute_removals(env: &WorkEnvironment) -> CoreResult<bool> {
    let triggers = env.triggers.active::<dyn IndexUpdateTrigger>();
    env.storage.batch(|actions| {
        let tasks = actions.take_tasks(TaskKind::RemoveFromIndex, usize::MAX)?;
        if tasks.is_empty() {
            return Ok(false);
        }
        for queued in &tasks {
            let Some(index) = env.indexes.get(queued.task.index()) else {
                continue;
            };
            if index.compiled().is_map_reduce() {
                let mut affected = BTreeSet::new();
                for key in queued.task.keys() {
                    affected.extend(actions.delete_mapped_results(index.name(), key)?);
                }
                queue_reduce(actions, index.name(), affected)?;
            } else {
                let keys: Vec<String> = queued.task.keys().iter().map(|k| k.to_lowercase()).collect();
                let triggers = triggers.clone();
                actions.on_commit(move || index.update(&keys, Vec::new(), &triggers))?;
            }
        }
        debug!(tasks = tasks.len(), "executed removal tasks");
        Ok(true)
    })
}

fn queue_reduce(
    actions: &StorageActions<'_>,
    index: &str,
    keys: BTreeSet<String>,
) -> CoreResult<()> {
    let keys: Vec<String> = keys.into_iter().collect();
    for chunk in keys.chunks(MAX_REDUCE_KEYS_PER_TASK) {
        actions.add_task(Task::reduce(index, chunk.to_vec()))?;
    }
    Ok(())
}

fn index_documents(env: &WorkEnvironment) -> CoreResult<bool> {
    let (stats, last_document) = env
        .storage
        .read(|a| Ok((a.all_index_stats()?, a.last_document_etag()?)))?;
    let Some(last_document) = last_document else {
        return Ok(false);
    };

    let work: Vec<(Arc<Index>, IndexStats)> = stats
        .into_iter()
        .filter(|s| s.last_indexed_etag < last_document)
        .filter(|s| {
            !s.failure_rate(env.config.index_failure_threshold, env.config.index_failure_min_attempts)
                .is_invalid()
        })
        .filter_map(|s| env.indexes.get(&s.name).map(|index| (index, s)))
        .collect();
    let Some(lowest) = work.iter().map(|(_, s)| s.last_indexed_etag).min() else {
        return Ok(false);
    };

    let batch_size = env.context.current_index_batch_size();
    let documents = env.storage.read(|a| a.documents_after(lowest, batch_size))?;
    let Some(last_etag) = documents.last().map(|d| d.etag) else {
        return Ok(false);
    };
    env.context.record_index_batch(batch_size, documents.len());

    let candidates: Vec<Candidate> = documents
        .into_iter()
        .map(|doc| {
            let key = doc.key.clone();
            let etag = doc.etag;
            let doc = if is_system_document(&key) {
                None
            } else {
                env.triggers
                    .process_read(doc, ReadOperation::Index, None)
                    .filter(|d| read_veto_of(&d.metadata).is_none())
            };
            Candidate { key, etag, doc }
        })
        .collect();

    let advanced = env.executor.apply(&work, |(index, stats)| {
        let result = if index.compiled().is_map_reduce() {
            map_reduce_documents(env, index, stats, &candidates, last_etag)
        } else {
            map_documents(env, index, stats, &candidates, last_etag)
        };
        match result {
            Ok(advanced) => advanced.then_some(()),
            Err(e) => {
                warn!(index = %index.name(), error = %e, "indexing pass failed");
                env.context.add_error(index.name(), None, &e);
                None
            }
        }
    });
    debug!(
        documents = candidates.len(),
        indexes = advanced.len(),
        last_etag = %last_etag,
        "indexed documents"
    );
    Ok(!advanced.is_empty())
}

/// Whether `index` is still the registered index of its name and was not
/// reset since `stats` were read.
fn is_unchanged(
    env: &WorkEnvironment,
    a: &StorageActions<'_>,
    index: &Arc<Index>,
    stats: &IndexStats,
) -> CoreResult<bool> {
    let registered = env
        .indexes
        .get(index.name())
        .is_some_and(|current| Arc::ptr_eq(&current, index));
    if !registered {
        return Ok(false);
    }
    Ok(a
        .index_stats(index.name())?
        .is_some_and(|current| current.last_indexed_etag == stats.last_indexed_etag))
}

fn pending_for<'a>(
    candidates: &'a [Candidate],
    stats: &'a IndexStats,
) -> impl Iterator<Item = &'a Candidate> + 'a {
    candidates
        .iter()
        .filter(move |c| c.etag > stats.last_indexed_etag)
}

fn map_documents(
    env: &WorkEnvironment,
    index: &Arc<Index>,
    stats: &IndexStats,
    candidates: &[Candidate],
    last_etag: Etag,
) -> CoreResult<bool> {
    let compiled = index.compiled();
    let mut outcome = Outcome::default();
    let mut writes = Vec::new();
    let mut deletes = Vec::new();

    for candidate in pending_for(candidates, stats) {
        let Some(doc) = candidate
            .doc
            .as_ref()
            .filter(|d| compiled.applies_to(d.entity_name()))
        else {
            deletes.push(candidate.key.to_lowercase());
            continue;
        };
        outcome.attempts += 1;
        match compiled.map_entry(doc) {
            Ok(entry) => writes.push(entry),
            Err(e) => {
                outcome.errors += 1;
                deletes.push(candidate.key.to_lowercase());
                env.context.add_error(index.name(), Some(&doc.key), &e);
            }
        }
    }

    let triggers = env.triggers.active::<dyn IndexUpdateTrigger>();
    env.storage.batch(|a| {
        if !is_unchanged(env, a, index, stats)? {
            return Ok(false);
        }
        let updated = a.update_index_stats(index.name(), |s| outcome.record(s, last_etag))?;
        if updated {
            let index = Arc::clone(index);
            a.on_commit(move || {
                index.update(&deletes, writes, &triggers);
                index.mark_indexed(last_etag);
            })?;
        }
        Ok(updated)
    })
}

fn map_reduce_documents(
    env: &WorkEnvironment,
    index: &Arc<Index>,
    stats: &IndexStats,
    candidates: &[Candidate],
    last_etag: Etag,
) -> CoreResult<bool> {
    let compiled = index.compiled();
    let name = index.name();

    env.storage.batch(|a| {
        if !is_unchanged(env, a, index, stats)? {
            return Ok(false);
        }
        let mut outcome = Outcome::default();
        let mut affected = BTreeSet::new();

        for candidate in pending_for(candidates, stats) {
            affected.extend(a.delete_mapped_results(name, &candidate.key)?);
            let Some(doc) = candidate
                .doc
                .as_ref()
                .filter(|d| compiled.applies_to(d.entity_name()))
            else {
                continue;
            };
            outcome.attempts += 1;
            match compiled.map_results(doc) {
                Ok(results) if results.is_empty() => {}
                Ok(results) => {
                    let mapped: Vec<MappedResult> = results
                        .into_iter()
                        .map(|(reduce_key, value)| {
                            affected.insert(reduce_key.clone());
                            MappedResult {
                                reduce_key,
                                value,
                                etag: a.generate_etag(),
                            }
                        })
                        .collect();
                    a.put_mapped_results(name, &doc.key, mapped)?;
                }
                Err(e) => {
                    outcome.errors += 1;
                    env.context.add_error(name, Some(&doc.key), &e);
                }
            }
        }

        queue_reduce(a, name, affected)?;
        let updated = a.update_index_stats(name, |s| outcome.record(s, last_etag))?;
        if updated {
            let index = Arc::clone(index);
            a.on_commit(move || index.mark_indexed(last_etag))?;
        }
        Ok(updated)
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{add_index, environment, put};
    use super::*;
    use crate::config::Config;
    use crate::index::{FieldConversion, IndexDefinition};
    use crate::triggers::{ReadTrigger, ReadVetoResult};
    use crate::types::{JsonObject, TransactionInformation};
    use serde_json::json;

    fn users_by_name() -> IndexDefinition {
        IndexDefinition::new()
            .from_entity("Users")
            .map_field("Name", "Name")
    }

    #[test]
    fn maps_new_documents_and_advances_stats() {
        let env = environment(Config::default());
        add_index(&env, "Users/ByName", &users_by_name());
        put(&env, "users/1", json!({"Name": "Ayende"}), "Users");
        put(&env, "users/2", json!({"Name": "Oren"}), "Users");
        put(&env, "orders/1", json!({"Name": "not a user"}), "Orders");

        assert!(execute(&env).unwrap());
        let index = env.indexes.get("Users/ByName").unwrap();
        assert_eq!(index.contents().len(), 2);
        assert!(index.contents().entry("users/1").is_some());

        let stats = env
            .storage
            .read(|a| a.index_stats("Users/ByName"))
            .unwrap()
            .unwrap();
        let last = env.storage.read(|a| a.last_document_etag()).unwrap().unwrap();
        assert_eq!(stats.last_indexed_etag, last);
        assert_eq!(stats.indexing_attempts, 2);
        assert_eq!(stats.indexing_successes, 2);
        assert_eq!(index.applied().indexed, last);

        assert!(!execute(&env).unwrap());
    }

    #[test]
    fn removal_tasks_drop_entries() {
        let env = environment(Config::default());
        add_index(&env, "Users/ByName", &users_by_name());
        put(&env, "Users/1", json!({"Name": "Ayende"}), "Users");
        execute(&env).unwrap();

        env.storage
            .batch(|a| {
                a.delete_document("users/1", None)?;
                a.add_task(Task::remove_from_index("Users/ByName", vec!["Users/1".into()]))
            })
            .unwrap();
        assert!(execute(&env).unwrap());
        assert!(env.indexes.get("Users/ByName").unwrap().contents().is_empty());
        assert!(!env.storage.read(|a| a.has_tasks()).unwrap());
    }

    #[test]
    fn pass_over_moved_stats_is_dropped() {
        let env = environment(Config::default());
        add_index(&env, "Users/ByName", &users_by_name());
        put(&env, "users/1", json!({"Name": "Ayende"}), "Users");
        let before = env
            .storage
            .read(|a| a.index_stats("Users/ByName"))
            .unwrap()
            .unwrap();
        assert!(execute(&env).unwrap());

        put(&env, "users/2", json!({"Name": "Oren"}), "Users");
        let candidates: Vec<Candidate> = env
            .storage
            .read(|a| a.documents_after(Etag::EMPTY, 10))
            .unwrap()
            .into_iter()
            .map(|doc| Candidate {
                key: doc.key.clone(),
                etag: doc.etag,
                doc: Some(doc),
            })
            .collect();
        let last = candidates.last().unwrap().etag;
        let index = env.indexes.get("Users/ByName").unwrap();

        assert!(!map_documents(&env, &index, &before, &candidates, last).unwrap());
        assert_eq!(index.contents().len(), 1);
        let stats = env
            .storage
            .read(|a| a.index_stats("Users/ByName"))
            .unwrap()
            .unwrap();
        assert_eq!(stats.indexing_attempts, 1);
        assert!(execute(&env).unwrap());
        assert_eq!(index.contents().len(), 2);
    }

    #[test]
    fn conversion_failures_are_counted() {
        let env = environment(Config::default());
        add_index(
            &env,
            "Users/ByAge",
            &IndexDefinition::new().map_field_with("Age", "Age", FieldConversion::Number),
        );
        put(&env, "users/1", json!({"Age": "not a number"}), "Users");
        put(&env, "users/2", json!({"Age": 30}), "Users");

        execute(&env).unwrap();
        let stats = env
            .storage
            .read(|a| a.index_stats("Users/ByAge"))
            .unwrap()
            .unwrap();
        assert_eq!(stats.indexing_attempts, 2);
        assert_eq!(stats.indexing_errors, 1);
        assert_eq!(stats.indexing_successes, 1);
        assert_eq!(env.context.errors().len(), 1);
        assert_eq!(env.context.errors()[0].document.as_deref(), Some("users/1"));
    }

    struct HideSecrets;

    impl ReadTrigger for HideSecrets {
        fn allow_read(
            &self,
            key: &str,
            _metadata: &JsonObject,
            _operation: ReadOperation,
            _tx: Option<&TransactionInformation>,
        ) -> ReadVetoResult {
            if key.starts_with("secret") {
                ReadVetoResult::Deny("hidden".into())
            } else {
                ReadVetoResult::Allowed
            }
        }
    }

    #[test]
    fn denied_and_system_documents_are_not_indexed() {
        let env = environment(Config::default());
        env.triggers.register::<dyn ReadTrigger>(Arc::new(HideSecrets));
        add_index(&env, "All/ByName", &IndexDefinition::new().map_field("Name", "Name"));
        put(&env, "secret/1", json!({"Name": "x"}), "Secrets");
        put(&env, "Tessera/Backup/Status", json!({"Name": "y"}), "System");
        put(&env, "users/1", json!({"Name": "z"}), "Users");

        execute(&env).unwrap();
        let index = env.indexes.get("All/ByName").unwrap();
        assert_eq!(index.contents().all(), BTreeSet::from(["users/1".to_string()]));
    }

    #[test]
    fn map_reduce_documents_queue_reduce_tasks() {
        let env = environment(Config::default());
        add_index(
            &env,
            "Orders/ByCustomer",
            &IndexDefinition::new()
                .map_field("Customer", "Customer")
                .reduce_by(["Customer"], [crate::index::AggregateDefinition::count("Count")]),
        );
        put(&env, "orders/1", json!({"Customer": "a"}), "Orders");
        put(&env, "orders/2", json!({"Customer": "b"}), "Orders");

        execute(&env).unwrap();
        let results = env
            .storage
            .read(|a| a.mapped_results_for_document("Orders/ByCustomer", "orders/1"))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].reduce_key, r#"["a"]"#);
        assert!(env.storage.read(|a| a.has_task_for("Orders/ByCustomer")).unwrap());
    }
}
