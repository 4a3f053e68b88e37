//! The reducing pass: re-reduce every key a task names.

use super::WorkEnvironment;
use crate::error::CoreResult;
use crate::storage::MappedResult;
use crate::tasks::TaskKind;
use crate::triggers::IndexUpdateTrigger;
use crate::types::now_ms;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

pub(super) fn execute(env: &WorkEnvironment) -> CoreResult<bool> {
    let max_keys = env.context.current_reduce_batch_size();
    let triggers = env.triggers.active::<dyn IndexUpdateTrigger>();

    env.storage.batch(|a| {
        let tasks = a.take_tasks(TaskKind::Reduce, max_keys)?;
        if tasks.is_empty() {
            return Ok(false);
        }
        let mut by_index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for queued in tasks {
            by_index
                .entry(queued.task.index().to_string())
                .or_default()
                .extend(queued.task.keys().iter().cloned());
        }
        let taken = by_index.values().map(BTreeSet::len).sum();
        env.context.record_reduce_batch(max_keys, taken);

        for (name, keys) in by_index {
            let Some(index) = env.indexes.get(&name) else {
                continue;
            };
            let mut grouped: BTreeMap<String, Vec<MappedResult>> =
                keys.iter().map(|k| (k.clone(), Vec::new())).collect();
            for result in a.mapped_results_for_reduce_keys(&name, &keys)? {
                if let Some(group) = grouped.get_mut(&result.reduce_key) {
                    group.push(result);
                }
            }

            let mut writes = Vec::new();
            let mut deletes = Vec::new();
            let mut errors = 0_u64;
            for (key, results) in &grouped {
                match index.compiled().reduce(key, results) {
                    Ok(Some(entry)) => writes.push(entry),
                    Ok(None) => deletes.push(key.clone()),
                    Err(e) => {
                        errors += 1;
                        env.context.add_error(&name, None, &e);
                    }
                }
            }

            let etag = a.generate_etag();
            let attempts = grouped.len() as u64;
            a.update_index_stats(&name, |s| {
                s.last_reduced_etag = Some(etag);
                s.last_reduced_timestamp_ms = Some(now_ms());
                s.reduce_attempts += attempts;
                s.reduce_errors += errors;
                s.reduce_successes += attempts - errors;
            })?;
            let triggers = triggers.clone();
            a.on_commit(move || {
                index.update(&deletes, writes, &triggers);
                index.mark_reduced(etag);
            })?;
            debug!(index = %name, keys = attempts, errors, "reduced");
        }
        Ok(true)
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::{add_index, environment, put};
    use super::super::Worker;
    use super::*;
    use crate::config::Config;
    use crate::error::CoreError;
    use crate::index::{AggregateDefinition, AggregateOp, IndexDefinition};
    use crate::tasks::Task;
    use serde_json::json;

    fn totals() -> IndexDefinition {
        IndexDefinition::new()
            .from_entity("Orders")
            .map_field("Customer", "Customer")
            .map_field("Amount", "Amount")
            .reduce_by(
                ["Customer"],
                [
                    AggregateDefinition::count("Count"),
                    AggregateDefinition::over("Total", AggregateOp::Sum, "Amount"),
                ],
            )
    }

    #[test]
    fn reduces_groups_and_records_stats() {
        let env = environment(Config::default());
        add_index(&env, "Totals", &totals());
        put(&env, "orders/1", json!({"Customer": "a", "Amount": 5}), "Orders");
        put(&env, "orders/2", json!({"Customer": "a", "Amount": 7}), "Orders");
        put(&env, "orders/3", json!({"Customer": "b", "Amount": 1}), "Orders");

        env.run_once(Worker::Indexing).unwrap();
        assert!(execute(&env).unwrap());

        let index = env.indexes.get("Totals").unwrap();
        let contents = index.contents();
        let a = contents.entry(r#"["a"]"#).unwrap();
        assert_eq!(a.first("Count"), Some(&json!(2)));
        assert_eq!(a.first("Total").and_then(|v| v.as_f64()), Some(12.0));
        drop(contents);

        let stats = env.storage.read(|a| a.index_stats("Totals")).unwrap().unwrap();
        assert_eq!(stats.reduce_attempts, 2);
        assert_eq!(stats.reduce_successes, 2);
        assert_eq!(Some(index.applied().reduced.unwrap()), stats.last_reduced_etag);
        assert!(!execute(&env).unwrap());
    }

    #[test]
    fn rolled_back_reduce_leaves_contents_alone() {
        let env = environment(Config::default());
        add_index(&env, "Totals", &totals());
        put(&env, "orders/1", json!({"Customer": "a", "Amount": 5}), "Orders");
        env.run_once(Worker::Indexing).unwrap();
        let index = env.indexes.get("Totals").unwrap();

        let rolled_back = env.storage.batch(|_| -> CoreResult<()> {
            assert!(execute(&env)?);
            assert!(index.contents().is_empty());
            Err(CoreError::invalid_operation("rollback"))
        });
        assert!(rolled_back.is_err());
        assert!(index.contents().is_empty());
        assert_eq!(index.applied().reduced, None);
        assert!(env.storage.read(|a| a.has_task_for("Totals")).unwrap());

        assert!(execute(&env).unwrap());
        assert_eq!(index.contents().len(), 1);
    }

    #[test]
    fn groups_without_results_are_removed() {
        let env = environment(Config::default());
        add_index(&env, "Totals", &totals());
        put(&env, "orders/1", json!({"Customer": "a", "Amount": 5}), "Orders");
        env.run_until_idle().unwrap();
        assert_eq!(env.indexes.get("Totals").unwrap().contents().len(), 1);

        env.storage
            .batch(|a| {
                a.delete_document("orders/1", None)?;
                a.add_task(Task::remove_from_index("Totals", vec!["orders/1".into()]))
            })
            .unwrap();
        env.run_until_idle().unwrap();
        assert!(env.indexes.get("Totals").unwrap().contents().is_empty());
    }
}
