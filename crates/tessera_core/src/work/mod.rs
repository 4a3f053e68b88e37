//! Background indexing and reducing.
//!
//! Two long-running workers share a [`WorkEnvironment`]. The indexing
//! worker removes deleted documents from indexes and maps new documents;
//! the reducing worker folds mapped results into reduced entries. Both
//! sleep on their signal in [`WorkContext`] between passes and stop when
//! the context is cancelled.

mod context;
mod executor;
mod indexing;
mod reducing;

pub use context::{ServerError, WorkContext, Worker};
pub use executor::{BackgroundExecutor, RepeatedAction};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::index::IndexStorage;
use crate::storage::TransactionalStorage;
use crate::triggers::TriggerRegistry;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Key prefix of documents the engine keeps for itself. They are never
/// indexed.
pub const SYSTEM_DOCUMENT_PREFIX: &str = "tessera/";

/// Whether `key` names an engine document.
#[must_use]
pub fn is_system_document(key: &str) -> bool {
    key.len() >= SYSTEM_DOCUMENT_PREFIX.len()
        && key.is_char_boundary(SYSTEM_DOCUMENT_PREFIX.len())
        && key[..SYSTEM_DOCUMENT_PREFIX.len()].eq_ignore_ascii_case(SYSTEM_DOCUMENT_PREFIX)
}

/// Everything a worker pass touches.
#[derive(Debug)]
pub(crate) struct WorkEnvironment {
    pub storage: Arc<TransactionalStorage>,
    pub indexes: Arc<IndexStorage>,
    pub triggers: Arc<TriggerRegistry>,
    pub context: Arc<WorkContext>,
    pub executor: Arc<BackgroundExecutor>,
    pub config: Config,
}

impl WorkEnvironment {
    /// Runs one pass of `worker`. Returns whether it did anything.
    pub fn run_once(&self, worker: Worker) -> CoreResult<bool> {
        match worker {
            Worker::Indexing => indexing::execute(self),
            Worker::Reducing => reducing::execute(self),
        }
    }

    /// Runs both workers on the calling thread until neither finds work.
    pub fn run_until_idle(&self) -> CoreResult<()> {
        loop {
            let indexed = self.run_once(Worker::Indexing)?;
            let reduced = self.run_once(Worker::Reducing)?;
            if indexed || reduced {
                self.context.notify_index_progress();
            } else {
                return Ok(());
            }
        }
    }
}

/// Starts the indexing and reducing threads.
pub(crate) fn spawn_workers(env: &Arc<WorkEnvironment>) -> CoreResult<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(2);
    for (worker, name) in [
        (Worker::Indexing, "tessera-indexing"),
        (Worker::Reducing, "tessera-reducing"),
    ] {
        let env = Arc::clone(env);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_worker(&env, worker))
            .map_err(|e| CoreError::invalid_operation(format!("cannot start {name}: {e}")))?;
        handles.push(handle);
    }
    Ok(handles)
}

fn run_worker(env: &WorkEnvironment, worker: Worker) {
    debug!(?worker, "worker started");
    while !env.context.is_cancelled() {
        match env.run_once(worker) {
            Ok(true) => {
                env.context.notify_index_progress();
                continue;
            }
            Ok(false) => {}
            Err(CoreError::DatabaseClosed) => break,
            Err(e) => error!(?worker, error = %e, "background work failed"),
        }
        env.context.wait_for_work(worker, env.config.worker_poll_interval);
    }
    debug!(?worker, "worker stopped");
}
