//! Builder for databases with triggers registered before the first write.

use super::Database;
use crate::config::Config;
use crate::error::CoreResult;
use crate::triggers::{TriggerRegistry, TriggerSlot};
use std::path::Path;
use std::sync::Arc;

/// Collects configuration and triggers, then opens a [`Database`].
///
/// Triggers added here are active before recovery finishes and before the
/// background workers start, so they see every operation.
///
/// ```rust,ignore
/// let db = DatabaseBuilder::new()
///     .config(Config::default().sync_on_commit(false))
///     .trigger::<dyn PutTrigger>(Arc::new(AuditTrigger))
///     .open(Path::new("data"))?;
/// ```
#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    config: Config,
    triggers: TriggerRegistry,
}

impl DatabaseBuilder {
    /// Starts with the default configuration and no triggers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Registers a trigger of kind `K`.
    #[must_use]
    pub fn trigger<K: TriggerSlot + ?Sized>(self, trigger: Arc<K>) -> Self {
        self.triggers.register::<K>(trigger);
        self
    }

    /// Opens or creates the database at `path`.
    ///
    /// # Errors
    ///
    /// Same as [`Database::open_with_config`].
    pub fn open(self, path: &Path) -> CoreResult<Database> {
        Database::open_with_triggers(path, self.config, self.triggers)
    }

    /// Opens a database that lives in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error if the background workers cannot start.
    pub fn open_in_memory(self) -> CoreResult<Database> {
        Database::open_in_memory_with(self.config, self.triggers)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{obj, quiet_config};
    use super::*;
    use crate::error::CoreError;
    use crate::triggers::{PutTrigger, VetoResult};
    use crate::types::{JsonObject, TransactionInformation};
    use serde_json::json;

    struct ReadOnlyUsers;

    impl PutTrigger for ReadOnlyUsers {
        fn allow_put(
            &self,
            key: &str,
            _data: &JsonObject,
            _metadata: &JsonObject,
            _tx: Option<&TransactionInformation>,
        ) -> VetoResult {
            if key.starts_with("users/") {
                VetoResult::Deny("users are read only".into())
            } else {
                VetoResult::Allowed
            }
        }
    }

    #[test]
    fn triggers_are_active_from_the_start() {
        let db = DatabaseBuilder::new()
            .config(quiet_config())
            .trigger::<dyn PutTrigger>(Arc::new(ReadOnlyUsers))
            .open_in_memory()
            .unwrap();
        assert_eq!(db.triggers().trigger_infos().len(), 1);
        let err = db
            .put("users/1", None, obj(json!({"Name": "a"})), JsonObject::new(), None)
            .unwrap_err();
        assert!(matches!(err, CoreError::Veto { .. }));
        db.put("posts/1", None, obj(json!({"Title": "a"})), JsonObject::new(), None)
            .unwrap();
    }
}
