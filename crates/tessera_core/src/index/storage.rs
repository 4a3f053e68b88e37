//! Registered indexes, their definition files and content snapshots.
//!
//! Content snapshot layout:
//!
//! ```text
//! | magic "TIDX" (4) | version (2) | definition hash (32) | indexed etag (16) |
//! | has reduced (1) | reduced etag (16) | length (8) | CBOR contents (N) | crc32 (4) |
//! ```
//!
//! Snapshots are a cache. A snapshot that is missing, damaged, or taken
//! under another definition or at another etag than the stored stats is
//! discarded and the index rebuilt from the documents.

use crate::error::{CoreError, CoreResult};
use crate::etag::Etag;
use crate::index::definition::{CompiledIndex, FieldIndexing, IndexDefinition};
use crate::index::extension::{IndexExtension, SuggestionIndexExtension};
use crate::index::fulltext::{FullTextIndex, IndexEntry};
use crate::triggers::IndexUpdateTrigger;
use crate::wal::compute_crc32;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Magic bytes for index snapshots.
pub const INDEX_MAGIC: [u8; 4] = *b"TIDX";

/// Current index snapshot version.
pub const INDEX_VERSION: u16 = 1;

const HEADER_SIZE: usize = 4 + 2 + 32 + 16 + 1 + 16 + 8;

/// What `put_index` has to do for a name and definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreationOptions {
    /// The same definition is already registered.
    Noop,
    /// Another definition is registered under the name.
    Update,
    /// The name is free.
    Create,
}

/// Etags the contents of an index reflect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedEtags {
    /// Last document etag mapped into the contents.
    pub indexed: Etag,
    /// Last mapped-result etag reduced into the contents.
    pub reduced: Option<Etag>,
}

/// One live index.
pub struct Index {
    compiled: CompiledIndex,
    contents: RwLock<FullTextIndex>,
    applied: Mutex<AppliedEtags>,
    extensions: RwLock<BTreeMap<String, Arc<dyn IndexExtension>>>,
    suggestions: RwLock<BTreeMap<String, Arc<SuggestionIndexExtension>>>,
    restored: bool,
    dirty: AtomicBool,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.compiled.name())
            .field("entries", &self.contents.read().len())
            .field("applied", &*self.applied.lock())
            .finish_non_exhaustive()
    }
}

impl Index {
    /// Creates an empty index.
    #[must_use]
    pub fn new(compiled: CompiledIndex) -> Self {
        let contents = FullTextIndex::new(modes_of(compiled.definition()));
        Self::with_contents(compiled, contents, AppliedEtags::default(), false)
    }

    fn with_contents(
        compiled: CompiledIndex,
        contents: FullTextIndex,
        applied: AppliedEtags,
        restored: bool,
    ) -> Self {
        Self {
            compiled,
            contents: RwLock::new(contents),
            applied: Mutex::new(applied),
            extensions: RwLock::new(BTreeMap::new()),
            suggestions: RwLock::new(BTreeMap::new()),
            restored,
            dirty: AtomicBool::new(false),
        }
    }

    /// Index name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.compiled.name()
    }

    /// The compiled definition.
    #[must_use]
    pub fn compiled(&self) -> &CompiledIndex {
        &self.compiled
    }

    /// Whether the contents came from a snapshot.
    #[must_use]
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Read access to the contents.
    pub fn contents(&self) -> RwLockReadGuard<'_, FullTextIndex> {
        self.contents.read()
    }

    /// Etags the contents reflect.
    #[must_use]
    pub fn applied(&self) -> AppliedEtags {
        *self.applied.lock()
    }

    /// Removes and writes entries, reporting them to update triggers and
    /// extensions.
    pub fn update(
        &self,
        deletes: &[String],
        writes: Vec<IndexEntry>,
        triggers: &[Arc<dyn IndexUpdateTrigger>],
    ) {
        if deletes.is_empty() && writes.is_empty() {
            return;
        }
        let mut batchers: Vec<_> = triggers
            .iter()
            .filter_map(|t| t.create_batcher(self.name()))
            .collect();

        {
            let mut contents = self.contents.write();
            for key in deletes {
                if contents.remove(key).is_some() {
                    for batcher in &mut batchers {
                        batcher.on_index_entry_deleted(key);
                    }
                }
            }
            for entry in &writes {
                contents.remove(&entry.key);
                for batcher in &mut batchers {
                    batcher.on_index_entry_created(&entry.key, entry);
                }
                contents.index(entry.clone());
            }
        }
        self.dirty.store(true, Ordering::Release);

        if !writes.is_empty() {
            for extension in self.extensions.read().values() {
                extension.on_documents_indexed(&writes);
            }
            for suggestion in self.suggestions.read().values() {
                suggestion.on_documents_indexed(&writes);
            }
        }
        for mut batcher in batchers {
            batcher.done();
        }
    }

    /// Records the last mapped document etag.
    pub fn mark_indexed(&self, etag: Etag) {
        self.applied.lock().indexed = etag;
        self.dirty.store(true, Ordering::Release);
    }

    /// Records the last reduced etag.
    pub fn mark_reduced(&self, etag: Etag) {
        self.applied.lock().reduced = Some(etag);
        self.dirty.store(true, Ordering::Release);
    }

    /// Drops every entry so the index can be rebuilt.
    pub fn reset(&self) {
        self.contents.write().clear();
        *self.applied.lock() = AppliedEtags::default();
        self.dirty.store(true, Ordering::Release);
    }

    /// Attaches an extension under a key.
    pub fn set_extension(&self, key: impl Into<String>, extension: Arc<dyn IndexExtension>) {
        self.extensions.write().insert(key.into(), extension);
    }

    /// Extension attached under a key.
    #[must_use]
    pub fn extension(&self, key: &str) -> Option<Arc<dyn IndexExtension>> {
        self.extensions.read().get(key).cloned()
    }

    /// Suggestion dictionary for a field, built from the current terms on
    /// first use.
    pub fn suggestions_for(&self, field: &str) -> Arc<SuggestionIndexExtension> {
        if let Some(existing) = self.suggestions.read().get(field) {
            return Arc::clone(existing);
        }
        let mut suggestions = self.suggestions.write();
        Arc::clone(suggestions.entry(field.to_string()).or_insert_with(|| {
            let contents = self.contents.read();
            Arc::new(SuggestionIndexExtension::new(
                field,
                contents.terms_for_field(field),
            ))
        }))
    }

    fn encode_snapshot(&self) -> CoreResult<Vec<u8>> {
        let contents = self.contents.read();
        let applied = self.applied();

        let mut payload = Vec::new();
        ciborium::ser::into_writer(&*contents, &mut payload).map_err(CoreError::cbor)?;

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len() + 4);
        buf.extend_from_slice(&INDEX_MAGIC);
        buf.extend_from_slice(&INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(self.compiled.hash());
        buf.extend_from_slice(applied.indexed.as_bytes());
        buf.push(u8::from(applied.reduced.is_some()));
        buf.extend_from_slice(applied.reduced.unwrap_or_default().as_bytes());
        buf.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = compute_crc32(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }
}

fn modes_of(definition: &IndexDefinition) -> BTreeMap<String, FieldIndexing> {
    definition.indexes.clone()
}

/// Decodes a content snapshot taken under `hash`.
fn decode_snapshot(bytes: &[u8], hash: &[u8; 32]) -> CoreResult<(FullTextIndex, AppliedEtags)> {
    if bytes.len() < HEADER_SIZE + 4 || bytes[0..4] != INDEX_MAGIC {
        return Err(CoreError::snapshot_corruption("invalid index snapshot header"));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version > INDEX_VERSION {
        return Err(CoreError::snapshot_corruption(format!(
            "unsupported index snapshot version {version}"
        )));
    }
    if &bytes[6..38] != hash {
        return Err(CoreError::snapshot_corruption(
            "index snapshot was taken under another definition",
        ));
    }

    let mut etag = [0u8; 16];
    etag.copy_from_slice(&bytes[38..54]);
    let indexed = Etag::from_bytes(etag);
    etag.copy_from_slice(&bytes[55..71]);
    let reduced = (bytes[54] == 1).then_some(Etag::from_bytes(etag));

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[71..79]);
    let len = usize::try_from(u64::from_le_bytes(len))
        .map_err(|_| CoreError::snapshot_corruption("index snapshot length overflow"))?;
    if bytes.len() != HEADER_SIZE + len + 4 {
        return Err(CoreError::snapshot_corruption("index snapshot length mismatch"));
    }

    let body_end = HEADER_SIZE + len;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&bytes[body_end..]);
    let stored = u32::from_le_bytes(stored);
    let computed = compute_crc32(&bytes[..body_end]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }

    let contents: FullTextIndex = ciborium::de::from_reader(&bytes[HEADER_SIZE..body_end])
        .map_err(|e| CoreError::snapshot_corruption(format!("undecodable index: {e}")))?;
    Ok((contents, AppliedEtags { indexed, reduced }))
}

#[derive(Serialize, Deserialize)]
struct PersistedDefinition {
    name: String,
    definition: IndexDefinition,
}

/// Escapes an index name into a file stem.
fn file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
            stem.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    stem
}

fn write_atomically(path: &Path, bytes: &[u8]) -> CoreResult<()> {
    let temp = path.with_extension("tmp");
    fs::write(&temp, bytes)?;
    fs::rename(&temp, path)?;
    Ok(())
}

fn remove_if_exists(path: &Path) -> CoreResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Every registered index, with its on-disk definitions and snapshots.
#[derive(Debug, Default)]
pub struct IndexStorage {
    definitions_dir: Option<PathBuf>,
    contents_dir: Option<PathBuf>,
    indexes: RwLock<BTreeMap<String, Arc<Index>>>,
}

impl IndexStorage {
    /// Index storage that keeps nothing on disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads every definition under `definitions_dir` and its snapshot
    /// under `contents_dir`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or a definition
    /// file cannot be read or compiled.
    pub fn open(definitions_dir: PathBuf, contents_dir: PathBuf) -> CoreResult<Self> {
        fs::create_dir_all(&definitions_dir)?;
        fs::create_dir_all(&contents_dir)?;

        let mut indexes = BTreeMap::new();
        let mut paths: Vec<PathBuf> = fs::read_dir(&definitions_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        for path in paths {
            let persisted: PersistedDefinition = serde_json::from_slice(&fs::read(&path)?)?;
            let compiled = persisted.definition.compile(&persisted.name)?;
            let snapshot_path = contents_dir.join(format!("{}.tidx", file_stem(&persisted.name)));

            let index = match fs::read(&snapshot_path) {
                Ok(bytes) => match decode_snapshot(&bytes, compiled.hash()) {
                    Ok((mut contents, applied)) => {
                        contents.set_modes(modes_of(compiled.definition()));
                        Index::with_contents(compiled, contents, applied, true)
                    }
                    Err(e) => {
                        tracing::warn!(index = %persisted.name, error = %e, "discarding index snapshot");
                        Index::new(compiled)
                    }
                },
                Err(_) => Index::new(compiled),
            };
            tracing::debug!(index = %persisted.name, restored = index.restored, "loaded index");
            indexes.insert(persisted.name, Arc::new(index));
        }

        Ok(Self {
            definitions_dir: Some(definitions_dir),
            contents_dir: Some(contents_dir),
            indexes: RwLock::new(indexes),
        })
    }

    /// Decides whether `put_index` must create, replace or skip.
    #[must_use]
    pub fn find_creation_options(&self, name: &str, definition: &IndexDefinition) -> IndexCreationOptions {
        match self.indexes.read().get(name) {
            Some(existing) if existing.compiled().definition() == definition => {
                IndexCreationOptions::Noop
            }
            Some(_) => IndexCreationOptions::Update,
            None => IndexCreationOptions::Create,
        }
    }

    /// Persists the definition and builds an empty index. The index is not
    /// visible until [`IndexStorage::register`].
    ///
    /// # Errors
    ///
    /// Returns an error if the definition file cannot be written.
    pub fn create(&self, compiled: CompiledIndex) -> CoreResult<Arc<Index>> {
        if let Some(dir) = &self.definitions_dir {
            let persisted = PersistedDefinition {
                name: compiled.name().to_string(),
                definition: compiled.definition().clone(),
            };
            let path = dir.join(format!("{}.json", file_stem(compiled.name())));
            write_atomically(&path, &serde_json::to_vec_pretty(&persisted)?)?;
        }
        Ok(Arc::new(Index::new(compiled)))
    }

    /// Makes an index visible.
    pub fn register(&self, index: Arc<Index>) {
        self.indexes.write().insert(index.name().to_string(), index);
    }

    /// Unregisters an index and deletes its files. Returns false if the
    /// name was unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed.
    pub fn remove(&self, name: &str) -> CoreResult<bool> {
        let removed = self.indexes.write().remove(name).is_some();
        if let Some(dir) = &self.definitions_dir {
            remove_if_exists(&dir.join(format!("{}.json", file_stem(name))))?;
        }
        if let Some(dir) = &self.contents_dir {
            remove_if_exists(&dir.join(format!("{}.tidx", file_stem(name))))?;
        }
        Ok(removed)
    }

    /// Index by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Index>> {
        self.indexes.read().get(name).cloned()
    }

    /// Every index, ordered by name.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Index>> {
        self.indexes.read().values().cloned().collect()
    }

    /// Every index name, ordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Number of indexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.indexes.read().len()
    }

    /// Returns true if no index is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }

    /// Writes a snapshot of every index changed since its last flush.
    ///
    /// # Errors
    ///
    /// Returns the first write failure.
    pub fn flush(&self) -> CoreResult<()> {
        let Some(dir) = &self.contents_dir else {
            return Ok(());
        };
        for index in self.all() {
            if !index.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            let bytes = index.encode_snapshot()?;
            let path = dir.join(format!("{}.tidx", file_stem(index.name())));
            if let Err(e) = write_atomically(&path, &bytes) {
                index.dirty.store(true, Ordering::Release);
                return Err(e);
            }
            tracing::debug!(index = %index.name(), bytes = bytes.len(), "flushed index");
        }
        Ok(())
    }

    /// Copies every definition file into `destination`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be copied.
    pub fn copy_definitions_to(&self, destination: &Path) -> CoreResult<()> {
        let Some(dir) = &self.definitions_dir else {
            fs::create_dir_all(destination)?;
            for index in self.all() {
                let persisted = PersistedDefinition {
                    name: index.name().to_string(),
                    definition: index.compiled().definition().clone(),
                };
                let path = destination.join(format!("{}.json", file_stem(index.name())));
                fs::write(path, serde_json::to_vec_pretty(&persisted)?)?;
            }
            return Ok(());
        };
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(file_name) = path.file_name() {
                    fs::copy(&path, destination.join(file_name))?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::definition::IndexDefinition;
    use crate::triggers::IndexUpdateBatcher;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn by_name() -> IndexDefinition {
        IndexDefinition::new().map_field("Name", "name")
    }

    fn entry(key: &str, name: &str) -> IndexEntry {
        let mut fields = BTreeMap::new();
        fields.insert("Name".to_string(), vec![json!(name)]);
        IndexEntry {
            key: key.into(),
            document_key: Some(key.into()),
            fields,
        }
    }

    #[test]
    fn file_stems_escape_separators() {
        assert_eq!(file_stem("Users/ByName"), "Users%2FByName");
        assert_eq!(file_stem("a b"), "a%20b");
        assert_eq!(file_stem("plain-name_1.x"), "plain-name_1.x");
    }

    #[test]
    fn creation_options() {
        let storage = IndexStorage::in_memory();
        assert_eq!(storage.find_creation_options("A", &by_name()), IndexCreationOptions::Create);

        let index = storage.create(by_name().compile("A").unwrap()).unwrap();
        assert!(storage.get("A").is_none());
        storage.register(index);

        assert_eq!(storage.find_creation_options("A", &by_name()), IndexCreationOptions::Noop);
        let other = IndexDefinition::new().map_field("Name", "fullName");
        assert_eq!(storage.find_creation_options("A", &other), IndexCreationOptions::Update);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let defs = dir.path().join("IndexDefinitions");
        let contents = dir.path().join("Indexes");

        {
            let storage = IndexStorage::open(defs.clone(), contents.clone()).unwrap();
            let index = storage.create(by_name().compile("Users/ByName").unwrap()).unwrap();
            storage.register(Arc::clone(&index));
            index.update(&[], vec![entry("users/1", "Ann")], &[]);
            index.mark_indexed(Etag::new(1, 7));
            storage.flush().unwrap();
        }

        let storage = IndexStorage::open(defs, contents).unwrap();
        let index = storage.get("Users/ByName").unwrap();
        assert!(index.is_restored());
        assert_eq!(index.applied().indexed, Etag::new(1, 7));
        assert_eq!(index.contents().term("Name", "ann").len(), 1);
    }

    #[test]
    fn snapshot_under_other_definition_is_discarded() {
        let index = Index::new(by_name().compile("A").unwrap());
        index.update(&[], vec![entry("a", "x")], &[]);
        let bytes = index.encode_snapshot().unwrap();

        let other = IndexDefinition::new().map_field("Name", "other").compile("A").unwrap();
        assert!(decode_snapshot(&bytes, other.hash()).is_err());
        assert!(decode_snapshot(&bytes, index.compiled().hash()).is_ok());

        let mut damaged = bytes.clone();
        let last = damaged.len() - 5;
        damaged[last] ^= 0xFF;
        assert!(decode_snapshot(&damaged, index.compiled().hash()).is_err());
    }

    #[test]
    fn remove_deletes_files() {
        let dir = tempdir().unwrap();
        let defs = dir.path().join("defs");
        let storage = IndexStorage::open(defs.clone(), dir.path().join("idx")).unwrap();
        storage.register(storage.create(by_name().compile("A").unwrap()).unwrap());
        assert_eq!(fs::read_dir(&defs).unwrap().count(), 1);

        assert!(storage.remove("A").unwrap());
        assert!(!storage.remove("A").unwrap());
        assert_eq!(fs::read_dir(&defs).unwrap().count(), 0);
    }

    struct CountingTrigger(Arc<AtomicUsize>, Arc<AtomicUsize>);
    struct CountingBatcher(Arc<AtomicUsize>, Arc<AtomicUsize>);

    impl IndexUpdateBatcher for CountingBatcher {
        fn on_index_entry_deleted(&mut self, _entry_key: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_index_entry_created(&mut self, _entry_key: &str, _entry: &IndexEntry) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl IndexUpdateTrigger for CountingTrigger {
        fn create_batcher(&self, _index: &str) -> Option<Box<dyn IndexUpdateBatcher>> {
            Some(Box::new(CountingBatcher(Arc::clone(&self.0), Arc::clone(&self.1))))
        }
    }

    #[test]
    fn update_reports_to_batchers_and_suggestions() {
        let index = Index::new(by_name().compile("A").unwrap());
        let deleted = Arc::new(AtomicUsize::new(0));
        let created = Arc::new(AtomicUsize::new(0));
        let triggers: Vec<Arc<dyn IndexUpdateTrigger>> = vec![Arc::new(CountingTrigger(
            Arc::clone(&deleted),
            Arc::clone(&created),
        ))];

        index.update(&[], vec![entry("a", "Oren")], &triggers);
        let suggestions = index.suggestions_for("Name");
        assert_eq!(suggestions.len(), 1);

        index.update(&["a".to_string(), "missing".to_string()], vec![entry("b", "Ayende")], &triggers);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(suggestions.len(), 2);
        assert_eq!(index.contents().len(), 1);
    }
}
