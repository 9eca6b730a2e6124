pub mod collection;

pub use collection::{Collection, UpdateResult};

use crate::document::{document_id, Document, ID_FIELD};
use crate::error::{NestDbError, Result};
use crate::index::{FieldIndex, IndexOptions};
use crate::writer::{PersistFn, WriteFailure, WriteScheduler};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

const DATA_EXTENSION: &str = "json";
const BACKUP_DIR: &str = "_backups";

/// Store-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Quiet period after the last mutation before a collection is written.
    pub write_delay: Duration,
    /// Pretty-print collection files.
    pub pretty: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            write_delay: Duration::from_millis(100),
            pretty: true,
        }
    }
}

impl StoreConfig {
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }
}

/// Description of one index, as returned by [`Store::list_indexes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub field: String,
    pub unique: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectionStats {
    pub documents: usize,
    pub file_size: u64,
    pub indexes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub collections: BTreeMap<String, CollectionStats>,
    pub total_documents: usize,
    pub total_size: u64,
}

/// In-memory state of one collection: documents in insertion order plus the
/// indexes derived from them.
#[derive(Debug)]
pub(crate) struct CollectionData {
    pub(crate) docs: Vec<Document>,
    indexes: Vec<FieldIndex>,
    positions: HashMap<String, usize>,
}

impl CollectionData {
    fn new(docs: Vec<Document>) -> Self {
        let mut data = CollectionData {
            docs,
            indexes: vec![FieldIndex::new(ID_FIELD, true)],
            positions: HashMap::new(),
        };
        data.rebuild_indexes();
        data
    }

    /// Full rescan of every index. Runs after each mutation.
    pub(crate) fn rebuild_indexes(&mut self) {
        self.positions = self
            .docs
            .iter()
            .enumerate()
            .filter_map(|(pos, doc)| document_id(doc).map(|id| (id.to_string(), pos)))
            .collect();
        for index in &mut self.indexes {
            index.rebuild(&self.docs);
        }
    }

    pub(crate) fn index(&self, field: &str) -> Option<&FieldIndex> {
        self.indexes.iter().find(|i| i.field() == field)
    }

    pub(crate) fn unique_indexes(&self) -> impl Iterator<Item = &FieldIndex> {
        self.indexes.iter().filter(|i| i.is_unique())
    }

    pub(crate) fn position_of(&self, id: &str) -> Option<usize> {
        self.positions.get(id).copied()
    }
}

type CollectionMap = HashMap<String, CollectionData>;

struct StoreInner {
    root: PathBuf,
    config: StoreConfig,
    collections: Arc<RwLock<CollectionMap>>,
    writer: WriteScheduler,
    closed: AtomicBool,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Err(e) = self.writer.shutdown() {
            log::error!("Final flush of {} failed: {e}", self.root.display());
        }
    }
}

/// The main entry point for NestDB.
/// Opens a data directory, loads every collection file into memory, and
/// hands out collection handles for CRUD operations. Cloning is cheap; all
/// clones share the same state and writer.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Open a NestDB store at the given data directory, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, StoreConfig::default())
    }

    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let mut collections = CollectionMap::new();
        for file in collection_files(&root)? {
            let Some(name) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_name(name).is_err() {
                log::warn!("Ignoring {}: not a valid collection name", file.display());
                continue;
            }
            let docs = load_collection_file(&file)?;
            log::debug!("Loaded {} documents from {}", docs.len(), file.display());
            collections.insert(name.to_string(), CollectionData::new(docs));
        }

        log::info!(
            "Opened store at {} ({} collections)",
            root.display(),
            collections.len()
        );

        let collections = Arc::new(RwLock::new(collections));
        let persist = persist_fn(root.clone(), Arc::clone(&collections), config.pretty);
        let writer = WriteScheduler::start(config.write_delay, persist)?;

        Ok(Store {
            inner: Arc::new(StoreInner {
                root,
                config,
                collections,
                writer,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Get a handle to a collection. The collection exists in memory from
    /// here on; its file appears with the first mutation.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        validate_name(name)?;
        self.write_state()
            .entry(name.to_string())
            .or_insert_with(|| CollectionData::new(Vec::new()));
        Ok(Collection::new(self.clone(), name.to_string()))
    }

    /// Names of every known collection, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read_state().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Build (or rebuild) an index on `field`. A unique index is refused when
    /// the current data already holds duplicates.
    pub fn create_index(&self, collection: &str, field: &str, options: IndexOptions) -> Result<()> {
        validate_name(collection)?;
        if field.is_empty() {
            return Err(NestDbError::Other("index field must not be empty".to_string()));
        }
        if field == ID_FIELD {
            return Ok(());
        }

        let mut state = self.write_state();
        let data = state
            .entry(collection.to_string())
            .or_insert_with(|| CollectionData::new(Vec::new()));

        let mut index = FieldIndex::new(field, options.unique);
        if options.unique {
            if let Some(value) = index.first_duplicate(&data.docs) {
                return Err(NestDbError::DuplicateKey {
                    collection: collection.to_string(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
        index.rebuild(&data.docs);
        log::debug!(
            "Built {}index {collection}.{field} ({} keys)",
            if options.unique { "unique " } else { "" },
            index.key_count()
        );

        match data.indexes.iter_mut().find(|i| i.field() == field) {
            Some(existing) => *existing = index,
            None => data.indexes.push(index),
        }
        Ok(())
    }

    /// Remove an index. Returns whether one existed.
    pub fn drop_index(&self, collection: &str, field: &str) -> Result<bool> {
        if field == ID_FIELD {
            return Err(NestDbError::Other(format!(
                "the {ID_FIELD} index cannot be dropped"
            )));
        }
        let mut state = self.write_state();
        let Some(data) = state.get_mut(collection) else {
            return Ok(false);
        };
        let before = data.indexes.len();
        data.indexes.retain(|i| i.field() != field);
        Ok(data.indexes.len() != before)
    }

    pub fn list_indexes(&self, collection: &str) -> Vec<IndexInfo> {
        self.read_state()
            .get(collection)
            .map(|data| {
                data.indexes
                    .iter()
                    .map(|i| IndexInfo {
                        field: i.field().to_string(),
                        unique: i.is_unique(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Mark a collection dirty; it is written once the debounce window passes
    /// without further mutations.
    pub fn schedule_write(&self, collection: &str) {
        self.inner.writer.schedule(collection);
    }

    /// Write every dirty collection now.
    pub fn flush(&self) -> Result<()> {
        self.inner.writer.flush()
    }

    /// Final flush; the store accepts no further writes afterwards.
    pub fn shutdown(&self) -> Result<()> {
        {
            let _state = self.write_state();
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        self.inner.writer.shutdown()
    }

    /// Checked by every mutation while it holds the state lock.
    pub(crate) fn ensure_open(&self, collection: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(NestDbError::Persistence {
                collection: collection.to_string(),
                message: "store has been shut down".to_string(),
            });
        }
        Ok(())
    }

    /// Drain failures recorded by background writes since the last call.
    pub fn write_failures(&self) -> Vec<WriteFailure> {
        self.inner.writer.take_failures()
    }

    /// Flush, then copy every collection file into `destination` (default
    /// `<root>/_backups/<timestamp>`). Returns the backup directory.
    pub fn backup(&self, destination: Option<&Path>) -> Result<PathBuf> {
        self.flush()?;

        let target = match destination {
            Some(path) => path.to_path_buf(),
            None => self
                .inner
                .root
                .join(BACKUP_DIR)
                .join(Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()),
        };
        std::fs::create_dir_all(&target)?;

        let mut copied = 0;
        for name in self.collection_names() {
            let source = self.collection_path(&name);
            if !source.exists() {
                continue;
            }
            std::fs::copy(&source, target.join(data_file_name(&name)))?;
            copied += 1;
        }

        log::info!("Backed up {copied} collections to {}", target.display());
        Ok(target)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let state = self.read_state();
        let mut collections = BTreeMap::new();
        for (name, data) in state.iter() {
            let file_size = match std::fs::metadata(self.collection_path(name)) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };
            collections.insert(
                name.clone(),
                CollectionStats {
                    documents: data.docs.len(),
                    file_size,
                    indexes: data.indexes.iter().map(|i| i.field().to_string()).collect(),
                },
            );
        }
        Ok(StoreStats {
            total_documents: collections.values().map(|c| c.documents).sum(),
            total_size: collections.values().map(|c| c.file_size).sum(),
            collections,
        })
    }

    pub(crate) fn collection_path(&self, name: &str) -> PathBuf {
        self.inner.root.join(data_file_name(name))
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, CollectionMap> {
        self.inner
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_state(&self) -> RwLockWriteGuard<'_, CollectionMap> {
        self.inner
            .collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("root", &self.inner.root)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Collection names double as file names.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.starts_with('_')
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if invalid {
        return Err(NestDbError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn data_file_name(name: &str) -> String {
    format!("{name}.{DATA_EXTENSION}")
}

fn collection_files(root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/*.{DATA_EXTENSION}",
        glob::Pattern::escape(&root.to_string_lossy())
    );
    let mut files = Vec::new();
    for entry in glob::glob(&pattern).map_err(|e| NestDbError::Other(format!("Glob error: {e}")))? {
        let path = entry.map_err(|e| NestDbError::Corrupt {
            path: e.path().to_path_buf(),
            reason: e.error().to_string(),
        })?;
        if path.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// Read one collection file. A missing file is an empty collection; anything
/// unreadable or malformed is corruption.
fn load_collection_file(path: &Path) -> Result<Vec<Document>> {
    let corrupt = |reason: String| NestDbError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(corrupt(e.to_string())),
    };
    let values: Vec<Value> =
        serde_json::from_str(&content).map_err(|e| corrupt(format!("not a JSON array: {e}")))?;

    let mut seen = HashSet::new();
    let mut docs = Vec::with_capacity(values.len());
    for (position, value) in values.into_iter().enumerate() {
        let Value::Object(doc) = value else {
            return Err(corrupt(format!("entry {position} is not an object")));
        };
        let id = document_id(&doc)
            .ok_or_else(|| corrupt(format!("entry {position} has no string {ID_FIELD}")))?;
        if !seen.insert(id.to_string()) {
            return Err(corrupt(format!("duplicate {ID_FIELD} '{id}'")));
        }
        docs.push(doc);
    }
    Ok(docs)
}

/// The writer's view of the store: serialize one collection under a read
/// lock, then replace its file atomically.
fn persist_fn(root: PathBuf, collections: Arc<RwLock<CollectionMap>>, pretty: bool) -> PersistFn {
    Arc::new(move |name: &str| {
        let body = {
            let state = collections.read().unwrap_or_else(PoisonError::into_inner);
            let Some(data) = state.get(name) else {
                return Ok(());
            };
            if pretty {
                serde_json::to_string_pretty(&data.docs)?
            } else {
                serde_json::to_string(&data.docs)?
            }
        };
        write_atomic(&root, &root.join(data_file_name(name)), body.as_bytes()).map_err(|e| {
            NestDbError::Persistence {
                collection: name.to_string(),
                message: e.to_string(),
            }
        })
    })
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tempfile::Builder::new()
        .prefix(".nestdb-")
        .suffix(".tmp")
        .tempfile_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(target).map_err(|e| NestDbError::Io(e.error))?;
    Ok(())
}
