// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable recovery store.
//!
//! Batches flushed with the durable method are written here and picked back up
//! by the queue manager the next time their category is touched, possibly by a
//! later process. All stores share one layout: a namespaced document mapping
//! each identity key to its per-category entry sequences.
//!
//! ```json
//! {
//!   "2333333-42": {
//!     "custom": [{"timestamp": 1, "category": "custom", "target": "a", ...}],
//!     "trace": []
//!   }
//! }
//! ```
//!
//! Slots are per category, so saving, clearing or recovering one category never
//! touches another.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::entry::{Category, Entry};
use crate::errors::StoreError;

type Document = BTreeMap<String, BTreeMap<Category, Vec<Entry>>>;

/// Keyed persistent storage of undelivered entries.
pub trait RecoveryStore: Send + Sync + Debug {
    /// Overwrite the slot for `(identity_key, category)`. Saving an empty
    /// sequence leaves the slot empty.
    fn save(&self, identity_key: &str, category: Category, entries: &[Entry])
        -> Result<(), StoreError>;

    /// Read the slot without clearing it.
    fn load(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError>;

    fn clear(&self, identity_key: &str, category: Category) -> Result<(), StoreError>;

    /// Read and clear the slot as one operation, so concurrent callers can never
    /// both observe the same entries.
    fn take(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError>;
}

/// Build the store described by `config`: file-backed when a storage directory
/// is configured, in memory otherwise.
pub fn from_config(config: &PipelineConfig) -> Result<Arc<dyn RecoveryStore>, StoreError> {
    match &config.storage_dir {
        Some(dir) => Ok(Arc::new(FileStore::new(dir, &config.storage_namespace)?)),
        None => Ok(Arc::new(MemoryStore::default())),
    }
}

fn put(document: &mut Document, identity_key: &str, category: Category, entries: &[Entry]) {
    if entries.is_empty() {
        remove(document, identity_key, category);
        return;
    }
    document
        .entry(identity_key.to_string())
        .or_default()
        .insert(category, entries.to_vec());
}

fn get(document: &Document, identity_key: &str, category: Category) -> Vec<Entry> {
    document
        .get(identity_key)
        .and_then(|slots| slots.get(&category))
        .cloned()
        .unwrap_or_default()
}

fn remove(document: &mut Document, identity_key: &str, category: Category) -> Vec<Entry> {
    let Some(slots) = document.get_mut(identity_key) else {
        return Vec::new();
    };
    let entries = slots.remove(&category).unwrap_or_default();
    if slots.is_empty() {
        document.remove(identity_key);
    }
    entries
}

/// Process-local store. Clones share the same slots, which lets tests model a
/// restart by handing the same store to a fresh pipeline.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    document: Arc<Mutex<Document>>,
}

impl MemoryStore {
    fn with_document<T>(&self, f: impl FnOnce(&mut Document) -> T) -> Result<T, StoreError> {
        let mut document = self.document.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&mut document))
    }
}

impl RecoveryStore for MemoryStore {
    fn save(
        &self,
        identity_key: &str,
        category: Category,
        entries: &[Entry],
    ) -> Result<(), StoreError> {
        self.with_document(|document| put(document, identity_key, category, entries))
    }

    fn load(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        self.with_document(|document| get(document, identity_key, category))
    }

    fn clear(&self, identity_key: &str, category: Category) -> Result<(), StoreError> {
        self.with_document(|document| {
            remove(document, identity_key, category);
        })
    }

    fn take(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        self.with_document(|document| remove(document, identity_key, category))
    }
}

/// Store keeping one JSON document per namespace at `<dir>/<namespace>.json`.
///
/// Every mutation rewrites the document through a temporary file followed by a
/// rename, so a crash mid-write leaves the previous contents in place.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Open the store, creating `dir` if needed. `namespace` must already be a
    /// valid file stem (see [`crate::util::parse_storage_namespace`]).
    pub fn new(dir: impl AsRef<Path>, namespace: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{namespace}.json"));
        debug!("Opened recovery store at {}", path.display());
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_document(&self) -> Result<Document, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Document::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(Document::new());
        }
        match serde_json::from_slice(&bytes) {
            Ok(document) => Ok(document),
            Err(e) => {
                warn!(
                    "Discarding unreadable recovery store {}: {}",
                    self.path.display(),
                    e
                );
                Ok(Document::new())
            }
        }
    }

    fn write_document(&self, document: &Document) -> Result<(), StoreError> {
        if document.is_empty() {
            return match fs::remove_file(&self.path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            };
        }
        let bytes = serde_json::to_vec(document)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn modify<T>(&self, f: impl FnOnce(&mut Document) -> T) -> Result<T, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        let mut document = self.read_document()?;
        let before = document.clone();
        let result = f(&mut document);
        if document != before {
            self.write_document(&document)?;
        }
        Ok(result)
    }
}

impl RecoveryStore for FileStore {
    fn save(
        &self,
        identity_key: &str,
        category: Category,
        entries: &[Entry],
    ) -> Result<(), StoreError> {
        self.modify(|document| put(document, identity_key, category, entries))
    }

    fn load(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        let _guard = self.lock.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(get(&self.read_document()?, identity_key, category))
    }

    fn clear(&self, identity_key: &str, category: Category) -> Result<(), StoreError> {
        self.modify(|document| {
            remove(document, identity_key, category);
        })
    }

    fn take(&self, identity_key: &str, category: Category) -> Result<Vec<Entry>, StoreError> {
        self.modify(|document| remove(document, identity_key, category))
    }
}
