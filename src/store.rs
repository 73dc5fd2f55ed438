//! Document stores for dead-letter records

use crate::connector::{Document, StoreSession};
use crate::consumer::error::{ConsumerError, ConsumerResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// A store that hands out named sessions
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Open a session on the store called `name`
    async fn open_session(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>>;
}

type CollectionKey = (String, String);

/// In-memory store keyed by store name and collection
#[derive(Clone, Default)]
pub struct MemoryStore {
    documents: Arc<Mutex<HashMap<CollectionKey, Vec<Document>>>>,
    fail_writes: Arc<AtomicBool>,
    open_sessions: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents written to a collection of a named store
    pub fn documents(&self, store: &str, collection: &str) -> Vec<Document> {
        self.documents
            .lock()
            .get(&(store.to_string(), collection.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of documents across all collections
    pub fn total(&self) -> usize {
        self.documents.lock().values().map(Vec::len).sum()
    }

    /// Make every subsequent insert fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Sessions opened and not yet closed
    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn open_session(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>> {
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            store: self.clone(),
            name: name.to_string(),
            closed: false,
        }))
    }
}

struct MemorySession {
    store: MemoryStore,
    name: String,
    closed: bool,
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn insert(&mut self, collection: &str, document: Document) -> ConsumerResult<()> {
        if self.closed {
            return Err(ConsumerError::Store("session is closed".to_string()));
        }
        if self.store.fail_writes.load(Ordering::SeqCst) {
            return Err(ConsumerError::Store(format!(
                "write to {}.{} rejected",
                self.name, collection
            )));
        }
        self.store
            .documents
            .lock()
            .entry((self.name.clone(), collection.to_string()))
            .or_default()
            .push(document);
        Ok(())
    }

    async fn close(&mut self) -> ConsumerResult<()> {
        if !self.closed {
            self.closed = true;
            self.store.open_sessions.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Store writing one JSON document per line to
/// `<root>/<store>/<collection>.jsonl`
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `root`; directories are created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn open_session(&self, name: &str) -> ConsumerResult<Box<dyn StoreSession>> {
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ConsumerError::Store(format!("create {}: {}", dir.display(), e)))?;
        Ok(Box::new(JsonFileSession { dir }))
    }
}

struct JsonFileSession {
    dir: PathBuf,
}

#[async_trait]
impl StoreSession for JsonFileSession {
    async fn insert(&mut self, collection: &str, document: Document) -> ConsumerResult<()> {
        let path = self.dir.join(format!("{}.jsonl", collection));
        let mut line = serde_json::to_vec(&document)
            .map_err(|e| ConsumerError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| ConsumerError::Store(format!("open {}: {}", path.display(), e)))?;
        file.write_all(&line)
            .await
            .map_err(|e| ConsumerError::Store(format!("write {}: {}", path.display(), e)))?;
        file.flush()
            .await
            .map_err(|e| ConsumerError::Store(format!("flush {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "document appended");
        Ok(())
    }

    async fn close(&mut self) -> ConsumerResult<()> {
        Ok(())
    }
}
