//! JSON persistence index
//!
//! One versioned file maps every known URL to its metadata. Writes are
//! debounced through a background task and land atomically via temp file
//! plus rename, so a crash leaves either the old or the new index.

use crate::error::CacheError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rescache_types::ResourceStatus;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bumped whenever the on-disk layout changes; other versions are discarded
pub const INDEX_VERSION: u32 = 1;

/// File name of the index inside the cache root
pub const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    pub version: u32,
    pub resources: Vec<IndexEntry>,
}

impl IndexFile {
    pub fn new(resources: Vec<IndexEntry>) -> Self {
        Self {
            version: INDEX_VERSION,
            resources,
        }
    }
}

/// Persisted metadata of one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub url: String,
    /// Never `InProgress`: transfers do not survive a restart
    pub status: ResourceStatus,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default = "unknown_length")]
    pub expected_length: i64,
    #[serde(default)]
    pub loaded_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_access_date: Option<DateTime<Utc>>,
    /// Milliseconds, 0 disables expiration
    #[serde(default)]
    pub expiration_period_ms: u64,
}

fn unknown_length() -> i64 {
    -1
}

/// Load the index at `path`
///
/// A missing file is an empty index. A corrupt file or a version mismatch is
/// logged and also treated as empty so startup always proceeds.
pub async fn load_index(path: &Path) -> IndexFile {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No index at {}", path.display());
            return IndexFile::new(Vec::new());
        }
        Err(e) => {
            warn!("Failed to read index {}: {}", path.display(), e);
            return IndexFile::new(Vec::new());
        }
    };

    match serde_json::from_slice::<IndexFile>(&raw) {
        Ok(index) if index.version == INDEX_VERSION => {
            info!("Loaded {} index entries", index.resources.len());
            index
        }
        Ok(index) => {
            warn!(
                "Index version {} does not match {}, starting empty",
                index.version, INDEX_VERSION
            );
            IndexFile::new(Vec::new())
        }
        Err(e) => {
            warn!("Corrupt index {}, starting empty: {}", path.display(), e);
            IndexFile::new(Vec::new())
        }
    }
}

/// Serialize and atomically replace the index at `path`
pub async fn save_index(path: &Path, index: &IndexFile) -> Result<(), CacheError> {
    let json = serde_json::to_vec_pretty(index)?;
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| CacheError::Storage(format!("index rename: {}", e.error)))?;
        Ok(())
    })
    .await?
}

// ============================================================================
// Debounced writer
// ============================================================================

struct WriterShared {
    path: PathBuf,
    pending: Mutex<Option<IndexFile>>,
    notify: Notify,
    /// Serializes writes so a slow older snapshot never lands after a newer one
    write_lock: tokio::sync::Mutex<()>,
    writes: AtomicU64,
}

impl WriterShared {
    async fn write_pending(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let Some(snapshot) = self.pending.lock().take() else {
            return Ok(());
        };
        save_index(&self.path, &snapshot).await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!("Index written with {} entries", snapshot.resources.len());
        Ok(())
    }
}

/// Coalesces index snapshots into at most one write per debounce interval
pub struct IndexWriter {
    shared: Arc<WriterShared>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IndexWriter {
    /// Start the writer task; requires a tokio runtime
    pub fn spawn(path: PathBuf, debounce: Duration) -> Self {
        let shared = Arc::new(WriterShared {
            path,
            pending: Mutex::new(None),
            notify: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
            writes: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_writer(shared.clone(), debounce, shutdown.clone()));

        Self {
            shared,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Replace the pending snapshot; never blocks on disk
    pub fn schedule(&self, snapshot: IndexFile) {
        *self.shared.pending.lock() = Some(snapshot);
        self.shared.notify.notify_one();
    }

    /// Write the pending snapshot now, if any
    pub async fn flush(&self) -> Result<(), CacheError> {
        self.shared.write_pending().await
    }

    /// Stop the background task and write whatever is still pending
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.flush().await
    }

    /// Number of completed writes, for diagnostics
    pub fn write_count(&self) -> u64 {
        self.shared.writes.load(Ordering::Relaxed)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_writer(shared: Arc<WriterShared>, debounce: Duration, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = shared.notify.notified() => {}
        }

        if let Err(e) = shared.write_pending().await {
            warn!("Index write failed: {}", e);
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(debounce) => {}
        }
    }
    debug!("Index writer stopped");
}
