//! On-disk artifact store
//!
//! Layout under the cache root:
//! - `artifacts/<md5 of normalized url>` committed artifacts
//! - `staging/` transfer buffers and temp files, same filesystem as `artifacts/`
//!   so every commit is a plain rename

use crate::cipher::Cipher;
use crate::error::CacheError;
use crate::key::ResourceKey;
use bytes::Bytes;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs;
use tracing::{debug, warn};

const ARTIFACTS_DIR: &str = "artifacts";
const STAGING_DIR: &str = "staging";

/// Cipher plus the key string it is applied with
#[derive(Clone)]
struct Sealing {
    cipher: Arc<dyn Cipher>,
    key: String,
}

/// Artifact store keyed by normalized URL
#[derive(Clone)]
pub struct CacheStore {
    artifacts_dir: PathBuf,
    staging_dir: PathBuf,
    sealing: Option<Sealing>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("artifacts_dir", &self.artifacts_dir)
            .field("encrypted", &self.sealing.is_some())
            .finish()
    }
}

impl CacheStore {
    /// Create the store directories under `root`
    ///
    /// Leftovers in `staging/` come from transfers interrupted by a crash and
    /// are discarded.
    pub async fn open(root: &Path) -> Result<Self, CacheError> {
        let artifacts_dir = root.join(ARTIFACTS_DIR);
        let staging_dir = root.join(STAGING_DIR);

        fs::create_dir_all(&artifacts_dir).await?;
        if fs::try_exists(&staging_dir).await? {
            if let Err(e) = fs::remove_dir_all(&staging_dir).await {
                warn!("Failed to clear staging dir {}: {}", staging_dir.display(), e);
            }
        }
        fs::create_dir_all(&staging_dir).await?;

        Ok(Self {
            artifacts_dir,
            staging_dir,
            sealing: None,
        })
    }

    /// Encrypt artifacts at rest with `cipher` under `key`
    pub fn with_cipher(mut self, cipher: Arc<dyn Cipher>, key: impl Into<String>) -> Self {
        self.sealing = Some(Sealing {
            cipher,
            key: key.into(),
        });
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealing.is_some()
    }

    pub fn artifact_path(&self, key: &ResourceKey) -> PathBuf {
        self.artifacts_dir.join(key.artifact_name())
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn contains(&self, key: &ResourceKey) -> bool {
        fs::try_exists(self.artifact_path(key)).await.unwrap_or(false)
    }

    /// Atomically store `data` as the artifact for `key`
    pub async fn write(&self, key: &ResourceKey, data: Bytes) -> Result<(), CacheError> {
        let staged = self.stage_bytes(data).await?;
        self.install(key, staged)
    }

    /// Seal `data` into a temp file ready to be installed
    pub async fn stage_bytes(&self, data: Bytes) -> Result<StagedArtifact, CacheError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.stage_blocking(&data)).await?
    }

    /// Turn a finished transfer buffer into an installable artifact
    ///
    /// Without encryption the buffer file is used as is. With encryption it is
    /// sealed chunk by chunk into a new temp file and the plain buffer is
    /// dropped.
    pub async fn stage_buffer(&self, buffer: TempPath) -> Result<StagedArtifact, CacheError> {
        let Some(sealing) = self.sealing.clone() else {
            return Ok(StagedArtifact { path: buffer });
        };
        let staging_dir = self.staging_dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut plain = BufReader::new(std::fs::File::open(&buffer)?);
            let mut tmp = NamedTempFile::new_in(&staging_dir)?;
            {
                let mut out = BufWriter::new(tmp.as_file_mut());
                sealing.cipher.encrypt_stream(&sealing.key, &mut plain, &mut out)?;
                out.flush()?;
            }
            tmp.as_file().sync_all()?;
            Ok(StagedArtifact {
                path: tmp.into_temp_path(),
            })
        })
        .await?
    }

    /// Rename a staged artifact into place for `key`
    ///
    /// A single rename on the same filesystem, cheap enough to run while the
    /// caller holds its coordination lock. A failure leaves any previous
    /// artifact untouched.
    pub fn install(&self, key: &ResourceKey, staged: StagedArtifact) -> Result<(), CacheError> {
        staged
            .path
            .persist(self.artifact_path(key))
            .map_err(|e| CacheError::Storage(format!("atomic rename: {}", e.error)))?;
        debug!(url = %key, "Artifact installed");
        Ok(())
    }

    /// Read and, if needed, decrypt the artifact for `key`
    pub async fn read(&self, key: &ResourceKey) -> Result<Bytes, CacheError> {
        let raw = match fs::read(self.artifact_path(key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotDownloaded(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        match &self.sealing {
            Some(sealing) => Ok(Bytes::from(sealing.cipher.decrypt(&sealing.key, &raw)?)),
            None => Ok(Bytes::from(raw)),
        }
    }

    /// Delete the artifact for `key`; `false` when there was none
    pub async fn remove(&self, key: &ResourceKey) -> Result<bool, CacheError> {
        match fs::remove_file(self.artifact_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Same as [`remove`](Self::remove) for callers holding a sync lock
    pub fn remove_now(&self, key: &ResourceKey) -> Result<bool, CacheError> {
        match std::fs::remove_file(self.artifact_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn stage_blocking(&self, plain: &[u8]) -> Result<StagedArtifact, CacheError> {
        let sealed;
        let bytes = match &self.sealing {
            Some(sealing) => {
                sealed = sealing.cipher.encrypt(&sealing.key, plain)?;
                sealed.as_slice()
            }
            None => plain,
        };

        let mut tmp = NamedTempFile::new_in(&self.staging_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(StagedArtifact {
            path: tmp.into_temp_path(),
        })
    }
}

/// Artifact bytes sitting in the staging dir; deleted if never installed
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::AesCipher;

    fn key(s: &str) -> ResourceKey {
        ResourceKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let k = key("https://example.com/a.bin");

        store.write(&k, Bytes::from_static(b"hello")).await.unwrap();
        assert!(store.contains(&k).await);
        assert_eq!(store.read(&k).await.unwrap(), Bytes::from_static(b"hello"));

        assert!(store.remove(&k).await.unwrap());
        assert!(!store.remove(&k).await.unwrap());
        assert!(matches!(
            store.read(&k).await,
            Err(CacheError::NotDownloaded(_))
        ));
    }

    #[tokio::test]
    async fn test_encrypted_bytes_differ_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path())
            .await
            .unwrap()
            .with_cipher(Arc::new(AesCipher), "k3y");
        let k = key("https://example.com/secret");

        store.write(&k, Bytes::from_static(b"plain text")).await.unwrap();
        let raw = std::fs::read(store.artifact_path(&k)).unwrap();
        assert_ne!(raw.as_slice(), b"plain text");
        assert_eq!(store.read(&k).await.unwrap(), Bytes::from_static(b"plain text"));
    }

    #[tokio::test]
    async fn test_install_moves_buffer_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path()).await.unwrap();
        let k = key("https://example.com/b");

        let mut tmp = NamedTempFile::new_in(store.staging_dir()).unwrap();
        tmp.write_all(b"streamed").unwrap();
        let staged = store.stage_buffer(tmp.into_temp_path()).await.unwrap();
        store.install(&k, staged).unwrap();

        assert_eq!(store.read(&k).await.unwrap(), Bytes::from_static(b"streamed"));
        let leftovers = std::fs::read_dir(store.staging_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_encrypted_buffer_larger_than_a_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path())
            .await
            .unwrap()
            .with_cipher(Arc::new(AesCipher), "k3y");
        let k = key("https://example.com/large");
        let body: Vec<u8> = (0..200_003u32).map(|i| (i % 253) as u8).collect();

        let mut tmp = NamedTempFile::new_in(store.staging_dir()).unwrap();
        tmp.write_all(&body).unwrap();
        let staged = store.stage_buffer(tmp.into_temp_path()).await.unwrap();
        store.install(&k, staged).unwrap();

        let raw = std::fs::read(store.artifact_path(&k)).unwrap();
        assert_ne!(&raw[16..32], &body[..16]);
        assert_eq!(store.read(&k).await.unwrap(), Bytes::from(body));
        let leftovers = std::fs::read_dir(store.staging_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_dropped_stage_never_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path())
            .await
            .unwrap()
            .with_cipher(Arc::new(AesCipher), "k3y");
        let k = key("https://example.com/c");

        let staged = store.stage_bytes(Bytes::from_static(b"late")).await.unwrap();
        drop(staged);

        assert!(!store.contains(&k).await);
        assert_eq!(std::fs::read_dir(store.staging_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_open_clears_stale_staging() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(STAGING_DIR)).unwrap();
        std::fs::write(dir.path().join(STAGING_DIR).join("partial"), b"x").unwrap();

        let store = CacheStore::open(dir.path()).await.unwrap();
        assert_eq!(std::fs::read_dir(store.staging_dir()).unwrap().count(), 0);
    }
}
