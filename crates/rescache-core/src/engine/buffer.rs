//! File-backed transfer buffer
//!
//! Streamed bytes are appended to a temp file in the store's staging
//! directory so peak memory stays flat for large artifacts. Dropping the
//! buffer at any point deletes the backing file.

use crate::error::CacheError;
use bytes::Bytes;
use std::path::Path;
use tempfile::{NamedTempFile, TempPath};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Append-only byte accumulator
#[derive(Debug)]
pub struct Buffer {
    writer: BufWriter<File>,
    path: TempPath,
    length: u64,
    error_occurred: bool,
}

impl Buffer {
    /// Create an empty buffer backed by a new temp file in `dir`
    pub fn new_in(dir: &Path) -> Result<Self, CacheError> {
        let (file, path) = NamedTempFile::new_in(dir)?.into_parts();
        Ok(Self {
            writer: BufWriter::new(File::from_std(file)),
            path,
            length: 0,
            error_occurred: false,
        })
    }

    /// Append a chunk; a failed write poisons the buffer
    pub async fn append(&mut self, data: &[u8]) -> Result<u64, CacheError> {
        if self.error_occurred {
            return Err(CacheError::Storage("buffer is in error state".to_string()));
        }
        if let Err(e) = self.writer.write_all(data).await {
            self.error_occurred = true;
            return Err(e.into());
        }
        self.length += data.len() as u64;
        Ok(self.length)
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn has_error(&self) -> bool {
        self.error_occurred
    }

    /// Flush and close the backing file
    pub async fn finish(mut self) -> Result<FinishedBuffer, CacheError> {
        if self.error_occurred {
            return Err(CacheError::Storage("buffer is in error state".to_string()));
        }
        self.writer.flush().await?;
        self.writer.get_ref().sync_all().await?;
        Ok(FinishedBuffer {
            path: self.path,
            length: self.length,
        })
    }
}

/// Closed, immutable buffer contents
#[derive(Debug)]
pub struct FinishedBuffer {
    path: TempPath,
    length: u64,
}

impl FinishedBuffer {
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Whole contents in memory
    pub async fn bytes(&self) -> Result<Bytes, CacheError> {
        Ok(Bytes::from(tokio::fs::read(&self.path).await?))
    }

    /// Readable stream over the contents
    pub async fn reader(&self) -> Result<File, CacheError> {
        Ok(File::open(&self.path).await?)
    }

    /// Hand the backing file over, e.g. for an atomic rename
    pub fn into_temp_path(self) -> TempPath {
        self.path
    }
}
