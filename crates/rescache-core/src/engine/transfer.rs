//! The reporting surface a strategy drives during one transfer

use crate::engine::Buffer;
use crate::error::{CacheError, Result};
use crate::key::ResourceKey;
use crate::Registry;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use rescache_types::ResponseMeta;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outgoing request as watchers may adjust it
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl FetchRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HeaderMap::new(),
        }
    }
}

/// Handed to [`FetchStrategy::start`](crate::engine::FetchStrategy::start)
///
/// Bytes appended here stream into a staging file. Once the attempt has been
/// cancelled or superseded every report becomes a no-op. Dropping the context
/// without calling a `finish` method fails the attempt.
pub struct TransferContext {
    registry: Registry,
    key: ResourceKey,
    attempt: u64,
    token: CancellationToken,
    staging_dir: PathBuf,
    buffer: Option<Buffer>,
    response: Option<ResponseMeta>,
    finished: bool,
}

impl TransferContext {
    pub(crate) fn new(
        registry: Registry,
        key: ResourceKey,
        attempt: u64,
        token: CancellationToken,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            registry,
            key,
            attempt,
            token,
            staging_dir,
            buffer: None,
            response: None,
            finished: false,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn url(&self) -> &Url {
        self.key.url()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the attempt is cancelled or suspended
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Let watchers adjust the request before it goes out
    pub fn will_send_request(&self, request: &mut FetchRequest) {
        self.registry
            .transfer_will_send(&self.key, self.attempt, request);
    }

    /// Negative means unknown
    pub fn set_expected_length(&self, length: i64) {
        self.registry
            .transfer_expected_length(&self.key, self.attempt, length);
    }

    pub fn set_content_type(&self, content_type: impl Into<String>) {
        self.registry
            .transfer_content_type(&self.key, self.attempt, content_type.into());
    }

    /// Response metadata recorded on the resource when the transfer succeeds
    pub fn set_response(&mut self, response: ResponseMeta) {
        self.response = Some(response);
    }

    /// Report progress without appending, for strategies that hand over
    /// their bytes in one piece at the end
    pub fn set_downloaded_length(&self, downloaded: u64) {
        self.registry
            .transfer_progress(&self.key, self.attempt, downloaded);
    }

    pub fn downloaded_length(&self) -> u64 {
        self.buffer.as_ref().map(Buffer::len).unwrap_or(0)
    }

    /// Append a chunk to the staging buffer and report the new length
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        if self.buffer.is_none() {
            self.buffer = Some(Buffer::new_in(&self.staging_dir)?);
        }
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(CacheError::Storage("transfer buffer unavailable".to_string()));
        };
        let downloaded = buffer.append(chunk).await?;
        self.registry
            .transfer_progress(&self.key, self.attempt, downloaded);
        Ok(())
    }

    /// End the attempt; on success the appended bytes become the artifact
    pub async fn finish(mut self, result: Result<()>) {
        self.finished = true;
        if let Err(error) = result {
            self.registry.transfer_failed(&self.key, self.attempt, error);
            return;
        }

        let buffer = match self.buffer.take() {
            Some(buffer) => buffer,
            None => match Buffer::new_in(&self.staging_dir) {
                Ok(buffer) => buffer,
                Err(e) => {
                    self.registry.transfer_failed(&self.key, self.attempt, e);
                    return;
                }
            },
        };

        match buffer.finish().await {
            Ok(finished) => {
                self.registry
                    .transfer_succeeded(&self.key, self.attempt, finished, self.response.take())
                    .await
            }
            Err(e) => self.registry.transfer_failed(&self.key, self.attempt, e),
        }
    }

    /// End the attempt with the whole payload in memory
    pub async fn finish_with_data(mut self, result: Result<Bytes>) {
        match result {
            Ok(data) => {
                let appended = self.append(&data).await;
                self.finish(appended).await
            }
            Err(e) => self.finish(Err(e)).await,
        }
    }
}

impl Drop for TransferContext {
    fn drop(&mut self) {
        if !self.finished {
            self.registry.transfer_failed(
                &self.key,
                self.attempt,
                CacheError::Storage("transfer ended without reporting completion".to_string()),
            );
        }
    }
}
