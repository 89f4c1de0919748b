//! Per-URL state machine and the public resource handle

use crate::engine::IndexEntry;
use crate::error::{CacheError, Result};
use crate::key::ResourceKey;
use crate::watcher::{CompletionHandler, CompletionOutcome, WatcherId};
use crate::Registry;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rescache_types::{ResourceInfo, ResourceStatus, ResponseMeta};
use std::time::Duration;
use url::Url;

// ============================================================================
// State machine
// ============================================================================

/// What `start` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartOutcome {
    Started,
    AlreadyDownloaded,
}

/// Everything known about one URL, mutated only under the registry lock
///
/// Legal transitions: `NotDownloaded -> InProgress -> {Downloaded | NotDownloaded}`
/// and `Downloaded -> NotDownloaded` via removal or eviction.
pub(crate) struct ResourceState {
    pub key: ResourceKey,
    pub status: ResourceStatus,
    pub content_type: Option<String>,
    /// -1 when unknown
    pub expected_length: i64,
    pub downloaded_length: u64,
    pub progress: f32,
    pub loaded_date: Option<DateTime<Utc>>,
    pub last_access_date: Option<DateTime<Utc>>,
    pub last_error: Option<CacheError>,
    pub last_response: Option<ResponseMeta>,
    pub expiration_period: Duration,
    pub queued: bool,
    /// Cleared by removal so the URL drops out of the index
    pub indexed: bool,
    pub watchers: Vec<WatcherId>,
    pub completion_handlers: Vec<CompletionHandler>,
}

impl ResourceState {
    pub fn new(key: ResourceKey, expiration_period: Duration) -> Self {
        Self {
            key,
            status: ResourceStatus::NotDownloaded,
            content_type: None,
            expected_length: -1,
            downloaded_length: 0,
            progress: 0.0,
            loaded_date: None,
            last_access_date: None,
            last_error: None,
            last_response: None,
            expiration_period,
            queued: false,
            indexed: false,
            watchers: Vec::new(),
            completion_handlers: Vec::new(),
        }
    }

    /// Rebuild from a persisted entry; an in-flight status is never trusted
    pub fn from_index(key: ResourceKey, entry: &IndexEntry) -> Self {
        let mut state = Self::new(key, Duration::from_millis(entry.expiration_period_ms));
        state.content_type = entry.content_type.clone();
        state.loaded_date = entry.loaded_date;
        state.last_access_date = entry.last_access_date;
        state.indexed = true;
        if entry.status == ResourceStatus::Downloaded {
            state.status = ResourceStatus::Downloaded;
            state.expected_length = entry.expected_length;
            state.downloaded_length = u64::try_from(entry.expected_length).unwrap_or(0);
            state.progress = 1.0;
        }
        state
    }

    pub fn to_index(&self) -> IndexEntry {
        let status = match self.status {
            ResourceStatus::InProgress => ResourceStatus::NotDownloaded,
            other => other,
        };
        IndexEntry {
            url: self.key.to_string(),
            status,
            content_type: self.content_type.clone(),
            expected_length: self.expected_length,
            loaded_date: self.loaded_date,
            last_access_date: self.last_access_date,
            expiration_period_ms: u64::try_from(self.expiration_period.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    pub fn snapshot(&self) -> ResourceInfo {
        ResourceInfo {
            url: self.key.to_string(),
            status: self.status,
            content_type: self.content_type.clone(),
            expected_length: self.expected_length,
            downloaded_length: self.downloaded_length,
            progress: self.progress,
            loaded_date: self.loaded_date,
            last_access_date: self.last_access_date,
            last_error: self.last_error.as_ref().map(|e| e.to_string()),
            last_response: self.last_response.clone(),
            expiration_period: self.expiration_period,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == ResourceStatus::InProgress
    }

    pub fn start(&mut self) -> Result<StartOutcome> {
        match self.status {
            ResourceStatus::Downloaded => Ok(StartOutcome::AlreadyDownloaded),
            ResourceStatus::InProgress => Err(CacheError::Busy(self.key.to_string())),
            ResourceStatus::NotDownloaded => {
                self.status = ResourceStatus::InProgress;
                self.queued = false;
                self.indexed = true;
                self.content_type = None;
                self.expected_length = -1;
                self.downloaded_length = 0;
                self.progress = 0.0;
                self.last_error = None;
                self.last_response = None;
                Ok(StartOutcome::Started)
            }
        }
    }

    pub fn set_expected_length(&mut self, length: i64) {
        if self.is_in_progress() {
            self.expected_length = if length < 0 { -1 } else { length };
        }
    }

    pub fn set_content_type(&mut self, content_type: String) {
        if self.is_in_progress() {
            self.content_type = Some(content_type);
        }
    }

    /// Record downloaded bytes; returns the new progress when it moved
    ///
    /// Progress is clamped to `[0, 1]` and never goes backwards within an
    /// attempt. With an unknown length it stays at 0 until success.
    pub fn report_progress(&mut self, downloaded: u64) -> Option<f32> {
        if !self.is_in_progress() {
            return None;
        }
        self.downloaded_length = downloaded;
        if self.expected_length <= 0 {
            return None;
        }
        let ratio = (downloaded as f64 / self.expected_length as f64).clamp(0.0, 1.0) as f32;
        if ratio > self.progress {
            self.progress = ratio;
            Some(ratio)
        } else {
            None
        }
    }

    /// `InProgress -> Downloaded`
    pub fn succeed(&mut self, length: u64, response: Option<ResponseMeta>) -> Result<()> {
        if !self.is_in_progress() {
            return Err(CacheError::Busy(format!(
                "{} is {}, cannot complete",
                self.key, self.status
            )));
        }
        let now = Utc::now();
        self.status = ResourceStatus::Downloaded;
        self.expected_length = i64::try_from(length).unwrap_or(i64::MAX);
        self.downloaded_length = length;
        self.progress = 1.0;
        self.loaded_date = Some(now);
        self.last_access_date = Some(now);
        self.last_error = None;
        if response.is_some() {
            self.last_response = response;
        }
        Ok(())
    }

    /// `InProgress -> NotDownloaded`, recording the error
    pub fn fail(&mut self, error: CacheError) -> Result<()> {
        if !self.is_in_progress() {
            return Err(CacheError::Busy(format!("{} is {}, cannot fail", self.key, self.status)));
        }
        self.reset_transfer();
        self.last_error = Some(error);
        Ok(())
    }

    /// `InProgress -> NotDownloaded` without an error; also used by suspend
    pub fn cancel(&mut self) -> Result<()> {
        if !self.is_in_progress() {
            return Err(CacheError::Busy(format!(
                "{} is {}, cannot cancel",
                self.key, self.status
            )));
        }
        self.reset_transfer();
        Ok(())
    }

    /// Swap the payload of an already downloaded resource
    pub fn replace_payload(&mut self, length: u64) -> Result<()> {
        if self.status != ResourceStatus::Downloaded {
            return Err(CacheError::Busy(format!(
                "{} is {}, cannot replace payload",
                self.key, self.status
            )));
        }
        let now = Utc::now();
        self.content_type = None;
        self.expected_length = i64::try_from(length).unwrap_or(i64::MAX);
        self.downloaded_length = length;
        self.loaded_date = Some(now);
        self.last_access_date = Some(now);
        self.last_response = None;
        Ok(())
    }

    /// `Downloaded -> NotDownloaded` for removal and eviction
    pub fn discard(&mut self) {
        self.status = ResourceStatus::NotDownloaded;
        self.content_type = None;
        self.expected_length = -1;
        self.downloaded_length = 0;
        self.progress = 0.0;
        self.loaded_date = None;
        self.last_access_date = None;
        self.last_response = None;
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_access_date = Some(now);
    }

    /// Expired when a period is set and the last access is older than it
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.status != ResourceStatus::Downloaded || self.expiration_period.is_zero() {
            return false;
        }
        let Some(last) = self.last_access_date.or(self.loaded_date) else {
            return false;
        };
        let Ok(period) = chrono::Duration::from_std(self.expiration_period) else {
            return false;
        };
        now - last > period
    }

    pub fn take_completion_handlers(&mut self) -> Vec<CompletionHandler> {
        std::mem::take(&mut self.completion_handlers)
    }

    pub fn add_watcher(&mut self, id: WatcherId) {
        if !self.watchers.contains(&id) {
            self.watchers.push(id);
        }
    }

    pub fn remove_watcher(&mut self, id: WatcherId) {
        self.watchers.retain(|w| *w != id);
    }

    fn reset_transfer(&mut self) {
        self.status = ResourceStatus::NotDownloaded;
        self.downloaded_length = 0;
        self.progress = 0.0;
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// Handle to the single resource a registry keeps for a URL
///
/// Cheap to clone. Every handle for the same URL observes the same state.
#[derive(Clone)]
pub struct Resource {
    key: ResourceKey,
    registry: Registry,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource").field("url", &self.key.as_str()).finish()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.registry.same_as(&other.registry)
    }
}

impl Resource {
    pub(crate) fn new(key: ResourceKey, registry: Registry) -> Self {
        Self { key, registry }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn url(&self) -> &Url {
        self.key.url()
    }

    /// Point-in-time copy of the resource's state
    pub fn info(&self) -> ResourceInfo {
        self.registry.info_for(&self.key)
    }

    pub fn status(&self) -> ResourceStatus {
        self.info().status
    }

    pub fn progress(&self) -> f32 {
        self.info().progress
    }

    pub fn content_type(&self) -> Option<String> {
        self.info().content_type
    }

    pub fn expected_length(&self) -> i64 {
        self.info().expected_length
    }

    pub fn loaded_date(&self) -> Option<DateTime<Utc>> {
        self.info().loaded_date
    }

    pub fn last_response(&self) -> Option<ResponseMeta> {
        self.info().last_response
    }

    pub fn last_error(&self) -> Option<CacheError> {
        self.registry.last_error_for(&self.key)
    }

    /// Whether the resource is waiting for an admission slot
    pub fn is_queued(&self) -> bool {
        self.registry.is_queued(&self.key)
    }

    /// Request the resource; a no-op when already downloaded
    ///
    /// Fails with [`CacheError::Busy`] while a transfer for it is running or
    /// queued. [`Registry::download`] is the idempotent variant.
    pub fn start(&self) -> Result<()> {
        self.registry.start_key(&self.key)
    }

    pub fn cancel(&self) {
        self.registry.cancel_key(&self.key)
    }

    pub async fn data(&self) -> Result<Bytes> {
        self.registry.data(&self.key).await
    }

    pub async fn set_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.registry.set_data(&self.key, data).await
    }

    pub fn expiration_period(&self) -> Duration {
        self.info().expiration_period
    }

    /// Zero disables expiration
    pub fn set_expiration_period(&self, period: Duration) {
        self.registry.expire_after(&self.key, period)
    }

    pub fn add_watcher(&self, watcher: WatcherId) {
        self.registry.attach_watcher(&self.key, watcher)
    }

    pub fn remove_watcher(&self, watcher: WatcherId) {
        self.registry.detach_watcher(&self.key, watcher)
    }

    /// Fire `handler` once on the next terminal transition
    pub fn add_completion_handler<F>(&self, handler: F)
    where
        F: FnOnce(&ResourceInfo, &CompletionOutcome) + Send + 'static,
    {
        self.registry
            .add_resource_completion_handler(&self.key, Box::new(handler))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> ResourceState {
        ResourceState::new(
            ResourceKey::parse("https://example.com/r").unwrap(),
            Duration::ZERO,
        )
    }

    #[test]
    fn test_happy_path() {
        let mut s = state();
        assert_eq!(s.start().unwrap(), StartOutcome::Started);
        assert_eq!(s.status, ResourceStatus::InProgress);

        s.set_expected_length(200);
        assert_eq!(s.report_progress(50), Some(0.25));
        assert_eq!(s.report_progress(50), None);

        s.succeed(200, None).unwrap();
        assert_eq!(s.status, ResourceStatus::Downloaded);
        assert_eq!(s.progress, 1.0);
        assert!(s.loaded_date.is_some());
        assert_eq!(s.start().unwrap(), StartOutcome::AlreadyDownloaded);
    }

    #[test]
    fn test_no_shortcut_from_not_downloaded_to_downloaded() {
        let mut s = state();
        assert!(s.succeed(10, None).is_err());
        assert_eq!(s.status, ResourceStatus::NotDownloaded);
    }

    #[test]
    fn test_start_while_in_progress_is_busy() {
        let mut s = state();
        s.start().unwrap();
        assert!(matches!(s.start(), Err(CacheError::Busy(_))));
    }

    #[test]
    fn test_progress_clamped_and_monotonic() {
        let mut s = state();
        s.start().unwrap();
        s.set_expected_length(100);
        assert_eq!(s.report_progress(60), Some(0.6));
        assert_eq!(s.report_progress(40), None);
        assert_eq!(s.progress, 0.6);
        assert_eq!(s.report_progress(150), Some(1.0));
    }

    #[test]
    fn test_unknown_length_keeps_progress_at_zero() {
        let mut s = state();
        s.start().unwrap();
        assert_eq!(s.report_progress(4096), None);
        assert_eq!(s.progress, 0.0);
        assert_eq!(s.downloaded_length, 4096);
    }

    #[test]
    fn test_fail_records_error_and_cancel_does_not() {
        let mut s = state();
        s.start().unwrap();
        s.fail(CacheError::http_status(404, "https://example.com/r")).unwrap();
        assert_eq!(s.status, ResourceStatus::NotDownloaded);
        assert!(s.last_error.is_some());

        s.start().unwrap();
        assert!(s.last_error.is_none());
        s.cancel().unwrap();
        assert_eq!(s.status, ResourceStatus::NotDownloaded);
        assert!(s.last_error.is_none());
    }

    #[test]
    fn test_expiration() {
        let mut s = state();
        s.start().unwrap();
        s.succeed(3, None).unwrap();
        let now = Utc::now();
        s.touch(now);
        assert!(!s.is_expired(now + chrono::Duration::days(365)));

        s.expiration_period = Duration::from_secs(1);
        assert!(!s.is_expired(now));
        assert!(s.is_expired(now + chrono::Duration::seconds(2)));
    }

    #[test]
    fn test_index_entry_never_persists_in_progress() {
        let mut s = state();
        s.start().unwrap();
        assert_eq!(s.to_index().status, ResourceStatus::NotDownloaded);

        s.succeed(5, None).unwrap();
        let entry = s.to_index();
        let restored = ResourceState::from_index(s.key.clone(), &entry);
        assert_eq!(restored.status, ResourceStatus::Downloaded);
        assert_eq!(restored.expected_length, 5);
    }
}
