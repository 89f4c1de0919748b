//! Shared types for rescache
//!
//! This crate contains the plain data structures shared between the core
//! coordinator and the CLI: resource snapshots, events and settings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Resource Types
// ============================================================================

/// Download status of a resource
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    #[default]
    NotDownloaded,
    InProgress,
    Downloaded,
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceStatus::NotDownloaded => "not downloaded",
            ResourceStatus::InProgress => "in progress",
            ResourceStatus::Downloaded => "downloaded",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a resource, handed to watchers and callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub url: String,
    pub status: ResourceStatus,
    pub content_type: Option<String>,
    /// Expected content length, -1 when unknown
    pub expected_length: i64,
    pub downloaded_length: u64,
    pub progress: f32,
    pub loaded_date: Option<DateTime<Utc>>,
    pub last_access_date: Option<DateTime<Utc>>,
    /// Message of the last failed attempt
    pub last_error: Option<String>,
    /// Response of the last transfer in this session, never persisted
    pub last_response: Option<ResponseMeta>,
    /// Zero means the artifact never expires
    pub expiration_period: Duration,
}

impl ResourceInfo {
    pub fn is_downloaded(&self) -> bool {
        self.status == ResourceStatus::Downloaded
    }

    pub fn length_known(&self) -> bool {
        self.expected_length >= 0
    }
}

/// Response metadata captured from the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub status: u16,
    pub final_url: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseMeta {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events published by the registry to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ResourceEvent {
    StatusChanged {
        url: String,
        status: ResourceStatus,
    },
    WillSendRequest {
        url: String,
    },
    Progress {
        url: String,
        downloaded: u64,
        expected: Option<u64>,
        progress: f32,
    },
    Completed {
        url: String,
        error: Option<String>,
    },
    Cancelled {
        url: String,
    },
    Removed {
        url: String,
    },
    Evicted {
        url: String,
    },
    /// No transfer is active or queued any more
    Idle,
}

impl ResourceEvent {
    pub fn url(&self) -> Option<&str> {
        match self {
            ResourceEvent::StatusChanged { url, .. }
            | ResourceEvent::WillSendRequest { url }
            | ResourceEvent::Progress { url, .. }
            | ResourceEvent::Completed { url, .. }
            | ResourceEvent::Cancelled { url }
            | ResourceEvent::Removed { url }
            | ResourceEvent::Evicted { url } => Some(url),
            ResourceEvent::Idle => None,
        }
    }
}

// ============================================================================
// Settings Types
// ============================================================================

/// Cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Root directory for artifacts and the index file
    pub cache_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// When set, artifacts are encrypted at rest with a key derived from it
    pub encryption_key: Option<String>,
    /// Minimum spacing between two index writes
    pub index_debounce_ms: u64,
    /// Periodic expiration sweep, disabled when unset
    pub sweep_interval_secs: Option<u64>,
    /// Expiration period given to newly created resources, 0 = never
    pub default_expiration_secs: u64,
    pub user_agent: String,
    pub connect_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            cache_dir: dirs::cache_dir()
                .map(|p| p.join("rescache"))
                .unwrap_or_else(|| PathBuf::from(".rescache")),
            max_concurrent_downloads: 10,
            encryption_key: None,
            index_debounce_ms: 1000,
            sweep_interval_secs: None,
            default_expiration_secs: 0,
            user_agent: format!("rescache/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: Some(30),
            request_timeout_secs: None,
        }
    }
}

impl CacheSettings {
    /// Settings rooted at `cache_dir`, everything else default
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }

    pub fn index_debounce(&self) -> Duration {
        Duration::from_millis(self.index_debounce_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn default_expiration(&self) -> Duration {
        Duration::from_secs(self.default_expiration_secs)
    }
}
