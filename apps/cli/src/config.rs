//! settings.json handling

use anyhow::{anyhow, Context, Result};
use rescache_types::CacheSettings;
use std::path::{Path, PathBuf};

const SETTINGS_FILE: &str = "settings.json";

/// Keys accepted by `config get` and `config set`
pub const KEYS: &[&str] = &[
    "cache_dir",
    "max_concurrent_downloads",
    "encryption_key",
    "index_debounce_ms",
    "sweep_interval_secs",
    "default_expiration_secs",
    "user_agent",
    "connect_timeout_secs",
    "request_timeout_secs",
];

pub fn settings_path(config_dir: Option<&Path>) -> PathBuf {
    let dir = config_dir.map(Path::to_path_buf).unwrap_or_else(|| {
        dirs::config_dir()
            .map(|d| d.join("rescache"))
            .unwrap_or_else(|| PathBuf::from(".rescache"))
    });
    dir.join(SETTINGS_FILE)
}

/// Settings from `path`, defaults when the file does not exist
pub async fn load_settings(path: &Path) -> Result<CacheSettings> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .with_context(|| format!("Invalid settings file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(CacheSettings::default()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

pub async fn save_settings(path: &Path, settings: &CacheSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn show_optional<T: ToString>(value: &Option<T>) -> String {
    value
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

fn parse_optional<T>(value: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        Ok(Some(value.parse()?))
    }
}

pub fn get_key(settings: &CacheSettings, key: &str) -> Result<String> {
    let value = match key {
        "cache_dir" => settings.cache_dir.display().to_string(),
        "max_concurrent_downloads" => settings.max_concurrent_downloads.to_string(),
        "encryption_key" => match settings.encryption_key {
            Some(_) => "(set)".to_string(),
            None => "none".to_string(),
        },
        "index_debounce_ms" => settings.index_debounce_ms.to_string(),
        "sweep_interval_secs" => show_optional(&settings.sweep_interval_secs),
        "default_expiration_secs" => settings.default_expiration_secs.to_string(),
        "user_agent" => settings.user_agent.clone(),
        "connect_timeout_secs" => show_optional(&settings.connect_timeout_secs),
        "request_timeout_secs" => show_optional(&settings.request_timeout_secs),
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    };
    Ok(value)
}

pub fn set_key(settings: &mut CacheSettings, key: &str, value: &str) -> Result<()> {
    match key {
        "cache_dir" => settings.cache_dir = PathBuf::from(value),
        "max_concurrent_downloads" => {
            let max: usize = value.parse()?;
            if max == 0 {
                return Err(anyhow!("max_concurrent_downloads must be at least 1"));
            }
            settings.max_concurrent_downloads = max;
        }
        "encryption_key" => settings.encryption_key = parse_optional(value)?,
        "index_debounce_ms" => settings.index_debounce_ms = value.parse()?,
        "sweep_interval_secs" => settings.sweep_interval_secs = parse_optional(value)?,
        "default_expiration_secs" => settings.default_expiration_secs = value.parse()?,
        "user_agent" => settings.user_agent = value.to_string(),
        "connect_timeout_secs" => settings.connect_timeout_secs = parse_optional(value)?,
        "request_timeout_secs" => settings.request_timeout_secs = parse_optional(value)?,
        _ => return Err(anyhow!("Unknown config key: {}", key)),
    }
    Ok(())
}
