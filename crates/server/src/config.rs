use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use chrono::Duration;
use serde::Deserialize;
use server_api::{
    ApiConfig, DEFAULT_FEED_CAPACITY, DEFAULT_MAX_MEDIA_BYTES, DEFAULT_STATUS_TTL_HOURS,
    DEFAULT_TYPING_STALE_SECS,
};
use tracing::warn;

/// Matches the typing stale window, so an abandoned record is gone within two
/// windows of its last update.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub push_endpoint: Option<String>,
    pub push_api_key: Option<String>,
    pub typing_stale_secs: i64,
    pub status_ttl_hours: i64,
    pub sweep_interval_secs: u64,
    pub feed_capacity: usize,
    pub prune_invalid_tokens: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            push_endpoint: None,
            push_api_key: None,
            typing_stale_secs: DEFAULT_TYPING_STALE_SECS,
            status_ttl_hours: DEFAULT_STATUS_TTL_HOURS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            feed_capacity: DEFAULT_FEED_CAPACITY,
            prune_invalid_tokens: true,
        }
    }
}

impl Settings {
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            typing_stale_after: Duration::seconds(self.typing_stale_secs),
            status_ttl: Duration::hours(self.status_ttl_hours),
            feed_capacity: self.feed_capacity,
            max_media_bytes: DEFAULT_MAX_MEDIA_BYTES,
        }
    }
}

/// Defaults, then `server.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_overrides(&mut settings, |key| file_cfg.get(key).cloned()),
            Err(err) => warn!(%err, "ignoring unreadable server.toml"),
        }
    }

    apply_overrides(&mut settings, |key| {
        let legacy = match key {
            "bind_addr" => std::env::var("SERVER_BIND").ok(),
            "database_url" => std::env::var("DATABASE_URL").ok(),
            _ => None,
        };
        std::env::var(format!("APP__{}", key.to_ascii_uppercase()))
            .ok()
            .or(legacy)
    });

    settings
}

/// Applies every key `lookup` knows about. Unparseable numbers and flags are
/// logged and leave the previous value in place.
pub fn apply_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = lookup("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("push_endpoint") {
        settings.push_endpoint = Some(v).filter(|v| !v.trim().is_empty());
    }
    if let Some(v) = lookup("push_api_key") {
        settings.push_api_key = Some(v).filter(|v| !v.trim().is_empty());
    }
    parse_into(&lookup, "typing_stale_secs", &mut settings.typing_stale_secs);
    parse_into(&lookup, "status_ttl_hours", &mut settings.status_ttl_hours);
    parse_into(&lookup, "sweep_interval_secs", &mut settings.sweep_interval_secs);
    parse_into(&lookup, "feed_capacity", &mut settings.feed_capacity);
    parse_into(&lookup, "prune_invalid_tokens", &mut settings.prune_invalid_tokens);
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = %raw, "ignoring invalid setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    let path = if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        path
    } else if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        path
    } else if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    } else {
        raw_database_url
    };

    let path = path.replace('\\', "/");
    if is_windows_drive_path(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
