use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;

use crate::pagination::{DEFAULT_PAGE_SIZE, SHORT_PAGE_SIZE};

pub const SETTINGS_FILE: &str = "feed.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSettings {
    pub server_url: String,
    pub database_url: String,
    pub auth_token: Option<String>,
    pub page_size: usize,
    pub short_page_size: usize,
    /// Offset from UTC, in minutes, of the day boundaries used for sections.
    pub section_utc_offset_minutes: i32,
    pub request_timeout_secs: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8065/api/v4".into(),
            database_url: "sqlite://./data/feed.db".into(),
            auth_token: None,
            page_size: DEFAULT_PAGE_SIZE,
            short_page_size: SHORT_PAGE_SIZE,
            section_utc_offset_minutes: 0,
            request_timeout_secs: 30,
        }
    }
}

impl ClientSettings {
    /// Fixed offset for section bucketing; out-of-range values fall back to UTC.
    pub fn section_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.section_utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Defaults, then `feed.toml` in the working directory, then environment.
pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            apply_file_values(&mut settings, &file_cfg);
        }
    }

    if let Some(v) = env("FEED_SERVER_URL") {
        settings.server_url = v;
    }
    if let Some(v) = env("APP__SERVER_URL") {
        settings.server_url = v;
    }

    if let Some(v) = env("FEED_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = env("APP__AUTH_TOKEN") {
        settings.auth_token = Some(v).filter(|token| !token.is_empty());
    }

    if let Some(parsed) = env("APP__PAGE_SIZE").and_then(|v| v.parse::<usize>().ok()) {
        settings.page_size = parsed;
    }
    if let Some(parsed) = env("APP__SHORT_PAGE_SIZE").and_then(|v| v.parse::<usize>().ok()) {
        settings.short_page_size = parsed;
    }
    if let Some(parsed) =
        env("APP__SECTION_UTC_OFFSET_MINUTES").and_then(|v| v.parse::<i32>().ok())
    {
        settings.section_utc_offset_minutes = parsed;
    }
    if let Some(parsed) = env("APP__REQUEST_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
        settings.request_timeout_secs = parsed;
    }

    settings
}

fn apply_file_values(settings: &mut ClientSettings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("server_url") {
        settings.server_url = v.clone();
    }
    if let Some(v) = file_cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = file_cfg.get("auth_token") {
        settings.auth_token = Some(v.clone());
    }
    if let Some(v) = file_cfg.get("page_size").and_then(|v| v.parse().ok()) {
        settings.page_size = v;
    }
    if let Some(v) = file_cfg.get("short_page_size").and_then(|v| v.parse().ok()) {
        settings.short_page_size = v;
    }
    if let Some(v) = file_cfg
        .get("section_utc_offset_minutes")
        .and_then(|v| v.parse().ok())
    {
        settings.section_utc_offset_minutes = v;
    }
    if let Some(v) = file_cfg
        .get("request_timeout_secs")
        .and_then(|v| v.parse().ok())
    {
        settings.request_timeout_secs = v;
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
        return ClientSettings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
