use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Maximum number of rank windows the range cache holds.
    pub cache_capacity: u64,
    pub cache_ttl_seconds: u64,
    /// Outbound frames buffered per realtime session before frames are dropped.
    pub session_buffer: usize,
    pub request_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/messages.db".into(),
            cache_capacity: 1_000,
            cache_ttl_seconds: 300,
            session_buffer: 64,
            request_timeout_seconds: 10,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        match toml::from_str::<HashMap<String, String>>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, &file_cfg),
            Err(error) => warn!(%error, "ignoring unreadable server.toml"),
        }
    }

    apply_env_settings(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: &HashMap<String, String>) {
    if let Some(v) = file_cfg.get("bind_addr") {
        settings.server_bind = v.clone();
    }
    if let Some(v) = file_cfg.get("database_url") {
        settings.database_url = v.clone();
    }
    if let Some(v) = file_cfg.get("cache_capacity") {
        set_parsed(&mut settings.cache_capacity, "cache_capacity", v);
    }
    if let Some(v) = file_cfg.get("cache_ttl_seconds") {
        set_parsed(&mut settings.cache_ttl_seconds, "cache_ttl_seconds", v);
    }
    if let Some(v) = file_cfg.get("session_buffer") {
        set_parsed(&mut settings.session_buffer, "session_buffer", v);
    }
    if let Some(v) = file_cfg.get("request_timeout_seconds") {
        set_parsed(
            &mut settings.request_timeout_seconds,
            "request_timeout_seconds",
            v,
        );
    }
}

/// Later keys win, so `APP__*` overrides the short legacy names.
fn apply_env_settings(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = var(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = var(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = var("APP__CACHE_CAPACITY") {
        set_parsed(&mut settings.cache_capacity, "APP__CACHE_CAPACITY", &v);
    }
    if let Some(v) = var("APP__CACHE_TTL_SECONDS") {
        set_parsed(&mut settings.cache_ttl_seconds, "APP__CACHE_TTL_SECONDS", &v);
    }
    if let Some(v) = var("APP__SESSION_BUFFER") {
        set_parsed(&mut settings.session_buffer, "APP__SESSION_BUFFER", &v);
    }
    if let Some(v) = var("APP__REQUEST_TIMEOUT_SECONDS") {
        set_parsed(
            &mut settings.request_timeout_seconds,
            "APP__REQUEST_TIMEOUT_SECONDS",
            &v,
        );
    }
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(key, value = raw, "ignoring non-numeric setting"),
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
