use std::{fs, path::Path};

use serde::Deserialize;
use tracing::warn;

pub const SETTINGS_FILE: &str = "campus_ride.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Capacity of the trip change broadcast channel.
    pub feed_buffer: usize,
    /// Number of straight-line segments returned by `POST /route`.
    pub route_segments: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8787".into(),
            database_url: "sqlite://./data/campus_ride.db".into(),
            feed_buffer: 256,
            route_segments: 8,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    feed_buffer: Option<usize>,
    route_segments: Option<usize>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    file: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(file) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => apply_file_settings(&mut settings, file_cfg),
            Err(error) => warn!(path = %file.display(), %error, "ignoring unreadable settings file"),
        }
    }

    if let Some(v) = env("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Some(v) = env("APP__BIND_ADDR") {
        settings.server_bind = v;
    }

    if let Some(v) = env("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = env("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(parsed) = env("APP__FEED_BUFFER").and_then(|v| v.parse::<usize>().ok()) {
        settings.feed_buffer = parsed.max(1);
    }
    if let Some(parsed) = env("APP__ROUTE_SEGMENTS").and_then(|v| v.parse::<usize>().ok()) {
        settings.route_segments = parsed.max(1);
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.feed_buffer {
        settings.feed_buffer = v.max(1);
    }
    if let Some(v) = file_cfg.route_segments {
        settings.route_segments = v.max(1);
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    normalize_database_url(raw_database_url)
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
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
