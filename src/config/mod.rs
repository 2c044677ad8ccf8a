//! Configuration loading: defaults -> YAML file -> environment overrides.
//!
//! The teacher resolves nearly all of its runtime configuration through
//! ad hoc `env::var(...).ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! calls scattered through `main.rs`. That pattern is kept here, just
//! collected into one place and layered on top of a YAML file, following
//! the precedence chain documented in
//! `other_examples/539ff8b3_szilu-syncr__src-config.rs.rs`
//! (defaults -> file -> env -> CLI flags; this crate has no config-affecting
//! CLI flags beyond `--dry-run`/`--user`, applied by the caller after load).

use crate::error::{Result, ShelfBridgeError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_min_progress_threshold() -> f64 {
    5.0
}
fn default_true() -> bool {
    true
}
fn default_workers() -> usize {
    3
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_schedule() -> String {
    "0 3 * * *".to_string()
}
fn default_hc_semaphore() -> usize {
    1
}
fn default_hc_rpm() -> u32 {
    55
}
fn default_abs_semaphore() -> usize {
    5
}
fn default_abs_rpm() -> u32 {
    600
}
fn default_page_size() -> u32 {
    100
}
fn default_cache_path() -> PathBuf {
    PathBuf::from("data/.book_cache.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RereadDetectionConfig {
    pub reread_threshold: f64,
    pub high_progress_threshold: f64,
    pub regression_block_threshold: f64,
    pub regression_warn_threshold: f64,
}

impl Default for RereadDetectionConfig {
    fn default() -> Self {
        Self {
            reread_threshold: 30.0,
            high_progress_threshold: 85.0,
            regression_block_threshold: 50.0,
            regression_warn_threshold: 15.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TitleAuthorMatchingConfig {
    pub enabled: bool,
}

impl Default for TitleAuthorMatchingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayedUpdatesConfig {
    pub enabled: bool,
    pub session_timeout: u64,
    pub max_delay: u64,
    pub immediate_completion: bool,
}

impl Default for DelayedUpdatesConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            session_timeout: 900,
            max_delay: 3600,
            immediate_completion: true,
        }
    }
}

impl DelayedUpdatesConfig {
    pub fn validate(&self) -> Result<()> {
        if !(60..=7200).contains(&self.session_timeout) {
            return Err(ShelfBridgeError::Config(format!(
                "delayed_updates.session_timeout must be in 60..=7200, got {}",
                self.session_timeout
            )));
        }
        if !(300..=86400).contains(&self.max_delay) {
            return Err(ShelfBridgeError::Config(format!(
                "delayed_updates.max_delay must be in 300..=86400, got {}",
                self.max_delay
            )));
        }
        if self.session_timeout >= self.max_delay {
            return Err(ShelfBridgeError::Config(format!(
                "delayed_updates.session_timeout ({}) must be less than max_delay ({})",
                self.session_timeout, self.max_delay
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryFilterConfig {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub abs_url: String,
    pub abs_token: String,
    pub hardcover_token: String,
    #[serde(default)]
    pub libraries: Option<LibraryFilterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default = "default_min_progress_threshold")]
    pub min_progress_threshold: f64,
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_schedule")]
    pub sync_schedule: String,
    pub dry_run: bool,
    pub force_sync: bool,
    pub auto_add_books: bool,
    #[serde(default = "default_true")]
    pub prevent_progress_regression: bool,
    #[serde(default = "default_hc_semaphore")]
    pub hardcover_semaphore: usize,
    #[serde(default = "default_hc_rpm")]
    pub hardcover_rate_limit: u32,
    #[serde(default = "default_abs_semaphore")]
    pub audiobookshelf_semaphore: usize,
    #[serde(default = "default_abs_rpm")]
    pub audiobookshelf_rate_limit: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    pub max_books_to_fetch: Option<u32>,
    pub reread_detection: RereadDetectionConfig,
    pub title_author_matching: TitleAuthorMatchingConfig,
    pub delayed_updates: DelayedUpdatesConfig,
    pub libraries: LibraryFilterConfig,
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            min_progress_threshold: default_min_progress_threshold(),
            parallel: true,
            workers: default_workers(),
            timezone: default_timezone(),
            sync_schedule: default_schedule(),
            dry_run: false,
            force_sync: false,
            auto_add_books: false,
            prevent_progress_regression: true,
            hardcover_semaphore: default_hc_semaphore(),
            hardcover_rate_limit: default_hc_rpm(),
            audiobookshelf_semaphore: default_abs_semaphore(),
            audiobookshelf_rate_limit: default_abs_rpm(),
            page_size: default_page_size(),
            max_books_to_fetch: None,
            reread_detection: RereadDetectionConfig::default(),
            title_author_matching: TitleAuthorMatchingConfig::default(),
            delayed_updates: DelayedUpdatesConfig::default(),
            libraries: LibraryFilterConfig::default(),
            cache_path: default_cache_path(),
            users: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then a YAML file if present, then environment
    /// overrides. `path` not existing is not an error: a fresh install
    /// may run entirely off environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| ShelfBridgeError::Config(format!("reading {:?}: {e}", path)))?;
            serde_yaml::from_str(&raw)
                .map_err(|e| ShelfBridgeError::Config(format!("parsing {:?}: {e}", path)))?
        } else {
            AppConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables mirror a subset of fields using the
    /// `SHELFBRIDGE_` prefix and an underscored dotted path, e.g.
    /// `SHELFBRIDGE_DELAYED_UPDATES_SESSION_TIMEOUT`.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_f64("SHELFBRIDGE_MIN_PROGRESS_THRESHOLD") {
            self.min_progress_threshold = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_PARALLEL") {
            self.parallel = v;
        }
        if let Some(v) = env_usize("SHELFBRIDGE_WORKERS") {
            self.workers = v;
        }
        if let Ok(v) = std::env::var("SHELFBRIDGE_TIMEZONE") {
            self.timezone = v;
        }
        if let Ok(v) = std::env::var("SHELFBRIDGE_SYNC_SCHEDULE") {
            self.sync_schedule = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_DRY_RUN") {
            self.dry_run = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_FORCE_SYNC") {
            self.force_sync = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_AUTO_ADD_BOOKS") {
            self.auto_add_books = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_PREVENT_PROGRESS_REGRESSION") {
            self.prevent_progress_regression = v;
        }
        if let Some(v) = env_usize("SHELFBRIDGE_HARDCOVER_SEMAPHORE") {
            self.hardcover_semaphore = v;
        }
        if let Some(v) = env_u32("SHELFBRIDGE_HARDCOVER_RATE_LIMIT") {
            self.hardcover_rate_limit = v;
        }
        if let Some(v) = env_usize("SHELFBRIDGE_AUDIOBOOKSHELF_SEMAPHORE") {
            self.audiobookshelf_semaphore = v;
        }
        if let Some(v) = env_u32("SHELFBRIDGE_AUDIOBOOKSHELF_RATE_LIMIT") {
            self.audiobookshelf_rate_limit = v;
        }
        if let Some(v) = env_u32("SHELFBRIDGE_PAGE_SIZE") {
            self.page_size = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_TITLE_AUTHOR_MATCHING_ENABLED") {
            self.title_author_matching.enabled = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_DELAYED_UPDATES_ENABLED") {
            self.delayed_updates.enabled = v;
        }
        if let Some(v) = env_u64("SHELFBRIDGE_DELAYED_UPDATES_SESSION_TIMEOUT") {
            self.delayed_updates.session_timeout = v;
        }
        if let Some(v) = env_u64("SHELFBRIDGE_DELAYED_UPDATES_MAX_DELAY") {
            self.delayed_updates.max_delay = v;
        }
        if let Some(v) = env_bool("SHELFBRIDGE_DELAYED_UPDATES_IMMEDIATE_COMPLETION") {
            self.delayed_updates.immediate_completion = v;
        }
        if let Ok(v) = std::env::var("SHELFBRIDGE_CACHE_PATH") {
            self.cache_path = PathBuf::from(v);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=100.0).contains(&self.min_progress_threshold) {
            return Err(ShelfBridgeError::Config(
                "min_progress_threshold must be in 0..=100".into(),
            ));
        }
        if self.workers == 0 {
            return Err(ShelfBridgeError::Config("workers must be >= 1".into()));
        }
        self.delayed_updates.validate()?;
        for user in &self.users {
            if user.id.trim().is_empty() {
                return Err(ShelfBridgeError::Config("user id must not be empty".into()));
            }
            if user.abs_url.trim().is_empty() {
                return Err(ShelfBridgeError::Config(format!(
                    "user {}: abs_url must not be empty",
                    user.id
                )));
            }
        }
        Ok(())
    }
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    })
}

fn env_f64(key: &str) -> Option<f64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    fn session_timeout_below_min_is_rejected() {
        let mut cfg = DelayedUpdatesConfig::default();
        cfg.session_timeout = 59;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn session_timeout_at_min_is_accepted() {
        let mut cfg = DelayedUpdatesConfig::default();
        cfg.session_timeout = 60;
        cfg.max_delay = 300;
        cfg.validate().unwrap();
    }

    #[test]
    fn session_timeout_must_be_less_than_max_delay() {
        let mut cfg = DelayedUpdatesConfig::default();
        cfg.session_timeout = 3600;
        cfg.max_delay = 3600;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_overrides_defaults_and_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.yaml");
        let cfg = AppConfig::load(&missing).unwrap();
        assert_eq!(cfg.workers, 3);
    }
}
