use crate::backend::{MemoryBackend, ObjectStoreBackend, RemoteBackend, RetryPolicy, SheetsBackend};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "meghendra", "tasksync")
}

fn default_data_dir() -> PathBuf {
    if let Some(path) = std::env::var_os("TASKSYNC_DATA_DIR") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.data_dir().to_path_buf();
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tasksync")
}

fn default_snapshot_path() -> PathBuf {
    default_data_dir().join("tasks_snapshot.json")
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os("TASKSYNC_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(dirs) = project_dirs() {
        return dirs.config_dir().join("config.toml");
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tasksync-config.toml")
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub data: DataConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Sheets,
    ObjectStore,
    /// In-process backend, for tests and offline use. Nothing survives the
    /// process.
    Memory,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub sheets: SheetsConfig,
    pub object: ObjectStoreConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub sheet: String,
    pub api_token: String,
}

impl Default for SheetsConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: String::new(),
            sheet: "Tasks".to_string(),
            api_token: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub prefix: String,
    pub api_key: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: "terminal-to-do".to_string(),
            prefix: "tasks".to_string(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Seconds between timed reconciliation passes. 0 disables the timer.
    pub interval_secs: u64,
    /// Bound on any single backend HTTP call.
    pub request_timeout_secs: u64,
    /// Attempts per backend call for transient failures.
    pub max_attempts: u32,
    /// First-retry backoff; doubles per attempt.
    pub base_backoff_ms: u64,
    /// Targeted re-merge attempts for one conflicting task before the
    /// conflict is surfaced.
    pub conflict_retry_attempts: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            request_timeout_secs: 10,
            max_attempts: 4,
            base_backoff_ms: 500,
            conflict_retry_attempts: 3,
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_backoff_ms),
            multiplier: 2.0,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_secs > 0).then(|| Duration::from_secs(self.interval_secs))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DataConfig {
    pub snapshot_path: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let config_path = config_path();

        let mut config = if let Ok(content) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse config.toml ({config_path:?}), using defaults: {e}");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };

        let changed = config.normalize_paths();
        if changed || !config_path.exists() {
            let _ = config.save_to_path(&config_path);
        }

        config
    }

    pub fn save_to_path(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).unwrap_or_default();
        fs::write(path, content)
    }

    fn normalize_paths(&mut self) -> bool {
        let mut changed = false;

        if self.data.snapshot_path.as_os_str().is_empty() {
            self.data.snapshot_path = default_snapshot_path();
            changed = true;
        }

        if self.data.snapshot_path.is_relative() {
            self.data.snapshot_path = default_data_dir().join(&self.data.snapshot_path);
            changed = true;
        }

        changed
    }

    /// Construct the configured backend-of-record. Exactly one backend is
    /// active at a time; the spreadsheet and the object store are
    /// alternatives, never composed.
    pub fn build_backend(&self) -> Box<dyn RemoteBackend> {
        let timeout = self.sync.request_timeout();
        match self.backend.kind {
            BackendKind::Sheets => Box::new(SheetsBackend::new(&self.backend.sheets, timeout)),
            BackendKind::ObjectStore => {
                Box::new(ObjectStoreBackend::new(&self.backend.object, timeout))
            }
            BackendKind::Memory => Box::new(MemoryBackend::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_a_toml_roundtrip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).expect("serialize");
        let parsed: Config = toml::from_str(&text).expect("parse back");
        assert_eq!(parsed.backend.kind, BackendKind::Sheets);
        assert_eq!(parsed.sync.interval_secs, 300);
        assert_eq!(parsed.sync.max_attempts, 4);
        assert_eq!(parsed.backend.sheets.sheet, "Tasks");
    }

    #[test]
    fn partial_config_fills_in_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [backend]
            kind = "object_store"

            [backend.object]
            endpoint = "https://storage.example.com"
            api_key = "k"

            [sync]
            interval_secs = 60
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.backend.kind, BackendKind::ObjectStore);
        assert_eq!(parsed.backend.object.bucket, "terminal-to-do");
        assert_eq!(parsed.sync.interval_secs, 60);
        assert_eq!(parsed.sync.request_timeout_secs, 10);
    }

    #[test]
    fn relative_snapshot_path_is_anchored() {
        let mut config = Config::default();
        config.data.snapshot_path = PathBuf::from("snap.json");
        assert!(config.normalize_paths());
        assert!(config.data.snapshot_path.is_absolute());
    }

    #[test]
    fn zero_interval_disables_the_timer() {
        let sync = SyncConfig {
            interval_secs: 0,
            ..SyncConfig::default()
        };
        assert!(sync.interval().is_none());
    }
}
