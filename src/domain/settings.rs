use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::clock_sync::DEFAULT_HISTORY;
use crate::domain::orientation::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MIN_EMIT_INTERVAL_MS, DEFAULT_SMOOTHING_WINDOW,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "gan_cube_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Additional key/IV pair tried after the built-in table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub name: String,
    /// 16 bytes as hex, separators optional.
    pub key_hex: String,
    pub iv_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Connection Settings
    #[serde(default = "default_max_connect_retries")]
    pub max_connect_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_find_timeout_ms")]
    pub find_timeout_ms: u64,
    #[serde(default = "default_snapshot_delay_ms")]
    pub snapshot_delay_ms: u64,

    // Scanning
    #[serde(default = "default_name_prefixes")]
    pub name_prefixes: Vec<String>,

    // Orientation
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    #[serde(default = "default_min_emit_interval_ms")]
    pub min_emit_interval_ms: u64,

    // Clock Sync
    #[serde(default = "default_clock_sync_history")]
    pub clock_sync_history: usize,

    // Keying
    #[serde(default)]
    pub mac_override: Option<String>,
    #[serde(default)]
    pub extra_keys: Vec<KeyConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),

            max_connect_retries: default_max_connect_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            find_timeout_ms: default_find_timeout_ms(),
            snapshot_delay_ms: default_snapshot_delay_ms(),

            name_prefixes: default_name_prefixes(),

            buffer_size: default_buffer_size(),
            smoothing_window: default_smoothing_window(),
            min_emit_interval_ms: default_min_emit_interval_ms(),

            clock_sync_history: default_clock_sync_history(),

            mac_override: None,
            extra_keys: Vec::new(),
        }
    }
}

fn default_max_connect_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_find_timeout_ms() -> u64 {
    15_000
}
fn default_snapshot_delay_ms() -> u64 {
    1000
}
fn default_name_prefixes() -> Vec<String> {
    vec!["GAN".to_string(), "MG".to_string(), "AiCube".to_string()]
}
fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}
fn default_smoothing_window() -> usize {
    DEFAULT_SMOOTHING_WINDOW
}
fn default_min_emit_interval_ms() -> u64 {
    DEFAULT_MIN_EMIT_INTERVAL_MS
}
fn default_clock_sync_history() -> usize {
    DEFAULT_HISTORY
}

/// Read-only settings source. Nothing is written back to disk.
pub struct SettingsService {
    settings: Settings,
    settings_path: Option<PathBuf>,
}

impl SettingsService {
    /// Loads from the per-user config directory, falling back to defaults
    /// when the file is missing or unreadable.
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let settings = Self::load_from_file(&settings_path).unwrap_or_else(|e| {
            tracing::debug!(
                "Using default settings ({}): {}",
                settings_path.display(),
                e
            );
            Settings::default()
        });

        Ok(Self {
            settings,
            settings_path: Some(settings_path),
        })
    }

    /// Loads from an explicit path. Unlike [`SettingsService::new`] a bad
    /// file is an error.
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let settings = Self::load_from_file(&path)?;
        Ok(Self {
            settings,
            settings_path: Some(path),
        })
    }

    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings,
            settings_path: None,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("gan-cube-link");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn path(&self) -> Option<&Path> {
        self.settings_path.as_deref()
    }

    pub fn into_settings(self) -> Settings {
        self.settings
    }
}
