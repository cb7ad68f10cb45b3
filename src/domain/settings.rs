use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

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
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "motionlink".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSettings {
    /// Case-insensitive substrings an advertised name must contain.
    #[serde(default = "default_name_filters")]
    pub name_filters: Vec<String>,
    /// Devices weaker than this are ignored during discovery (dBm).
    #[serde(default = "default_min_rssi")]
    pub min_rssi: i16,
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            name_filters: default_name_filters(),
            min_rssi: default_min_rssi(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

fn default_name_filters() -> Vec<String> {
    vec!["sensor".to_string()]
}
fn default_min_rssi() -> i16 {
    -80
}
fn default_scan_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Connection establishment can legitimately take tens of seconds on
    /// some platforms.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_discovery_attempts")]
    pub discovery_attempts: u32,
    #[serde(default = "default_discovery_retry_delay_ms")]
    pub discovery_retry_delay_ms: u64,
    /// Pause between two consecutive successful connects so the native
    /// stack can stabilize.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_battery_poll_secs")]
    pub battery_poll_secs: u64,
    /// Bounded wait for a notification-based command reply.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            discovery_attempts: default_discovery_attempts(),
            discovery_retry_delay_ms: default_discovery_retry_delay_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            battery_poll_secs: default_battery_poll_secs(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_discovery_attempts() -> u32 {
    3
}
fn default_discovery_retry_delay_ms() -> u64 {
    500
}
fn default_settle_delay_ms() -> u64 {
    300
}
fn default_battery_poll_secs() -> u64 {
    60
}
fn default_reply_timeout_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_sync_samples")]
    pub samples: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            samples: default_sync_samples(),
        }
    }
}

fn default_sync_samples() -> usize {
    20
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub scan: ScanSettings,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: BridgeSettings,
    path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let path = Self::settings_path()?;
        let settings = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            BridgeSettings::default()
        };
        Ok(Self { settings, path })
    }

    fn settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("motionlink");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &PathBuf) -> anyhow::Result<BridgeSettings> {
        let content = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    pub fn get(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut BridgeSettings {
        &mut self.settings
    }
}
