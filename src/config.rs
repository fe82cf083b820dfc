use crate::core::engine::{DiscoveryPolicy, EngineConfig};
use crate::utils::get_data_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on the discovery timeout, so a typo cannot stall every rule for hours
pub const MAX_DISCOVERY_TIMEOUT_SECS: u64 = 60;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Seconds to wait for a gateway on each discovery (default: 5s, max: 60s)
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Whether one discovered gateway is reused for a whole pass
    #[serde(default)]
    pub discovery_policy: DiscoveryPolicy,
    /// Requested mapping lease in seconds; 0 means permanent
    #[serde(default)]
    pub lease_duration_secs: u32,
    /// Enable the audit event log (opt-in, disabled by default)
    #[serde(default)]
    pub enable_event_log: bool,
    /// Rule file used when none is given on the command line
    #[serde(default)]
    pub last_rules_file: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: default_discovery_timeout(),
            discovery_policy: DiscoveryPolicy::PerCall,
            lease_duration_secs: 0,
            enable_event_log: false, // Opt-in only for privacy/disk space
            last_rules_file: None,
        }
    }
}

fn default_discovery_timeout() -> u64 {
    5
}

impl AppConfig {
    /// Builds the engine settings, clamping the timeout to 1..=60 seconds.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            discovery_timeout: Duration::from_secs(
                self.discovery_timeout_secs
                    .clamp(1, MAX_DISCOVERY_TIMEOUT_SECS),
            ),
            discovery_policy: self.discovery_policy,
        }
    }
}

fn config_path() -> Option<PathBuf> {
    get_data_dir().map(|dir| dir.join("config.json"))
}

/// Saves the app config to disk using an atomic write pattern.
/// 1. Writes to a temporary file.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn save_config(config: &AppConfig) -> std::io::Result<()> {
    match config_path() {
        Some(path) => save_config_to(config, &path).await,
        None => Ok(()),
    }
}

/// Saves the config to an explicit path.
pub async fn save_config_to(config: &AppConfig, path: &Path) -> std::io::Result<()> {
    let json = serde_json::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");

    // Create file with restrictive permissions from the start to prevent
    // race condition where file is briefly world-readable
    #[cfg(unix)]
    {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600) // Set permissions BEFORE any data is written
            .open(&temp_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    #[cfg(not(unix))]
    {
        use tokio::io::AsyncWriteExt;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
    }

    // Atomic rename
    tokio::fs::rename(temp_path, path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::StorageFull {
            std::io::Error::new(
                std::io::ErrorKind::StorageFull,
                "Disk full: cannot save configuration. Free up space and try again.",
            )
        } else {
            e
        }
    })
}

/// Loads the app config from disk, or returns default if not found.
///
/// # Async
/// Uses `tokio::fs` for non-blocking I/O.
pub async fn load_config() -> AppConfig {
    match config_path() {
        Some(path) => load_config_from(&path).await,
        None => AppConfig::default(),
    }
}

/// Loads the config from an explicit path; missing or invalid files yield defaults.
pub async fn load_config_from(path: &Path) -> AppConfig {
    match tokio::fs::read_to_string(path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json).unwrap_or_else(|e| {
            tracing::warn!("Ignoring invalid config {}: {e}", path.display());
            AppConfig::default()
        }),
        Err(_) => AppConfig::default(),
    }
}
