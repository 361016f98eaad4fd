use crate::persistence::DEFAULT_SNAPSHOT_TTL_SECS;
use crate::utils::error::{CleanerError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound for any configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Tuning knobs of the cleanup engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerConfig {
    /// Users idle longer than this are dropped by the sweep
    pub inactive_threshold_secs: u64,
    /// Sweep period
    pub cleanup_interval_secs: u64,
    /// Per-user cap on tracked messages
    pub max_tracked_messages: usize,
    /// Ids per transport delete call
    pub deletion_batch_size: usize,
    /// Bounded wait for a user's cleanup lock
    pub lock_timeout_ms: u64,
    /// Delay before a COMMAND message is deleted
    pub command_delete_delay_ms: u64,
    /// Log deletion sets instead of deleting
    pub dry_run: bool,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            inactive_threshold_secs: 60 * 60,
            cleanup_interval_secs: 5 * 60,
            max_tracked_messages: 100,
            deletion_batch_size: 50,
            lock_timeout_ms: 3_000,
            command_delete_delay_ms: 2_000,
            dry_run: false,
        }
    }
}

impl CleanerConfig {
    pub fn inactive_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.inactive_threshold_secs.min(MAX_DURATION_SECS) as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.min(MAX_DURATION_SECS))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms.min(MAX_DURATION_SECS * 1000))
    }

    pub fn command_delete_delay(&self) -> Duration {
        Duration::from_millis(self.command_delete_delay_ms.min(MAX_DURATION_SECS * 1000))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tracked_messages == 0 {
            return Err(CleanerError::config("max_tracked_messages must be at least 1"));
        }
        if self.deletion_batch_size == 0 {
            return Err(CleanerError::config("deletion_batch_size must be at least 1"));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(CleanerError::config("cleanup_interval_secs must be at least 1"));
        }
        check_secs("inactive_threshold_secs", self.inactive_threshold_secs)?;
        check_secs("cleanup_interval_secs", self.cleanup_interval_secs)?;
        check_secs("lock_timeout_ms", self.lock_timeout_ms / 1000)?;
        check_secs("command_delete_delay_ms", self.command_delete_delay_ms / 1000)?;
        Ok(())
    }
}

fn check_secs(field: &str, secs: u64) -> Result<()> {
    if secs > MAX_DURATION_SECS {
        return Err(CleanerError::config(format!(
            "{field} exceeds the maximum of {MAX_DURATION_SECS} seconds"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    pub snapshot_ttl_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            snapshot_ttl_secs: DEFAULT_SNAPSHOT_TTL_SECS,
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_secs.min(MAX_DURATION_SECS))
    }

    pub fn validate(&self) -> Result<()> {
        if self.snapshot_ttl_secs == 0 {
            return Err(CleanerError::config("snapshot_ttl_secs must be at least 1"));
        }
        check_secs("snapshot_ttl_secs", self.snapshot_ttl_secs)
    }

    /// Configured directory, or `~/.tidygram/snapshots`.
    pub fn resolved_dir(&self) -> Option<PathBuf> {
        self.dir.clone().or_else(|| {
            dirs::home_dir().map(|home| home.join(".tidygram").join("snapshots"))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_token: Option<String>,
    pub persistence: PersistenceConfig,
    pub cleaner: CleanerConfig,
}

/// Loggable view of the config without secrets
#[derive(Debug, Clone)]
pub struct SafeConfigSummary {
    pub telegram_configured: bool,
    pub persistence_enabled: bool,
    pub dry_run: bool,
    pub max_tracked_messages: usize,
}

impl AppConfig {
    pub fn get_safe_summary(&self) -> SafeConfigSummary {
        SafeConfigSummary {
            telegram_configured: self.telegram_token.is_some(),
            persistence_enabled: self.persistence.enabled,
            dry_run: self.cleaner.dry_run,
            max_tracked_messages: self.cleaner.max_tracked_messages,
        }
    }
}
