use crate::config::schema::AppConfig;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file contains invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// CLI flags that override everything else
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub dry_run: bool,
}

pub fn load_config(overrides: &CliOverrides) -> Result<AppConfig> {
    tracing::debug!("Loading configuration");

    let mut config = AppConfig::default();

    // Layer 1: config file (~/.tidygram/config.json)
    let config_file = overrides
        .config_path
        .clone()
        .or_else(get_default_config_path);

    if let Some(ref path) = config_file {
        if path.exists() {
            tracing::debug!(config_path = %path.display(), "Loading configuration from file");
            config = merge_config_from_file(config, path)?;
        } else {
            tracing::debug!(config_path = %path.display(), "Config file not found, using defaults");
        }
    }

    // Layer 2: environment
    config = merge_env_variables(config, |key| std::env::var(key).ok());

    // Layer 3: CLI flags
    if let Some(ref dir) = overrides.data_dir {
        config.persistence.dir = Some(dir.clone());
    }
    if overrides.dry_run {
        config.cleaner.dry_run = true;
    }

    config
        .cleaner
        .validate()
        .context("Invalid cleaner configuration")?;
    config
        .persistence
        .validate()
        .context("Invalid persistence configuration")?;

    let summary = config.get_safe_summary();
    tracing::debug!(
        telegram_configured = summary.telegram_configured,
        persistence_enabled = summary.persistence_enabled,
        dry_run = summary.dry_run,
        max_tracked_messages = summary.max_tracked_messages,
        "Configuration loaded successfully"
    );

    Ok(config)
}

pub fn get_default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tidygram").join("config.json"))
}

fn merge_config_from_file(config: AppConfig, path: &Path) -> Result<AppConfig> {
    let metadata = match fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(config),
        Err(e) => return Err(e).context("Failed to read metadata for config file"),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode != 0o600 {
            tracing::error!(
                "Config file {:?} has permissions {:o}, expected 0600 - skipping for security",
                path,
                mode
            );
            return Ok(config);
        }
    }
    #[cfg(not(unix))]
    let _ = metadata;

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let file_config: AppConfig = serde_json::from_str(&content).map_err(ConfigError::InvalidJson)?;

    Ok(AppConfig {
        telegram_token: file_config.telegram_token.or(config.telegram_token),
        persistence: file_config.persistence,
        cleaner: file_config.cleaner,
    })
}

/// Applies environment overrides. `lookup` is `std::env::var` outside tests.
pub fn merge_env_variables<F>(mut config: AppConfig, lookup: F) -> AppConfig
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(token) = lookup("TELEGRAM_BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
        config.telegram_token = Some(token);
    }
    if let Some(dir) = lookup("TIDYGRAM_DATA_DIR").filter(|d| !d.trim().is_empty()) {
        config.persistence.dir = Some(PathBuf::from(dir));
    }
    if let Some(flag) = lookup("TIDYGRAM_PERSISTENCE").and_then(|v| parse_flag(&v)) {
        config.persistence.enabled = flag;
    }
    if let Some(flag) = lookup("TIDYGRAM_DRY_RUN").and_then(|v| parse_flag(&v)) {
        config.cleaner.dry_run = flag;
    }
    config
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, json: &str, mode: u32) -> PathBuf {
        let path = dir.path().join("config.json");
        fs::write(&path, json).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
        }
        #[cfg(not(unix))]
        let _ = mode;
        path
    }

    #[test]
    fn test_file_layer_applies() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"telegram_token": "1:a", "cleaner": {"deletion_batch_size": 10}}"#,
            0o600,
        );

        let config = merge_config_from_file(AppConfig::default(), &path).unwrap();
        assert_eq!(config.telegram_token.as_deref(), Some("1:a"));
        assert_eq!(config.cleaner.deletion_batch_size, 10);
    }

    #[cfg(unix)]
    #[test]
    fn test_world_readable_file_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, r#"{"telegram_token": "1:a"}"#, 0o644);

        let config = merge_config_from_file(AppConfig::default(), &path).unwrap();
        assert!(config.telegram_token.is_none());
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "{ not json", 0o600);
        assert!(merge_config_from_file(AppConfig::default(), &path).is_err());
    }

    #[test]
    fn test_env_layer_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEGRAM_BOT_TOKEN", "99:xyz"),
            ("TIDYGRAM_DATA_DIR", "/var/lib/tidygram"),
            ("TIDYGRAM_PERSISTENCE", "off"),
            ("TIDYGRAM_DRY_RUN", "true"),
        ]);
        let config = merge_env_variables(AppConfig::default(), |k| {
            env.get(k).map(|v| v.to_string())
        });

        assert_eq!(config.telegram_token.as_deref(), Some("99:xyz"));
        assert_eq!(config.persistence.dir, Some(PathBuf::from("/var/lib/tidygram")));
        assert!(!config.persistence.enabled);
        assert!(config.cleaner.dry_run);
    }

    #[test]
    fn test_env_ignores_garbage_flags() {
        let config = merge_env_variables(AppConfig::default(), |k| {
            (k == "TIDYGRAM_PERSISTENCE").then(|| "maybe".to_string())
        });
        assert!(config.persistence.enabled);
    }

    #[test]
    fn test_load_with_explicit_missing_path() {
        let dir = TempDir::new().unwrap();
        let overrides = CliOverrides {
            config_path: Some(dir.path().join("absent.json")),
            data_dir: Some(dir.path().join("data")),
            dry_run: true,
        };
        let config = load_config(&overrides).unwrap();
        assert_eq!(config.persistence.dir, Some(dir.path().join("data")));
        assert!(config.cleaner.dry_run);
    }

    #[test]
    fn test_load_rejects_huge_snapshot_ttl() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"{"persistence": {"snapshot_ttl_secs": 10000000000000}}"#,
            0o600,
        );
        let overrides = CliOverrides {
            config_path: Some(path),
            ..CliOverrides::default()
        };
        let err = load_config(&overrides).unwrap_err();
        assert!(format!("{err:#}").contains("snapshot_ttl_secs"));
    }
}
