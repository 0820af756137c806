//! Configuration file
//!
//! A JSON file whose every field has a default, so `{}` (or no file at all)
//! is a complete configuration. Looked up at `~/.config/nftsync/config.json`
//! unless a path is given.

use crate::core::error::{Error, Result};
use crate::core::set::MembershipMode;
use crate::telemetry::LogConfig;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Manager ticks are never closer together than this
pub const MIN_REFRESH_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// inet table holding the chain and the sets
    pub table: String,
    /// Input filter chain holding the drop rules
    pub chain: String,
    pub ipv4_set: String,
    pub ipv6_set: String,
    pub port_set: String,
    /// Addresses, ranges and prefixes to block, one per line
    pub address_list: PathBuf,
    /// Destination ports and port ranges to block, one per line
    pub port_list: PathBuf,
    pub refresh_interval_ms: u64,
    /// Forget cached membership after a failed commit
    pub clear_on_error: bool,
    pub membership_mode: MembershipMode,
    pub logging: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            table: "nftsync".to_string(),
            chain: "input".to_string(),
            ipv4_set: "ipv4_blocklist".to_string(),
            ipv6_set: "ipv6_blocklist".to_string(),
            port_set: "port_blocklist".to_string(),
            address_list: PathBuf::from("./ip.list"),
            port_list: PathBuf::from("./port.list"),
            refresh_interval_ms: 1000,
            clear_on_error: false,
            membership_mode: MembershipMode::default(),
            logging: LogConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(MIN_REFRESH_INTERVAL_MS))
    }

    /// Checks that every object name is usable by nft
    pub fn validate(&self) -> Result<()> {
        let names = [
            ("table", &self.table),
            ("chain", &self.chain),
            ("ipv4_set", &self.ipv4_set),
            ("ipv6_set", &self.ipv6_set),
            ("port_set", &self.port_set),
        ];
        for (field, name) in names {
            validate_name(field, name)?;
        }
        Ok(())
    }
}

/// nft identifiers: a letter, then letters, digits, `_`, `-` or `.`, at most 255 bytes
fn validate_name(field: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid_start && valid_rest && name.len() <= 255 {
        Ok(())
    } else {
        Err(Error::validation(field, format!("'{name}' is not a valid nftables name")))
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "nftsync", "nftsync").map(|pd| pd.config_dir().to_path_buf())
}

/// `config.json` in the user config directory
pub fn default_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.json"))
}

/// Loads the config from `path`, or from the default location.
///
/// A missing file yields the defaults; an unreadable or malformed one is an
/// error.
pub async fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let Some(path) = path.map(Path::to_path_buf).or_else(default_config_path) else {
        return Ok(AppConfig::default());
    };

    let config = match tokio::fs::read_to_string(&path).await {
        Ok(json) => serde_json::from_str::<AppConfig>(&json)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config at {}, using defaults", path.display());
            AppConfig::default()
        }
        Err(e) => return Err(e.into()),
    };
    config.validate()?;
    Ok(config)
}

/// Saves the config using an atomic write pattern.
/// 1. Writes to a temporary file next to the target.
/// 2. Sets restrictive permissions (0o600).
/// 3. Atomically renames to the target path.
pub async fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    use tokio::fs::OpenOptions;
    use tokio::io::AsyncWriteExt;

    let json = serde_json::to_string_pretty(config)?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)
        .await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}
