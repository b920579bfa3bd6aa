//! Engine settings and the optional config file that overrides them.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::transfer::{CONNECT_TIMEOUT, READ_TIMEOUT};

/// Default interval between reconciliation polls of delegated transfers.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long `cancel` waits for a streamed task to clean up before aborting it.
pub const DEFAULT_CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Which backend performs transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransferMode {
    /// Bytes are fetched and written in-process.
    #[default]
    Streamed,
    /// Transfers are handed to an external download subsystem and polled.
    Delegated,
}

impl TransferMode {
    /// Returns the stable string label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streamed => "streamed",
            Self::Delegated => "delegated",
        }
    }
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "streamed" => Ok(Self::Streamed),
            "delegated" => Ok(Self::Delegated),
            other => Err(format!(
                "unknown transfer mode '{other}': expected one of: streamed, delegated"
            )),
        }
    }
}

/// Resolved settings the engine runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Directory new downloads are written into; created on demand.
    pub download_dir: PathBuf,
    /// Backend selected for every transfer.
    pub transfer_mode: TransferMode,
    /// Cadence of delegated-transfer reconciliation.
    pub poll_interval: Duration,
    /// HTTP connect timeout.
    pub connect_timeout: Duration,
    /// HTTP idle timeout between body reads.
    pub read_timeout: Duration,
    /// Grace period before a cancelled stream task is aborted.
    pub cancel_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            transfer_mode: TransferMode::Streamed,
            poll_interval: DEFAULT_POLL_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            cancel_grace: DEFAULT_CANCEL_GRACE,
        }
    }
}

impl EngineConfig {
    /// Overlays values present in `file` onto `self`.
    #[must_use]
    pub fn with_file_config(mut self, file: &FileConfig) -> Self {
        if let Some(dir) = &file.download_dir {
            self.download_dir.clone_from(dir);
        }
        if let Some(mode) = file.transfer_mode {
            self.transfer_mode = mode;
        }
        if let Some(ms) = file.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = file.connect_timeout_secs {
            self.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.read_timeout_secs {
            self.read_timeout = Duration::from_secs(secs);
        }
        self
    }
}

/// `$HOME/Downloads/Netdisk`, or `Downloads/Netdisk` under the working
/// directory when no home is known.
#[must_use]
pub fn default_download_dir() -> PathBuf {
    env_var_non_empty_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("Downloads")
        .join("Netdisk")
}

/// Resolves the default history database path.
///
/// Priority:
/// 1. `$XDG_DATA_HOME/netdisk/netdisk.db`
/// 2. `$HOME/.local/share/netdisk/netdisk.db`
#[must_use]
pub fn resolve_default_database_path() -> Option<PathBuf> {
    if let Some(xdg_data_home) = env_var_non_empty_os("XDG_DATA_HOME") {
        return Some(PathBuf::from(xdg_data_home).join("netdisk").join("netdisk.db"));
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("netdisk")
            .join("netdisk.db"),
    )
}

/// Values read from the config file; `None` means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Download directory.
    pub download_dir: Option<PathBuf>,
    /// Transfer backend.
    pub transfer_mode: Option<TransferMode>,
    /// Reconciliation poll interval in milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: Option<u64>,
    /// Read timeout in seconds.
    pub read_timeout_secs: Option<u64>,
    /// History database location.
    pub database_path: Option<PathBuf>,
    /// Netscape cookie file loaded at startup.
    pub cookie_file: Option<PathBuf>,
}

impl FileConfig {
    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range key.
    pub fn validate(&self) -> Result<()> {
        if let Some(interval) = self.poll_interval_ms
            && !(100..=60_000).contains(&interval)
        {
            bail!(
                "Invalid config value for `poll_interval_ms`: {interval}. Expected range: 100..=60000"
            );
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        Ok(())
    }
}

fn validate_timeout_secs(field: &str, value: Option<u64>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(1..=3600).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists.
    pub config: Option<FileConfig>,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/netdisk/config.toml`
/// 2. `$HOME/.config/netdisk/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("netdisk")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("netdisk")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from the default path if present.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_default_file_config() -> Result<LoadedConfig> {
    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(load_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

/// Reads and validates one config file.
///
/// # Errors
///
/// Returns an error when the file cannot be read, has a syntax error, names
/// an unknown key, or holds an out-of-range value.
pub fn load_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!(
                "Invalid config syntax on line {}: expected key = value",
                line_index + 1
            );
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let line_number = line_index + 1;

        match key {
            "download_dir" => {
                let parsed = parse_string_literal(value).with_context(|| {
                    format!("Invalid `download_dir` value on line {line_number}")
                })?;
                cfg.download_dir = Some(PathBuf::from(parsed));
            }
            "transfer_mode" => {
                let parsed = parse_string_literal(value).with_context(|| {
                    format!("Invalid `transfer_mode` value on line {line_number}")
                })?;
                let mode = parsed.parse::<TransferMode>().map_err(|e| {
                    anyhow::anyhow!("Invalid `transfer_mode` value on line {line_number}: {e}")
                })?;
                cfg.transfer_mode = Some(mode);
            }
            "poll_interval_ms" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `poll_interval_ms` value on line {line_number}")
                })?;
                cfg.poll_interval_ms = Some(parsed);
            }
            "connect_timeout_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `connect_timeout_secs` value on line {line_number}")
                })?;
                cfg.connect_timeout_secs = Some(parsed);
            }
            "read_timeout_secs" => {
                let parsed = parse_integer_u64(value).with_context(|| {
                    format!("Invalid `read_timeout_secs` value on line {line_number}")
                })?;
                cfg.read_timeout_secs = Some(parsed);
            }
            "database_path" => {
                let parsed = parse_string_literal(value).with_context(|| {
                    format!("Invalid `database_path` value on line {line_number}")
                })?;
                cfg.database_path = Some(PathBuf::from(parsed));
            }
            "cookie_file" => {
                let parsed = parse_string_literal(value).with_context(|| {
                    format!("Invalid `cookie_file` value on line {line_number}")
                })?;
                cfg.cookie_file = Some(PathBuf::from(parsed));
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_number}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}
