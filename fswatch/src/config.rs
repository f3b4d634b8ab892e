//! aios-fswatch configuration loading and parsing

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::decoder::MIN_BUFFER_SIZE;
use crate::event_loop::UnknownWatchPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/aios/fswatch.toml";
pub const CONFIG_ENV: &str = "AIOS_FSWATCH_CONFIG";

/// Root configuration structure
#[derive(Debug, Default, Deserialize)]
pub struct FsWatchConfig {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<PathBuf>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default)]
    pub unknown_watch: UnknownWatchPolicy,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            buffer_size: default_buffer_size(),
            unknown_watch: UnknownWatchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Default, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub format: OutputFormat,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_roots() -> Vec<PathBuf> { vec![PathBuf::from("/tmp")] }
fn default_buffer_size() -> usize { 4096 }
fn default_log_level() -> String { "info".into() }

impl FsWatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.watch.roots.is_empty() {
            bail!("watch.roots must list at least one path");
        }
        if self.watch.buffer_size < MIN_BUFFER_SIZE {
            bail!(
                "watch.buffer_size {} is too small, need at least {MIN_BUFFER_SIZE}",
                self.watch.buffer_size
            );
        }
        Ok(())
    }
}

/// Resolve the config path: explicit argument, then $AIOS_FSWATCH_CONFIG, then the default
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load configuration; a missing file means defaults.
///
/// Runs before logging is up, so the caller reports which case applied.
pub fn load_config(path: &Path) -> Result<FsWatchConfig> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: FsWatchConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        Ok(config)
    } else {
        Ok(FsWatchConfig::default())
    }
}
