use crate::shared::error::{Error, Result};
use crate::shared::scoring::Thresholds;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub explain: ExplainConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

/// Probability cutoffs: SAFE at or below `safe_max`, MALICIOUS at or above `malicious_min`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ThresholdConfig {
    #[serde(default = "default_safe_max")]
    pub safe_max: f64,
    #[serde(default = "default_malicious_min")]
    pub malicious_min: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            safe_max: default_safe_max(),
            malicious_min: default_malicious_min(),
        }
    }
}

impl ThresholdConfig {
    /// Validated threshold pair.
    pub fn validated(&self) -> Result<Thresholds> {
        Thresholds::new(self.safe_max, self.malicious_min)
    }
}

fn default_safe_max() -> f64 {
    0.35
}

fn default_malicious_min() -> f64 {
    0.65
}

/// Bounds on how much of a package the corpus collector reads.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LimitsConfig {
    #[serde(default = "default_max_files")]
    pub max_files: usize,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files: default_max_files(),
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_max_files() -> usize {
    400
}

fn default_max_file_bytes() -> u64 {
    200_000
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExplainConfig {
    /// Reasons kept when ranking by value x importance.
    #[serde(default = "default_ranked_top_k")]
    pub ranked_top_k: usize,
    /// Reasons kept when walking the fixed priority list.
    #[serde(default = "default_priority_top_k")]
    pub priority_top_k: usize,
}

impl Default for ExplainConfig {
    fn default() -> Self {
        Self {
            ranked_top_k: default_ranked_top_k(),
            priority_top_k: default_priority_top_k(),
        }
    }
}

fn default_ranked_top_k() -> usize {
    7
}

fn default_priority_top_k() -> usize {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
pub struct ModelConfig {
    /// Model artifact (JSON, optionally gzipped). Unset means rule-only scoring.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Load config from ~/.config/pkgsentry/config.toml, falling back to defaults.
pub fn load_config() -> Config {
    load_config_from(&config_path())
}

/// Load config from `path`. A missing file is silent; a broken one is logged.
pub fn load_config_from(path: &Path) -> Config {
    match read_config(path) {
        Ok(config) => config,
        Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "ignoring config: {e}");
            Config::default()
        }
    }
}

/// Read and parse a config file without falling back.
pub fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Save config, creating the parent directory if needed.
pub fn save_config(config: &Config, path: &Path) -> std::result::Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {e}"))?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| format!("Failed to serialize config: {e}"))?;
    std::fs::write(path, toml_str).map_err(|e| format!("Failed to write config: {e}"))?;
    Ok(())
}

pub fn config_path() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join("pkgsentry").join("config.toml")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home)
            .join(".config")
            .join("pkgsentry")
            .join("config.toml")
    } else {
        PathBuf::from("/etc/pkgsentry/config.toml")
    }
}
