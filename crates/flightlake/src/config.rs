use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration. Recorded verbatim in every checkpoint so a restart
/// rebuilds the same pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub source_host: String,
    pub source_port: u16,
    /// Micro-batch interval, e.g. "5s"
    pub batch_interval: String,
    pub checkpoint_dir: PathBuf,
    pub output_dir: PathBuf,
    pub table_name: String,
    pub catalog_path: PathBuf,
    /// Optional bound on the run, e.g. "10s". Unbounded when absent.
    pub run_duration: Option<String>,
    /// List catalog partitions after every batch (log only)
    pub verify_partitions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_host: "localhost".to_string(),
            source_port: 9000,
            batch_interval: "5s".to_string(),
            checkpoint_dir: PathBuf::from("./checkpoint"),
            output_dir: PathBuf::from("./output"),
            table_name: "flights".to_string(),
            catalog_path: PathBuf::from("./catalog.json"),
            run_duration: None,
            verify_partitions: true,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every duration string parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch_interval()?;
        self.run_duration()?;
        if self.table_name.trim().is_empty() {
            return Err(ConfigError::Invalid("table_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn source_addr(&self) -> String {
        format!("{}:{}", self.source_host, self.source_port)
    }

    pub fn batch_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.batch_interval)
    }

    pub fn run_duration(&self) -> Result<Option<Duration>, ConfigError> {
        self.run_duration.as_deref().map(parse_duration).transpose()
    }
}

/// Longest accepted duration (about ten years)
pub const MAX_DURATION: Duration = Duration::from_secs(3650 * 24 * 60 * 60);

/// Parse a duration string like "5s", "15m", "1h", "1d"
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ConfigError::Invalid("Empty duration".to_string()));
    }

    let split = s.len() - s.chars().last().map(char::len_utf8).unwrap_or(0);
    let (num_str, unit) = s.split_at(split);
    let num: u64 = num_str
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("Invalid duration: {}", s)))?;

    if num == 0 {
        return Err(ConfigError::Invalid(
            "Duration must be greater than zero".to_string(),
        ));
    }

    let unit_secs: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 60 * 60 * 24,
        _ => return Err(ConfigError::Invalid(format!("Unknown unit: {}", unit))),
    };

    let secs = num
        .checked_mul(unit_secs)
        .filter(|secs| *secs <= MAX_DURATION.as_secs())
        .ok_or_else(|| ConfigError::Invalid(format!("Duration too large: {}", s)))?;
    Ok(Duration::from_secs(secs))
}
