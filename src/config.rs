//! Validated configuration value consumed by the core (spec §6).
//!
//! Parsing and merging YAML into these types is an external concern; the
//! core only deserializes (for embedding convenience) and reads fields.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl LoggingConfig {
    /// Normalizes `warn` and `warning` to the same level and rejects anything
    /// outside the recognized set (spec §6).
    pub fn normalized_level(&self) -> Result<&'static str, String> {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok("debug"),
            "info" => Ok("info"),
            "warn" | "warning" => Ok("warn"),
            "error" => Ok("error"),
            "critical" => Ok("critical"),
            other => Err(format!("unsupported logging level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "default_parallel_agents")]
    pub parallel_agents: u32,
    #[serde(default = "default_pages_per_agent")]
    pub pages_per_agent: u32,
    #[serde(default = "default_jitter_seconds")]
    pub jitter_seconds: f64,
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_min")]
    pub backoff_min_seconds: f64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_seconds: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    pub fetch_timeout_seconds: Option<f64>,
}

fn default_parallel_agents() -> u32 {
    2
}
fn default_pages_per_agent() -> u32 {
    2
}
fn default_jitter_seconds() -> f64 {
    1.0
}
fn default_heartbeat_seconds() -> f64 {
    30.0
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_min() -> f64 {
    1.0
}
fn default_backoff_max() -> f64 {
    60.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            parallel_agents: default_parallel_agents(),
            pages_per_agent: default_pages_per_agent(),
            jitter_seconds: default_jitter_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
            max_retries: default_max_retries(),
            backoff_min_seconds: default_backoff_min(),
            backoff_max_seconds: default_backoff_max(),
            backoff_multiplier: default_backoff_multiplier(),
            fetch_timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputsConfig {
    pub base_path: PathBuf,
    pub raw_subdir: String,
    pub normalized_subdir: String,
    pub metadata_subdir: String,
    pub media_subdir: String,
}

/// Per-domain allow/deny path rules (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainFilter {
    #[serde(default)]
    pub allow_paths: Vec<String>,
    #[serde(default)]
    pub deny_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub name: String,
    #[serde(default)]
    pub start_urls: Vec<String>,
    #[serde(default)]
    pub allowed_domains: HashMap<String, DomainFilter>,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default)]
    pub plugins: Vec<String>,
    pub parallel_agents: Option<u32>,
    pub pages_per_agent: Option<u32>,
    pub jitter_seconds: Option<f64>,
    pub max_pages: Option<u32>,
    #[serde(default = "default_fetcher")]
    pub fetcher: String,
    #[serde(default)]
    pub fetcher_options: serde_json::Value,
}

fn default_depth() -> u32 {
    1
}
fn default_fetcher() -> String {
    "playwright".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: i32,
    pub default_source: String,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub outputs: OutputsConfig,
    pub sources: Vec<SourceSettings>,
}

impl Config {
    pub fn source(&self, name: &str) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.name == name)
    }
}

/// Effective depth/parallelism precedence: CLI override > source setting >
/// crawler default (spec §4.7).
pub struct EffectiveRunSettings {
    pub depth: u32,
    pub parallel_agents: u32,
    pub pages_per_agent: u32,
}

impl EffectiveRunSettings {
    pub fn resolve(
        crawler: &CrawlerConfig,
        source: &SourceSettings,
        depth_override: Option<u32>,
        parallel_override: Option<u32>,
    ) -> Self {
        Self {
            depth: depth_override.unwrap_or(source.depth),
            parallel_agents: parallel_override
                .or(source.parallel_agents)
                .unwrap_or(crawler.parallel_agents),
            pages_per_agent: source.pages_per_agent.unwrap_or(crawler.pages_per_agent),
        }
    }
}
