use crate::rule::RuleSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    /// Sets both the consume and the produce datacenter.
    #[serde(default)]
    pub dc_name: Option<String>,
    #[serde(default)]
    pub consume_dc: Option<String>,
    #[serde(default)]
    pub produce_dc: Option<String>,
    #[serde(default)]
    pub startup_delay_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Raw librdkafka properties applied on top of the consumer defaults.
    #[serde(default)]
    pub consumer: BTreeMap<String, String>,
    #[serde(default)]
    pub producer: BTreeMap<String, String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            dc_name: None,
            consume_dc: None,
            produce_dc: None,
            startup_delay_ms: 0,
            poll_interval_ms: default_poll_interval(),
            consumer: BTreeMap::new(),
            producer: BTreeMap::new(),
        }
    }
}

impl KafkaConfig {
    pub fn consume_dc(&self) -> String {
        resolve_dc(self.dc_name.as_deref(), self.consume_dc.as_deref())
    }

    pub fn produce_dc(&self) -> String {
        resolve_dc(self.dc_name.as_deref(), self.produce_dc.as_deref())
    }
}

/// An explicitly empty name on either field disables prefixing.
fn resolve_dc(dc_name: Option<&str>, specific: Option<&str>) -> String {
    if dc_name == Some("") || specific == Some("") {
        return String::new();
    }
    dc_name
        .or(specific)
        .map(str::to_string)
        .unwrap_or_else(default_dc)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_commit_interval")]
    pub commit_interval_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            commit_interval_ms: default_commit_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_api_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_broadcast_topic")]
    pub topic: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            topic: default_broadcast_topic(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_brokers() -> Vec<String> {
    vec!["127.0.0.1:9092".to_string()]
}
fn default_dc() -> String {
    "datacenter1".to_string()
}
fn default_poll_interval() -> u64 {
    10
}
fn default_concurrency() -> usize {
    30
}
fn default_commit_interval() -> u64 {
    500
}
fn default_user_agent() -> String {
    "ChangePropagation".to_string()
}
fn default_api_listen() -> String {
    "0.0.0.0:7272".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_listen() -> String {
    "0.0.0.0:9102".to_string()
}
fn default_broadcast_topic() -> String {
    crate::types::RULES_TOPIC.to_string()
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::error::Error::Config(format!("failed to parse config: {e}")))?;
        Ok(config)
    }
}
