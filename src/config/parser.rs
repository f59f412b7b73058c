use std::path::Path;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use super::ConfigError;
use crate::db::TicketPriority;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tickets: TicketsConfig,
    #[serde(default)]
    pub flow_engine: FlowEngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(deserialize_with = "deserialize_secret")]
    pub admin_token: SecretString,
}

#[derive(Debug, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub verify_token: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_secret")]
    pub app_secret: Option<SecretString>,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            app_secret: None,
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub conn_string: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub max_connections: Option<u32>,
    #[serde(default)]
    pub min_connections: Option<u32>,
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

impl DatabaseConfig {
    pub fn db_type(&self) -> DbType {
        let url = self.connection_string();
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            DbType::Postgres
        } else {
            DbType::Sqlite
        }
    }

    pub fn connection_string(&self) -> String {
        if let Some(ref url) = self.url {
            url.clone()
        } else if let Some(ref conn) = self.conn_string {
            conn.clone()
        } else if let Some(ref file) = self.filename {
            format!("sqlite://{}", file)
        } else {
            String::new()
        }
    }

    /// Plain filesystem path for SQLite; the `sqlite://` prefix is stripped.
    pub fn sqlite_path(&self) -> Option<String> {
        if let DbType::Sqlite = self.db_type() {
            let url = self.connection_string();
            Some(url.strip_prefix("sqlite://").unwrap_or(&url).to_string())
        } else {
            None
        }
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(10)
    }

    pub fn min_connections(&self) -> u32 {
        self.min_connections.unwrap_or(1)
    }

    pub fn busy_timeout_ms(&self) -> u64 {
        self.busy_timeout_ms.unwrap_or(5000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Zero processes each event inline in the webhook request.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_reaper_grace_secs")]
    pub reaper_grace_secs: i64,
    #[serde(default = "default_reaper_batch")]
    pub reaper_batch: i64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            processing_timeout_ms: default_processing_timeout_ms(),
            max_attempts: default_max_attempts(),
            reaper_interval_secs: default_reaper_interval_secs(),
            reaper_grace_secs: default_reaper_grace_secs(),
            reaper_batch: default_reaper_batch(),
        }
    }
}

/// What an inbound message does to a (contact, channel) pair whose latest
/// conversation is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClosedPolicy {
    #[default]
    Reopen,
    NewConversation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub closed_policy: ClosedPolicy,
    #[serde(default = "default_lock_prune_threshold")]
    pub lock_prune_threshold: usize,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            closed_policy: ClosedPolicy::default(),
            lock_prune_threshold: default_lock_prune_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TicketsConfig {
    #[serde(default = "default_ticket_prefix")]
    pub prefix: String,
    #[serde(default = "default_max_number_attempts")]
    pub max_number_attempts: u32,
    #[serde(default = "default_ticket_priority")]
    pub default_priority: TicketPriority,
}

impl Default for TicketsConfig {
    fn default() -> Self {
        Self {
            prefix: default_ticket_prefix(),
            max_number_attempts: default_max_number_attempts(),
            default_priority: default_ticket_priority(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowEngineConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_flow_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for FlowEngineConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_flow_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(alias = "console", default = "default_log_level")]
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

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        Self::load_from_file(&config_path)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("ROUTER_ADMIN_TOKEN") {
            self.server.admin_token = SecretString::from(value);
        }
        if let Ok(value) = std::env::var("ROUTER_WEBHOOK_APP_SECRET") {
            self.webhook.app_secret = Some(SecretString::from(value));
        }
        if let Ok(value) = std::env::var("ROUTER_WEBHOOK_VERIFY_TOKEN") {
            self.webhook.verify_token = Some(value);
        }
        if let Ok(value) = std::env::var("ROUTER_DATABASE_URL") {
            self.database.url = Some(value);
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    String::deserialize(deserializer).map(SecretString::from)
}

fn deserialize_optional_secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|value| !value.is_empty())
        .map(SecretString::from))
}

fn default_port() -> u16 {
    9010
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_processing_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> i32 {
    5
}

fn default_reaper_interval_secs() -> u64 {
    30
}

fn default_reaper_grace_secs() -> i64 {
    60
}

fn default_reaper_batch() -> i64 {
    100
}

fn default_lock_prune_threshold() -> usize {
    1024
}

fn default_ticket_prefix() -> String {
    "TCK".to_string()
}

fn default_max_number_attempts() -> u32 {
    5
}

fn default_ticket_priority() -> TicketPriority {
    TicketPriority::Normal
}

fn default_flow_timeout_ms() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
