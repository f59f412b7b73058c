use secrecy::ExposeSecret;
use thiserror::Error;

use super::parser::Config;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::InvalidConfig(message.to_string())
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.admin_token.expose_secret().trim().is_empty() {
            return Err(invalid("server.admin_token cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(invalid("server.port must be between 1 and 65535"));
        }

        if self.database.connection_string().is_empty() {
            return Err(invalid("database connection string cannot be empty"));
        }

        if self.ingest.processing_timeout_ms == 0 {
            return Err(invalid("ingest.processing_timeout_ms must be greater than 0"));
        }

        if self.ingest.max_attempts < 1 {
            return Err(invalid("ingest.max_attempts must be at least 1"));
        }

        if self.ingest.queue_capacity == 0 {
            return Err(invalid("ingest.queue_capacity must be greater than 0"));
        }

        if self.tickets.max_number_attempts == 0 {
            return Err(invalid("tickets.max_number_attempts must be at least 1"));
        }

        if self.tickets.prefix.trim().is_empty() {
            return Err(invalid("tickets.prefix cannot be empty"));
        }

        if let Some(url) = &self.flow_engine.url {
            url::Url::parse(url).map_err(|e| {
                ConfigError::InvalidConfig(format!("flow_engine.url is not a valid URL: {e}"))
            })?;
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "logging.format must be pretty or json, got {other}"
                )));
            }
        }

        Ok(())
    }
}
