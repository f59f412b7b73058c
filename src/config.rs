pub use self::parser::{
    ClosedPolicy, Config, DatabaseConfig, DbType, FlowEngineConfig, IngestConfig, LoggingConfig,
    RoutingConfig, ServerConfig, TicketsConfig, WebhookConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
