use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use once_cell::sync::OnceCell;
use salvo::prelude::*;
use secrecy::SecretString;
use tracing::info;

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::ingest::WebhookIngestor;
use crate::routing::RoutingCore;
use crate::tenant::TenantContext;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::middleware::auth::create_router;

#[derive(Clone)]
pub struct WebState {
    pub db_manager: Arc<DatabaseManager>,
    pub core: Arc<RoutingCore>,
    pub ingestor: Arc<WebhookIngestor>,
    pub tenants: TenantContext,
    pub admin_token: SecretString,
    pub verify_token: Option<String>,
    pub app_secret: Option<SecretString>,
    pub max_body_bytes: usize,
    pub started_at: Instant,
}

static WEB_STATE: OnceCell<WebState> = OnceCell::new();

/// `None` only before [`WebServer::new`] has run.
pub fn web_state() -> Option<&'static WebState> {
    WEB_STATE.get()
}

#[derive(Clone)]
pub struct WebServer {
    config: Arc<Config>,
}

impl WebServer {
    pub async fn new(
        config: Arc<Config>,
        db_manager: Arc<DatabaseManager>,
        core: Arc<RoutingCore>,
        ingestor: Arc<WebhookIngestor>,
    ) -> Result<Self> {
        let _ = WEB_STATE.set(WebState {
            tenants: TenantContext::new(db_manager.clone()),
            db_manager,
            core,
            ingestor,
            admin_token: config.server.admin_token.clone(),
            verify_token: config.webhook.verify_token.clone(),
            app_secret: config.webhook.app_secret.clone(),
            max_body_bytes: config.webhook.max_body_bytes,
            started_at: Instant::now(),
        });

        Ok(Self { config })
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.server.bind_address, self.config.server.port
        );
        info!("Starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
