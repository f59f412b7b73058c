#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

mod cli;
mod config;
mod db;
mod ingest;
mod parsers;
mod routing;
mod tenant;
mod utils;
mod web;

use cli::{Cli, Command};
use config::Config;
use ingest::{RetryReaper, WebhookIngestor, spawn_workers};
use routing::{BotFlowEngine, HttpFlowEngine, PassiveFlowEngine, RoutingCore};
use web::WebServer;
use web::metrics::Metrics;

fn flow_engine(config: &Config) -> Result<Arc<dyn BotFlowEngine>> {
    match &config.flow_engine.url {
        Some(raw) => {
            let url = Url::parse(raw).with_context(|| format!("invalid flow_engine.url {raw}"))?;
            let timeout = Duration::from_millis(config.flow_engine.timeout_ms);
            info!("bot flows are delegated to {}", url);
            Ok(Arc::new(HttpFlowEngine::new(url, timeout)?))
        }
        None => {
            info!("no flow engine configured, bots only claim conversations");
            Ok(Arc::new(PassiveFlowEngine))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    let config = Arc::new(config);

    utils::logging::init_tracing(&config.logging);
    Metrics::start();
    info!("conversation router starting up");

    let db_manager = Arc::new(db::DatabaseManager::new(&config.database).await?);
    db_manager.migrate().await?;
    info!("database ready ({})", db_manager.db_type().as_str());

    let command = cli.command();
    if command == Command::Migrate {
        info!("migrations applied");
        return Ok(());
    }

    let core = Arc::new(RoutingCore::new(
        db_manager.clone(),
        &config.routing,
        &config.tickets,
        flow_engine(&config)?,
    ));

    if command == Command::Replay {
        let ingestor = Arc::new(WebhookIngestor::new(db_manager.clone(), core, &config.ingest));
        let reaper = RetryReaper::new(ingestor, db_manager.clone(), &config.ingest);
        let summary = reaper.reap(chrono::Utc::now()).await?;
        info!(
            "replay finished: scanned={} processed={} failed={}",
            summary.scanned, summary.processed, summary.failed
        );
        return Ok(());
    }

    let ingestor = WebhookIngestor::new(db_manager.clone(), core.clone(), &config.ingest);
    let (ingestor, worker_handles) = if config.ingest.workers > 0 {
        let (sender, receiver) = mpsc::channel(config.ingest.queue_capacity.max(1));
        let ingestor = Arc::new(ingestor.with_queue(sender));
        let handles = spawn_workers(ingestor.clone(), receiver, config.ingest.workers);
        info!("started {} ingest worker(s)", handles.len());
        (ingestor, handles)
    } else {
        info!("ingest workers disabled, webhooks are processed inline");
        (Arc::new(ingestor), Vec::new())
    };

    serve(config, db_manager, core, ingestor, worker_handles).await
}

async fn serve(
    config: Arc<Config>,
    db_manager: Arc<db::DatabaseManager>,
    core: Arc<RoutingCore>,
    ingestor: Arc<WebhookIngestor>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
) -> Result<()> {
    let reaper = Arc::new(RetryReaper::new(
        ingestor.clone(),
        db_manager.clone(),
        &config.ingest,
    ));
    let reaper_handle = tokio::spawn(reaper.run());

    let web_server = WebServer::new(config.clone(), db_manager, core, ingestor).await?;
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web_server.start().await {
            error!("web server error: {}", e);
        }
    });

    tokio::select! {
        _ = web_handle => {},
        _ = reaper_handle => {},
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    for handle in worker_handles {
        handle.abort();
    }
    info!("conversation router shutting down");
    Ok(())
}
