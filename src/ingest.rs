//! Webhook ingestion: durable insert, queueing, processing and retries.

pub mod error;
pub mod ingestor;
pub mod reaper;
pub mod worker;

pub use error::IngestError;
pub use ingestor::{ProcessOutcome, QueuedEvent, Receipt, WebhookIngestor};
pub use reaper::{ReapSummary, RetryReaper};
pub use worker::spawn_workers;
