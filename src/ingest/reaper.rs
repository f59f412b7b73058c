use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::IngestConfig;
use crate::db::{DatabaseError, DatabaseManager};
use crate::web::metrics::Metrics;

use super::{ProcessOutcome, WebhookIngestor};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    pub scanned: usize,
    pub processed: usize,
    pub failed: usize,
}

/// Periodically re-drives stored events that are neither processed nor
/// permanently failed: queue overflow, crashes between insert and processing,
/// and transient failures all end up here.
pub struct RetryReaper {
    ingestor: Arc<WebhookIngestor>,
    db_manager: Arc<DatabaseManager>,
    interval: Duration,
    grace: chrono::Duration,
    batch: i64,
}

impl RetryReaper {
    pub fn new(
        ingestor: Arc<WebhookIngestor>,
        db_manager: Arc<DatabaseManager>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            ingestor,
            db_manager,
            interval: Duration::from_secs(config.reaper_interval_secs.max(1)),
            grace: chrono::Duration::seconds(config.reaper_grace_secs.max(0)),
            batch: config.reaper_batch.max(1),
        }
    }

    /// Retries events last touched before `updated_before`, oldest first.
    pub async fn reap(&self, updated_before: DateTime<Utc>) -> Result<ReapSummary, DatabaseError> {
        let events = self
            .db_manager
            .webhook_store()
            .list_retryable_unscoped(self.ingestor.max_attempts(), updated_before, self.batch)
            .await?;

        let mut summary = ReapSummary {
            scanned: events.len(),
            ..Default::default()
        };
        for event in events {
            Metrics::event_retried();
            debug!(
                "retrying webhook event_id={} after {} attempt(s)",
                event.id, event.attempts
            );
            match self.ingestor.process(event.company_id, event.id).await {
                Ok(ProcessOutcome::Processed { .. }) | Ok(ProcessOutcome::AlreadyProcessed) => {
                    summary.processed += 1
                }
                Ok(ProcessOutcome::Failed { .. }) | Ok(ProcessOutcome::Missing) => {
                    summary.failed += 1
                }
                Err(err) => {
                    summary.failed += 1;
                    error!("retry of webhook event_id={} failed: {}", event.id, err);
                }
            }
        }
        Ok(summary)
    }

    /// One pass over events idle longer than the grace period.
    pub async fn run_once(&self) -> Result<ReapSummary, DatabaseError> {
        self.reap(Utc::now() - self.grace).await
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "retry reaper started, interval={:?} grace={}s",
            self.interval,
            self.grace.num_seconds()
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once().await {
                Ok(summary) if summary.scanned > 0 => info!(
                    "retry pass: scanned={} processed={} failed={}",
                    summary.scanned, summary.processed, summary.failed
                ),
                Ok(_) => {}
                Err(err) => warn!("retry pass failed: {}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::RetryReaper;
    use crate::config::IngestConfig;
    use crate::db::testing::TestDatabase;
    use crate::ingest::ingestor::test_ingestor;
    use crate::routing::PassiveFlowEngine;

    #[tokio::test]
    async fn reaper_picks_up_events_the_queue_dropped() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let config = IngestConfig {
            queue_capacity: 1,
            ..Default::default()
        };
        // No workers: the first event sits in the queue, the second overflows.
        let (sender, _receiver) = mpsc::channel(1);
        let ingestor = Arc::new(
            test_ingestor(&db, &config, Arc::new(PassiveFlowEngine)).with_queue(sender),
        );

        let first = ingestor
            .receive(channel.id, "message", json!({"from": "+15550001", "id": "m1", "text": "a"}))
            .await
            .expect("first");
        let second = ingestor
            .receive(channel.id, "message", json!({"from": "+15550002", "id": "m2", "text": "b"}))
            .await
            .expect("second");
        assert!(first.queued);
        assert!(!second.queued);

        let reaper = RetryReaper::new(ingestor, db.manager.clone(), &config);
        let summary = reaper
            .reap(Utc::now() + Duration::seconds(1))
            .await
            .expect("reap");
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.processed, 2);

        let store = db.manager.webhook_store();
        assert_eq!(store.count_unprocessed_unscoped().await.expect("count"), 0);
        let again = reaper
            .reap(Utc::now() + Duration::seconds(1))
            .await
            .expect("second pass");
        assert_eq!(again.scanned, 0);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let config = IngestConfig {
            workers: 0,
            ..Default::default()
        };
        let ingestor = Arc::new(test_ingestor(&db, &config, Arc::new(PassiveFlowEngine)));
        ingestor
            .receive(channel.id, "message", json!({"text": "no sender"}))
            .await
            .expect("acknowledged");

        let reaper = RetryReaper::new(ingestor, db.manager.clone(), &config);
        let summary = reaper
            .run_once()
            .await
            .expect("reap");
        assert_eq!(summary.scanned, 0);
        assert_eq!(
            db.manager
                .webhook_store()
                .count_unprocessed_unscoped()
                .await
                .expect("count"),
            1
        );
    }
}
