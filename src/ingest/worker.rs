use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::web::metrics::Metrics;

use super::{ProcessOutcome, QueuedEvent, WebhookIngestor};

/// Starts `workers` tasks draining one shared queue. Each task exits once the
/// sending side is dropped and the queue is empty.
pub fn spawn_workers(
    ingestor: Arc<WebhookIngestor>,
    receiver: mpsc::Receiver<QueuedEvent>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    let receiver = Arc::new(Mutex::new(receiver));
    (0..workers.max(1))
        .map(|worker_id| {
            let ingestor = ingestor.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                debug!("ingest worker {} started", worker_id);
                loop {
                    let next = receiver.lock().await.recv().await;
                    let Some(job) = next else {
                        break;
                    };
                    Metrics::queue_depth_dec();
                    match ingestor.process(job.company_id, job.event_id).await {
                        Ok(ProcessOutcome::Missing) => {
                            debug!("worker {} skipped missing event_id={}", worker_id, job.event_id)
                        }
                        Ok(_) => {}
                        Err(err) => error!(
                            "worker {} could not record outcome for event_id={}: {}",
                            worker_id, job.event_id, err
                        ),
                    }
                }
                info!("ingest worker {} stopped", worker_id);
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::spawn_workers;
    use crate::config::IngestConfig;
    use crate::db::testing::TestDatabase;
    use crate::ingest::ingestor::test_ingestor;
    use crate::routing::PassiveFlowEngine;

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let (sender, receiver) = mpsc::channel(16);
        let ingestor = Arc::new(
            test_ingestor(&db, &IngestConfig::default(), Arc::new(PassiveFlowEngine))
                .with_queue(sender),
        );
        let handles = spawn_workers(ingestor.clone(), receiver, 2);

        for n in 0..3 {
            let receipt = tokio_test::assert_ok!(
                ingestor
                    .receive(
                        channel.id,
                        "message",
                        json!({"from": format!("+1555000{n}"), "id": format!("m{n}"), "text": "hi"}),
                    )
                    .await
            );
            assert!(receipt.queued);
        }

        let store = db.manager.webhook_store();
        let mut remaining = 3;
        for _ in 0..100 {
            remaining = store.count_unprocessed_unscoped().await.expect("count");
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(remaining, 0);

        for handle in handles {
            handle.abort();
        }
    }
}
