use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::IngestConfig;
use crate::db::{DatabaseManager, NewWebhookEvent, WebhookEvent};
use crate::parsers::adapter_for;
use crate::routing::{RoutingCore, RoutingError};
use crate::tenant::{Tenant, TenantContext};
use crate::web::metrics::Metrics;

use super::IngestError;

/// A stored event waiting for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    pub company_id: i64,
    pub event_id: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct Receipt {
    pub event_id: i64,
    pub queued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { messages: usize },
    AlreadyProcessed,
    Failed { error: String, retryable: bool },
    Missing,
}

/// Stores every delivery before touching routing, then processes it inline or
/// through the worker queue. The single place that decides processed versus
/// retry.
pub struct WebhookIngestor {
    db_manager: Arc<DatabaseManager>,
    tenants: TenantContext,
    core: Arc<RoutingCore>,
    queue: Option<mpsc::Sender<QueuedEvent>>,
    processing_timeout: Duration,
    max_attempts: i32,
}

impl WebhookIngestor {
    pub fn new(db_manager: Arc<DatabaseManager>, core: Arc<RoutingCore>, config: &IngestConfig) -> Self {
        Self {
            tenants: TenantContext::new(db_manager.clone()),
            db_manager,
            core,
            queue: None,
            processing_timeout: Duration::from_millis(config.processing_timeout_ms),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Without a queue every event is processed inside `receive`.
    pub fn with_queue(mut self, sender: mpsc::Sender<QueuedEvent>) -> Self {
        self.queue = Some(sender);
        self
    }

    pub fn max_attempts(&self) -> i32 {
        self.max_attempts
    }

    pub async fn receive(
        &self,
        channel_id: i64,
        event_type: &str,
        payload: Value,
    ) -> Result<Receipt, IngestError> {
        let (tenant, channel) = self.tenants.for_channel(channel_id).await?;
        let stored = self
            .db_manager
            .webhook_store()
            .create_webhook_event(
                &tenant.scope,
                &NewWebhookEvent {
                    channel_id: channel.id,
                    event_type: event_type.to_string(),
                    payload,
                },
            )
            .await?;
        Metrics::event_received();
        debug!(
            "stored webhook event_id={} channel_id={} company_id={}",
            stored.id, channel.id, tenant.company.id
        );

        let job = QueuedEvent {
            company_id: tenant.company.id,
            event_id: stored.id,
        };
        let queued = match &self.queue {
            Some(sender) => match sender.try_send(job) {
                Ok(()) => {
                    Metrics::queue_depth_inc();
                    true
                }
                Err(TrySendError::Full(job)) => {
                    warn!("ingest queue full, event_id={} left for the retry reaper", job.event_id);
                    false
                }
                Err(TrySendError::Closed(job)) => {
                    warn!("ingest queue closed, event_id={} left for the retry reaper", job.event_id);
                    false
                }
            },
            None => {
                if let Err(err) = self.process(job.company_id, job.event_id).await {
                    error!("failed to process webhook event_id={}: {}", job.event_id, err);
                }
                false
            }
        };

        Ok(Receipt {
            event_id: stored.id,
            queued,
        })
    }

    /// Runs one attempt on a stored event and records the outcome on its row.
    /// `Err` only when the outcome itself cannot be recorded.
    pub async fn process(&self, company_id: i64, event_id: i64) -> Result<ProcessOutcome, IngestError> {
        let span = info_span!(
            "webhook_event",
            event_id,
            company_id,
            channel_id = tracing::field::Empty
        );
        self.process_in_span(company_id, event_id)
            .instrument(span)
            .await
    }

    async fn process_in_span(&self, company_id: i64, event_id: i64) -> Result<ProcessOutcome, IngestError> {
        let tenant = self.tenants.for_company(company_id).await?;
        let scope = &tenant.scope;
        let store = self.db_manager.webhook_store();

        let Some(event) = store.get_webhook_event(scope, event_id).await? else {
            warn!("webhook event vanished before processing");
            return Ok(ProcessOutcome::Missing);
        };
        tracing::Span::current().record("channel_id", event.channel_id);
        if event.processed {
            debug!("webhook event already processed");
            return Ok(ProcessOutcome::AlreadyProcessed);
        }

        let attempt = store.begin_attempt(scope, event_id).await?;
        let (message, transient) =
            match tokio::time::timeout(self.processing_timeout, self.route(&tenant, &event)).await {
                Ok(Ok(messages)) => {
                    store.mark_processed(scope, event_id).await?;
                    Metrics::event_processed();
                    info!(
                        "processed webhook event with {} message(s) on attempt {}",
                        messages, attempt
                    );
                    return Ok(ProcessOutcome::Processed { messages });
                }
                Ok(Err(err)) => (err.to_string(), err.is_retryable()),
                Err(_) => (
                    format!("processing timed out after {:?}", self.processing_timeout),
                    true,
                ),
            };

        let retryable = transient && attempt < self.max_attempts;
        store.mark_failed(scope, event_id, &message, retryable).await?;
        Metrics::event_failed();
        if retryable {
            warn!(
                "webhook event failed on attempt {}/{}, will retry: {}",
                attempt, self.max_attempts, message
            );
        } else {
            error!(
                "webhook event failed permanently on attempt {}: {}",
                attempt, message
            );
        }
        Ok(ProcessOutcome::Failed {
            error: message,
            retryable,
        })
    }

    async fn route(&self, tenant: &Tenant, event: &WebhookEvent) -> Result<usize, RoutingError> {
        let channel = self
            .db_manager
            .tenant_store()
            .get_channel(&tenant.scope, event.channel_id)
            .await?
            .ok_or_else(|| RoutingError::NotFound(format!("channel {}", event.channel_id)))?;

        let inbound = adapter_for(channel.provider).normalize(&channel, &event.event_type, &event.payload)?;
        if inbound.is_empty() {
            debug!("webhook event carried no conversational messages");
        }
        for item in &inbound {
            let outcome = self.core.handle_inbound(tenant, &channel, item).await?;
            debug!(
                "routed message_id={} to conversation_id={} ({:?}, duplicate={})",
                outcome.message_id, outcome.conversation_id, outcome.state, outcome.duplicate
            );
        }
        Ok(inbound.len())
    }
}

#[cfg(test)]
pub(crate) fn test_ingestor(
    db: &crate::db::testing::TestDatabase,
    config: &IngestConfig,
    flow: Arc<dyn crate::routing::BotFlowEngine>,
) -> WebhookIngestor {
    use crate::config::{RoutingConfig, TicketsConfig};

    let core = Arc::new(RoutingCore::new(
        db.manager.clone(),
        &RoutingConfig::default(),
        &TicketsConfig::default(),
        flow,
    ));
    WebhookIngestor::new(db.manager.clone(), core, config)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::{ProcessOutcome, test_ingestor};
    use crate::config::IngestConfig;
    use crate::db::testing::TestDatabase;
    use crate::db::{
        Bot, ChannelProvider, ChannelStatus, Conversation, ConversationFilter, ConversationState,
        NewChannel, WebhookEvent,
    };
    use crate::ingest::IngestError;
    use crate::parsers::InboundEvent;
    use crate::routing::{BotFlowEngine, FlowError, FlowReply, PassiveFlowEngine};
    use crate::tenant::Tenant;

    struct SlowFlow;

    #[async_trait]
    impl BotFlowEngine for SlowFlow {
        async fn run(
            &self,
            _bot: &Bot,
            _conversation: &Conversation,
            _event: &InboundEvent,
        ) -> Result<FlowReply, FlowError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(FlowReply::keep_going())
        }
    }

    /// Stalls on its first run only.
    struct SlowOnceFlow(AtomicUsize);

    #[async_trait]
    impl BotFlowEngine for SlowOnceFlow {
        async fn run(
            &self,
            _bot: &Bot,
            _conversation: &Conversation,
            _event: &InboundEvent,
        ) -> Result<FlowReply, FlowError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(FlowReply::keep_going())
        }
    }

    fn inline_config() -> IngestConfig {
        IngestConfig {
            workers: 0,
            ..Default::default()
        }
    }

    async fn stored_event(db: &TestDatabase, tenant: &Tenant, id: i64) -> WebhookEvent {
        db.manager
            .webhook_store()
            .get_webhook_event(&tenant.scope, id)
            .await
            .expect("load")
            .expect("event row")
    }

    fn generic(phone: &str, id: &str, text: &str) -> Value {
        json!({"from": phone, "id": id, "text": text})
    }

    #[tokio::test]
    async fn inline_receive_routes_and_marks_processed() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let ingestor = test_ingestor(&db, &inline_config(), Arc::new(PassiveFlowEngine));

        let receipt = ingestor
            .receive(channel.id, "message", generic("+15550001", "m1", "hello"))
            .await
            .expect("receive");
        assert!(!receipt.queued);

        let event = stored_event(&db, &tenant, receipt.event_id).await;
        assert!(event.processed);
        assert_eq!(event.attempts, 1);
        assert!(event.processing_error.is_none());
        assert!(event.processed_at.is_some());

        let conversations = db
            .manager
            .conversation_store()
            .list_conversations(&tenant.scope, &ConversationFilter { limit: 10, ..Default::default() })
            .await
            .expect("list");
        assert_eq!(conversations.len(), 1);
    }

    #[tokio::test]
    async fn unknown_channel_is_rejected_without_storing() {
        let db = TestDatabase::new().await;
        let ingestor = test_ingestor(&db, &inline_config(), Arc::new(PassiveFlowEngine));

        let err = ingestor
            .receive(9999, "message", generic("+15550001", "m1", "hello"))
            .await
            .expect_err("unknown channel");
        assert!(matches!(err, IngestError::UnknownChannel(9999)));
        assert_eq!(
            db.manager
                .webhook_store()
                .count_unprocessed_unscoped()
                .await
                .expect("count"),
            0
        );
    }

    #[tokio::test]
    async fn malformed_payload_is_stored_as_permanent_failure() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let ingestor = test_ingestor(&db, &inline_config(), Arc::new(PassiveFlowEngine));

        let receipt = ingestor
            .receive(channel.id, "message", json!({"text": "who am I"}))
            .await
            .expect("acknowledged");

        let event = stored_event(&db, &tenant, receipt.event_id).await;
        assert!(!event.processed);
        assert!(!event.retryable);
        assert!(
            event
                .processing_error
                .as_deref()
                .is_some_and(|e| e.contains("malformed"))
        );
    }

    #[tokio::test]
    async fn redelivered_payload_records_one_message() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let ingestor = test_ingestor(&db, &inline_config(), Arc::new(PassiveFlowEngine));
        let payload = generic("+15550001", "m1", "hello");

        let first = ingestor.receive(channel.id, "message", payload.clone()).await.expect("first");
        let second = ingestor.receive(channel.id, "message", payload).await.expect("second");
        assert_ne!(first.event_id, second.event_id);
        assert!(stored_event(&db, &tenant, second.event_id).await.processed);

        let conversations = db
            .manager
            .conversation_store()
            .list_conversations(&tenant.scope, &ConversationFilter { limit: 10, ..Default::default() })
            .await
            .expect("list");
        let count = db
            .manager
            .message_store()
            .count_messages(&tenant.scope, conversations[0].id)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn timeout_is_retryable_and_retry_is_idempotent() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let bot = db.bot(&tenant, "slow").await;
        db.bind(&tenant, &channel, &bot, json!(true)).await;
        let config = IngestConfig {
            workers: 0,
            processing_timeout_ms: 1000,
            max_attempts: 5,
            ..Default::default()
        };
        let flow = Arc::new(SlowOnceFlow(AtomicUsize::new(0)));
        let ingestor = test_ingestor(&db, &config, flow.clone());

        let receipt = ingestor
            .receive(channel.id, "message", generic("+15550001", "m1", "hello"))
            .await
            .expect("acknowledged");
        let event = stored_event(&db, &tenant, receipt.event_id).await;
        assert!(!event.processed);
        assert!(event.retryable);
        assert!(event.processing_error.as_deref().is_some_and(|e| e.contains("timed out")));

        let outcome = ingestor
            .process(tenant.company.id, receipt.event_id)
            .await
            .expect("second attempt");
        assert_eq!(outcome, ProcessOutcome::Processed { messages: 1 });
        let event = stored_event(&db, &tenant, receipt.event_id).await;
        assert_eq!(event.attempts, 2);
        assert!(event.processed);

        // The stored message is not duplicated but its routing is finished.
        assert_eq!(flow.0.load(Ordering::SeqCst), 2);
        let conversations = db
            .manager
            .conversation_store()
            .list_conversations(&tenant.scope, &ConversationFilter { limit: 10, ..Default::default() })
            .await
            .expect("list");
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].state, ConversationState::BotActive { bot_id: bot.id });
        let messages = db
            .manager
            .message_store()
            .list_messages(&tenant.scope, conversations[0].id, 10, 0)
            .await
            .expect("messages");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].routed_at.is_some());

        let again = ingestor
            .process(tenant.company.id, receipt.event_id)
            .await
            .expect("third call");
        assert_eq!(again, ProcessOutcome::AlreadyProcessed);
    }

    #[tokio::test]
    async fn last_attempt_is_not_retryable() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "web").await;
        let bot = db.bot(&tenant, "slow").await;
        db.bind(&tenant, &channel, &bot, json!(true)).await;
        let config = IngestConfig {
            workers: 0,
            processing_timeout_ms: 1000,
            max_attempts: 1,
            ..Default::default()
        };
        let ingestor = test_ingestor(&db, &config, Arc::new(SlowFlow));

        let receipt = ingestor
            .receive(channel.id, "message", generic("+15550001", "m1", "hello"))
            .await
            .expect("acknowledged");
        let event = stored_event(&db, &tenant, receipt.event_id).await;
        assert!(!event.processed);
        assert!(!event.retryable);
        assert_eq!(event.attempts, 1);
    }

    #[tokio::test]
    async fn whatsapp_delivery_routes_messages_and_ignores_receipts() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db
            .manager
            .tenant_store()
            .create_channel(
                &tenant.scope,
                &NewChannel {
                    name: "whatsapp".to_string(),
                    provider: ChannelProvider::WhatsApp,
                    external_id: Some("PN-1".to_string()),
                    status: ChannelStatus::Active,
                },
            )
            .await
            .expect("channel");
        let ingestor = test_ingestor(&db, &inline_config(), Arc::new(PassiveFlowEngine));

        let value = |messages: Value, statuses: Value| {
            json!({
                "object": "whatsapp_business_account",
                "entry": [{
                    "id": "WABA-1",
                    "changes": [{
                        "field": "messages",
                        "value": {
                            "messaging_product": "whatsapp",
                            "metadata": {"display_phone_number": "15550000000", "phone_number_id": "PN-1"},
                            "contacts": [{"wa_id": "15551234567", "profile": {"name": "Ada"}}],
                            "messages": messages,
                            "statuses": statuses
                        }
                    }]
                }]
            })
        };

        let receipt = ingestor
            .receive(
                channel.id,
                "message",
                value(
                    json!([{"id": "wamid.A", "from": "15551234567", "timestamp": "1700000000", "type": "text", "text": {"body": "hi"}}]),
                    json!([]),
                ),
            )
            .await
            .expect("message delivery");
        assert!(stored_event(&db, &tenant, receipt.event_id).await.processed);

        let receipt = ingestor
            .receive(
                channel.id,
                "message",
                value(json!([]), json!([{"id": "wamid.A", "status": "read"}])),
            )
            .await
            .expect("status delivery");
        assert!(stored_event(&db, &tenant, receipt.event_id).await.processed);

        let conversations = db
            .manager
            .conversation_store()
            .list_conversations(&tenant.scope, &ConversationFilter { limit: 10, ..Default::default() })
            .await
            .expect("list");
        assert_eq!(conversations.len(), 1);
        let contact = db
            .manager
            .contact_store()
            .get_contact(&tenant.scope, conversations[0].contact_id)
            .await
            .expect("load")
            .expect("contact");
        assert_eq!(contact.phone, "+15551234567");
        assert_eq!(contact.name.as_deref(), Some("Ada"));
    }
}
