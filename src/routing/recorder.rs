use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tracing::debug;

use crate::db::{Conversation, DatabaseManager, MessageInsert, NewMessage, SenderType};
use crate::parsers::InboundEvent;
use crate::tenant::TenantScope;

use super::RoutingError;

/// A message before it is bound to a conversation and timestamped.
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub external_id: Option<String>,
    pub body: Option<String>,
    pub message_type: String,
    pub attachments: Value,
    pub provider_timestamp: Option<DateTime<Utc>>,
}

impl MessageDraft {
    pub fn from_inbound(event: &InboundEvent) -> Self {
        Self {
            sender_type: SenderType::Contact,
            sender_id: None,
            external_id: event.external_id.clone(),
            body: event.body.clone(),
            message_type: event.message_type.clone(),
            attachments: event.attachments_json(),
            provider_timestamp: event.timestamp,
        }
    }

    pub fn text(sender_type: SenderType, sender_id: Option<i64>, body: &str) -> Self {
        Self {
            sender_type,
            sender_id,
            external_id: None,
            body: Some(body.to_string()),
            message_type: "text".to_string(),
            attachments: json!([]),
            provider_timestamp: None,
        }
    }
}

pub struct MessageRecorder {
    db_manager: Arc<DatabaseManager>,
}

impl MessageRecorder {
    pub fn new(db_manager: Arc<DatabaseManager>) -> Self {
        Self { db_manager }
    }

    /// Appends under the conversation lock. `created_at` never goes backwards
    /// within a conversation, so `(created_at, id)` order is append order.
    /// A duplicate `external_id` returns the stored row and touches nothing.
    pub async fn append(
        &self,
        scope: &TenantScope,
        conversation: &mut Conversation,
        draft: MessageDraft,
    ) -> Result<MessageInsert, RoutingError> {
        scope.ensure_owns("conversation", conversation.company_id)?;

        let now = Utc::now();
        let created_at = conversation
            .last_message_at
            .map_or(now, |last| last.max(now));

        let result = self
            .db_manager
            .message_store()
            .insert_message(
                scope,
                &NewMessage {
                    conversation_id: conversation.id,
                    sender_type: draft.sender_type,
                    sender_id: draft.sender_id,
                    external_id: draft.external_id,
                    body: draft.body,
                    message_type: draft.message_type,
                    attachments: draft.attachments,
                    provider_timestamp: draft.provider_timestamp,
                    created_at,
                },
            )
            .await?;

        match &result {
            MessageInsert::Duplicate(existing) => {
                debug!(
                    "duplicate message external_id={:?} conversation_id={} existing_id={}",
                    existing.external_id, conversation.id, existing.id
                );
            }
            MessageInsert::Inserted(message) => {
                conversation.last_message_at = Some(message.created_at);
                conversation.updated_at = now;
                self.db_manager
                    .conversation_store()
                    .save_conversation(scope, conversation)
                    .await?;
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::{MessageDraft, MessageRecorder};
    use crate::db::SenderType;
    use crate::db::testing::TestDatabase;
    use crate::parsers::InboundEvent;

    fn inbound(conversation_channel: i64, external_id: &str, body: &str) -> InboundEvent {
        let mut event = InboundEvent::new(conversation_channel, "message", "+15550001");
        event.external_id = Some(external_id.to_string());
        event.body = Some(body.to_string());
        event
    }

    #[tokio::test]
    async fn append_twice_with_same_external_id_stores_once() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let mut conversation = db.open_conversation(&tenant, "+15550001").await;
        let recorder = MessageRecorder::new(db.manager.clone());
        let event = inbound(conversation.channel_id, "wamid.1", "hello");

        let first = recorder
            .append(&tenant.scope, &mut conversation, MessageDraft::from_inbound(&event))
            .await
            .expect("first append");
        let touched = conversation.last_message_at;
        let second = recorder
            .append(&tenant.scope, &mut conversation, MessageDraft::from_inbound(&event))
            .await
            .expect("second append");

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.message().id, second.message().id);
        assert_eq!(conversation.last_message_at, touched);
        let count = db
            .manager
            .message_store()
            .count_messages(&tenant.scope, conversation.id)
            .await
            .expect("count");
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn created_at_never_moves_backwards() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let mut conversation = db.open_conversation(&tenant, "+15550001").await;
        let recorder = MessageRecorder::new(db.manager.clone());

        let future = Utc::now() + Duration::minutes(5);
        conversation.last_message_at = Some(future);

        let message = recorder
            .append(
                &tenant.scope,
                &mut conversation,
                MessageDraft::text(SenderType::System, None, "clock skew"),
            )
            .await
            .expect("append")
            .into_message();
        assert!(message.created_at.timestamp_micros() >= future.timestamp_micros());
        assert_eq!(conversation.last_message_at, Some(message.created_at));

        let stored = db
            .manager
            .conversation_store()
            .get_conversation(&tenant.scope, conversation.id)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(stored.last_message_at, Some(message.created_at));
    }

    #[tokio::test]
    async fn messages_read_back_in_append_order() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let mut conversation = db.open_conversation(&tenant, "+15550001").await;
        let recorder = MessageRecorder::new(db.manager.clone());

        let channel_id = conversation.channel_id;
        for n in 0..5 {
            let event = inbound(channel_id, &format!("m{n}"), &format!("#{n}"));
            recorder
                .append(&tenant.scope, &mut conversation, MessageDraft::from_inbound(&event))
                .await
                .expect("append");
        }

        let bodies: Vec<_> = db
            .manager
            .message_store()
            .list_messages(&tenant.scope, conversation.id, 50, 0)
            .await
            .expect("list")
            .into_iter()
            .filter_map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["#0", "#1", "#2", "#3", "#4"]);
    }
}
