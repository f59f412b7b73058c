//! SQLite fixtures shared by store, routing and ingestion tests.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tempfile::NamedTempFile;

use crate::config::DatabaseConfig;
use crate::db::{
    Bot, Channel, ChannelBot, ChannelProvider, ChannelStatus, Conversation, ConversationState,
    DatabaseManager, NewBot, NewChannel, NewChannelBot, NewCompany, NewContact, NewConversation,
    NewMessage, NewUser, SenderType, User,
};
use crate::tenant::{Tenant, TenantScope};

pub(crate) struct TestDatabase {
    _file: NamedTempFile,
    config: DatabaseConfig,
    pub manager: Arc<DatabaseManager>,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let file = NamedTempFile::new().expect("temp sqlite file");
        let config = DatabaseConfig {
            url: None,
            conn_string: None,
            filename: Some(file.path().to_string_lossy().to_string()),
            max_connections: Some(1),
            min_connections: Some(1),
            busy_timeout_ms: Some(5000),
        };
        let manager = DatabaseManager::new(&config).await.expect("db manager");
        manager.migrate().await.expect("migrate");
        Self {
            _file: file,
            config,
            manager: Arc::new(manager),
        }
    }

    pub async fn reopen(&self) -> DatabaseManager {
        let manager = DatabaseManager::new(&self.config)
            .await
            .expect("db manager reopened");
        manager.migrate().await.expect("migrate reopened");
        manager
    }

    pub async fn company(&self, slug: &str) -> Tenant {
        let company = self
            .manager
            .tenant_store()
            .create_company(&NewCompany {
                name: slug.to_uppercase(),
                slug: slug.to_string(),
                settings: json!({}),
            })
            .await
            .expect("company");
        let scope = TenantScope::from_company(&company);
        Tenant { company, scope }
    }

    pub async fn channel(&self, tenant: &Tenant, name: &str) -> Channel {
        self.manager
            .tenant_store()
            .create_channel(
                &tenant.scope,
                &NewChannel {
                    name: name.to_string(),
                    provider: ChannelProvider::Generic,
                    external_id: None,
                    status: ChannelStatus::Active,
                },
            )
            .await
            .expect("channel")
    }

    pub async fn bot(&self, tenant: &Tenant, name: &str) -> Bot {
        self.manager
            .tenant_store()
            .create_bot(
                &tenant.scope,
                &NewBot {
                    name: name.to_string(),
                    is_active: true,
                    flow_data: json!({"entry": name}),
                },
            )
            .await
            .expect("bot")
    }

    pub async fn bind(
        &self,
        tenant: &Tenant,
        channel: &Channel,
        bot: &Bot,
        trigger_conditions: Value,
    ) -> ChannelBot {
        self.manager
            .tenant_store()
            .create_channel_bot(
                &tenant.scope,
                &NewChannelBot {
                    channel_id: channel.id,
                    bot_id: bot.id,
                    trigger_conditions,
                    is_active: true,
                },
            )
            .await
            .expect("channel bot")
    }

    pub async fn agent(&self, tenant: &Tenant, name: &str) -> User {
        self.manager
            .tenant_store()
            .create_user(
                &tenant.scope,
                &NewUser {
                    name: name.to_string(),
                    email: Some(format!("{}@example.com", name.to_lowercase())),
                },
            )
            .await
            .expect("user")
    }

    pub async fn open_conversation(&self, tenant: &Tenant, phone: &str) -> Conversation {
        let channel = self.channel(tenant, &format!("line-{phone}")).await;
        let (contact, _) = self
            .manager
            .contact_store()
            .insert_or_get_contact(
                &tenant.scope,
                &NewContact {
                    phone: phone.to_string(),
                    name: None,
                    email: None,
                    avatar_url: None,
                    metadata: json!({}),
                },
            )
            .await
            .expect("contact");
        self.manager
            .conversation_store()
            .create_conversation(
                &tenant.scope,
                &NewConversation {
                    contact_id: contact.id,
                    channel_id: channel.id,
                    state: ConversationState::Open,
                    last_message_at: None,
                },
            )
            .await
            .expect("conversation")
    }
}

pub(crate) fn new_message(
    conversation_id: i64,
    external_id: Option<&str>,
    body: &str,
    created_at: DateTime<Utc>,
) -> NewMessage {
    NewMessage {
        conversation_id,
        sender_type: SenderType::Contact,
        sender_id: None,
        external_id: external_id.map(str::to_string),
        body: Some(body.to_string()),
        message_type: "text".to_string(),
        attachments: json!([]),
        provider_timestamp: None,
        created_at,
    }
}
