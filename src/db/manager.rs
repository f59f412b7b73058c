use std::sync::Arc;

use tracing::info;

use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{
    ContactStore, ConversationStore, DatabaseError, MessageStore, TenantStore, TicketStore,
    WebhookEventStore,
};

#[cfg(feature = "postgres")]
use crate::db::postgres::PostgresStore;
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{SqliteStore, establish_connection};
#[cfg(all(feature = "sqlite", not(feature = "postgres")))]
use diesel::RunQueryDsl;
#[cfg(feature = "sqlite")]
use diesel::connection::SimpleConnection;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    busy_timeout_ms: u64,
    tenant_store: Arc<dyn TenantStore>,
    contact_store: Arc<dyn ContactStore>,
    conversation_store: Arc<dyn ConversationStore>,
    message_store: Arc<dyn MessageStore>,
    ticket_store: Arc<dyn TicketStore>,
    webhook_store: Arc<dyn WebhookEventStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Postgres => "postgres",
            DbType::Sqlite => "sqlite",
        }
    }
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());
        let busy_timeout_ms = config.busy_timeout_ms();

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let manager = ConnectionManager::<PgConnection>::new(config.connection_string());

                let pool = r2d2::Pool::builder()
                    .max_size(config.max_connections())
                    .min_idle(Some(config.min_connections()))
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                let store = Arc::new(PostgresStore::new(pool.clone()));

                Ok(Self {
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    busy_timeout_ms,
                    tenant_store: store.clone(),
                    contact_store: store.clone(),
                    conversation_store: store.clone(),
                    message_store: store.clone(),
                    ticket_store: store.clone(),
                    webhook_store: store,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path is not configured".to_string())
                })?;

                let store = Arc::new(SqliteStore::new(Arc::new(path.clone()), busy_timeout_ms));

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    sqlite_path: Some(path),
                    busy_timeout_ms,
                    tenant_store: store.clone(),
                    contact_store: store.clone(),
                    conversation_store: store.clone(),
                    message_store: store.clone(),
                    ticket_store: store.clone(),
                    webhook_store: store,
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        info!("applying {:?} schema", self.db_type);
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.clone().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool is not initialized".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.clone().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path is not configured".to_string())
                })?;
                Self::migrate_sqlite(path, self.busy_timeout_ms).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: Pool) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS companies (
                    id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    settings TEXT NOT NULL DEFAULT '{}',
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channels (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    external_id TEXT,
                    status TEXT NOT NULL,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (company_id, name)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS bots (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    flow_data TEXT NOT NULL DEFAULT '{}',
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_bots (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    channel_id BIGINT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                    bot_id BIGINT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                    trigger_conditions TEXT NOT NULL DEFAULT 'null',
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (channel_id, bot_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    email TEXT,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS contacts (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    phone TEXT NOT NULL,
                    name TEXT,
                    email TEXT,
                    avatar_url TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    UNIQUE (company_id, phone)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    contact_id BIGINT NOT NULL REFERENCES contacts(id),
                    channel_id BIGINT NOT NULL REFERENCES channels(id),
                    status TEXT NOT NULL,
                    bot_id BIGINT REFERENCES bots(id),
                    assigned_to BIGINT REFERENCES users(id),
                    last_message_at TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    CHECK (bot_id IS NULL OR assigned_to IS NULL)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    sender_type TEXT NOT NULL,
                    sender_id BIGINT,
                    external_id TEXT,
                    body TEXT,
                    message_type TEXT NOT NULL DEFAULT 'text',
                    attachments TEXT NOT NULL DEFAULT '[]',
                    provider_timestamp TIMESTAMP WITH TIME ZONE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    routed_at TIMESTAMP WITH TIME ZONE,
                    UNIQUE (conversation_id, external_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS tickets (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    conversation_id BIGINT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    ticket_number TEXT NOT NULL UNIQUE,
                    subject TEXT NOT NULL,
                    reason TEXT,
                    status TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    assigned_to BIGINT REFERENCES users(id),
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS webhook_events (
                    id BIGSERIAL PRIMARY KEY,
                    company_id BIGINT NOT NULL REFERENCES companies(id),
                    channel_id BIGINT NOT NULL REFERENCES channels(id),
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    processed BOOLEAN NOT NULL DEFAULT FALSE,
                    processing_error TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    retryable BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
                    processed_at TIMESTAMP WITH TIME ZONE
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_channel_bots_priority ON channel_bots(channel_id, created_at, id)",
                "CREATE INDEX IF NOT EXISTS idx_conversations_pair ON conversations(company_id, contact_id, channel_id, created_at)",
                "CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(company_id, status, updated_at)",
                "CREATE INDEX IF NOT EXISTS idx_messages_order ON messages(conversation_id, created_at, id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_external ON messages(company_id, external_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_conversation ON tickets(conversation_id)",
                "CREATE INDEX IF NOT EXISTS idx_webhook_events_backlog ON webhook_events(processed, retryable, updated_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: String, busy_timeout_ms: u64) -> Result<(), DatabaseError> {
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&path, busy_timeout_ms)?;
            conn.batch_execute("PRAGMA journal_mode = WAL;")
                .map_err(|e| DatabaseError::Migration(e.to_string()))?;

            let statements = [
                r#"
                CREATE TABLE IF NOT EXISTS companies (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL UNIQUE,
                    settings TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channels (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    provider TEXT NOT NULL,
                    external_id TEXT,
                    status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (company_id, name)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS bots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL DEFAULT 1,
                    flow_data TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS channel_bots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                    bot_id INTEGER NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                    trigger_conditions TEXT NOT NULL DEFAULT 'null',
                    is_active BOOLEAN NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    UNIQUE (channel_id, bot_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    name TEXT NOT NULL,
                    email TEXT,
                    created_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS contacts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    phone TEXT NOT NULL,
                    name TEXT,
                    email TEXT,
                    avatar_url TEXT,
                    metadata TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    UNIQUE (company_id, phone)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS conversations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    contact_id INTEGER NOT NULL REFERENCES contacts(id),
                    channel_id INTEGER NOT NULL REFERENCES channels(id),
                    status TEXT NOT NULL,
                    bot_id INTEGER REFERENCES bots(id),
                    assigned_to INTEGER REFERENCES users(id),
                    last_message_at TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    CHECK (bot_id IS NULL OR assigned_to IS NULL)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    sender_type TEXT NOT NULL,
                    sender_id INTEGER,
                    external_id TEXT,
                    body TEXT,
                    message_type TEXT NOT NULL DEFAULT 'text',
                    attachments TEXT NOT NULL DEFAULT '[]',
                    provider_timestamp TEXT,
                    created_at TEXT NOT NULL,
                    routed_at TEXT,
                    UNIQUE (conversation_id, external_id)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS tickets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                    ticket_number TEXT NOT NULL UNIQUE,
                    subject TEXT NOT NULL,
                    reason TEXT,
                    status TEXT NOT NULL,
                    priority TEXT NOT NULL,
                    assigned_to INTEGER REFERENCES users(id),
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS webhook_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    company_id INTEGER NOT NULL REFERENCES companies(id),
                    channel_id INTEGER NOT NULL REFERENCES channels(id),
                    event_type TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    processed BOOLEAN NOT NULL DEFAULT 0,
                    processing_error TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    retryable BOOLEAN NOT NULL DEFAULT 1,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    processed_at TEXT
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_channel_bots_priority ON channel_bots(channel_id, created_at, id)",
                "CREATE INDEX IF NOT EXISTS idx_conversations_pair ON conversations(company_id, contact_id, channel_id, created_at)",
                "CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(company_id, status, updated_at)",
                "CREATE INDEX IF NOT EXISTS idx_messages_order ON messages(conversation_id, created_at, id)",
                "CREATE INDEX IF NOT EXISTS idx_messages_external ON messages(company_id, external_id)",
                "CREATE INDEX IF NOT EXISTS idx_tickets_conversation ON tickets(conversation_id)",
                "CREATE INDEX IF NOT EXISTS idx_webhook_events_backlog ON webhook_events(processed, retryable, updated_at)",
            ];

            for statement in statements {
                diesel::sql_query(statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn tenant_store(&self) -> Arc<dyn TenantStore> {
        self.tenant_store.clone()
    }

    pub fn contact_store(&self) -> Arc<dyn ContactStore> {
        self.contact_store.clone()
    }

    pub fn conversation_store(&self) -> Arc<dyn ConversationStore> {
        self.conversation_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn ticket_store(&self) -> Arc<dyn TicketStore> {
        self.ticket_store.clone()
    }

    pub fn webhook_store(&self) -> Arc<dyn WebhookEventStore> {
        self.webhook_store.clone()
    }

    #[cfg(feature = "postgres")]
    pub fn pool(&self) -> Option<&Pool> {
        self.postgres_pool.as_ref()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;

    use crate::db::testing::{TestDatabase, new_message};
    use crate::db::{
        ConversationFilter, ConversationState, ConversationStatus, DatabaseError, NewContact,
        NewConversation, NewTicket, NewWebhookEvent, SenderType, TicketPriority, TicketStatus,
    };

    fn new_contact(phone: &str) -> NewContact {
        NewContact {
            phone: phone.to_string(),
            name: Some("Ada".to_string()),
            email: None,
            avatar_url: None,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn migrate_is_idempotent_and_persists_across_reopen() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        db.manager.migrate().await.expect("second migrate");

        let reopened = db.reopen().await;
        let company = reopened
            .tenant_store()
            .get_company_by_slug("acme")
            .await
            .expect("query")
            .expect("company exists");
        assert_eq!(company.id, tenant.scope.company_id());
    }

    #[tokio::test]
    async fn contact_insert_or_get_is_keyed_by_phone() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let store = db.manager.contact_store();

        let (first, created) = store
            .insert_or_get_contact(&tenant.scope, &new_contact("+15550001"))
            .await
            .expect("first insert");
        assert!(created);

        let (second, created_again) = store
            .insert_or_get_contact(&tenant.scope, &new_contact("+15550001"))
            .await
            .expect("second insert");
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn message_insert_detects_duplicates() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "line-1").await;
        let (contact, _) = db
            .manager
            .contact_store()
            .insert_or_get_contact(&tenant.scope, &new_contact("+15550002"))
            .await
            .expect("contact");
        let conversation = db
            .manager
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
            .expect("conversation");

        let store = db.manager.message_store();
        let message = new_message(conversation.id, Some("wamid.1"), "hello", Utc::now());
        let first = store
            .insert_message(&tenant.scope, &message)
            .await
            .expect("insert");
        let second = store
            .insert_message(&tenant.scope, &message)
            .await
            .expect("duplicate insert");

        assert!(!first.is_duplicate());
        assert!(second.is_duplicate());
        assert_eq!(first.message().id, second.message().id);
        assert_eq!(
            store
                .count_messages(&tenant.scope, conversation.id)
                .await
                .expect("count"),
            1
        );

        let without_external_id = new_message(conversation.id, None, "note", Utc::now());
        store
            .insert_message(&tenant.scope, &without_external_id)
            .await
            .expect("first note");
        store
            .insert_message(&tenant.scope, &without_external_id)
            .await
            .expect("second note");
        assert_eq!(
            store
                .count_messages(&tenant.scope, conversation.id)
                .await
                .expect("count"),
            3
        );
    }

    #[tokio::test]
    async fn ticket_number_collision_is_unique_violation() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let conversation = db.open_conversation(&tenant, "+15550003").await;
        let store = db.manager.ticket_store();

        let ticket = NewTicket {
            conversation_id: conversation.id,
            ticket_number: "TCK-0001".to_string(),
            subject: "Help".to_string(),
            reason: None,
            status: TicketStatus::Open,
            priority: TicketPriority::Normal,
            assigned_to: None,
        };
        store.create_ticket(&tenant.scope, &ticket).await.expect("first ticket");
        let err = store
            .create_ticket(&tenant.scope, &ticket)
            .await
            .expect_err("collision");
        assert!(matches!(err, DatabaseError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn rows_are_invisible_to_other_tenants() {
        let db = TestDatabase::new().await;
        let acme = db.company("acme").await;
        let globex = db.company("globex").await;
        let conversation = db.open_conversation(&acme, "+15550004").await;

        let store = db.manager.conversation_store();
        assert!(
            store
                .get_conversation(&globex.scope, conversation.id)
                .await
                .expect("query")
                .is_none()
        );
        assert!(
            store
                .list_conversations(
                    &globex.scope,
                    &ConversationFilter {
                        limit: 50,
                        ..Default::default()
                    }
                )
                .await
                .expect("list")
                .is_empty()
        );

        let mut foreign = conversation.clone();
        foreign.state = ConversationState::Closed {
            last_assignee: None,
        };
        let err = store
            .save_conversation(&globex.scope, &foreign)
            .await
            .expect_err("cross-tenant write");
        assert!(matches!(err, DatabaseError::NotFound(_)));

        let unchanged = store
            .get_conversation(&acme.scope, conversation.id)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(unchanged.status(), ConversationStatus::Open);

        let (_, created) = db
            .manager
            .contact_store()
            .insert_or_get_contact(&globex.scope, &new_contact("+15550004"))
            .await
            .expect("same phone in another tenant");
        assert!(created);
    }

    #[tokio::test]
    async fn latest_conversation_skips_closed_unless_asked() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let mut conversation = db.open_conversation(&tenant, "+15550005").await;
        let store = db.manager.conversation_store();

        conversation.state = ConversationState::Closed {
            last_assignee: None,
        };
        store
            .save_conversation(&tenant.scope, &conversation)
            .await
            .expect("close");

        let open = store
            .latest_conversation(
                &tenant.scope,
                conversation.contact_id,
                conversation.channel_id,
                false,
            )
            .await
            .expect("query");
        assert!(open.is_none());

        let any = store
            .latest_conversation(
                &tenant.scope,
                conversation.contact_id,
                conversation.channel_id,
                true,
            )
            .await
            .expect("query")
            .expect("closed conversation");
        assert_eq!(any.id, conversation.id);
    }

    #[tokio::test]
    async fn webhook_event_attempts_and_backlog() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let channel = db.channel(&tenant, "line-1").await;
        let store = db.manager.webhook_store();

        let event = store
            .create_webhook_event(
                &tenant.scope,
                &NewWebhookEvent {
                    channel_id: channel.id,
                    event_type: "message".to_string(),
                    payload: json!({"from": "+15550006", "text": "hi"}),
                },
            )
            .await
            .expect("event");
        assert!(!event.processed);
        assert_eq!(event.attempts, 0);

        assert_eq!(store.begin_attempt(&tenant.scope, event.id).await.expect("attempt"), 1);
        store
            .mark_failed(&tenant.scope, event.id, "database is locked", true)
            .await
            .expect("mark failed");
        assert_eq!(store.count_unprocessed_unscoped().await.expect("count"), 1);

        let due = store
            .list_retryable_unscoped(5, Utc::now() + Duration::seconds(1), 10)
            .await
            .expect("retryable");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].processing_error.as_deref(), Some("database is locked"));

        let not_yet = store
            .list_retryable_unscoped(5, Utc::now() - Duration::hours(1), 10)
            .await
            .expect("retryable");
        assert!(not_yet.is_empty());

        store
            .mark_processed(&tenant.scope, event.id)
            .await
            .expect("mark processed");
        let processed = store
            .get_webhook_event(&tenant.scope, event.id)
            .await
            .expect("query")
            .expect("exists");
        assert!(processed.processed);
        assert!(processed.processing_error.is_none());
        assert!(processed.processed_at.is_some());
        assert_eq!(store.count_unprocessed_unscoped().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn messages_list_in_created_order() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let conversation = db.open_conversation(&tenant, "+15550007").await;
        let store = db.manager.message_store();

        let base = Utc::now();
        for (index, offset) in [0i64, 0, 5].into_iter().enumerate() {
            let message = new_message(
                conversation.id,
                Some(&format!("m{index}")),
                &format!("body {index}"),
                base + Duration::milliseconds(offset),
            );
            store
                .insert_message(&tenant.scope, &message)
                .await
                .expect("insert");
        }

        let listed = store
            .list_messages(&tenant.scope, conversation.id, 10, 0)
            .await
            .expect("list");
        let bodies: Vec<_> = listed.iter().filter_map(|m| m.body.clone()).collect();
        assert_eq!(bodies, vec!["body 0", "body 1", "body 2"]);
        assert!(listed.iter().all(|m| m.sender_type == SenderType::Contact));
    }

    #[tokio::test]
    async fn thread_lookup_spans_conversations_of_the_pair() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let first = db.open_conversation(&tenant, "+15550008").await;
        let conversations = db.manager.conversation_store();
        let second = conversations
            .create_conversation(
                &tenant.scope,
                &NewConversation {
                    contact_id: first.contact_id,
                    channel_id: first.channel_id,
                    state: ConversationState::Open,
                    last_message_at: None,
                },
            )
            .await
            .expect("second conversation");
        let other_pair = db.open_conversation(&tenant, "+15550009").await;

        let store = db.manager.message_store();
        let stored = store
            .insert_message(
                &tenant.scope,
                &new_message(first.id, Some("wamid.9"), "hello", Utc::now()),
            )
            .await
            .expect("insert")
            .into_message();
        assert!(stored.routed_at.is_none());

        let found = store
            .find_in_thread(&tenant.scope, second.contact_id, second.channel_id, "wamid.9")
            .await
            .expect("lookup")
            .expect("found in sibling conversation");
        assert_eq!(found.id, stored.id);
        assert!(
            store
                .find_in_thread(&tenant.scope, other_pair.contact_id, other_pair.channel_id, "wamid.9")
                .await
                .expect("lookup")
                .is_none()
        );

        store.mark_routed(&tenant.scope, stored.id).await.expect("mark");
        let routed = store
            .find_in_thread(&tenant.scope, first.contact_id, first.channel_id, "wamid.9")
            .await
            .expect("lookup")
            .expect("found");
        assert!(routed.routed_at.is_some());

        let other = db.company("globex").await;
        assert!(store.mark_routed(&other.scope, stored.id).await.is_err());
    }
}
