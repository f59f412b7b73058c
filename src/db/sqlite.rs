use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::Value;

use crate::db::schema_sqlite::{
    bots, channel_bots, channels, companies, contacts, conversations, messages, tickets, users,
    webhook_events,
};
use crate::tenant::TenantScope;

use super::{
    DatabaseError,
    models::{
        Bot, Channel, ChannelBot, ChannelStatus, Company, Contact, ContactProfile, Conversation,
        ConversationFilter, ConversationState, Message, MessageInsert, NewBot, NewChannel,
        NewChannelBot, NewCompany, NewContact, NewConversation, NewMessage, NewTicket, NewUser,
        NewWebhookEvent, Ticket, TicketPriority, TicketStatus, User, WebhookEvent,
    },
};

// Fixed-width UTC text so lexical order in SQLite equals chronological order.
pub(crate) fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt(format!("invalid datetime format: {}", e)))
}

fn optional_datetime(s: Option<&str>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(string_to_datetime).transpose()
}

fn string_to_json(s: &str) -> Result<Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Corrupt(format!("invalid json column: {}", e)))
}

#[derive(QueryableByName)]
struct LastInsertId {
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    id: i64,
}

fn last_insert_id(conn: &mut SqliteConnection) -> Result<i64, DatabaseError> {
    let row: LastInsertId = diesel::sql_query("SELECT last_insert_rowid() AS id").get_result(conn)?;
    Ok(row.id)
}

fn expect_affected(rows: usize, entity: &str, id: i64) -> Result<(), DatabaseError> {
    if rows == 0 {
        Err(DatabaseError::NotFound(format!("{entity} {id}")))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = companies)]
struct DbCompany {
    id: i64,
    name: String,
    slug: String,
    settings: String,
    created_at: String,
    updated_at: String,
}

impl DbCompany {
    fn into_company(self) -> Result<Company, DatabaseError> {
        Ok(Company {
            id: self.id,
            name: self.name,
            slug: self.slug,
            settings: string_to_json(&self.settings)?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = companies)]
struct NewDbCompany<'a> {
    name: &'a str,
    slug: &'a str,
    settings: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channels)]
struct DbChannel {
    id: i64,
    company_id: i64,
    name: String,
    provider: String,
    external_id: Option<String>,
    status: String,
    created_at: String,
    updated_at: String,
}

impl DbChannel {
    fn into_channel(self) -> Result<Channel, DatabaseError> {
        Ok(Channel {
            id: self.id,
            company_id: self.company_id,
            name: self.name,
            provider: self.provider.parse()?,
            external_id: self.external_id,
            status: self.status.parse()?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = channels)]
struct NewDbChannel<'a> {
    company_id: i64,
    name: &'a str,
    provider: &'a str,
    external_id: Option<&'a str>,
    status: &'a str,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = bots)]
struct DbBot {
    id: i64,
    company_id: i64,
    name: String,
    is_active: bool,
    flow_data: String,
    created_at: String,
    updated_at: String,
}

impl DbBot {
    fn into_bot(self) -> Result<Bot, DatabaseError> {
        Ok(Bot {
            id: self.id,
            company_id: self.company_id,
            name: self.name,
            is_active: self.is_active,
            flow_data: string_to_json(&self.flow_data)?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = bots)]
struct NewDbBot<'a> {
    company_id: i64,
    name: &'a str,
    is_active: bool,
    flow_data: String,
    created_at: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_bots)]
struct DbChannelBot {
    id: i64,
    company_id: i64,
    channel_id: i64,
    bot_id: i64,
    trigger_conditions: String,
    is_active: bool,
    created_at: String,
}

impl DbChannelBot {
    fn into_channel_bot(self) -> Result<ChannelBot, DatabaseError> {
        Ok(ChannelBot {
            id: self.id,
            company_id: self.company_id,
            channel_id: self.channel_id,
            bot_id: self.bot_id,
            trigger_conditions: string_to_json(&self.trigger_conditions)?,
            is_active: self.is_active,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_bots)]
struct NewDbChannelBot {
    company_id: i64,
    channel_id: i64,
    bot_id: i64,
    trigger_conditions: String,
    is_active: bool,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = users)]
struct DbUser {
    id: i64,
    company_id: i64,
    name: String,
    email: Option<String>,
    created_at: String,
}

impl DbUser {
    fn into_user(self) -> Result<User, DatabaseError> {
        Ok(User {
            id: self.id,
            company_id: self.company_id,
            name: self.name,
            email: self.email,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewDbUser<'a> {
    company_id: i64,
    name: &'a str,
    email: Option<&'a str>,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = contacts)]
struct DbContact {
    id: i64,
    company_id: i64,
    phone: String,
    name: Option<String>,
    email: Option<String>,
    avatar_url: Option<String>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

impl DbContact {
    fn into_contact(self) -> Result<Contact, DatabaseError> {
        Ok(Contact {
            id: self.id,
            company_id: self.company_id,
            phone: self.phone,
            name: self.name,
            email: self.email,
            avatar_url: self.avatar_url,
            metadata: string_to_json(&self.metadata)?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = contacts)]
struct NewDbContact<'a> {
    company_id: i64,
    phone: &'a str,
    name: Option<&'a str>,
    email: Option<&'a str>,
    avatar_url: Option<&'a str>,
    metadata: String,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = contacts)]
#[diesel(treat_none_as_null = true)]
struct UpdateDbContact<'a> {
    name: Option<&'a str>,
    email: Option<&'a str>,
    avatar_url: Option<&'a str>,
    metadata: String,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = conversations)]
struct DbConversation {
    id: i64,
    company_id: i64,
    contact_id: i64,
    channel_id: i64,
    status: String,
    bot_id: Option<i64>,
    assigned_to: Option<i64>,
    last_message_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DbConversation {
    fn into_conversation(self) -> Result<Conversation, DatabaseError> {
        Ok(Conversation {
            id: self.id,
            company_id: self.company_id,
            contact_id: self.contact_id,
            channel_id: self.channel_id,
            state: ConversationState::from_columns(&self.status, self.bot_id, self.assigned_to)?,
            last_message_at: optional_datetime(self.last_message_at.as_deref())?,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = conversations)]
struct NewDbConversation {
    company_id: i64,
    contact_id: i64,
    channel_id: i64,
    status: &'static str,
    bot_id: Option<i64>,
    assigned_to: Option<i64>,
    last_message_at: Option<String>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = conversations)]
#[diesel(treat_none_as_null = true)]
struct UpdateDbConversation {
    status: &'static str,
    bot_id: Option<i64>,
    assigned_to: Option<i64>,
    last_message_at: Option<String>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = messages)]
struct DbMessage {
    id: i64,
    company_id: i64,
    conversation_id: i64,
    sender_type: String,
    sender_id: Option<i64>,
    external_id: Option<String>,
    body: Option<String>,
    message_type: String,
    attachments: String,
    provider_timestamp: Option<String>,
    created_at: String,
    routed_at: Option<String>,
}

impl DbMessage {
    fn into_message(self) -> Result<Message, DatabaseError> {
        Ok(Message {
            id: self.id,
            company_id: self.company_id,
            conversation_id: self.conversation_id,
            sender_type: self.sender_type.parse()?,
            sender_id: self.sender_id,
            external_id: self.external_id,
            body: self.body,
            message_type: self.message_type,
            attachments: string_to_json(&self.attachments)?,
            provider_timestamp: optional_datetime(self.provider_timestamp.as_deref())?,
            created_at: string_to_datetime(&self.created_at)?,
            routed_at: optional_datetime(self.routed_at.as_deref())?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = messages)]
struct NewDbMessage<'a> {
    company_id: i64,
    conversation_id: i64,
    sender_type: &'static str,
    sender_id: Option<i64>,
    external_id: Option<&'a str>,
    body: Option<&'a str>,
    message_type: &'a str,
    attachments: String,
    provider_timestamp: Option<String>,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = tickets)]
struct DbTicket {
    id: i64,
    company_id: i64,
    conversation_id: i64,
    ticket_number: String,
    subject: String,
    reason: Option<String>,
    status: String,
    priority: String,
    assigned_to: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl DbTicket {
    fn into_ticket(self) -> Result<Ticket, DatabaseError> {
        Ok(Ticket {
            id: self.id,
            company_id: self.company_id,
            conversation_id: self.conversation_id,
            ticket_number: self.ticket_number,
            subject: self.subject,
            reason: self.reason,
            status: self.status.parse()?,
            priority: self.priority.parse()?,
            assigned_to: self.assigned_to,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = tickets)]
struct NewDbTicket<'a> {
    company_id: i64,
    conversation_id: i64,
    ticket_number: &'a str,
    subject: &'a str,
    reason: Option<&'a str>,
    status: &'static str,
    priority: &'static str,
    assigned_to: Option<i64>,
    created_at: String,
    updated_at: String,
}

#[derive(AsChangeset)]
#[diesel(table_name = tickets)]
#[diesel(treat_none_as_null = true)]
struct UpdateDbTicket {
    status: &'static str,
    priority: &'static str,
    assigned_to: Option<i64>,
    updated_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = webhook_events)]
struct DbWebhookEvent {
    id: i64,
    company_id: i64,
    channel_id: i64,
    event_type: String,
    payload: String,
    processed: bool,
    processing_error: Option<String>,
    attempts: i32,
    retryable: bool,
    created_at: String,
    updated_at: String,
    processed_at: Option<String>,
}

impl DbWebhookEvent {
    fn into_webhook_event(self) -> Result<WebhookEvent, DatabaseError> {
        Ok(WebhookEvent {
            id: self.id,
            company_id: self.company_id,
            channel_id: self.channel_id,
            event_type: self.event_type,
            payload: string_to_json(&self.payload)?,
            processed: self.processed,
            processing_error: self.processing_error,
            attempts: self.attempts,
            retryable: self.retryable,
            created_at: string_to_datetime(&self.created_at)?,
            updated_at: string_to_datetime(&self.updated_at)?,
            processed_at: optional_datetime(self.processed_at.as_deref())?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = webhook_events)]
struct NewDbWebhookEvent<'a> {
    company_id: i64,
    channel_id: i64,
    event_type: &'a str,
    payload: String,
    processed: bool,
    attempts: i32,
    retryable: bool,
    created_at: String,
    updated_at: String,
}

pub(crate) fn establish_connection(
    path: &str,
    busy_timeout_ms: u64,
) -> Result<SqliteConnection, DatabaseError> {
    let mut conn =
        SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))?;
    conn.batch_execute(&format!(
        "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
        busy_timeout_ms
    ))
    .map_err(|e| DatabaseError::Connection(e.to_string()))?;
    Ok(conn)
}

/// Every store trait over one SQLite file. Each call opens its own
/// connection on the blocking pool; writers queue on the busy timeout.
pub struct SqliteStore {
    db_path: Arc<String>,
    busy_timeout_ms: u64,
}

impl SqliteStore {
    pub fn new(db_path: Arc<String>, busy_timeout_ms: u64) -> Self {
        Self {
            db_path,
            busy_timeout_ms,
        }
    }

    async fn with_connection<T, F>(&self, operation: F) -> Result<T, DatabaseError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        let busy_timeout_ms = self.busy_timeout_ms;
        tokio::task::spawn_blocking(move || {
            let mut conn = establish_connection(&db_path, busy_timeout_ms)?;
            operation(&mut conn)
        })
        .await
        .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
    }
}

fn load_company(conn: &mut SqliteConnection, id: i64) -> Result<Option<Company>, DatabaseError> {
    companies::table
        .filter(companies::id.eq(id))
        .select(DbCompany::as_select())
        .first::<DbCompany>(conn)
        .optional()?
        .map(DbCompany::into_company)
        .transpose()
}

fn load_channel(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Channel>, DatabaseError> {
    channels::table
        .filter(channels::id.eq(id))
        .filter(channels::company_id.eq(company_id))
        .select(DbChannel::as_select())
        .first::<DbChannel>(conn)
        .optional()?
        .map(DbChannel::into_channel)
        .transpose()
}

fn load_bot(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Bot>, DatabaseError> {
    bots::table
        .filter(bots::id.eq(id))
        .filter(bots::company_id.eq(company_id))
        .select(DbBot::as_select())
        .first::<DbBot>(conn)
        .optional()?
        .map(DbBot::into_bot)
        .transpose()
}

fn load_user(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<User>, DatabaseError> {
    users::table
        .filter(users::id.eq(id))
        .filter(users::company_id.eq(company_id))
        .select(DbUser::as_select())
        .first::<DbUser>(conn)
        .optional()?
        .map(DbUser::into_user)
        .transpose()
}

fn load_contact(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Contact>, DatabaseError> {
    contacts::table
        .filter(contacts::id.eq(id))
        .filter(contacts::company_id.eq(company_id))
        .select(DbContact::as_select())
        .first::<DbContact>(conn)
        .optional()?
        .map(DbContact::into_contact)
        .transpose()
}

fn load_conversation(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Conversation>, DatabaseError> {
    conversations::table
        .filter(conversations::id.eq(id))
        .filter(conversations::company_id.eq(company_id))
        .select(DbConversation::as_select())
        .first::<DbConversation>(conn)
        .optional()?
        .map(DbConversation::into_conversation)
        .transpose()
}

fn load_message(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Message>, DatabaseError> {
    messages::table
        .filter(messages::id.eq(id))
        .filter(messages::company_id.eq(company_id))
        .select(DbMessage::as_select())
        .first::<DbMessage>(conn)
        .optional()?
        .map(DbMessage::into_message)
        .transpose()
}

fn load_message_by_external_id(
    conn: &mut SqliteConnection,
    company_id: i64,
    conversation_id: i64,
    external_id: &str,
) -> Result<Option<Message>, DatabaseError> {
    messages::table
        .filter(messages::company_id.eq(company_id))
        .filter(messages::conversation_id.eq(conversation_id))
        .filter(messages::external_id.eq(external_id))
        .select(DbMessage::as_select())
        .first::<DbMessage>(conn)
        .optional()?
        .map(DbMessage::into_message)
        .transpose()
}

fn load_ticket(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<Ticket>, DatabaseError> {
    tickets::table
        .filter(tickets::id.eq(id))
        .filter(tickets::company_id.eq(company_id))
        .select(DbTicket::as_select())
        .first::<DbTicket>(conn)
        .optional()?
        .map(DbTicket::into_ticket)
        .transpose()
}

fn load_webhook_event(
    conn: &mut SqliteConnection,
    company_id: i64,
    id: i64,
) -> Result<Option<WebhookEvent>, DatabaseError> {
    webhook_events::table
        .filter(webhook_events::id.eq(id))
        .filter(webhook_events::company_id.eq(company_id))
        .select(DbWebhookEvent::as_select())
        .first::<DbWebhookEvent>(conn)
        .optional()?
        .map(DbWebhookEvent::into_webhook_event)
        .transpose()
}

fn inserted<T>(row: Option<T>, entity: &str) -> Result<T, DatabaseError> {
    row.ok_or_else(|| DatabaseError::Query(format!("inserted {entity} could not be read back")))
}

#[async_trait]
impl super::TenantStore for SqliteStore {
    async fn create_company(&self, company: &NewCompany) -> Result<Company, DatabaseError> {
        let company = company.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbCompany {
                name: &company.name,
                slug: &company.slug,
                settings: company.settings.to_string(),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(companies::table).values(&row).execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_company(conn, id)?, "company")
        })
        .await
    }

    async fn get_company(&self, id: i64) -> Result<Option<Company>, DatabaseError> {
        self.with_connection(move |conn| load_company(conn, id)).await
    }

    async fn get_company_by_slug(&self, slug: &str) -> Result<Option<Company>, DatabaseError> {
        let slug = slug.to_string();
        self.with_connection(move |conn| {
            companies::table
                .filter(companies::slug.eq(slug))
                .select(DbCompany::as_select())
                .first::<DbCompany>(conn)
                .optional()?
                .map(DbCompany::into_company)
                .transpose()
        })
        .await
    }

    async fn find_channel_unscoped(&self, id: i64) -> Result<Option<Channel>, DatabaseError> {
        self.with_connection(move |conn| {
            channels::table
                .filter(channels::id.eq(id))
                .select(DbChannel::as_select())
                .first::<DbChannel>(conn)
                .optional()?
                .map(DbChannel::into_channel)
                .transpose()
        })
        .await
    }

    async fn create_channel(
        &self,
        scope: &TenantScope,
        channel: &NewChannel,
    ) -> Result<Channel, DatabaseError> {
        let company_id = scope.company_id();
        let channel = channel.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbChannel {
                company_id,
                name: &channel.name,
                provider: channel.provider.as_str(),
                external_id: channel.external_id.as_deref(),
                status: channel.status.as_str(),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(channels::table).values(&row).execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_channel(conn, company_id, id)?, "channel")
        })
        .await
    }

    async fn get_channel(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<Channel>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_channel(conn, company_id, id))
            .await
    }

    async fn set_channel_status(
        &self,
        scope: &TenantScope,
        id: i64,
        status: ChannelStatus,
    ) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = diesel::update(
                channels::table
                    .filter(channels::id.eq(id))
                    .filter(channels::company_id.eq(company_id)),
            )
            .set((
                channels::status.eq(status.as_str()),
                channels::updated_at.eq(datetime_to_string(&Utc::now())),
            ))
            .execute(conn)?;
            expect_affected(rows, "channel", id)
        })
        .await
    }

    async fn create_bot(&self, scope: &TenantScope, bot: &NewBot) -> Result<Bot, DatabaseError> {
        let company_id = scope.company_id();
        let bot = bot.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbBot {
                company_id,
                name: &bot.name,
                is_active: bot.is_active,
                flow_data: bot.flow_data.to_string(),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(bots::table).values(&row).execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_bot(conn, company_id, id)?, "bot")
        })
        .await
    }

    async fn get_bot(&self, scope: &TenantScope, id: i64) -> Result<Option<Bot>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_bot(conn, company_id, id))
            .await
    }

    async fn create_channel_bot(
        &self,
        scope: &TenantScope,
        binding: &NewChannelBot,
    ) -> Result<ChannelBot, DatabaseError> {
        let company_id = scope.company_id();
        let binding = binding.clone();
        self.with_connection(move |conn| {
            if load_channel(conn, company_id, binding.channel_id)?.is_none() {
                return Err(DatabaseError::NotFound(format!(
                    "channel {}",
                    binding.channel_id
                )));
            }
            if load_bot(conn, company_id, binding.bot_id)?.is_none() {
                return Err(DatabaseError::NotFound(format!("bot {}", binding.bot_id)));
            }

            let row = NewDbChannelBot {
                company_id,
                channel_id: binding.channel_id,
                bot_id: binding.bot_id,
                trigger_conditions: binding.trigger_conditions.to_string(),
                is_active: binding.is_active,
                created_at: datetime_to_string(&Utc::now()),
            };
            diesel::insert_into(channel_bots::table)
                .values(&row)
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            let row = channel_bots::table
                .filter(channel_bots::id.eq(id))
                .select(DbChannelBot::as_select())
                .first::<DbChannelBot>(conn)
                .optional()?;
            inserted(row, "channel bot")?.into_channel_bot()
        })
        .await
    }

    async fn list_active_channel_bots(
        &self,
        scope: &TenantScope,
        channel_id: i64,
    ) -> Result<Vec<(ChannelBot, Bot)>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = channel_bots::table
                .inner_join(bots::table)
                .filter(channel_bots::company_id.eq(company_id))
                .filter(channel_bots::channel_id.eq(channel_id))
                .filter(channel_bots::is_active.eq(true))
                .filter(bots::company_id.eq(company_id))
                .filter(bots::is_active.eq(true))
                .order((channel_bots::created_at.asc(), channel_bots::id.asc()))
                .select((DbChannelBot::as_select(), DbBot::as_select()))
                .load::<(DbChannelBot, DbBot)>(conn)?;

            rows.into_iter()
                .map(|(binding, bot)| Ok((binding.into_channel_bot()?, bot.into_bot()?)))
                .collect()
        })
        .await
    }

    async fn set_channel_bot_active(
        &self,
        scope: &TenantScope,
        id: i64,
        is_active: bool,
    ) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = diesel::update(
                channel_bots::table
                    .filter(channel_bots::id.eq(id))
                    .filter(channel_bots::company_id.eq(company_id)),
            )
            .set(channel_bots::is_active.eq(is_active))
            .execute(conn)?;
            expect_affected(rows, "channel bot", id)
        })
        .await
    }

    async fn create_user(&self, scope: &TenantScope, user: &NewUser) -> Result<User, DatabaseError> {
        let company_id = scope.company_id();
        let user = user.clone();
        self.with_connection(move |conn| {
            let row = NewDbUser {
                company_id,
                name: &user.name,
                email: user.email.as_deref(),
                created_at: datetime_to_string(&Utc::now()),
            };
            diesel::insert_into(users::table).values(&row).execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_user(conn, company_id, id)?, "user")
        })
        .await
    }

    async fn get_user(&self, scope: &TenantScope, id: i64) -> Result<Option<User>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_user(conn, company_id, id))
            .await
    }
}

#[async_trait]
impl super::ContactStore for SqliteStore {
    async fn insert_or_get_contact(
        &self,
        scope: &TenantScope,
        contact: &NewContact,
    ) -> Result<(Contact, bool), DatabaseError> {
        let company_id = scope.company_id();
        let contact = contact.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbContact {
                company_id,
                phone: &contact.phone,
                name: contact.name.as_deref(),
                email: contact.email.as_deref(),
                avatar_url: contact.avatar_url.as_deref(),
                metadata: contact.metadata.to_string(),
                created_at: now.clone(),
                updated_at: now,
            };
            let created = diesel::insert_into(contacts::table)
                .values(&row)
                .on_conflict((contacts::company_id, contacts::phone))
                .do_nothing()
                .execute(conn)?;

            let existing = contacts::table
                .filter(contacts::company_id.eq(company_id))
                .filter(contacts::phone.eq(&contact.phone))
                .select(DbContact::as_select())
                .first::<DbContact>(conn)?;
            Ok((existing.into_contact()?, created > 0))
        })
        .await
    }

    async fn get_contact(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<Contact>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_contact(conn, company_id, id))
            .await
    }

    async fn update_contact_profile(
        &self,
        scope: &TenantScope,
        id: i64,
        profile: &ContactProfile,
    ) -> Result<Contact, DatabaseError> {
        let company_id = scope.company_id();
        let profile = profile.clone();
        self.with_connection(move |conn| {
            let changes = UpdateDbContact {
                name: profile.name.as_deref(),
                email: profile.email.as_deref(),
                avatar_url: profile.avatar_url.as_deref(),
                metadata: profile.metadata.to_string(),
                updated_at: datetime_to_string(&Utc::now()),
            };
            let rows = diesel::update(
                contacts::table
                    .filter(contacts::id.eq(id))
                    .filter(contacts::company_id.eq(company_id)),
            )
            .set(&changes)
            .execute(conn)?;
            expect_affected(rows, "contact", id)?;
            inserted(load_contact(conn, company_id, id)?, "contact")
        })
        .await
    }
}

#[async_trait]
impl super::ConversationStore for SqliteStore {
    async fn create_conversation(
        &self,
        scope: &TenantScope,
        conversation: &NewConversation,
    ) -> Result<Conversation, DatabaseError> {
        let company_id = scope.company_id();
        let conversation = conversation.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbConversation {
                company_id,
                contact_id: conversation.contact_id,
                channel_id: conversation.channel_id,
                status: conversation.state.status().as_str(),
                bot_id: conversation.state.bot_id(),
                assigned_to: conversation.state.assigned_to(),
                last_message_at: conversation.last_message_at.as_ref().map(datetime_to_string),
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(conversations::table)
                .values(&row)
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_conversation(conn, company_id, id)?, "conversation")
        })
        .await
    }

    async fn get_conversation(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_conversation(conn, company_id, id))
            .await
    }

    async fn latest_conversation(
        &self,
        scope: &TenantScope,
        contact_id: i64,
        channel_id: i64,
        include_closed: bool,
    ) -> Result<Option<Conversation>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let mut query = conversations::table
                .select(DbConversation::as_select())
                .filter(conversations::company_id.eq(company_id))
                .filter(conversations::contact_id.eq(contact_id))
                .filter(conversations::channel_id.eq(channel_id))
                .into_boxed();
            if !include_closed {
                query = query.filter(conversations::status.ne("closed"));
            }
            query
                .order((conversations::created_at.desc(), conversations::id.desc()))
                .first::<DbConversation>(conn)
                .optional()?
                .map(DbConversation::into_conversation)
                .transpose()
        })
        .await
    }

    async fn save_conversation(
        &self,
        scope: &TenantScope,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        let conversation = conversation.clone();
        self.with_connection(move |conn| {
            let changes = UpdateDbConversation {
                status: conversation.state.status().as_str(),
                bot_id: conversation.state.bot_id(),
                assigned_to: conversation.state.assigned_to(),
                last_message_at: conversation.last_message_at.as_ref().map(datetime_to_string),
                updated_at: datetime_to_string(&conversation.updated_at),
            };
            let rows = diesel::update(
                conversations::table
                    .filter(conversations::id.eq(conversation.id))
                    .filter(conversations::company_id.eq(company_id)),
            )
            .set(&changes)
            .execute(conn)?;
            expect_affected(rows, "conversation", conversation.id)
        })
        .await
    }

    async fn list_conversations(
        &self,
        scope: &TenantScope,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, DatabaseError> {
        let company_id = scope.company_id();
        let filter = filter.clone();
        self.with_connection(move |conn| {
            let mut query = conversations::table
                .select(DbConversation::as_select())
                .filter(conversations::company_id.eq(company_id))
                .into_boxed();
            if let Some(status) = filter.status {
                query = query.filter(conversations::status.eq(status.as_str()));
            }
            if let Some(channel_id) = filter.channel_id {
                query = query.filter(conversations::channel_id.eq(channel_id));
            }
            if let Some(contact_id) = filter.contact_id {
                query = query.filter(conversations::contact_id.eq(contact_id));
            }
            let rows = query
                .order((conversations::updated_at.desc(), conversations::id.desc()))
                .limit(filter.limit)
                .offset(filter.offset)
                .load::<DbConversation>(conn)?;
            rows.into_iter()
                .map(DbConversation::into_conversation)
                .collect()
        })
        .await
    }
}

#[async_trait]
impl super::MessageStore for SqliteStore {
    async fn insert_message(
        &self,
        scope: &TenantScope,
        message: &NewMessage,
    ) -> Result<MessageInsert, DatabaseError> {
        let company_id = scope.company_id();
        let message = message.clone();
        self.with_connection(move |conn| {
            let row = NewDbMessage {
                company_id,
                conversation_id: message.conversation_id,
                sender_type: message.sender_type.as_str(),
                sender_id: message.sender_id,
                external_id: message.external_id.as_deref(),
                body: message.body.as_deref(),
                message_type: &message.message_type,
                attachments: message.attachments.to_string(),
                provider_timestamp: message.provider_timestamp.as_ref().map(datetime_to_string),
                created_at: datetime_to_string(&message.created_at),
            };
            let created = diesel::insert_into(messages::table)
                .values(&row)
                .on_conflict((messages::conversation_id, messages::external_id))
                .do_nothing()
                .execute(conn)?;

            if created == 0 {
                let external_id = message.external_id.as_deref().unwrap_or_default();
                let existing = load_message_by_external_id(
                    conn,
                    company_id,
                    message.conversation_id,
                    external_id,
                )?;
                return Ok(MessageInsert::Duplicate(inserted(existing, "message")?));
            }

            let id = last_insert_id(conn)?;
            Ok(MessageInsert::Inserted(inserted(
                load_message(conn, company_id, id)?,
                "message",
            )?))
        })
        .await
    }

    async fn get_by_external_id(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let company_id = scope.company_id();
        let external_id = external_id.to_string();
        self.with_connection(move |conn| {
            load_message_by_external_id(conn, company_id, conversation_id, &external_id)
        })
        .await
    }

    async fn find_in_thread(
        &self,
        scope: &TenantScope,
        contact_id: i64,
        channel_id: i64,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        let company_id = scope.company_id();
        let external_id = external_id.to_string();
        self.with_connection(move |conn| {
            let thread = conversations::table
                .filter(conversations::company_id.eq(company_id))
                .filter(conversations::contact_id.eq(contact_id))
                .filter(conversations::channel_id.eq(channel_id))
                .select(conversations::id);
            messages::table
                .filter(messages::company_id.eq(company_id))
                .filter(messages::external_id.eq(&external_id))
                .filter(messages::conversation_id.eq_any(thread))
                .order(messages::id.asc())
                .select(DbMessage::as_select())
                .first::<DbMessage>(conn)
                .optional()?
                .map(DbMessage::into_message)
                .transpose()
        })
        .await
    }

    async fn mark_routed(&self, scope: &TenantScope, message_id: i64) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = diesel::update(
                messages::table
                    .filter(messages::id.eq(message_id))
                    .filter(messages::company_id.eq(company_id)),
            )
            .set(messages::routed_at.eq(Some(datetime_to_string(&Utc::now()))))
            .execute(conn)?;
            expect_affected(rows, "message", message_id)
        })
        .await
    }

    async fn list_messages(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = messages::table
                .filter(messages::company_id.eq(company_id))
                .filter(messages::conversation_id.eq(conversation_id))
                .order((messages::created_at.asc(), messages::id.asc()))
                .limit(limit)
                .offset(offset)
                .select(DbMessage::as_select())
                .load::<DbMessage>(conn)?;
            rows.into_iter().map(DbMessage::into_message).collect()
        })
        .await
    }

    async fn count_messages(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<i64, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            Ok(messages::table
                .filter(messages::company_id.eq(company_id))
                .filter(messages::conversation_id.eq(conversation_id))
                .count()
                .get_result::<i64>(conn)?)
        })
        .await
    }
}

#[async_trait]
impl super::TicketStore for SqliteStore {
    async fn create_ticket(
        &self,
        scope: &TenantScope,
        ticket: &NewTicket,
    ) -> Result<Ticket, DatabaseError> {
        let company_id = scope.company_id();
        let ticket = ticket.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbTicket {
                company_id,
                conversation_id: ticket.conversation_id,
                ticket_number: &ticket.ticket_number,
                subject: &ticket.subject,
                reason: ticket.reason.as_deref(),
                status: ticket.status.as_str(),
                priority: ticket.priority.as_str(),
                assigned_to: ticket.assigned_to,
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(tickets::table).values(&row).execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_ticket(conn, company_id, id)?, "ticket")
        })
        .await
    }

    async fn get_ticket(&self, scope: &TenantScope, id: i64) -> Result<Option<Ticket>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_ticket(conn, company_id, id))
            .await
    }

    async fn list_tickets_for_conversation(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<Vec<Ticket>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = tickets::table
                .filter(tickets::company_id.eq(company_id))
                .filter(tickets::conversation_id.eq(conversation_id))
                .order(tickets::id.asc())
                .select(DbTicket::as_select())
                .load::<DbTicket>(conn)?;
            rows.into_iter().map(DbTicket::into_ticket).collect()
        })
        .await
    }

    async fn update_ticket(
        &self,
        scope: &TenantScope,
        id: i64,
        status: TicketStatus,
        priority: TicketPriority,
        assigned_to: Option<i64>,
    ) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let changes = UpdateDbTicket {
                status: status.as_str(),
                priority: priority.as_str(),
                assigned_to,
                updated_at: datetime_to_string(&Utc::now()),
            };
            let rows = diesel::update(
                tickets::table
                    .filter(tickets::id.eq(id))
                    .filter(tickets::company_id.eq(company_id)),
            )
            .set(&changes)
            .execute(conn)?;
            expect_affected(rows, "ticket", id)
        })
        .await
    }
}

#[async_trait]
impl super::WebhookEventStore for SqliteStore {
    async fn create_webhook_event(
        &self,
        scope: &TenantScope,
        event: &NewWebhookEvent,
    ) -> Result<WebhookEvent, DatabaseError> {
        let company_id = scope.company_id();
        let event = event.clone();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let row = NewDbWebhookEvent {
                company_id,
                channel_id: event.channel_id,
                event_type: &event.event_type,
                payload: event.payload.to_string(),
                processed: false,
                attempts: 0,
                retryable: true,
                created_at: now.clone(),
                updated_at: now,
            };
            diesel::insert_into(webhook_events::table)
                .values(&row)
                .execute(conn)?;
            let id = last_insert_id(conn)?;
            inserted(load_webhook_event(conn, company_id, id)?, "webhook event")
        })
        .await
    }

    async fn get_webhook_event(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<WebhookEvent>, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| load_webhook_event(conn, company_id, id))
            .await
    }

    async fn begin_attempt(&self, scope: &TenantScope, id: i64) -> Result<i32, DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let rows = diesel::update(
                webhook_events::table
                    .filter(webhook_events::id.eq(id))
                    .filter(webhook_events::company_id.eq(company_id)),
            )
            .set((
                webhook_events::attempts.eq(webhook_events::attempts + 1),
                webhook_events::updated_at.eq(datetime_to_string(&Utc::now())),
            ))
            .execute(conn)?;
            expect_affected(rows, "webhook event", id)?;
            Ok(webhook_events::table
                .filter(webhook_events::id.eq(id))
                .select(webhook_events::attempts)
                .first::<i32>(conn)?)
        })
        .await
    }

    async fn mark_processed(&self, scope: &TenantScope, id: i64) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        self.with_connection(move |conn| {
            let now = datetime_to_string(&Utc::now());
            let rows = diesel::update(
                webhook_events::table
                    .filter(webhook_events::id.eq(id))
                    .filter(webhook_events::company_id.eq(company_id)),
            )
            .set((
                webhook_events::processed.eq(true),
                webhook_events::processing_error.eq(None::<String>),
                webhook_events::processed_at.eq(Some(now.clone())),
                webhook_events::updated_at.eq(now),
            ))
            .execute(conn)?;
            expect_affected(rows, "webhook event", id)
        })
        .await
    }

    async fn mark_failed(
        &self,
        scope: &TenantScope,
        id: i64,
        error: &str,
        retryable: bool,
    ) -> Result<(), DatabaseError> {
        let company_id = scope.company_id();
        let error = error.to_string();
        self.with_connection(move |conn| {
            let rows = diesel::update(
                webhook_events::table
                    .filter(webhook_events::id.eq(id))
                    .filter(webhook_events::company_id.eq(company_id)),
            )
            .set((
                webhook_events::processed.eq(false),
                webhook_events::processing_error.eq(Some(error)),
                webhook_events::retryable.eq(retryable),
                webhook_events::updated_at.eq(datetime_to_string(&Utc::now())),
            ))
            .execute(conn)?;
            expect_affected(rows, "webhook event", id)
        })
        .await
    }

    async fn list_retryable_unscoped(
        &self,
        max_attempts: i32,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEvent>, DatabaseError> {
        self.with_connection(move |conn| {
            let rows = webhook_events::table
                .filter(webhook_events::processed.eq(false))
                .filter(webhook_events::retryable.eq(true))
                .filter(webhook_events::attempts.lt(max_attempts))
                .filter(webhook_events::updated_at.lt(datetime_to_string(&updated_before)))
                .order(webhook_events::id.asc())
                .limit(limit)
                .select(DbWebhookEvent::as_select())
                .load::<DbWebhookEvent>(conn)?;
            rows.into_iter()
                .map(DbWebhookEvent::into_webhook_event)
                .collect()
        })
        .await
    }

    async fn count_unprocessed_unscoped(&self) -> Result<i64, DatabaseError> {
        self.with_connection(move |conn| {
            Ok(webhook_events::table
                .filter(webhook_events::processed.eq(false))
                .count()
                .get_result::<i64>(conn)?)
        })
        .await
    }
}
