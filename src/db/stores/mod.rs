use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::DatabaseError;
use super::models::{
    Bot, Channel, ChannelBot, ChannelStatus, Company, Contact, ContactProfile, Conversation,
    ConversationFilter, Message, MessageInsert, NewBot, NewChannel, NewChannelBot, NewCompany,
    NewContact, NewConversation, NewMessage, NewTicket, NewUser, NewWebhookEvent, Ticket,
    TicketPriority, TicketStatus, User, WebhookEvent,
};
use crate::tenant::TenantScope;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create_company(&self, company: &NewCompany) -> Result<Company, DatabaseError>;
    async fn get_company(&self, id: i64) -> Result<Option<Company>, DatabaseError>;
    async fn get_company_by_slug(&self, slug: &str) -> Result<Option<Company>, DatabaseError>;

    /// Tenant resolution entry point; nothing else may read channels unscoped.
    async fn find_channel_unscoped(&self, id: i64) -> Result<Option<Channel>, DatabaseError>;
    async fn create_channel(
        &self,
        scope: &TenantScope,
        channel: &NewChannel,
    ) -> Result<Channel, DatabaseError>;
    async fn get_channel(&self, scope: &TenantScope, id: i64)
    -> Result<Option<Channel>, DatabaseError>;
    async fn set_channel_status(
        &self,
        scope: &TenantScope,
        id: i64,
        status: ChannelStatus,
    ) -> Result<(), DatabaseError>;

    async fn create_bot(&self, scope: &TenantScope, bot: &NewBot) -> Result<Bot, DatabaseError>;
    async fn get_bot(&self, scope: &TenantScope, id: i64) -> Result<Option<Bot>, DatabaseError>;

    async fn create_channel_bot(
        &self,
        scope: &TenantScope,
        binding: &NewChannelBot,
    ) -> Result<ChannelBot, DatabaseError>;
    /// Active bindings on a channel whose bot is also active, in creation
    /// order with ties broken by id.
    async fn list_active_channel_bots(
        &self,
        scope: &TenantScope,
        channel_id: i64,
    ) -> Result<Vec<(ChannelBot, Bot)>, DatabaseError>;
    async fn set_channel_bot_active(
        &self,
        scope: &TenantScope,
        id: i64,
        is_active: bool,
    ) -> Result<(), DatabaseError>;

    async fn create_user(&self, scope: &TenantScope, user: &NewUser) -> Result<User, DatabaseError>;
    async fn get_user(&self, scope: &TenantScope, id: i64) -> Result<Option<User>, DatabaseError>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    /// Conflict-ignoring insert on `(company_id, phone)` followed by a read.
    /// The flag is true when this call created the row.
    async fn insert_or_get_contact(
        &self,
        scope: &TenantScope,
        contact: &NewContact,
    ) -> Result<(Contact, bool), DatabaseError>;
    async fn get_contact(&self, scope: &TenantScope, id: i64)
    -> Result<Option<Contact>, DatabaseError>;
    async fn update_contact_profile(
        &self,
        scope: &TenantScope,
        id: i64,
        profile: &ContactProfile,
    ) -> Result<Contact, DatabaseError>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        scope: &TenantScope,
        conversation: &NewConversation,
    ) -> Result<Conversation, DatabaseError>;
    async fn get_conversation(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<Conversation>, DatabaseError>;
    /// Most recent conversation for the pair, newest `created_at` then id.
    async fn latest_conversation(
        &self,
        scope: &TenantScope,
        contact_id: i64,
        channel_id: i64,
        include_closed: bool,
    ) -> Result<Option<Conversation>, DatabaseError>;
    /// Persists state, owner columns and `last_message_at`.
    async fn save_conversation(
        &self,
        scope: &TenantScope,
        conversation: &Conversation,
    ) -> Result<(), DatabaseError>;
    async fn list_conversations(
        &self,
        scope: &TenantScope,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, DatabaseError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert_message(
        &self,
        scope: &TenantScope,
        message: &NewMessage,
    ) -> Result<MessageInsert, DatabaseError>;
    async fn get_by_external_id(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;
    /// Finds an inbound message in any conversation of the (contact, channel)
    /// thread, closed ones included.
    async fn find_in_thread(
        &self,
        scope: &TenantScope,
        contact_id: i64,
        channel_id: i64,
        external_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;
    async fn mark_routed(&self, scope: &TenantScope, message_id: i64) -> Result<(), DatabaseError>;
    /// Ordered by `created_at`, then id.
    async fn list_messages(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Message>, DatabaseError>;
    async fn count_messages(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<i64, DatabaseError>;
}

#[async_trait]
pub trait TicketStore: Send + Sync {
    /// A taken `ticket_number` surfaces as `DatabaseError::UniqueViolation`.
    async fn create_ticket(
        &self,
        scope: &TenantScope,
        ticket: &NewTicket,
    ) -> Result<Ticket, DatabaseError>;
    async fn get_ticket(&self, scope: &TenantScope, id: i64) -> Result<Option<Ticket>, DatabaseError>;
    async fn list_tickets_for_conversation(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<Vec<Ticket>, DatabaseError>;
    async fn update_ticket(
        &self,
        scope: &TenantScope,
        id: i64,
        status: TicketStatus,
        priority: TicketPriority,
        assigned_to: Option<i64>,
    ) -> Result<(), DatabaseError>;
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn create_webhook_event(
        &self,
        scope: &TenantScope,
        event: &NewWebhookEvent,
    ) -> Result<WebhookEvent, DatabaseError>;
    async fn get_webhook_event(
        &self,
        scope: &TenantScope,
        id: i64,
    ) -> Result<Option<WebhookEvent>, DatabaseError>;
    /// Bumps `attempts` and `updated_at`; returns the new attempt count.
    async fn begin_attempt(&self, scope: &TenantScope, id: i64) -> Result<i32, DatabaseError>;
    async fn mark_processed(&self, scope: &TenantScope, id: i64) -> Result<(), DatabaseError>;
    async fn mark_failed(
        &self,
        scope: &TenantScope,
        id: i64,
        error: &str,
        retryable: bool,
    ) -> Result<(), DatabaseError>;
    /// System-level sweep used by the retry reaper across all tenants.
    async fn list_retryable_unscoped(
        &self,
        max_attempts: i32,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<WebhookEvent>, DatabaseError>;
    async fn count_unprocessed_unscoped(&self) -> Result<i64, DatabaseError>;
}
