pub use self::error::DatabaseError;
pub use self::manager::{DatabaseManager, DbType};
pub use self::models::{
    Bot, Channel, ChannelBot, ChannelProvider, ChannelStatus, Company, Contact, ContactProfile,
    Conversation, ConversationFilter, ConversationState, ConversationStatus, Message,
    MessageInsert, NewBot, NewChannel, NewChannelBot, NewCompany, NewContact, NewConversation,
    NewMessage, NewTicket, NewUser, NewWebhookEvent, SenderType, Ticket, TicketPriority,
    TicketStatus, User, WebhookEvent,
};
pub use self::stores::{
    ContactStore, ConversationStore, MessageStore, TenantStore, TicketStore, WebhookEventStore,
};

pub mod error;
pub mod manager;
pub mod models;
pub mod stores;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod schema;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub mod schema_sqlite;

#[cfg(test)]
pub(crate) mod testing;
