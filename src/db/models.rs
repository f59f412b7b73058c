use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::DatabaseError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Company {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCompany {
    pub name: String,
    pub slug: String,
    pub settings: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Inactive,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl FromStr for ChannelStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(DatabaseError::Corrupt(format!("unknown channel status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelProvider {
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Generic,
}

impl ChannelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Generic => "generic",
        }
    }
}

impl FromStr for ChannelProvider {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::WhatsApp),
            "generic" => Ok(Self::Generic),
            other => Err(DatabaseError::Corrupt(format!("unknown channel provider {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub provider: ChannelProvider,
    pub external_id: Option<String>,
    pub status: ChannelStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }
}

#[derive(Debug, Clone)]
pub struct NewChannel {
    pub name: String,
    pub provider: ChannelProvider,
    pub external_id: Option<String>,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub is_active: bool,
    pub flow_data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub is_active: bool,
    pub flow_data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBot {
    pub id: i64,
    pub company_id: i64,
    pub channel_id: i64,
    pub bot_id: i64,
    pub trigger_conditions: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChannelBot {
    pub channel_id: i64,
    pub bot_id: i64,
    pub trigger_conditions: Value,
    pub is_active: bool,
}

/// Human agent that can own a conversation or a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub company_id: i64,
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewContact {
    pub phone: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub metadata: Value,
}

/// Mutable display attributes written back on an existing contact.
#[derive(Debug, Clone)]
pub struct ContactProfile {
    pub name: Option<String>,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    BotActive,
    Assigned,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::BotActive => "bot_active",
            Self::Assigned => "assigned",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "bot_active" => Ok(Self::BotActive),
            "assigned" => Ok(Self::Assigned),
            "closed" => Ok(Self::Closed),
            other => Err(DatabaseError::Corrupt(format!(
                "unknown conversation status {other}"
            ))),
        }
    }
}

/// Who currently owns a conversation. The `status`, `bot_id` and
/// `assigned_to` columns are derived from this and parsed back into it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversationState {
    Open,
    BotActive { bot_id: i64 },
    Assigned { user_id: i64 },
    Closed { last_assignee: Option<i64> },
}

impl ConversationState {
    pub fn status(&self) -> ConversationStatus {
        match self {
            Self::Open => ConversationStatus::Open,
            Self::BotActive { .. } => ConversationStatus::BotActive,
            Self::Assigned { .. } => ConversationStatus::Assigned,
            Self::Closed { .. } => ConversationStatus::Closed,
        }
    }

    pub fn bot_id(&self) -> Option<i64> {
        match self {
            Self::BotActive { bot_id } => Some(*bot_id),
            _ => None,
        }
    }

    pub fn assigned_to(&self) -> Option<i64> {
        match self {
            Self::Assigned { user_id } => Some(*user_id),
            Self::Closed { last_assignee } => *last_assignee,
            _ => None,
        }
    }

    pub fn from_columns(
        status: &str,
        bot_id: Option<i64>,
        assigned_to: Option<i64>,
    ) -> Result<Self, DatabaseError> {
        let status = status.parse::<ConversationStatus>()?;
        match (status, bot_id, assigned_to) {
            (ConversationStatus::Open, None, None) => Ok(Self::Open),
            (ConversationStatus::BotActive, Some(bot_id), None) => Ok(Self::BotActive { bot_id }),
            (ConversationStatus::Assigned, None, Some(user_id)) => Ok(Self::Assigned { user_id }),
            (ConversationStatus::Closed, None, last_assignee) => Ok(Self::Closed { last_assignee }),
            (status, bot_id, assigned_to) => Err(DatabaseError::Corrupt(format!(
                "conversation status {status} with bot_id={bot_id:?} assigned_to={assigned_to:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub company_id: i64,
    pub contact_id: i64,
    pub channel_id: i64,
    #[serde(flatten)]
    pub state: ConversationState,
    pub last_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn status(&self) -> ConversationStatus {
        self.state.status()
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub contact_id: i64,
    pub channel_id: i64,
    pub state: ConversationState,
    pub last_message_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct ConversationFilter {
    pub status: Option<ConversationStatus>,
    pub channel_id: Option<i64>,
    pub contact_id: Option<i64>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Contact,
    Bot,
    Agent,
    System,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Bot => "bot",
            Self::Agent => "agent",
            Self::System => "system",
        }
    }
}

impl FromStr for SenderType {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact" => Ok(Self::Contact),
            "bot" => Ok(Self::Bot),
            "agent" => Ok(Self::Agent),
            "system" => Ok(Self::System),
            other => Err(DatabaseError::Corrupt(format!("unknown sender type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub company_id: i64,
    pub conversation_id: i64,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub external_id: Option<String>,
    pub body: Option<String>,
    pub message_type: String,
    pub attachments: Value,
    pub provider_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Set once bot routing has been evaluated for this inbound message.
    pub routed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub external_id: Option<String>,
    pub body: Option<String>,
    pub message_type: String,
    pub attachments: Value,
    pub provider_timestamp: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Result of inserting a message keyed by `(conversation_id, external_id)`.
#[derive(Debug, Clone)]
pub enum MessageInsert {
    Inserted(Message),
    Duplicate(Message),
}

impl MessageInsert {
    pub fn message(&self) -> &Message {
        match self {
            Self::Inserted(message) | Self::Duplicate(message) => message,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            Self::Inserted(message) | Self::Duplicate(message) => message,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for TicketStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            other => Err(DatabaseError::Corrupt(format!("unknown ticket status {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for TicketPriority {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(DatabaseError::Corrupt(format!("unknown ticket priority {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub company_id: i64,
    pub conversation_id: i64,
    pub ticket_number: String,
    pub subject: String,
    pub reason: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub assigned_to: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTicket {
    pub conversation_id: i64,
    pub ticket_number: String,
    pub subject: String,
    pub reason: Option<String>,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub assigned_to: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub company_id: i64,
    pub channel_id: i64,
    pub event_type: String,
    pub payload: Value,
    pub processed: bool,
    pub processing_error: Option<String>,
    pub attempts: i32,
    pub retryable: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub channel_id: i64,
    pub event_type: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::{ConversationState, ConversationStatus};

    #[test_case("open", None, None => ConversationState::Open ; "open")]
    #[test_case("bot_active", Some(3), None => ConversationState::BotActive { bot_id: 3 } ; "bot active")]
    #[test_case("assigned", None, Some(9) => ConversationState::Assigned { user_id: 9 } ; "assigned")]
    #[test_case("closed", None, Some(9) => ConversationState::Closed { last_assignee: Some(9) } ; "closed after agent")]
    #[test_case("closed", None, None => ConversationState::Closed { last_assignee: None } ; "closed without agent")]
    fn state_round_trips_through_columns(
        status: &str,
        bot_id: Option<i64>,
        assigned_to: Option<i64>,
    ) -> ConversationState {
        let state = ConversationState::from_columns(status, bot_id, assigned_to).expect("valid row");
        assert_eq!(state.status().as_str(), status);
        assert_eq!(state.bot_id(), bot_id);
        assert_eq!(state.assigned_to(), assigned_to);
        state
    }

    #[test_case("bot_active", Some(1), Some(2) ; "bot and agent at once")]
    #[test_case("bot_active", None, None ; "bot active without bot")]
    #[test_case("assigned", None, None ; "assigned without agent")]
    #[test_case("open", Some(1), None ; "open with bot")]
    #[test_case("closed", Some(1), None ; "closed with bot")]
    #[test_case("pending", None, None ; "unknown status")]
    fn inconsistent_rows_are_rejected(status: &str, bot_id: Option<i64>, assigned_to: Option<i64>) {
        assert!(ConversationState::from_columns(status, bot_id, assigned_to).is_err());
    }

    #[test]
    fn status_display_matches_column_value() {
        assert_eq!(ConversationStatus::BotActive.to_string(), "bot_active");
    }
}
