use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::db::{Bot, Conversation, TicketPriority};
use crate::parsers::InboundEvent;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow engine request failed: {0}")]
    Transport(String),
    #[error("flow engine timed out after {0:?}")]
    Timeout(Duration),
    #[error("flow engine answered with status {0}")]
    Status(u16),
    #[error("flow engine reply is invalid: {0}")]
    InvalidReply(String),
}

/// What the bot wants to happen to the conversation after this message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowAction {
    Continue,
    Release,
    Handoff {
        user_id: Option<i64>,
        reason: Option<String>,
        priority: Option<TicketPriority>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowReply {
    pub action: FlowAction,
    /// Bot texts to record, in order.
    pub replies: Vec<String>,
}

impl FlowReply {
    pub fn keep_going() -> Self {
        Self {
            action: FlowAction::Continue,
            replies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum WireAction {
    Continue,
    Release,
    Handoff,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default = "default_wire_action")]
    action: WireAction,
    #[serde(default)]
    user_id: Option<i64>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    priority: Option<TicketPriority>,
    #[serde(default)]
    replies: Vec<String>,
}

fn default_wire_action() -> WireAction {
    WireAction::Continue
}

impl From<WireReply> for FlowReply {
    fn from(wire: WireReply) -> Self {
        let action = match wire.action {
            WireAction::Continue => FlowAction::Continue,
            WireAction::Release => FlowAction::Release,
            WireAction::Handoff => FlowAction::Handoff {
                user_id: wire.user_id,
                reason: wire.reason,
                priority: wire.priority,
            },
        };
        Self {
            action,
            replies: wire.replies,
        }
    }
}

/// Runs a bot's flow for one inbound message. The engine's internals are not
/// this service's concern; only its reply drives the conversation.
#[async_trait]
pub trait BotFlowEngine: Send + Sync {
    async fn run(
        &self,
        bot: &Bot,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> Result<FlowReply, FlowError>;
}

/// Used when no engine is configured: the bot stays in charge and says nothing.
pub struct PassiveFlowEngine;

#[async_trait]
impl BotFlowEngine for PassiveFlowEngine {
    async fn run(
        &self,
        _bot: &Bot,
        _conversation: &Conversation,
        _event: &InboundEvent,
    ) -> Result<FlowReply, FlowError> {
        Ok(FlowReply::keep_going())
    }
}

pub struct HttpFlowEngine {
    client: Client,
    url: Url,
    timeout: Duration,
}

impl HttpFlowEngine {
    pub fn new(url: Url, timeout: Duration) -> Result<Self, FlowError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FlowError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    fn request_body(bot: &Bot, conversation: &Conversation, event: &InboundEvent) -> Value {
        json!({
            "bot": {
                "id": bot.id,
                "name": bot.name,
                "flow_data": bot.flow_data,
            },
            "conversation": {
                "id": conversation.id,
                "company_id": conversation.company_id,
                "contact_id": conversation.contact_id,
                "channel_id": conversation.channel_id,
                "status": conversation.status().as_str(),
            },
            "event": event,
        })
    }
}

#[async_trait]
impl BotFlowEngine for HttpFlowEngine {
    async fn run(
        &self,
        bot: &Bot,
        conversation: &Conversation,
        event: &InboundEvent,
    ) -> Result<FlowReply, FlowError> {
        debug!(
            "running flow for bot_id={} conversation_id={}",
            bot.id, conversation.id
        );

        let response = self
            .client
            .post(self.url.clone())
            .json(&Self::request_body(bot, conversation, event))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FlowError::Timeout(self.timeout)
                } else {
                    FlowError::Transport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(FlowError::Status(response.status().as_u16()));
        }

        let wire: WireReply = response
            .json()
            .await
            .map_err(|e| FlowError::InvalidReply(e.to_string()))?;
        Ok(wire.into())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{FlowAction, FlowReply, WireReply};
    use crate::db::TicketPriority;

    fn parse(raw: serde_json::Value) -> FlowReply {
        serde_json::from_value::<WireReply>(raw).expect("wire reply").into()
    }

    #[test]
    fn empty_reply_continues() {
        assert_eq!(parse(json!({})), FlowReply::keep_going());
    }

    #[test]
    fn handoff_reply_carries_details() {
        let reply = parse(json!({
            "action": "handoff",
            "user_id": 7,
            "reason": "asked for a human",
            "priority": "high",
            "replies": ["Connecting you to an agent"]
        }));
        assert_eq!(
            reply.action,
            FlowAction::Handoff {
                user_id: Some(7),
                reason: Some("asked for a human".to_string()),
                priority: Some(TicketPriority::High),
            }
        );
        assert_eq!(reply.replies, vec!["Connecting you to an agent"]);
    }

    #[test]
    fn unknown_action_is_rejected() {
        assert!(serde_json::from_value::<WireReply>(json!({"action": "explode"})).is_err());
    }
}
