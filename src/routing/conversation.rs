use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::config::ClosedPolicy;
use crate::db::{Bot, Channel, Contact, Conversation, ConversationState, DatabaseManager, NewConversation};
use crate::tenant::TenantScope;

use super::RoutingError;
use super::state::Transition;

/// How a conversation was reached for an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Continued,
    Opened,
    Reopened,
}

/// Owns the find-or-create rule for (contact, channel) pairs and every state
/// change. Callers hold the pair's lock.
pub struct ConversationRouter {
    db_manager: Arc<DatabaseManager>,
    closed_policy: ClosedPolicy,
}

impl ConversationRouter {
    pub fn new(db_manager: Arc<DatabaseManager>, closed_policy: ClosedPolicy) -> Self {
        Self {
            db_manager,
            closed_policy,
        }
    }

    /// Latest non-closed conversation for the pair, else the closed one
    /// reopened (under [`ClosedPolicy::Reopen`]), else a new `Open` one.
    pub async fn resolve(
        &self,
        scope: &TenantScope,
        contact: &Contact,
        channel: &Channel,
    ) -> Result<(Conversation, Resolution), RoutingError> {
        scope.ensure_owns("contact", contact.company_id)?;
        scope.ensure_owns("channel", channel.company_id)?;
        let store = self.db_manager.conversation_store();

        if let Some(conversation) = store
            .latest_conversation(scope, contact.id, channel.id, false)
            .await?
        {
            debug!(
                "continuing conversation_id={} status={}",
                conversation.id,
                conversation.status()
            );
            return Ok((conversation, Resolution::Continued));
        }

        if self.closed_policy == ClosedPolicy::Reopen {
            if let Some(mut closed) = store
                .latest_conversation(scope, contact.id, channel.id, true)
                .await?
            {
                self.transition(scope, &mut closed, Transition::Reopen).await?;
                return Ok((closed, Resolution::Reopened));
            }
        }

        if !channel.is_active() {
            return Err(RoutingError::ChannelInactive(channel.id));
        }

        let conversation = store
            .create_conversation(
                scope,
                &NewConversation {
                    contact_id: contact.id,
                    channel_id: channel.id,
                    state: ConversationState::Open,
                    last_message_at: None,
                },
            )
            .await?;
        info!(
            "opened conversation_id={} contact_id={} channel_id={}",
            conversation.id, contact.id, channel.id
        );
        Ok((conversation, Resolution::Opened))
    }

    /// Applies `transition` and persists the new state.
    pub async fn transition(
        &self,
        scope: &TenantScope,
        conversation: &mut Conversation,
        transition: Transition,
    ) -> Result<(), RoutingError> {
        let from = conversation.state;
        conversation.state = from.apply(transition)?;
        conversation.updated_at = Utc::now();
        self.db_manager
            .conversation_store()
            .save_conversation(scope, conversation)
            .await?;
        info!(
            "conversation_id={} {} -> {} via {}",
            conversation.id,
            from.status(),
            conversation.status(),
            transition
        );
        Ok(())
    }

    /// Re-evaluation after an inbound message: a matched bot takes or keeps
    /// the conversation, no match releases a bot back to `Open`. Returns
    /// whether the state changed.
    pub async fn apply_match(
        &self,
        scope: &TenantScope,
        conversation: &mut Conversation,
        matched: Option<&Bot>,
    ) -> Result<bool, RoutingError> {
        let transition = match (conversation.state, matched) {
            (ConversationState::Open, Some(bot)) => Transition::BotMatched { bot_id: bot.id },
            (ConversationState::BotActive { bot_id }, Some(bot)) if bot_id != bot.id => {
                Transition::BotMatched { bot_id: bot.id }
            }
            (ConversationState::BotActive { .. }, None) => Transition::BotReleased,
            _ => return Ok(false),
        };
        self.transition(scope, conversation, transition).await?;
        Ok(true)
    }
}
