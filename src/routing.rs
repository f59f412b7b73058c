//! Inbound routing core.
//!
//! [`RoutingCore::handle_inbound`] takes one normalized event through contact
//! resolution, conversation find-or-create, message recording, bot trigger
//! matching and the bot flow reply. Work for one (contact, channel) pair is
//! serialized by [`ConversationLocks`]; different pairs run in parallel.

pub mod contacts;
pub mod conversation;
pub mod error;
pub mod escalator;
pub mod flow;
pub mod locks;
pub mod matcher;
pub mod recorder;
pub mod state;
pub mod triggers;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::{RoutingConfig, TicketsConfig};
use crate::db::{
    Bot, Channel, Contact, Conversation, ConversationFilter, ConversationState, DatabaseManager,
    Message, SenderType, Ticket, User,
};
use crate::parsers::InboundEvent;
use crate::tenant::{Tenant, TenantScope};
use crate::web::metrics::Metrics;

pub use contacts::{ContactAttributes, ContactResolver, ResolvedContact, normalize_phone};
pub use conversation::{ConversationRouter, Resolution};
pub use error::RoutingError;
pub use escalator::{EscalationRequest, RandomTicketNumbers, TicketEscalator, TicketNumberGenerator};
pub use flow::{BotFlowEngine, FlowAction, FlowError, FlowReply, HttpFlowEngine, PassiveFlowEngine};
pub use locks::{ConversationKey, ConversationLocks};
pub use matcher::{BotMatch, BotTriggerMatcher};
pub use recorder::{MessageDraft, MessageRecorder};
pub use state::{InvalidTransition, Transition};
pub use triggers::{EventAttributes, TriggerError, TriggerExpr};

const DETAIL_MESSAGE_LIMIT: i64 = 200;

#[derive(Debug, Clone)]
pub struct RoutingOutcome {
    pub contact_id: i64,
    pub contact_created: bool,
    pub conversation_id: i64,
    pub resolution: Resolution,
    pub message_id: i64,
    pub duplicate: bool,
    pub state: ConversationState,
    pub ticket_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationDetail {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub message_count: i64,
    pub tickets: Vec<Ticket>,
}

pub struct RoutingCore {
    db_manager: Arc<DatabaseManager>,
    contacts: ContactResolver,
    conversations: ConversationRouter,
    matcher: BotTriggerMatcher,
    recorder: MessageRecorder,
    escalator: TicketEscalator,
    flow: Arc<dyn BotFlowEngine>,
    locks: ConversationLocks,
}

impl RoutingCore {
    pub fn new(
        db_manager: Arc<DatabaseManager>,
        routing: &RoutingConfig,
        tickets: &TicketsConfig,
        flow: Arc<dyn BotFlowEngine>,
    ) -> Self {
        Self {
            contacts: ContactResolver::new(db_manager.clone()),
            conversations: ConversationRouter::new(db_manager.clone(), routing.closed_policy),
            matcher: BotTriggerMatcher::new(db_manager.clone()),
            recorder: MessageRecorder::new(db_manager.clone()),
            escalator: TicketEscalator::new(db_manager.clone(), tickets),
            flow,
            locks: ConversationLocks::new(routing.lock_prune_threshold),
            db_manager,
        }
    }

    pub async fn handle_inbound(
        &self,
        tenant: &Tenant,
        channel: &Channel,
        event: &InboundEvent,
    ) -> Result<RoutingOutcome, RoutingError> {
        let scope = &tenant.scope;
        scope.ensure_owns("channel", channel.company_id)?;
        if event.channel_id != channel.id {
            return Err(RoutingError::Malformed(format!(
                "event for channel {} delivered on channel {}",
                event.channel_id, channel.id
            )));
        }

        let resolved = self
            .contacts
            .resolve(
                scope,
                &event.sender_phone,
                &ContactAttributes {
                    name: event.sender_name.clone(),
                    email: event.sender_email.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let contact = resolved.contact;

        let _guard = self
            .locks
            .lock(ConversationKey::new(contact.id, channel.id))
            .await;

        // A redelivery must not reopen or open anything, so look across the
        // whole thread before resolving a conversation.
        if let Some(external_id) = event.external_id.as_deref() {
            let stored = self
                .db_manager
                .message_store()
                .find_in_thread(scope, contact.id, channel.id, external_id)
                .await?;
            if let Some(message) = stored {
                return self.redelivered(scope, event, &contact, channel, message).await;
            }
        }

        let (mut conversation, resolution) =
            self.conversations.resolve(scope, &contact, channel).await?;
        if resolution == Resolution::Opened {
            Metrics::conversation_opened();
        }

        let recorded = self
            .recorder
            .append(scope, &mut conversation, MessageDraft::from_inbound(event))
            .await?;
        if recorded.is_duplicate() {
            return self
                .redelivered(scope, event, &contact, channel, recorded.into_message())
                .await;
        }
        let message_id = recorded.message().id;

        let ticket_id = self
            .route_message(
                scope,
                event,
                &contact,
                resolved.created,
                channel,
                &mut conversation,
                message_id,
            )
            .await?;

        Ok(RoutingOutcome {
            contact_id: contact.id,
            contact_created: resolved.created,
            conversation_id: conversation.id,
            resolution,
            message_id,
            duplicate: false,
            state: conversation.state,
            ticket_id,
        })
    }

    /// A message already stored in the thread. Nothing moves unless routing
    /// for it never finished, in which case matching and the flow run again.
    async fn redelivered(
        &self,
        scope: &TenantScope,
        event: &InboundEvent,
        contact: &Contact,
        channel: &Channel,
        message: Message,
    ) -> Result<RoutingOutcome, RoutingError> {
        Metrics::duplicate_message();
        let mut conversation = self.load_conversation(scope, message.conversation_id).await?;

        let ticket_id = if message.routed_at.is_none() {
            info!(
                "resuming bot routing for message_id={} on conversation_id={}",
                message.id, conversation.id
            );
            self.route_message(scope, event, contact, false, channel, &mut conversation, message.id)
                .await?
        } else {
            debug!(
                "duplicate message_id={} on conversation_id={}, nothing to do",
                message.id, conversation.id
            );
            None
        };

        Ok(RoutingOutcome {
            contact_id: contact.id,
            contact_created: false,
            conversation_id: conversation.id,
            resolution: Resolution::Continued,
            message_id: message.id,
            duplicate: true,
            state: conversation.state,
            ticket_id,
        })
    }

    /// Bot matching and the flow for one recorded inbound message. The routed
    /// marker is set last, so a retry after any failure here starts over.
    #[allow(clippy::too_many_arguments)]
    async fn route_message(
        &self,
        scope: &TenantScope,
        event: &InboundEvent,
        contact: &Contact,
        contact_is_new: bool,
        channel: &Channel,
        conversation: &mut Conversation,
        message_id: i64,
    ) -> Result<Option<i64>, RoutingError> {
        let mut ticket_id = None;
        if conversation.state.accepts_bot_routing() {
            let attributes =
                EventAttributes::from_context(event, contact, contact_is_new, conversation, channel);
            let matched = self
                .matcher
                .find_match(scope, conversation, &attributes)
                .await?;
            let changed = self
                .conversations
                .apply_match(scope, conversation, matched.as_ref().map(|m| &m.bot))
                .await?;
            if let Some(found) = matched {
                if changed {
                    Metrics::bot_matched();
                }
                ticket_id = self.run_flow(scope, conversation, &found.bot, event).await?;
            }
        } else {
            debug!(
                "conversation_id={} is {}, skipping bot routing",
                conversation.id,
                conversation.status()
            );
        }

        self.db_manager
            .message_store()
            .mark_routed(scope, message_id)
            .await?;
        Ok(ticket_id)
    }

    /// Returns the escalated ticket id on a handoff.
    async fn run_flow(
        &self,
        scope: &TenantScope,
        conversation: &mut Conversation,
        bot: &Bot,
        event: &InboundEvent,
    ) -> Result<Option<i64>, RoutingError> {
        let reply = match self.flow.run(bot, conversation, event).await {
            Ok(reply) => reply,
            Err(err) => {
                Metrics::flow_failed();
                warn!(
                    "flow for bot_id={} failed on conversation_id={}: {}",
                    bot.id, conversation.id, err
                );
                return Ok(None);
            }
        };

        for text in &reply.replies {
            self.recorder
                .append(
                    scope,
                    conversation,
                    MessageDraft::text(SenderType::Bot, Some(bot.id), text),
                )
                .await?;
        }

        match reply.action {
            FlowAction::Continue => Ok(None),
            FlowAction::Release => {
                self.conversations
                    .transition(scope, conversation, Transition::BotReleased)
                    .await?;
                Ok(None)
            }
            FlowAction::Handoff {
                user_id,
                reason,
                priority,
            } => {
                let agent = match user_id {
                    Some(user_id) => {
                        let agent = self.find_agent(scope, user_id).await?;
                        if agent.is_none() {
                            warn!(
                                "bot_id={} handed off to unknown user_id={}, leaving unassigned",
                                bot.id, user_id
                            );
                        }
                        agent
                    }
                    None => None,
                };

                let ticket = self
                    .escalator
                    .escalate(
                        scope,
                        conversation,
                        &EscalationRequest {
                            reason,
                            priority,
                            subject: None,
                            assign_to: agent.as_ref().map(|a| a.id),
                        },
                    )
                    .await?;
                Metrics::ticket_escalated();

                let transition = match agent {
                    Some(agent) => Transition::Claim { user_id: agent.id },
                    None => Transition::BotReleased,
                };
                self.conversations
                    .transition(scope, conversation, transition)
                    .await?;
                info!(
                    "bot_id={} handed off conversation_id={} with ticket {}",
                    bot.id, conversation.id, ticket.ticket_number
                );
                Ok(Some(ticket.id))
            }
        }
    }

    async fn find_agent(&self, scope: &TenantScope, user_id: i64) -> Result<Option<User>, RoutingError> {
        let user = self.db_manager.tenant_store().get_user(scope, user_id).await?;
        if let Some(user) = &user {
            scope.ensure_owns("user", user.company_id)?;
        }
        Ok(user)
    }

    async fn require_agent(&self, scope: &TenantScope, user_id: i64) -> Result<User, RoutingError> {
        self.find_agent(scope, user_id)
            .await?
            .ok_or_else(|| RoutingError::NotFound(format!("user {user_id}")))
    }

    async fn load_conversation(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<Conversation, RoutingError> {
        let conversation = self
            .db_manager
            .conversation_store()
            .get_conversation(scope, conversation_id)
            .await?
            .ok_or_else(|| RoutingError::NotFound(format!("conversation {conversation_id}")))?;
        scope.ensure_owns("conversation", conversation.company_id)?;
        Ok(conversation)
    }

    /// Takes the pair lock, then re-reads the row so the caller sees the state
    /// as of lock acquisition.
    async fn lock_conversation(
        &self,
        scope: &TenantScope,
        conversation_id: i64,
    ) -> Result<(OwnedMutexGuard<()>, Conversation), RoutingError> {
        let conversation = self.load_conversation(scope, conversation_id).await?;
        let guard = self
            .locks
            .lock(ConversationKey::new(
                conversation.contact_id,
                conversation.channel_id,
            ))
            .await;
        let conversation = self.load_conversation(scope, conversation_id).await?;
        Ok((guard, conversation))
    }

    async fn admin_transition(
        &self,
        tenant: &Tenant,
        conversation_id: i64,
        transition: Transition,
    ) -> Result<Conversation, RoutingError> {
        let (_guard, mut conversation) = self.lock_conversation(&tenant.scope, conversation_id).await?;
        self.conversations
            .transition(&tenant.scope, &mut conversation, transition)
            .await?;
        Ok(conversation)
    }

    pub async fn claim(
        &self,
        tenant: &Tenant,
        conversation_id: i64,
        user_id: i64,
    ) -> Result<Conversation, RoutingError> {
        let agent = self.require_agent(&tenant.scope, user_id).await?;
        self.admin_transition(tenant, conversation_id, Transition::Claim { user_id: agent.id })
            .await
    }

    pub async fn release(&self, tenant: &Tenant, conversation_id: i64) -> Result<Conversation, RoutingError> {
        self.admin_transition(tenant, conversation_id, Transition::BotReleased)
            .await
    }

    pub async fn close(&self, tenant: &Tenant, conversation_id: i64) -> Result<Conversation, RoutingError> {
        self.admin_transition(tenant, conversation_id, Transition::Close)
            .await
    }

    /// Opens a ticket without moving the conversation.
    pub async fn escalate(
        &self,
        tenant: &Tenant,
        conversation_id: i64,
        request: &EscalationRequest,
    ) -> Result<Ticket, RoutingError> {
        if let Some(user_id) = request.assign_to {
            self.require_agent(&tenant.scope, user_id).await?;
        }
        let (_guard, conversation) = self.lock_conversation(&tenant.scope, conversation_id).await?;
        let ticket = self
            .escalator
            .escalate(&tenant.scope, &conversation, request)
            .await?;
        Metrics::ticket_escalated();
        Ok(ticket)
    }

    /// Records an agent or system message. Outbound messages never trigger
    /// bot routing.
    pub async fn post_message(
        &self,
        tenant: &Tenant,
        conversation_id: i64,
        sender_type: SenderType,
        sender_id: Option<i64>,
        body: &str,
    ) -> Result<Message, RoutingError> {
        let scope = &tenant.scope;
        if body.trim().is_empty() {
            return Err(RoutingError::Malformed("message body is empty".to_string()));
        }
        let sender_id = match (sender_type, sender_id) {
            (SenderType::Agent, Some(user_id)) => Some(self.require_agent(scope, user_id).await?.id),
            (SenderType::Agent, None) => {
                return Err(RoutingError::Malformed("agent messages need a sender_id".to_string()));
            }
            (SenderType::System, _) => None,
            (other, _) => {
                return Err(RoutingError::Malformed(format!(
                    "cannot post {} messages",
                    other.as_str()
                )));
            }
        };

        let (_guard, mut conversation) = self.lock_conversation(scope, conversation_id).await?;
        let recorded = self
            .recorder
            .append(
                scope,
                &mut conversation,
                MessageDraft::text(sender_type, sender_id, body),
            )
            .await?;
        Ok(recorded.into_message())
    }

    pub async fn list_conversations(
        &self,
        tenant: &Tenant,
        filter: &ConversationFilter,
    ) -> Result<Vec<Conversation>, RoutingError> {
        Ok(self
            .db_manager
            .conversation_store()
            .list_conversations(&tenant.scope, filter)
            .await?)
    }

    pub async fn conversation_detail(
        &self,
        tenant: &Tenant,
        conversation_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<ConversationDetail, RoutingError> {
        let scope = &tenant.scope;
        let conversation = self.load_conversation(scope, conversation_id).await?;
        let messages = self
            .db_manager
            .message_store()
            .list_messages(scope, conversation_id, limit.clamp(1, DETAIL_MESSAGE_LIMIT), offset.max(0))
            .await?;
        let message_count = self
            .db_manager
            .message_store()
            .count_messages(scope, conversation_id)
            .await?;
        let tickets = self
            .db_manager
            .ticket_store()
            .list_tickets_for_conversation(scope, conversation_id)
            .await?;
        Ok(ConversationDetail {
            conversation,
            messages,
            message_count,
            tickets,
        })
    }
}
