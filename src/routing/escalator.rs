use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::TicketsConfig;
use crate::db::{
    Conversation, ConversationState, DatabaseError, DatabaseManager, NewTicket, Ticket,
    TicketPriority, TicketStatus,
};
use crate::tenant::TenantScope;

use super::RoutingError;

pub trait TicketNumberGenerator: Send + Sync {
    fn next_number(&self, prefix: &str) -> String;
}

/// `TCK-20240101-9F86D081`: date plus eight random hex digits.
pub struct RandomTicketNumbers;

impl TicketNumberGenerator for RandomTicketNumbers {
    fn next_number(&self, prefix: &str) -> String {
        let random: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(8)
            .collect();
        format!(
            "{}-{}-{}",
            prefix,
            Utc::now().format("%Y%m%d"),
            random.to_uppercase()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct EscalationRequest {
    pub reason: Option<String>,
    pub priority: Option<TicketPriority>,
    pub subject: Option<String>,
    /// Overrides the conversation's current agent as the ticket assignee.
    pub assign_to: Option<i64>,
}

pub struct TicketEscalator {
    db_manager: Arc<DatabaseManager>,
    prefix: String,
    max_attempts: u32,
    default_priority: TicketPriority,
    numbers: Arc<dyn TicketNumberGenerator>,
}

impl TicketEscalator {
    pub fn new(db_manager: Arc<DatabaseManager>, config: &TicketsConfig) -> Self {
        Self::with_generator(db_manager, config, Arc::new(RandomTicketNumbers))
    }

    pub fn with_generator(
        db_manager: Arc<DatabaseManager>,
        config: &TicketsConfig,
        numbers: Arc<dyn TicketNumberGenerator>,
    ) -> Self {
        Self {
            db_manager,
            prefix: config.prefix.clone(),
            max_attempts: config.max_number_attempts.max(1),
            default_priority: config.default_priority,
            numbers,
        }
    }

    /// Opens a ticket linked to `conversation`. The conversation itself is not
    /// touched; moving it is the caller's decision.
    pub async fn escalate(
        &self,
        scope: &TenantScope,
        conversation: &Conversation,
        request: &EscalationRequest,
    ) -> Result<Ticket, RoutingError> {
        scope.ensure_owns("conversation", conversation.company_id)?;

        let assigned_to = request.assign_to.or(match conversation.state {
            ConversationState::Assigned { user_id } => Some(user_id),
            _ => None,
        });
        let subject = request
            .subject
            .clone()
            .or_else(|| request.reason.clone())
            .unwrap_or_else(|| format!("Conversation #{}", conversation.id));
        let store = self.db_manager.ticket_store();

        for attempt in 1..=self.max_attempts {
            let ticket_number = self.numbers.next_number(&self.prefix);
            let ticket = NewTicket {
                conversation_id: conversation.id,
                ticket_number: ticket_number.clone(),
                subject: subject.clone(),
                reason: request.reason.clone(),
                status: TicketStatus::Open,
                priority: request.priority.unwrap_or(self.default_priority),
                assigned_to,
            };
            match store.create_ticket(scope, &ticket).await {
                Ok(ticket) => {
                    info!(
                        "escalated conversation_id={} to ticket {} (id={})",
                        conversation.id, ticket.ticket_number, ticket.id
                    );
                    return Ok(ticket);
                }
                Err(DatabaseError::UniqueViolation(_)) => {
                    warn!(
                        "ticket number {} taken (attempt {}/{})",
                        ticket_number, attempt, self.max_attempts
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(RoutingError::TicketNumberExhausted {
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{EscalationRequest, RandomTicketNumbers, TicketEscalator, TicketNumberGenerator};
    use crate::config::TicketsConfig;
    use crate::db::testing::TestDatabase;
    use crate::db::{ConversationState, TicketPriority, TicketStatus};
    use crate::routing::RoutingError;

    /// Hands out the queued numbers in order, then repeats the last one.
    struct ScriptedNumbers(Mutex<Vec<String>>);

    impl ScriptedNumbers {
        fn new(numbers: &[&str]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(
                numbers.iter().rev().map(|n| n.to_string()).collect(),
            )))
        }
    }

    impl TicketNumberGenerator for ScriptedNumbers {
        fn next_number(&self, _prefix: &str) -> String {
            let mut queue = self.0.lock();
            if queue.len() > 1 {
                queue.pop().unwrap_or_default()
            } else {
                queue.last().cloned().unwrap_or_default()
            }
        }
    }

    fn config(attempts: u32) -> TicketsConfig {
        TicketsConfig {
            prefix: "TCK".to_string(),
            max_number_attempts: attempts,
            default_priority: TicketPriority::Normal,
        }
    }

    #[test]
    fn random_numbers_carry_prefix_and_differ() {
        let numbers: HashSet<_> = (0..50).map(|_| RandomTicketNumbers.next_number("SUP")).collect();
        assert_eq!(numbers.len(), 50);
        assert!(numbers.iter().all(|n| n.starts_with("SUP-") && n.len() == "SUP-20240101-ABCDEF12".len()));
        assert!(numbers.iter().all(|n| {
            n.rsplit('-')
                .next()
                .is_some_and(|suffix| suffix.chars().all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)))
        }));
    }

    #[tokio::test]
    async fn collision_is_retried_with_a_new_number() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let conversation = db.open_conversation(&tenant, "+15550001").await;
        let escalator = TicketEscalator::with_generator(
            db.manager.clone(),
            &config(5),
            ScriptedNumbers::new(&["TCK-1", "TCK-1", "TCK-2"]),
        );
        let request = EscalationRequest {
            reason: Some("refund".to_string()),
            ..Default::default()
        };

        let first = escalator.escalate(&tenant.scope, &conversation, &request).await.expect("first");
        let second = escalator.escalate(&tenant.scope, &conversation, &request).await.expect("second");
        assert_eq!(first.ticket_number, "TCK-1");
        assert_eq!(second.ticket_number, "TCK-2");
        assert_eq!(second.status, TicketStatus::Open);
        assert_eq!(second.subject, "refund");
    }

    #[tokio::test]
    async fn exhausted_numbers_are_fatal() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let conversation = db.open_conversation(&tenant, "+15550001").await;
        let escalator = TicketEscalator::with_generator(
            db.manager.clone(),
            &config(3),
            ScriptedNumbers::new(&["TCK-SAME"]),
        );

        escalator
            .escalate(&tenant.scope, &conversation, &EscalationRequest::default())
            .await
            .expect("first ticket");
        let err = escalator
            .escalate(&tenant.scope, &conversation, &EscalationRequest::default())
            .await
            .expect_err("no numbers left");
        assert!(matches!(err, RoutingError::TicketNumberExhausted { attempts: 3 }));
    }

    #[tokio::test]
    async fn assigned_agent_is_preassigned_and_state_is_untouched() {
        let db = TestDatabase::new().await;
        let tenant = db.company("acme").await;
        let agent = db.agent(&tenant, "Grace").await;
        let mut conversation = db.open_conversation(&tenant, "+15550001").await;
        conversation.state = ConversationState::Assigned { user_id: agent.id };
        db.manager
            .conversation_store()
            .save_conversation(&tenant.scope, &conversation)
            .await
            .expect("assign");

        let escalator = TicketEscalator::new(db.manager.clone(), &config(5));
        let ticket = escalator
            .escalate(
                &tenant.scope,
                &conversation,
                &EscalationRequest {
                    priority: Some(TicketPriority::Urgent),
                    ..Default::default()
                },
            )
            .await
            .expect("ticket");
        assert_eq!(ticket.assigned_to, Some(agent.id));
        assert_eq!(ticket.priority, TicketPriority::Urgent);
        assert_eq!(ticket.conversation_id, conversation.id);

        let stored = db
            .manager
            .conversation_store()
            .get_conversation(&tenant.scope, conversation.id)
            .await
            .expect("load")
            .expect("exists");
        assert_eq!(stored.state, ConversationState::Assigned { user_id: agent.id });
    }
}
