//! Conversation ownership transitions.
//!
//! ```text
//! OPEN ──BotMatched──▶ BOT_ACTIVE ──BotReleased──▶ OPEN
//! OPEN | BOT_ACTIVE | ASSIGNED ──Claim──▶ ASSIGNED
//! ASSIGNED ──Close──▶ CLOSED ──Reopen──▶ OPEN
//! ```

use std::fmt;

use thiserror::Error;

use crate::db::{ConversationState, ConversationStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A trigger rule selected this bot. On `BotActive` it swaps the bot.
    BotMatched { bot_id: i64 },
    BotReleased,
    /// A human takes over, either explicitly or through a bot handoff.
    Claim { user_id: i64 },
    Close,
    Reopen,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BotMatched { .. } => "bot_matched",
            Self::BotReleased => "bot_released",
            Self::Claim { .. } => "claim",
            Self::Close => "close",
            Self::Reopen => "reopen",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {transition} to a {from} conversation")]
pub struct InvalidTransition {
    pub from: ConversationStatus,
    pub transition: &'static str,
}

impl ConversationState {
    pub fn apply(self, transition: Transition) -> Result<ConversationState, InvalidTransition> {
        use ConversationState as S;
        use Transition as T;

        match (self, transition) {
            (S::Open | S::BotActive { .. }, T::BotMatched { bot_id }) => Ok(S::BotActive { bot_id }),
            (S::BotActive { .. }, T::BotReleased) => Ok(S::Open),
            (S::Open | S::BotActive { .. } | S::Assigned { .. }, T::Claim { user_id }) => {
                Ok(S::Assigned { user_id })
            }
            (S::Assigned { user_id }, T::Close) => Ok(S::Closed {
                last_assignee: Some(user_id),
            }),
            (S::Closed { .. }, T::Reopen) => Ok(S::Open),
            (state, transition) => Err(InvalidTransition {
                from: state.status(),
                transition: transition.name(),
            }),
        }
    }

    /// Bot rules are only evaluated while no human owns the conversation.
    pub fn accepts_bot_routing(&self) -> bool {
        matches!(self, Self::Open | Self::BotActive { .. })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::Transition;
    use crate::db::ConversationState;

    const OPEN: ConversationState = ConversationState::Open;
    const BOT_1: ConversationState = ConversationState::BotActive { bot_id: 1 };
    const AGENT_7: ConversationState = ConversationState::Assigned { user_id: 7 };
    const CLOSED_7: ConversationState = ConversationState::Closed {
        last_assignee: Some(7),
    };

    #[test_case(OPEN, Transition::BotMatched { bot_id: 1 } => BOT_1 ; "bot picks up open")]
    #[test_case(BOT_1, Transition::BotMatched { bot_id: 2 } => ConversationState::BotActive { bot_id: 2 } ; "bot swap")]
    #[test_case(BOT_1, Transition::BotReleased => OPEN ; "bot gives up")]
    #[test_case(OPEN, Transition::Claim { user_id: 7 } => AGENT_7 ; "agent claims open")]
    #[test_case(BOT_1, Transition::Claim { user_id: 7 } => AGENT_7 ; "bot hands off")]
    #[test_case(AGENT_7, Transition::Claim { user_id: 8 } => ConversationState::Assigned { user_id: 8 } ; "reassign")]
    #[test_case(AGENT_7, Transition::Close => CLOSED_7 ; "agent resolves")]
    #[test_case(CLOSED_7, Transition::Reopen => OPEN ; "reopen")]
    fn legal_transitions(state: ConversationState, transition: Transition) -> ConversationState {
        let next = state.apply(transition).expect("legal transition");
        assert!(next.bot_id().is_none() || next.assigned_to().is_none());
        next
    }

    #[test_case(OPEN, Transition::BotReleased ; "release without bot")]
    #[test_case(OPEN, Transition::Close ; "close unowned")]
    #[test_case(OPEN, Transition::Reopen ; "reopen open")]
    #[test_case(BOT_1, Transition::Close ; "close bot conversation")]
    #[test_case(AGENT_7, Transition::BotMatched { bot_id: 1 } ; "bot over agent")]
    #[test_case(AGENT_7, Transition::BotReleased ; "release agent")]
    #[test_case(CLOSED_7, Transition::BotMatched { bot_id: 1 } ; "bot on closed")]
    #[test_case(CLOSED_7, Transition::Claim { user_id: 7 } ; "claim closed")]
    #[test_case(CLOSED_7, Transition::Close ; "close twice")]
    fn illegal_transitions(state: ConversationState, transition: Transition) {
        let err = state.apply(transition).expect_err("illegal transition");
        assert_eq!(err.from, state.status());
        assert_eq!(err.transition, transition.name());
    }

    #[test]
    fn bot_routing_stops_once_a_human_owns_it() {
        assert!(OPEN.accepts_bot_routing());
        assert!(BOT_1.accepts_bot_routing());
        assert!(!AGENT_7.accepts_bot_routing());
        assert!(!CLOSED_7.accepts_bot_routing());
    }
}
