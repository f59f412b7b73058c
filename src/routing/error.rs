use thiserror::Error;

use crate::db::DatabaseError;
use crate::parsers::AdapterError;
use crate::tenant::TenantError;

use super::state::InvalidTransition;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("channel {0} is inactive and cannot open conversations")]
    ChannelInactive(i64),
    #[error("{entity} belongs to company {found}, expected {expected}")]
    TenantMismatch {
        entity: &'static str,
        expected: i64,
        found: i64,
    },
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error("{0} not found")]
    NotFound(String),
    #[error("malformed inbound event: {0}")]
    Malformed(String),
    #[error("no free ticket number after {attempts} attempts")]
    TicketNumberExhausted { attempts: u32 },
}

impl RoutingError {
    /// Whether a later attempt at the same work may succeed. Everything that
    /// describes the input itself is permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database(err) => err.is_transient(),
            Self::ChannelInactive(_)
            | Self::TenantMismatch { .. }
            | Self::InvalidTransition(_)
            | Self::NotFound(_)
            | Self::Malformed(_)
            | Self::TicketNumberExhausted { .. } => false,
        }
    }
}

impl From<TenantError> for RoutingError {
    fn from(value: TenantError) -> Self {
        match value {
            TenantError::UnknownChannel(id) => Self::NotFound(format!("channel {id}")),
            TenantError::UnknownCompany(id) => Self::NotFound(format!("company {id}")),
            TenantError::Mismatch {
                entity,
                expected,
                found,
            } => Self::TenantMismatch {
                entity,
                expected,
                found,
            },
            TenantError::Database(err) => Self::Database(err),
        }
    }
}

impl From<AdapterError> for RoutingError {
    fn from(value: AdapterError) -> Self {
        Self::Malformed(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::RoutingError;
    use crate::db::{ConversationStatus, DatabaseError};
    use crate::routing::state::InvalidTransition;
    use crate::tenant::TenantError;

    #[test]
    fn only_transient_database_errors_are_retryable() {
        assert!(RoutingError::from(DatabaseError::Query("database is locked".into())).is_retryable());
        assert!(!RoutingError::from(DatabaseError::Corrupt("bad".into())).is_retryable());
        assert!(!RoutingError::Malformed("no phone".into()).is_retryable());
        assert!(!RoutingError::ChannelInactive(1).is_retryable());
        assert!(!RoutingError::TicketNumberExhausted { attempts: 5 }.is_retryable());
        assert!(
            !RoutingError::from(InvalidTransition {
                from: ConversationStatus::Closed,
                transition: "close",
            })
            .is_retryable()
        );
    }

    #[test]
    fn tenant_mismatch_keeps_details() {
        let err = RoutingError::from(TenantError::Mismatch {
            entity: "bot",
            expected: 1,
            found: 2,
        });
        assert_eq!(err.to_string(), "bot belongs to company 2, expected 1");
        assert!(!err.is_retryable());
    }
}
