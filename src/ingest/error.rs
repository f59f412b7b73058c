use thiserror::Error;

use crate::db::DatabaseError;
use crate::tenant::TenantError;

/// Failures surfaced to the webhook sender. Anything that goes wrong after the
/// event row is stored is recorded on the row instead.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("channel {0} not found")]
    UnknownChannel(i64),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<TenantError> for IngestError {
    fn from(value: TenantError) -> Self {
        match value {
            TenantError::UnknownChannel(id) => Self::UnknownChannel(id),
            TenantError::UnknownCompany(id) => {
                Self::Database(DatabaseError::NotFound(format!("company {id}")))
            }
            err @ TenantError::Mismatch { .. } => Self::Malformed(err.to_string()),
            TenantError::Database(err) => Self::Database(err),
        }
    }
}
