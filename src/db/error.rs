use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database connection error: {0}")]
    Connection(String),
    #[error("database query error: {0}")]
    Query(String),
    #[error("database migration error: {0}")]
    Migration(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl DatabaseError {
    /// Connection and query failures may succeed on a later attempt; the rest
    /// describe the data itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Query(_))
    }
}

impl From<DieselError> for DatabaseError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Self::UniqueViolation(info.message().to_string())
            }
            DieselError::NotFound => Self::NotFound("row".to_string()),
            other => Self::Query(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DatabaseError;

    #[test]
    fn transient_errors_are_connection_and_query() {
        assert!(DatabaseError::Connection("down".to_string()).is_transient());
        assert!(DatabaseError::Query("locked".to_string()).is_transient());
        assert!(!DatabaseError::UniqueViolation("dup".to_string()).is_transient());
        assert!(!DatabaseError::Corrupt("bad".to_string()).is_transient());
    }

    #[test]
    fn diesel_not_found_maps_to_not_found() {
        let err = DatabaseError::from(diesel::result::Error::NotFound);
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
