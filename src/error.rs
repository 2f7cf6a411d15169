//! Crate-wide error taxonomy.
//!
//! Every component speaks this enum so the retry-vs-surface decision can be
//! made at the loop that owns the retry policy.

use sea_orm::{DbErr, SqlErr};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Missing blob or row. Never retried internally.
    #[error("not found")]
    NotFound,

    /// Duplicate `(address, id)` meta or duplicate queue item.
    #[error("already exists")]
    AlreadyExists,

    /// Malformed input: bad JSON, schema violation, bad signature.
    #[error("invalid: {0}")]
    Invalid(String),

    /// Signature verified but ownership check failed.
    #[error("access denied")]
    Unauthorized,

    /// A DARE package failed authentication.
    #[error("ciphertext is corrupt")]
    Corrupt,

    /// Network, RPC or database failure; retried by the owning loop.
    #[error("transient: {0}")]
    Transient(String),

    /// Misconfiguration or start-up dependency failure.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn invalid(msg: impl std::fmt::Display) -> Self {
        Error::Invalid(msg.to_string())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Error::Transient(msg.to_string())
    }

    pub fn fatal(msg: impl std::fmt::Display) -> Self {
        Error::Fatal(msg.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

impl From<DbErr> for Error {
    fn from(err: DbErr) -> Self {
        if let DbErr::RecordNotFound(_) = err {
            return Error::NotFound;
        }
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => Error::AlreadyExists,
            _ => Error::Transient(format!("database: {}", err)),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transient("deadline exceeded".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_not_found_maps_to_not_found() {
        let err: Error = DbErr::RecordNotFound("pdv".to_string()).into();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_db_errors_are_transient() {
        let err: Error = DbErr::Custom("connection reset".to_string()).into();
        assert!(matches!(err, Error::Transient(msg) if msg.contains("connection reset")));
    }
}
