use thiserror::Error;

/// Errors returned by hub operations.
///
/// The variants double as the wire taxonomy: `code()` and `http_status()`
/// give the stable identifiers an HTTP layer would send back.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upload incomplete: received {received} of {total} chunks")]
    Incomplete { received: u32, total: u32 },

    #[error("Chunk index {index} out of range (total chunks {total})")]
    OutOfRange { index: u32, total: u32 },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),

    #[error("Artifact size {size} exceeds limit {limit}")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Storage failures (disk full, I/O errors, a failed statement) count:
    /// the request itself was valid.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HubError::Unavailable(_)
                | HubError::Timeout(_)
                | HubError::Io(_)
                | HubError::Database(_)
        )
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::InvalidArgument(_) => "invalid_argument",
            HubError::NotFound(_) => "not_found",
            HubError::Conflict(_) => "conflict",
            HubError::Incomplete { .. } => "incomplete",
            HubError::OutOfRange { .. } => "out_of_range",
            HubError::SizeMismatch { .. } => "size_mismatch",
            HubError::IntegrityFailure(_) => "integrity_failure",
            HubError::QuotaExceeded { .. } => "quota_exceeded",
            HubError::Unavailable(_) => "unavailable",
            HubError::Timeout(_) => "timeout",
            HubError::Cancelled(_) => "cancelled",
            HubError::Database(_)
            | HubError::Io(_)
            | HubError::Serialization(_)
            | HubError::Config(_) => "internal",
        }
    }

    /// HTTP status an API layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            HubError::InvalidArgument(_)
            | HubError::OutOfRange { .. }
            | HubError::SizeMismatch { .. } => 400,
            HubError::NotFound(_) => 404,
            HubError::Conflict(_) | HubError::Incomplete { .. } => 409,
            HubError::QuotaExceeded { .. } => 413,
            HubError::IntegrityFailure(_) => 422,
            HubError::Cancelled(_) => 499,
            HubError::Unavailable(_) => 503,
            HubError::Timeout(_) => 504,
            HubError::Database(_)
            | HubError::Io(_)
            | HubError::Serialization(_)
            | HubError::Config(_) => 500,
        }
    }
}

impl From<crate::db::DbError> for HubError {
    fn from(e: crate::db::DbError) -> Self {
        use crate::db::DbError;
        match e {
            DbError::Pool(e) => HubError::Unavailable(format!("connection pool: {}", e)),
            DbError::Rusqlite(e) => HubError::from(e),
            DbError::NotFound(msg) => HubError::NotFound(msg),
            DbError::Config(msg) => HubError::Config(msg),
        }
    }
}

impl From<rusqlite::Error> for HubError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e {
            match err.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    return HubError::Unavailable(format!("database busy: {}", e));
                }
                rusqlite::ErrorCode::CannotOpen => {
                    return HubError::Unavailable(format!("database unreachable: {}", e));
                }
                _ => {}
            }
        }
        HubError::Database(e.to_string())
    }
}

impl From<r2d2::Error> for HubError {
    fn from(e: r2d2::Error) -> Self {
        HubError::Unavailable(format!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for HubError {
    fn from(e: toml::ser::Error) -> Self {
        HubError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for HubError {
    fn from(e: toml::de::Error) -> Self {
        HubError::Config(e.to_string())
    }
}

impl From<tokio::task::JoinError> for HubError {
    fn from(e: tokio::task::JoinError) -> Self {
        HubError::Unavailable(format!("blocking task failed: {}", e))
    }
}

/// Whether a rusqlite error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HubError::Incomplete {
            received: 2,
            total: 3,
        };
        assert_eq!(err.to_string(), "Upload incomplete: received 2 of 3 chunks");
    }

    #[test]
    fn test_transient_classification() {
        assert!(HubError::Unavailable("db".into()).is_transient());
        assert!(HubError::Timeout("lease".into()).is_transient());
        assert!(!HubError::IntegrityFailure("size".into()).is_transient());
        assert!(!HubError::Conflict("merging".into()).is_transient());
        assert!(!HubError::Cancelled("merge".into()).is_transient());

        let disk_full = std::io::Error::new(std::io::ErrorKind::Other, "no space left on device");
        assert!(HubError::from(disk_full).is_transient());
        assert!(HubError::Database("disk I/O error".into()).is_transient());
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(HubError::NotFound("x".into()).http_status(), 404);
        assert_eq!(
            HubError::OutOfRange { index: 5, total: 3 }.http_status(),
            400
        );
        assert_eq!(
            HubError::QuotaExceeded { size: 2, limit: 1 }.code(),
            "quota_exceeded"
        );
        assert_eq!(HubError::Database("boom".into()).code(), "internal");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let hub_err: HubError = io_err.into();
        assert!(hub_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_busy_maps_to_unavailable() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        assert!(HubError::from(err).is_transient());
    }
}
