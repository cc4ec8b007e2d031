use thiserror::Error;

/// Error types for call routing, queueing and call-record operations
///
/// Routing problems that can be answered with a directive (no rule matched,
/// no member free, misconfigured rule) are *not* errors: they are folded into
/// the returned [`RoutingDirective`](crate::orchestrator::RoutingDirective).
/// The variants here cover the cases that callers have to handle themselves.
///
/// # Examples
///
/// ```
/// use crm_call_engine::{CallEngineError, Result};
///
/// fn admit() -> Result<()> {
///     Err(CallEngineError::QueueFull { group_id: 7, max_size: 1 })
/// }
///
/// match admit() {
///     Err(CallEngineError::QueueFull { max_size, .. }) => assert_eq!(max_size, 1),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum CallEngineError {
    /// Malformed input: empty caller or called number, unknown status
    /// value, invalid regex or time condition on an admin write.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown session, queue entry or directory record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The group's waiting queue already holds `max_size` calls.
    #[error("Queue for group {group_id} is full (max {max_size})")]
    QueueFull { group_id: i64, max_size: u32 },

    /// A rule or group references something that cannot be used.
    #[error("Misconfiguration: {0}")]
    Misconfiguration(String),

    /// Store failure that may succeed when retried (busy/locked database,
    /// pool timeout, I/O).
    ///
    /// Surfaced to the signaling adapter after the bounded write retries
    /// are exhausted.
    #[error("Transient store error: {0}")]
    TransientStore(String),

    /// Any other database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Unique-key conflict, e.g. a duplicate session id.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for CallEngineError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for CallEngineError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            return Self::TransientStore(err.to_string());
        }
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return Self::AlreadyExists(db_err.message().to_string());
            }
        }
        if let sqlx::Error::RowNotFound = err {
            return Self::NotFound("row not found".to_string());
        }
        Self::Database(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CallEngineError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Database(format!("migration failed: {err}"))
    }
}

/// Whether a sqlx error is worth retrying.
///
/// SQLite reports `SQLITE_BUSY` (5) and `SQLITE_LOCKED` (6) when another
/// writer holds the database.
pub(crate) fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db_err) => {
            let busy_code = db_err
                .code()
                .map(|code| matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517"))
                .unwrap_or(false);
            busy_code || db_err.message().contains("database is locked")
        }
        _ => false,
    }
}

impl CallEngineError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn misconfiguration<S: Into<String>>(msg: S) -> Self {
        Self::Misconfiguration(msg.into())
    }

    pub fn database<S: Into<String>>(msg: S) -> Self {
        Self::Database(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors caused by the request rather than by the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::NotFound(_) | Self::AlreadyExists(_) | Self::QueueFull { .. }
        )
    }

    /// Errors that the caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientStore(_))
    }
}

pub type Result<T> = std::result::Result<T, CallEngineError>;
