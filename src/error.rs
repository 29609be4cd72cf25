use crate::ids::ConnectionId;
use std::fmt;

/// Boxed error used for causes that have no more specific type.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Portable error types surfaced to callers of the session template.
///
/// Engine failures are translated into this taxonomy at the session proxy
/// boundary; the raw [`EngineError`] never reaches callers directly.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Misconfiguration or misuse detected before any engine call, such as
    /// changing the execution mode inside a transaction scope.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The engine failed because the database rejected the operation.
    #[error("Data access failure during {operation} ({kind}): {source}")]
    RecoverableData {
        /// Operation that was running when the failure happened
        operation: String,
        /// Classification of the database failure
        kind: DataAccessKind,
        /// Underlying SQLx error
        #[source]
        source: sqlx::Error,
    },

    /// Any other failure, including I/O errors while committing, rolling back
    /// or closing a connection.
    #[error("System failure during {operation}: {source}")]
    System {
        /// Operation that was running when the failure happened
        operation: String,
        /// Underlying cause
        #[source]
        source: BoxError,
    },
}

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn data_access(operation: &str, source: sqlx::Error) -> Self {
        Self::RecoverableData {
            operation: operation.to_string(),
            kind: DataAccessKind::classify(&source),
            source,
        }
    }

    /// Returns true for errors the caller may handle and retry on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::RecoverableData { .. })
    }

    /// Returns the data access classification, if this is a data error.
    pub fn data_access_kind(&self) -> Option<DataAccessKind> {
        match self {
            Self::RecoverableData { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of database failures carried by
/// [`Error::RecoverableData`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccessKind {
    /// A unique or primary key constraint was violated
    DuplicateKey,
    /// A foreign key, not-null or check constraint was violated
    IntegrityViolation,
    /// A statement expected a row and found none
    EmptyResult,
    /// The connection or pool failed underneath the statement
    ResourceFailure,
    /// Any other database failure
    Other,
}

impl DataAccessKind {
    /// Classifies a SQLx error.
    pub fn classify(err: &sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::Database(db) => match db.kind() {
                ErrorKind::UniqueViolation => Self::DuplicateKey,
                ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => Self::IntegrityViolation,
                _ => Self::Other,
            },
            sqlx::Error::RowNotFound => Self::EmptyResult,
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::ResourceFailure,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for DataAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DuplicateKey => "duplicate key",
            Self::IntegrityViolation => "integrity violation",
            Self::EmptyResult => "empty result",
            Self::ResourceFailure => "resource failure",
            Self::Other => "uncategorized",
        };
        f.write_str(name)
    }
}

/// Raw failures raised by the statement engine, the connection shim and the
/// session broker.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Statement execution failed inside the engine
    #[error("Persistence failure: {message}")]
    Persistence {
        /// Engine supplied description
        message: String,
        /// Root cause, a `sqlx::Error` when the database rejected the statement
        #[source]
        source: Option<BoxError>,
    },

    /// Commit, rollback or close failed on a raw connection
    #[error("Connection {connection} failed: {source}")]
    Connection {
        /// Physical identity of the failing connection
        connection: ConnectionId,
        /// Underlying SQLx error
        #[source]
        source: sqlx::Error,
    },

    /// A mapper or statement is not known to the engine configuration
    #[error("Binding failure: {0}")]
    Binding(String),

    /// A failure that is already in portable form
    #[error(transparent)]
    Portable(#[from] Error),

    /// Untyped failure
    #[error("{0}")]
    Other(BoxError),
}

impl EngineError {
    /// Creates a persistence failure with a root cause.
    pub fn persistence(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Persistence {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Result type alias for engine level operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Translates a raw engine failure into the portable taxonomy.
pub(crate) fn translate(operation: &str, err: EngineError) -> Error {
    match err {
        EngineError::Portable(err) => err,
        EngineError::Binding(message) => Error::Configuration(message),
        EngineError::Persistence {
            message,
            source: Some(source),
        } => match source.downcast::<sqlx::Error>() {
            Ok(db) => Error::data_access(operation, *db),
            Err(source) => Error::System {
                operation: operation.to_string(),
                source: Box::new(EngineError::Persistence {
                    message,
                    source: Some(source),
                }),
            },
        },
        other => Error::System {
            operation: operation.to_string(),
            source: Box::new(other),
        },
    }
}
