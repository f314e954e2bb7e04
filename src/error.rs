use crate::types::RowDecodeError;
use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataErrorCode {
    InvalidQueryDeclaration,
    NestedTransaction,
    Usage,
    InvalidConfig,
    RetryTransaction,
    OptimisticLock,
    StaleObject,
    LockTimeout,
    ConnectionLost,
    Cowrite,
    FullScatter,
    TableScan,
    PostCommitHookFailed,
    DuplicateMigrations,
    MissingMigrations,
    Migration,
    Database,
    NotFound,
    NonUniqueResult,
    RowLimitExceeded,
    Decode,
    Io,
}

impl DataErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DataErrorCode::InvalidQueryDeclaration => "invalid_query_declaration",
            DataErrorCode::NestedTransaction => "nested_transaction",
            DataErrorCode::Usage => "usage",
            DataErrorCode::InvalidConfig => "invalid_config",
            DataErrorCode::RetryTransaction => "retry_transaction",
            DataErrorCode::OptimisticLock => "optimistic_lock",
            DataErrorCode::StaleObject => "stale_object",
            DataErrorCode::LockTimeout => "lock_timeout",
            DataErrorCode::ConnectionLost => "connection_lost",
            DataErrorCode::Cowrite => "cowrite",
            DataErrorCode::FullScatter => "full_scatter",
            DataErrorCode::TableScan => "table_scan",
            DataErrorCode::PostCommitHookFailed => "post_commit_hook_failed",
            DataErrorCode::DuplicateMigrations => "duplicate_migrations",
            DataErrorCode::MissingMigrations => "missing_migrations",
            DataErrorCode::Migration => "migration",
            DataErrorCode::Database => "database",
            DataErrorCode::NotFound => "not_found",
            DataErrorCode::NonUniqueResult => "non_unique_result",
            DataErrorCode::RowLimitExceeded => "row_limit_exceeded",
            DataErrorCode::Decode => "decode",
            DataErrorCode::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("Query class {query} has problems:{}", render_problems(.problems))]
    InvalidQueryDeclaration {
        query: String,
        problems: Vec<String>,
    },
    #[error("Attempted to start a nested session")]
    NestedTransaction,
    #[error("{0}")]
    Usage(String),
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },
    #[error("transaction should be retried: {0}")]
    RetryTransaction(String),
    #[error("optimistic lock conflict on {table} {id}")]
    OptimisticLock { table: String, id: i64 },
    #[error("row in {table} with id {id} was updated or deleted by another transaction")]
    StaleObject { table: String, id: i64 },
    #[error("lock acquisition timed out: {0}")]
    LockTimeout(String),
    #[error("recoverable connection error: {0}")]
    ConnectionLost(String),
    #[error("cowrite: {message}")]
    Cowrite { message: String },
    #[error("full scatter: {message}")]
    FullScatter { message: String },
    #[error("table scan: {message}")]
    TableScan { message: String },
    #[error("transaction committed but a post-commit hook failed: {0}")]
    PostCommitHookFailed(Box<DataError>),
    #[error("Duplicate migrations found {}", .paths.join(", "))]
    DuplicateMigrations { paths: Vec<String> },
    #[error("{message}")]
    MissingMigrations { message: String },
    #[error("migration error: {0}")]
    Migration(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: String, id: i64 },
    #[error("query expected a unique result but was {rows}")]
    NonUniqueResult { rows: usize },
    #[error("query truncated at {rows} rows")]
    RowLimitExceeded { rows: usize },
    #[error(transparent)]
    Decode(#[from] RowDecodeError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{message}: {source}")]
    Context {
        message: String,
        #[source]
        source: Box<DataError>,
    },
}

pub type DataResult<T> = Result<T, DataError>;

fn render_problems(problems: &[String]) -> String {
    let mut out = String::new();
    for problem in problems {
        out.push_str("\n  ");
        out.push_str(problem);
    }
    out
}

impl DataError {
    pub fn code(&self) -> DataErrorCode {
        match self {
            DataError::InvalidQueryDeclaration { .. } => DataErrorCode::InvalidQueryDeclaration,
            DataError::NestedTransaction => DataErrorCode::NestedTransaction,
            DataError::Usage(_) => DataErrorCode::Usage,
            DataError::InvalidConfig { .. } => DataErrorCode::InvalidConfig,
            DataError::RetryTransaction(_) => DataErrorCode::RetryTransaction,
            DataError::OptimisticLock { .. } => DataErrorCode::OptimisticLock,
            DataError::StaleObject { .. } => DataErrorCode::StaleObject,
            DataError::LockTimeout(_) => DataErrorCode::LockTimeout,
            DataError::ConnectionLost(_) => DataErrorCode::ConnectionLost,
            DataError::Cowrite { .. } => DataErrorCode::Cowrite,
            DataError::FullScatter { .. } => DataErrorCode::FullScatter,
            DataError::TableScan { .. } => DataErrorCode::TableScan,
            DataError::PostCommitHookFailed(_) => DataErrorCode::PostCommitHookFailed,
            DataError::DuplicateMigrations { .. } => DataErrorCode::DuplicateMigrations,
            DataError::MissingMigrations { .. } => DataErrorCode::MissingMigrations,
            DataError::Migration(_) => DataErrorCode::Migration,
            DataError::Database(_) => DataErrorCode::Database,
            DataError::NotFound { .. } => DataErrorCode::NotFound,
            DataError::NonUniqueResult { .. } => DataErrorCode::NonUniqueResult,
            DataError::RowLimitExceeded { .. } => DataErrorCode::RowLimitExceeded,
            DataError::Decode(_) => DataErrorCode::Decode,
            DataError::Io(_) => DataErrorCode::Io,
            DataError::Context { source, .. } => source.code(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// True when the retry loop may run the transaction again.
    ///
    /// Context wrappers are transparent: a retryable error keeps its tag no
    /// matter how many times it has been wrapped on the way up.
    pub fn is_retryable(&self) -> bool {
        match self {
            DataError::RetryTransaction(_)
            | DataError::OptimisticLock { .. }
            | DataError::StaleObject { .. }
            | DataError::LockTimeout(_)
            | DataError::ConnectionLost(_) => true,
            DataError::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn is_scale_safety_violation(&self) -> bool {
        match self {
            DataError::Cowrite { .. } | DataError::FullScatter { .. } | DataError::TableScan { .. } => {
                true
            }
            DataError::Context { source, .. } => source.is_scale_safety_violation(),
            _ => false,
        }
    }

    pub fn is_usage(&self) -> bool {
        match self {
            DataError::InvalidQueryDeclaration { .. }
            | DataError::NestedTransaction
            | DataError::Usage(_)
            | DataError::InvalidConfig { .. } => true,
            DataError::Context { source, .. } => source.is_usage(),
            _ => false,
        }
    }

    /// Strips `Context` wrappers.
    pub fn root(&self) -> &DataError {
        match self {
            DataError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn context(self, message: impl Into<String>) -> DataError {
        DataError::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    pub fn usage(message: impl Into<String>) -> DataError {
        DataError::Usage(message.into())
    }
}

impl From<rusqlite::Error> for DataError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                DataError::LockTimeout(err.to_string())
            }
            Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::SystemIoFailure)
            | Some(ErrorCode::NotADatabase) => DataError::ConnectionLost(err.to_string()),
            _ => DataError::Database(err.to_string()),
        }
    }
}

/// Attaches a message to an error on its way up without changing its class.
pub trait ResultExt<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> DataResult<T>;
}

impl<T> ResultExt<T> for DataResult<T> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> DataResult<T> {
        self.map_err(|e| e.context(f()))
    }
}
