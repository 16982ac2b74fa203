use crate::records::ActionKind;

/// Errors from the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Migration from schema version {from_version} failed: {source}")]
    Migration {
        from_version: i64,
        #[source]
        source: sqlx::Error,
    },
    #[error("No upgrader registered for schema version {0}")]
    MissingUpgrader(i64),
    #[error("Stored schema version {stored} is newer than the latest known version {latest}")]
    UnsupportedVersion { stored: i64, latest: i64 },
    #[error("Stored schema version {stored} predates version {latest}; migrate the store first")]
    OutdatedSchema { stored: i64, latest: i64 },
    #[error("Corrupt row: {0}")]
    Record(#[from] RecordError),
    #[error("Storage actor closed")]
    ActorClosed,
    #[error("Storage actor failed: {0}")]
    ActorFailed(String),
    #[error("Storage actor task did not finish cleanly: {0}")]
    ActorJoin(String),
}

/// Errors raised while building or decoding record values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordError {
    #[error("Unknown action kind code: {0}")]
    UnknownActionKind(i64),
    #[error("Actions of kind {0} do not carry a description")]
    DescriptionNotAllowed(ActionKind),
    #[error("Description already set")]
    DescriptionAlreadySet,
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(f64),
}
