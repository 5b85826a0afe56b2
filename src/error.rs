use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Invalid segment file '{0}': bad magic")]
    InvalidSegment(String),

    #[error("Truncated record: {0}")]
    TruncatedRecord(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<rocksdb::Error> for DbError {
    fn from(err: rocksdb::Error) -> Self {
        DbError::StorageError(err.to_string())
    }
}
