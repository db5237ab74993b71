use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error taxonomy for the backup/restore engine.
///
/// Every job-level failure is caught at the job boundary, recorded on the job
/// record, and never re-thrown into the scheduler or retention loops.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Invalid schedule, destination or key material at configuration time
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Enumeration or row streaming failure from the data source
    #[error("source read error: {0}")]
    SourceRead(String),

    /// Compression or encryption transform failure
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// Artifact write failure at the destination
    #[error("destination write error: {0}")]
    DestinationWrite(String),

    /// Checksum mismatch on restore; always fatal, nothing is applied
    #[error("integrity error: artifact checksum mismatch (expected {expected}, got {actual})")]
    Integrity { expected: String, actual: String },

    /// A restore statement failed against the target
    #[error("statement execution error: {0}")]
    StatementExecution(String),

    /// Clock or timer fault in the scheduler
    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Job was cancelled cooperatively
    #[error("job cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// True when a failed statement should be skipped instead of failing the
    /// restore: the target object already holds the data being replayed.
    pub fn is_already_exists(&self) -> bool {
        match self {
            EngineError::StatementExecution(msg) => {
                msg.contains("already exists") || msg.contains("UNIQUE constraint failed")
            }
            _ => false,
        }
    }
}
