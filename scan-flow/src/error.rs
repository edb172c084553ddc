use thiserror::Error;

/// Errors produced while ingesting, storing and selecting scans
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Analysis request failed: {0}")]
    Transport(String),

    #[error("Analysis service rejected the upload with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("Malformed analysis response: {0}")]
    MalformedResponse(String),

    #[error("Scan not found: {0}")]
    ScanNotFound(String),

    #[error("Duplicate scan id: {0}")]
    DuplicateScanId(String),

    #[error("No scan is selected")]
    NoSelection,

    #[error("Batch of {submitted} files exceeds the limit of {limit}")]
    BatchTooLarge { submitted: usize, limit: usize },

    #[error("Scan store is full ({capacity} records)")]
    StoreFull { capacity: usize },

    #[error("Chat session not found: {0}")]
    ChatSessionNotFound(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ScanError>;
