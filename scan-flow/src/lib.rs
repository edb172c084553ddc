pub mod analysis;
pub mod chat;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod ingest;
pub mod models;
pub mod store;
pub mod workspace;

// Re-export commonly used types
#[cfg(feature = "http")]
pub use analysis::HttpAnalysisService;
pub use analysis::AnalysisService;
pub use chat::{
    ChatMessage, ChatSession, ChatSessionStorage, InMemoryChatSessionStorage, MessageRole,
};
pub use coordinator::{ChatTarget, DetailView, ReportNotice, SelectionCoordinator};
pub use error::{Result, ScanError};
pub use format::infer_format;
pub use ingest::{BatchOutcome, BatchSummary, IngestionController, IngestionOptions, RecordOrigin};
pub use models::{
    AnalysisResult, AnalysisStatus, AnalyzeResponse, FileBlob, Scan, ScanFormat, ScanPayload,
};
pub use store::{ScanEvent, ScanStore};
pub use workspace::{
    InMemoryWorkspaceStorage, Preferences, Theme, Workspace, WorkspaceLimits, WorkspaceStorage,
};
