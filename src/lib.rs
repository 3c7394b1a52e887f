//! Puffin Sync
//!
//! Google Drive backup and sync engine for the Puffin personal finance
//! tracker. The local SQLite database is treated as an opaque blob: a push
//! uploads it to a user-chosen Drive target, a pull replaces it atomically
//! after validation, and divergence between the two copies is surfaced to
//! the user rather than merged. Single-user, user-triggered,
//! last-writer-wins.

pub mod cli;
pub mod config;
pub mod drive;
pub mod error;
pub mod oauth;
pub mod orchestrator;
pub mod retry;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{
    FileStateStore, MemoryStateStore, SyncConfig, SyncConfigUpdate, SyncState, SyncStateStore,
    SyncTarget, TokenSet,
};
pub use drive::{DriveClient, RemoteMetadata, UploadTarget, UploadedFile};
pub use error::{ErrorCategory, SyncError, SyncResult};
pub use oauth::{AuthorizedClient, OAuthBroker, OAuthEndpoints, SyncCredentials};
pub use orchestrator::{
    CodeExchange, RemoteBackupInfo, SyncOrchestrator, SyncOutcome, SyncStatus, TargetValidation,
};
pub use retry::{with_retry, RetryPolicy};
pub use storage::{DatabaseHandle, FileDatabase};
