//! Push/pull orchestration.
//!
//! The orchestrator coordinates one complete push or pull per call and is
//! the only component permitted to mutate the live database file. Each
//! invocation walks the phases authorizing → locating-target →
//! backing-up-local → transferring → recording-result; a failure in any
//! phase surfaces as a structured outcome and the next call starts clean.
//! There is no automatic merge: divergence is reported by `status()` and
//! the user explicitly chooses which side wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{SyncConfig, SyncConfigUpdate, SyncStateStore, SyncTarget};
use crate::drive::{sanitize_container_id, DriveClient, UploadTarget};
use crate::error::{errors, SyncResult};
use crate::oauth::{AuthorizedClient, OAuthBroker, SyncCredentials};
use crate::storage::{file_sha256, replace_database, validate_database_file, DatabaseHandle};

const DEFAULT_BACKUP_NAME: &str = "puffin.db";

/// Phase of a running push or pull, for logging only. No cross-call state
/// is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Authorizing,
    LocatingTarget,
    BackingUpLocal,
    Transferring,
    RecordingResult,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncPhase::Authorizing => "authorizing",
            SyncPhase::LocatingTarget => "locating-target",
            SyncPhase::BackingUpLocal => "backing-up-local",
            SyncPhase::Transferring => "transferring",
            SyncPhase::RecordingResult => "recording-result",
        };
        f.write_str(name)
    }
}

/// Structured result of a push, pull or disconnect.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: crate::error::SyncError) -> Self {
        Self {
            success: false,
            error: Some(error.user_message()),
        }
    }
}

/// Local file half of a status report.
#[derive(Debug, Clone, Serialize)]
pub struct LocalFileStatus {
    pub exists: bool,
    pub modified_time: Option<DateTime<Utc>>,
}

/// Remote half of a status report. Ephemeral, computed on demand, never
/// persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteBackupInfo {
    pub exists: bool,
    pub modified_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RemoteBackupInfo {
    fn absent() -> Self {
        Self {
            exists: false,
            modified_time: None,
            error: None,
        }
    }

    fn unavailable(error: String) -> Self {
        Self {
            exists: false,
            modified_time: None,
            error: Some(error),
        }
    }
}

/// Read-only comparison of the local file and the remote backup.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub configured: bool,
    pub local: LocalFileStatus,
    pub remote: RemoteBackupInfo,
}

/// Result of validating a pasted target URL or id.
#[derive(Debug, Clone, Serialize)]
pub struct TargetValidation {
    pub success: bool,
    pub display_name: Option<String>,
    pub error: Option<String>,
}

/// Result of the OAuth callback code exchange.
#[derive(Debug, Clone, Serialize)]
pub struct CodeExchange {
    pub success: bool,
    pub email: Option<String>,
    pub error: Option<String>,
}

/// Parse a pasted Drive folder URL, file URL, `open?id=` URL or bare id
/// into the raw item id.
pub fn parse_target_input(input: &str) -> SyncResult<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(errors::validation(
            "Enter a Google Drive link or item id",
            Some("target".to_string()),
        ));
    }

    let raw_id = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        let url = Url::parse(trimmed).map_err(|_| {
            errors::validation(
                "That does not look like a valid Google Drive link",
                Some("target".to_string()),
            )
        })?;

        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        // https://drive.google.com/drive/folders/<id>
        // https://drive.google.com/file/d/<id>/view
        // https://drive.google.com/open?id=<id>
        if let Some(pos) = segments.iter().position(|s| *s == "folders") {
            segments.get(pos + 1).map(|s| s.to_string())
        } else if let Some(pos) = segments.iter().position(|s| *s == "d") {
            segments.get(pos + 1).map(|s| s.to_string())
        } else {
            url.query_pairs()
                .find(|(key, _)| key == "id")
                .map(|(_, value)| value.into_owned())
        }
        .ok_or_else(|| {
            errors::validation(
                "Could not find an item id in that Google Drive link",
                Some("target".to_string()),
            )
        })?
    } else {
        trimmed.to_string()
    };

    if raw_id.is_empty() || sanitize_container_id(&raw_id) != raw_id {
        return Err(errors::validation(
            "The Drive item id contains invalid characters",
            Some("target".to_string()),
        ));
    }

    Ok(raw_id)
}

/// Coordinates push and pull against the configured Drive target.
pub struct SyncOrchestrator {
    broker: OAuthBroker,
    drive: DriveClient,
    store: Arc<dyn SyncStateStore>,
    database: Arc<dyn DatabaseHandle>,
}

impl SyncOrchestrator {
    pub fn new(
        credentials: SyncCredentials,
        store: Arc<dyn SyncStateStore>,
        database: Arc<dyn DatabaseHandle>,
    ) -> Self {
        Self {
            broker: OAuthBroker::new(credentials, store.clone()),
            drive: DriveClient::new(),
            store,
            database,
        }
    }

    /// Assemble from pre-built components (used by tests to inject mock
    /// endpoints and fast retry policies).
    pub fn with_components(
        broker: OAuthBroker,
        drive: DriveClient,
        store: Arc<dyn SyncStateStore>,
        database: Arc<dyn DatabaseHandle>,
    ) -> Self {
        Self {
            broker,
            drive,
            store,
            database,
        }
    }

    /// The consent URL for the connect flow.
    pub fn auth_url(&self, state: Option<&str>) -> SyncResult<String> {
        self.broker.build_auth_url(state)
    }

    /// Upload the local database to the configured target.
    pub async fn push(&self) -> SyncOutcome {
        match self.push_inner().await {
            Ok(()) => SyncOutcome::ok(),
            Err(err) => {
                warn!("push failed: {}", err.user_message());
                SyncOutcome::failed(err)
            }
        }
    }

    async fn push_inner(&self) -> SyncResult<()> {
        debug!(phase = %SyncPhase::Authorizing, "starting push");
        let client = self.require_client().await?;

        debug!(phase = %SyncPhase::LocatingTarget, "resolving sync target");
        let config = self.require_config()?;
        let db_path = self.database.db_path().to_path_buf();

        // The backup runs even though the transfer direction is outward: it
        // protects against corruption introduced mid-transfer.
        debug!(phase = %SyncPhase::BackingUpLocal, "creating local backup");
        let backup = self.database.create_backup()?;
        info!(backup = %backup.display(), "local backup created");

        debug!(phase = %SyncPhase::Transferring, "uploading database");
        let new_file_target = match &config.target {
            SyncTarget::Folder {
                folder_id,
                file_name,
            } => {
                let target = match self
                    .drive
                    .find_file(&client, folder_id, file_name)
                    .await?
                {
                    Some(file_id) => UploadTarget::Update { file_id },
                    None => UploadTarget::Create {
                        folder_id: folder_id.clone(),
                        file_name: file_name.clone(),
                    },
                };
                self.drive.upload_file(&client, &target, &db_path).await?;
                None
            }
            SyncTarget::File { file_id } => {
                let target = UploadTarget::Update {
                    file_id: file_id.clone(),
                };
                let uploaded = self.drive.upload_file(&client, &target, &db_path).await?;
                // Keep the stored id in step with Drive if the file had to
                // be recreated during validation.
                (uploaded.id != *file_id).then_some(SyncTarget::File { file_id: uploaded.id })
            }
        };

        debug!(phase = %SyncPhase::RecordingResult, "recording push result");
        self.store.update_config(SyncConfigUpdate {
            target: new_file_target,
            last_synced_at: Some(Utc::now()),
            content_hash: file_sha256(&db_path).ok(),
            ..Default::default()
        })?;

        info!("push complete");
        Ok(())
    }

    /// Replace the local database with the remote backup.
    pub async fn pull(&self) -> SyncOutcome {
        match self.pull_inner().await {
            Ok(()) => SyncOutcome::ok(),
            Err(err) => {
                warn!("pull failed: {}", err.user_message());
                SyncOutcome::failed(err)
            }
        }
    }

    async fn pull_inner(&self) -> SyncResult<()> {
        debug!(phase = %SyncPhase::Authorizing, "starting pull");
        let client = self.require_client().await?;

        debug!(phase = %SyncPhase::LocatingTarget, "resolving sync target");
        let config = self.require_config()?;
        let file_id = self.resolve_remote_file(&client, &config).await?.ok_or_else(|| {
            errors::target(
                "No remote backup was found at the configured target. Push once to create it.",
            )
        })?;

        // This snapshot is the sole recovery path if the remote copy turns
        // out to be bad, so it happens strictly before any overwrite. On a
        // first pull there is nothing to preserve.
        debug!(phase = %SyncPhase::BackingUpLocal, "creating local backup");
        let db_path = self.database.db_path().to_path_buf();
        if db_path.exists() {
            let backup = self.database.create_backup()?;
            info!(backup = %backup.display(), "local backup created");
        }

        debug!(phase = %SyncPhase::Transferring, "downloading remote backup");
        let staged = staging_path(&db_path);
        self.drive
            .download_file(&client, &file_id, &staged)
            .await?;

        if let Err(err) = validate_database_file(&staged) {
            let _ = fs::remove_file(&staged);
            return Err(err);
        }

        replace_database(&db_path, &staged)?;
        self.database.reset_connections()?;

        debug!(phase = %SyncPhase::RecordingResult, "recording pull result");
        self.store.update_config(SyncConfigUpdate {
            last_synced_at: Some(Utc::now()),
            content_hash: file_sha256(&db_path).ok(),
            ..Default::default()
        })?;

        info!("pull complete");
        Ok(())
    }

    /// Read-only status for the UI. Never mutates persisted state; every
    /// failure is folded into the remote error field.
    pub async fn status(&self) -> SyncStatus {
        let state = self.store.load().unwrap_or_default();
        let local = local_status(self.database.db_path());

        let Some(config) = state.config else {
            return SyncStatus {
                configured: false,
                local,
                remote: RemoteBackupInfo::absent(),
            };
        };

        let remote = self.remote_status(&config).await;
        SyncStatus {
            configured: true,
            local,
            remote,
        }
    }

    async fn remote_status(&self, config: &SyncConfig) -> RemoteBackupInfo {
        let client = match self.broker.get_client().await {
            Ok(Some(client)) => client,
            Ok(None) => {
                return RemoteBackupInfo::unavailable(
                    "Not authenticated with Google Drive".to_string(),
                )
            }
            Err(err) => return RemoteBackupInfo::unavailable(err.user_message()),
        };

        let file_id = match self.resolve_remote_file(&client, config).await {
            Ok(Some(file_id)) => file_id,
            Ok(None) => return RemoteBackupInfo::absent(),
            Err(err) => return RemoteBackupInfo::unavailable(err.user_message()),
        };

        match self.drive.get_metadata(&client, &file_id).await {
            Ok(meta) => RemoteBackupInfo {
                exists: meta.exists,
                modified_time: meta.modified_time,
                error: None,
            },
            Err(err) => RemoteBackupInfo::unavailable(err.user_message()),
        }
    }

    /// Validate a pasted Drive link or id and persist it as the sync
    /// target. A folder becomes a folder-based target holding a file named
    /// after the local database; a file id becomes a fixed file-based
    /// target.
    pub async fn validate_target(&self, url_or_id: &str) -> TargetValidation {
        match self.validate_target_inner(url_or_id).await {
            Ok(display_name) => TargetValidation {
                success: true,
                display_name: Some(display_name),
                error: None,
            },
            Err(err) => TargetValidation {
                success: false,
                display_name: None,
                error: Some(err.user_message()),
            },
        }
    }

    async fn validate_target_inner(&self, url_or_id: &str) -> SyncResult<String> {
        let client = self.require_client().await?;
        let item_id = parse_target_input(url_or_id)?;

        let info = self.drive.get_file_info(&client, &item_id).await?;
        let target = if info.is_folder {
            SyncTarget::Folder {
                folder_id: info.id,
                file_name: self.backup_file_name(),
            }
        } else {
            SyncTarget::File { file_id: info.id }
        };

        info!(display_name = info.name.as_str(), "sync target selected");
        self.store
            .save_config(SyncConfig::new(target, info.name.clone()))?;
        Ok(info.name)
    }

    /// Complete the OAuth callback: store tokens and the account email.
    pub async fn exchange_code(&self, code: &str) -> CodeExchange {
        match self.exchange_code_inner(code).await {
            Ok(email) => CodeExchange {
                success: true,
                email,
                error: None,
            },
            Err(err) => CodeExchange {
                success: false,
                email: None,
                error: Some(err.user_message()),
            },
        }
    }

    async fn exchange_code_inner(&self, code: &str) -> SyncResult<Option<String>> {
        let tokens = self.broker.exchange_code(code).await?;
        let client = AuthorizedClient::new(tokens.access_token.clone());
        self.store.save_tokens(tokens)?;

        // The email is informational; its lookup must not fail the connect.
        let email = match self.broker.fetch_user_email(&client).await {
            Ok(email) => email,
            Err(err) => {
                warn!("could not fetch account email: {}", err.user_message());
                None
            }
        };
        if let Some(email) = &email {
            self.store.save_user_email(email.clone())?;
        }

        Ok(email)
    }

    /// Drop the sync target and tokens. Revocation is best-effort; the
    /// local financial data is never touched.
    pub async fn disconnect(&self) -> SyncOutcome {
        self.broker.revoke().await;
        match self.store.clear() {
            Ok(()) => {
                info!("sync disconnected");
                SyncOutcome::ok()
            }
            Err(err) => SyncOutcome::failed(err),
        }
    }

    async fn require_client(&self) -> SyncResult<AuthorizedClient> {
        self.broker.get_client().await?.ok_or_else(|| {
            errors::auth(
                "Not authenticated with Google Drive. Please authenticate and try again.",
            )
        })
    }

    fn require_config(&self) -> SyncResult<SyncConfig> {
        self.store.config()?.ok_or_else(|| {
            errors::target("No sync target is configured. Select a Drive folder or file first.")
        })
    }

    async fn resolve_remote_file(
        &self,
        client: &AuthorizedClient,
        config: &SyncConfig,
    ) -> SyncResult<Option<String>> {
        match &config.target {
            SyncTarget::Folder {
                folder_id,
                file_name,
            } => self.drive.find_file(client, folder_id, file_name).await,
            SyncTarget::File { file_id } => Ok(Some(file_id.clone())),
        }
    }

    fn backup_file_name(&self) -> String {
        self.database
            .db_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_BACKUP_NAME.to_string())
    }
}

fn staging_path(db_path: &Path) -> PathBuf {
    let file_name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_BACKUP_NAME.to_string());
    db_path.with_file_name(format!("{file_name}.download"))
}

fn local_status(db_path: &Path) -> LocalFileStatus {
    match fs::metadata(db_path) {
        Ok(meta) => LocalFileStatus {
            exists: true,
            modified_time: meta.modified().ok().map(DateTime::<Utc>::from),
        },
        Err(_) => LocalFileStatus {
            exists: false,
            modified_time: None,
        },
    }
}
