//! Google Drive client for backup files.
//!
//! Low-level remote operations over the Drive v3 HTTP API: locate a backup
//! by name, read its metadata, upload a new revision and download it back.
//! Every call runs through the shared retry policy, and every externally
//! derived identifier is pushed through the whitelist sanitizer before it
//! is interpolated into a query string.

use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{errors, SyncError, SyncResult};
use crate::oauth::AuthorizedClient;
use crate::retry::{with_retry, RetryPolicy};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const BACKUP_MIME_TYPE: &str = "application/octet-stream";
const FILE_FIELDS: &str = "id,name,mimeType,modifiedTime";

/// Strip everything outside `[A-Za-z0-9_-]` from an externally derived
/// identifier. Applied before any interpolation into a query string;
/// idempotent by construction.
pub fn sanitize_container_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Backslash-escape single quotes (and backslashes) so a filename cannot
/// terminate the quoted query literal early.
pub fn escape_query_value(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Build the Drive search query for a named file inside a container,
/// excluding trashed items.
pub fn build_file_query(container_id: &str, file_name: &str) -> String {
    format!(
        "'{}' in parents and name='{}' and trashed=false",
        sanitize_container_id(container_id),
        escape_query_value(file_name)
    )
}

/// Remediation text for an update against an id that no longer resolves.
/// The UI shows this verbatim, so it names every cause the user can fix.
pub fn stale_target_message(file_id: &str) -> String {
    format!(
        "The backup file ({file_id}) could not be updated. It may have been deleted from \
         Google Drive, your account may have insufficient permission to modify it, or it \
         was not shared with this account. Re-select the sync target to reconnect."
    )
}

/// Metadata for a remote file, with 404 folded into `exists: false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub exists: bool,
    pub modified_time: Option<DateTime<Utc>>,
}

/// Full file info used during target validation.
#[derive(Debug, Clone)]
pub struct DriveFileInfo {
    pub id: String,
    pub name: String,
    pub is_folder: bool,
    pub modified_time: Option<DateTime<Utc>>,
}

/// Upload destination: create a fresh file in a folder, or overwrite a
/// known id in place.
#[derive(Debug, Clone)]
pub enum UploadTarget {
    Create {
        folder_id: String,
        file_name: String,
    },
    Update {
        file_id: String,
    },
}

/// Result of an upload, recording whether the file had to be created.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub id: String,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
struct DriveFileResponse {
    id: String,
    name: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    #[serde(rename = "modifiedTime")]
    modified_time: Option<String>,
}

impl DriveFileResponse {
    fn modified_time_utc(&self) -> Option<DateTime<Utc>> {
        self.modified_time.as_deref().and_then(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
    }
}

#[derive(Debug, Deserialize)]
struct DriveFileListResponse {
    files: Option<Vec<DriveFileResponse>>,
}

/// HTTP client for the Drive v3 API.
#[derive(Debug, Clone)]
pub struct DriveClient {
    http: reqwest::Client,
    api_base: String,
    upload_base: String,
    retry: RetryPolicy,
}

impl Default for DriveClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DriveClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: DRIVE_UPLOAD_BASE.to_string(),
            retry: RetryPolicy::remote_default(),
        }
    }

    /// Point the client at a different API host (used by tests).
    pub fn with_base_urls(api_base: impl Into<String>, upload_base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into(),
            upload_base: upload_base.into(),
            retry: RetryPolicy::remote_default(),
        }
    }

    /// Override the retry policy (used by tests to avoid real delays).
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Find a file by name inside a container. Returns the first match, or
    /// `None` when the folder holds no such file.
    pub async fn find_file(
        &self,
        auth: &AuthorizedClient,
        container_id: &str,
        file_name: &str,
    ) -> SyncResult<Option<String>> {
        let query = build_file_query(container_id, file_name);
        debug!(query = query.as_str(), "searching for backup file");

        with_retry(&self.retry, SyncError::is_transient, || {
            self.find_file_once(auth, &query)
        })
        .await
    }

    async fn find_file_once(
        &self,
        auth: &AuthorizedClient,
        query: &str,
    ) -> SyncResult<Option<String>> {
        let response = self
            .http
            .get(format!("{}/files", self.api_base))
            .bearer_auth(auth.access_token())
            .query(&[
                ("q", query),
                ("fields", "files(id,name)"),
                ("pageSize", "10"),
            ])
            .send()
            .await
            .map_err(|err| errors::network("Failed to search for the backup file", err))?;

        let response = check_status(response, "File search").await?;

        let list: DriveFileListResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the search response", err))?;

        Ok(list
            .files
            .unwrap_or_default()
            .into_iter()
            .next()
            .map(|file| file.id))
    }

    /// Metadata for a file id. A 404 means the file is gone (or was never
    /// shared) and is reported as `exists: false`, not as an error.
    pub async fn get_metadata(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
    ) -> SyncResult<RemoteMetadata> {
        with_retry(&self.retry, SyncError::is_transient, || {
            self.get_metadata_once(auth, file_id)
        })
        .await
    }

    async fn get_metadata_once(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
    ) -> SyncResult<RemoteMetadata> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(auth.access_token())
            .query(&[("fields", FILE_FIELDS)])
            .send()
            .await
            .map_err(|err| errors::network("Failed to fetch remote metadata", err))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteMetadata {
                exists: false,
                modified_time: None,
            });
        }

        let response = check_status(response, "Metadata lookup").await?;

        let file: DriveFileResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the metadata response", err))?;

        Ok(RemoteMetadata {
            exists: true,
            modified_time: file.modified_time_utc(),
        })
    }

    /// Full file info, failing with a target error when the id does not
    /// resolve. Used during target validation.
    pub async fn get_file_info(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
    ) -> SyncResult<DriveFileInfo> {
        with_retry(&self.retry, SyncError::is_transient, || {
            self.get_file_info_once(auth, file_id)
        })
        .await
    }

    async fn get_file_info_once(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
    ) -> SyncResult<DriveFileInfo> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(auth.access_token())
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .send()
            .await
            .map_err(|err| errors::network("Failed to fetch file info", err))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(errors::target(format!(
                "No Drive file or folder with id {file_id} is visible to this account. \
                 Check the link and that the item is shared with the connected account."
            )));
        }

        let response = check_status(response, "File info lookup").await?;

        let file: DriveFileResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the file info response", err))?;

        Ok(DriveFileInfo {
            is_folder: file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE),
            modified_time: file.modified_time_utc(),
            id: file.id,
            name: file.name,
        })
    }

    /// Upload the local file to the target. Uses the multipart upload
    /// endpoint so metadata and content travel in one request.
    pub async fn upload_file(
        &self,
        auth: &AuthorizedClient,
        target: &UploadTarget,
        local_path: &Path,
    ) -> SyncResult<UploadedFile> {
        let content = fs::read(local_path).map_err(|err| {
            errors::local_io_with_source(
                "Failed to read the database file for upload",
                local_path.display().to_string(),
                err,
            )
        })?;

        info!(
            bytes = content.len(),
            path = %local_path.display(),
            "uploading backup to Google Drive"
        );

        with_retry(&self.retry, SyncError::is_transient, || {
            self.upload_once(auth, target, local_path, &content)
        })
        .await
    }

    async fn upload_once(
        &self,
        auth: &AuthorizedClient,
        target: &UploadTarget,
        local_path: &Path,
        content: &[u8],
    ) -> SyncResult<UploadedFile> {
        let (request, created, known_id) = match target {
            UploadTarget::Create {
                folder_id,
                file_name,
            } => {
                let metadata = serde_json::json!({
                    "name": file_name,
                    "mimeType": BACKUP_MIME_TYPE,
                    "parents": [sanitize_container_id(folder_id)],
                });
                let url = format!(
                    "{}/files?uploadType=multipart&fields={}",
                    self.upload_base, FILE_FIELDS
                );
                let form = multipart_form(&metadata, file_name, content)?;
                (self.http.post(url).multipart(form), true, None)
            }
            UploadTarget::Update { file_id } => {
                let file_name = local_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "puffin.db".to_string());
                let metadata = serde_json::json!({ "mimeType": BACKUP_MIME_TYPE });
                let url = format!(
                    "{}/files/{}?uploadType=multipart&fields={}",
                    self.upload_base, file_id, FILE_FIELDS
                );
                let form = multipart_form(&metadata, &file_name, content)?;
                (
                    self.http.patch(url).multipart(form),
                    false,
                    Some(file_id.clone()),
                )
            }
        };

        let response = request
            .bearer_auth(auth.access_token())
            .send()
            .await
            .map_err(|err| errors::network("Failed to upload the backup file", err))?;

        // A vanished id is a target problem, not a retryable remote fault.
        if response.status() == StatusCode::NOT_FOUND {
            if let Some(file_id) = known_id {
                return Err(errors::target(stale_target_message(&file_id)));
            }
        }

        let response = check_status(response, "Upload").await?;

        let file: DriveFileResponse = response
            .json()
            .await
            .map_err(|err| errors::network("Failed to parse the upload response", err))?;

        info!(file_id = file.id.as_str(), created, "upload complete");
        Ok(UploadedFile {
            id: file.id,
            created,
        })
    }

    /// Download a file's content to `dest`, creating parent directories as
    /// needed. The caller validates the bytes before they go anywhere near
    /// the live database.
    pub async fn download_file(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
        dest: &Path,
    ) -> SyncResult<()> {
        let bytes = with_retry(&self.retry, SyncError::is_transient, || {
            self.download_once(auth, file_id)
        })
        .await?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                errors::local_io_with_source(
                    "Failed to create the download directory",
                    parent.display().to_string(),
                    err,
                )
            })?;
        }

        fs::write(dest, &bytes).map_err(|err| {
            errors::local_io_with_source(
                "Failed to write the downloaded backup",
                dest.display().to_string(),
                err,
            )
        })?;

        info!(bytes = bytes.len(), dest = %dest.display(), "download complete");
        Ok(())
    }

    async fn download_once(
        &self,
        auth: &AuthorizedClient,
        file_id: &str,
    ) -> SyncResult<Vec<u8>> {
        let response = self
            .http
            .get(format!("{}/files/{}", self.api_base, file_id))
            .bearer_auth(auth.access_token())
            .query(&[("alt", "media")])
            .send()
            .await
            .map_err(|err| errors::network("Failed to download the backup file", err))?;

        let response = check_status(response, "Download").await?;

        let bytes = response
            .bytes()
            .await
            .map_err(|err| errors::network("Failed to read the download stream", err))?;

        Ok(bytes.to_vec())
    }
}

fn multipart_form(
    metadata: &serde_json::Value,
    file_name: &str,
    content: &[u8],
) -> SyncResult<Form> {
    let metadata_part = Part::text(metadata.to_string())
        .mime_str("application/json")
        .map_err(|err| errors::network("Failed to build upload metadata", err))?;

    let file_part = Part::bytes(content.to_vec())
        .file_name(file_name.to_string())
        .mime_str(BACKUP_MIME_TYPE)
        .map_err(|err| errors::network("Failed to build upload body", err))?;

    Ok(Form::new()
        .part("metadata", metadata_part)
        .part("file", file_part))
}

async fn check_status(response: reqwest::Response, what: &str) -> SyncResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(errors::remote(
        status.as_u16(),
        format!("{what} failed: {body}"),
    ))
}
