//! Persisted sync configuration and token storage.
//!
//! The sync target, last-sync bookkeeping and OAuth tokens live in a single
//! JSON document kept outside the financial database, so resetting one never
//! touches the other. Access goes through the [`SyncStateStore`] trait; the
//! file-backed implementation is the production store and an in-memory store
//! backs the tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{errors, SyncResult};

const STATE_FILE_NAME: &str = "sync.json";

/// OAuth tokens as returned by the provider. Owned and mutated exclusively
/// by the broker; a refresh never discards a valid `refresh_token`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry as epoch milliseconds.
    pub expiry_date: i64,
    pub token_type: String,
    pub scope: Option<String>,
}

/// Where backups go on Drive. The two modes are mutually exclusive by
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncTarget {
    /// A named file inside a user-chosen folder, located or created on demand.
    Folder { folder_id: String, file_name: String },
    /// A fixed file id, letting two accounts share one backup without
    /// folder access.
    File { file_id: String },
}

impl SyncTarget {
    pub fn is_file_based(&self) -> bool {
        matches!(self, SyncTarget::File { .. })
    }
}

/// Sync configuration, created on first successful target selection and
/// updated after every successful push or pull.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    pub target: SyncTarget,
    pub display_name: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

impl SyncConfig {
    pub fn new(target: SyncTarget, display_name: impl Into<String>) -> Self {
        Self {
            target,
            display_name: display_name.into(),
            last_synced_at: None,
            content_hash: None,
        }
    }

    /// Merge an update into the existing configuration. Fields left `None`
    /// in the update keep their current value, so advancing only
    /// `last_synced_at` never clobbers the target.
    pub fn apply(&mut self, update: SyncConfigUpdate) {
        if let Some(target) = update.target {
            self.target = target;
        }
        if let Some(display_name) = update.display_name {
            self.display_name = display_name;
        }
        if let Some(last_synced_at) = update.last_synced_at {
            self.last_synced_at = Some(last_synced_at);
        }
        if let Some(content_hash) = update.content_hash {
            self.content_hash = Some(content_hash);
        }
    }
}

/// Partial configuration update with merge semantics.
#[derive(Debug, Clone, Default)]
pub struct SyncConfigUpdate {
    pub target: Option<SyncTarget>,
    pub display_name: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub content_hash: Option<String>,
}

/// The persisted document: configuration, tokens and the authenticated
/// account, all or none of which may be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub config: Option<SyncConfig>,
    pub tokens: Option<TokenSet>,
    pub user_email: Option<String>,
}

/// Single source of truth for sync target and status.
///
/// Implementations are handed around by reference so tests can substitute
/// [`MemoryStateStore`] for the on-disk store.
pub trait SyncStateStore: Send + Sync {
    fn load(&self) -> SyncResult<SyncState>;
    fn save(&self, state: &SyncState) -> SyncResult<()>;

    /// Remove target and tokens. Never touches financial data.
    fn clear(&self) -> SyncResult<()> {
        self.save(&SyncState::default())
    }

    fn config(&self) -> SyncResult<Option<SyncConfig>> {
        Ok(self.load()?.config)
    }

    fn tokens(&self) -> SyncResult<Option<TokenSet>> {
        Ok(self.load()?.tokens)
    }

    fn save_tokens(&self, tokens: TokenSet) -> SyncResult<()> {
        let mut state = self.load()?;
        state.tokens = Some(tokens);
        self.save(&state)
    }

    fn save_user_email(&self, email: String) -> SyncResult<()> {
        let mut state = self.load()?;
        state.user_email = Some(email);
        self.save(&state)
    }

    /// Replace the configuration wholesale (first target selection).
    fn save_config(&self, config: SyncConfig) -> SyncResult<()> {
        let mut state = self.load()?;
        state.config = Some(config);
        self.save(&state)
    }

    /// Merge a partial update into the existing configuration.
    fn update_config(&self, update: SyncConfigUpdate) -> SyncResult<()> {
        let mut state = self.load()?;
        match state.config.as_mut() {
            Some(config) => config.apply(update),
            None => {
                let target = update.target.ok_or_else(|| {
                    errors::config("Cannot update sync configuration before a target is selected")
                })?;
                let mut config =
                    SyncConfig::new(target, update.display_name.unwrap_or_default());
                config.last_synced_at = update.last_synced_at;
                config.content_hash = update.content_hash;
                state.config = Some(config);
            }
        }
        self.save(&state)
    }
}

/// File-backed store under the user's config directory.
pub struct FileStateStore {
    state_path: PathBuf,
}

impl FileStateStore {
    /// Store at the default location, `<config dir>/puffin/sync.json`.
    pub fn new() -> SyncResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| errors::config("Could not determine the user config directory"))?
            .join("puffin");

        fs::create_dir_all(&config_dir).map_err(|err| {
            errors::config_with_source("Failed to create the puffin config directory", err)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&config_dir) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                let _ = fs::set_permissions(&config_dir, perms);
            }
        }

        Ok(Self {
            state_path: config_dir.join(STATE_FILE_NAME),
        })
    }

    /// Store at a custom path (used by tests).
    pub fn with_path(path: impl AsRef<Path>) -> Self {
        Self {
            state_path: path.as_ref().to_path_buf(),
        }
    }
}

impl SyncStateStore for FileStateStore {
    fn load(&self) -> SyncResult<SyncState> {
        if !self.state_path.exists() {
            return Ok(SyncState::default());
        }

        let content = fs::read_to_string(&self.state_path).map_err(|err| {
            errors::config_with_source("Failed to read the sync state file", err)
        })?;

        serde_json::from_str(&content)
            .map_err(|err| errors::config_with_source("Invalid sync state file", err))
    }

    fn save(&self, state: &SyncState) -> SyncResult<()> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                errors::config_with_source("Failed to create the sync state directory", err)
            })?;
        }

        let content = serde_json::to_string_pretty(state)
            .map_err(|err| errors::config_with_source("Failed to serialise sync state", err))?;

        // Write-to-temp then rename so a crash mid-write never leaves a
        // truncated state file behind.
        let tmp_path = self.state_path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|err| {
            errors::config_with_source("Failed to write the sync state file", err)
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(&tmp_path) {
                let mut perms = metadata.permissions();
                perms.set_mode(0o600);
                let _ = fs::set_permissions(&tmp_path, perms);
            }
        }

        fs::rename(&tmp_path, &self.state_path).map_err(|err| {
            errors::config_with_source("Failed to replace the sync state file", err)
        })
    }
}

/// In-memory store for tests and embedding.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<SyncState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }
}

impl SyncStateStore for MemoryStateStore {
    fn load(&self) -> SyncResult<SyncState> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| errors::config("Sync state mutex poisoned"))?
            .clone())
    }

    fn save(&self, state: &SyncState) -> SyncResult<()> {
        *self
            .inner
            .lock()
            .map_err(|_| errors::config("Sync state mutex poisoned"))? = state.clone();
        Ok(())
    }
}
