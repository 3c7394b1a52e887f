//! Local database file collaborators.
//!
//! The sync engine treats the SQLite database as an opaque blob: it reads
//! the file for a push, replaces it atomically for a pull, and never parses
//! its contents beyond the magic header check. The storage layer of the
//! application owns the file; this module defines the narrow interface the
//! orchestrator talks to.

use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::{errors, SyncResult};

/// First 16 bytes of every well-formed SQLite database file.
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Handle to the live database file, provided by the storage layer.
pub trait DatabaseHandle: Send + Sync {
    fn db_path(&self) -> &Path;

    /// Copy the current database to a timestamped backup file and return
    /// the backup path.
    fn create_backup(&self) -> SyncResult<PathBuf>;

    /// Drop and reopen any in-process connections after the on-disk file
    /// was replaced. The default is a no-op for callers that open a fresh
    /// connection per request.
    fn reset_connections(&self) -> SyncResult<()> {
        Ok(())
    }
}

/// Plain-file implementation used by the CLI and by tests.
pub struct FileDatabase {
    db_path: PathBuf,
    backup_dir: PathBuf,
}

impl FileDatabase {
    pub fn new(db_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            backup_dir: backup_dir.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }
}

impl DatabaseHandle for FileDatabase {
    fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn create_backup(&self) -> SyncResult<PathBuf> {
        if !self.db_path.exists() {
            return Err(errors::local_io(
                "Cannot back up a database that does not exist",
                self.db_path.display().to_string(),
            ));
        }

        fs::create_dir_all(&self.backup_dir).map_err(|err| {
            errors::local_io_with_source(
                "Failed to create the backup directory",
                self.backup_dir.display().to_string(),
                err,
            )
        })?;

        let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
        let backup_path = self.backup_dir.join(format!("puffin-backup-{stamp}.db"));

        fs::copy(&self.db_path, &backup_path).map_err(|err| {
            errors::local_io_with_source(
                "Failed to copy the database to a backup file",
                backup_path.display().to_string(),
                err,
            )
        })?;

        Ok(backup_path)
    }
}

/// Check that a downloaded file looks like a SQLite database: non-empty
/// and carrying the magic header. Anything else must never replace the
/// live file.
pub fn validate_database_file(path: &Path) -> SyncResult<()> {
    let mut file = fs::File::open(path).map_err(|err| {
        errors::local_io_with_source(
            "Failed to open the downloaded file for validation",
            path.display().to_string(),
            err,
        )
    })?;

    let mut header = [0u8; 16];
    let read = file.read(&mut header).map_err(|err| {
        errors::local_io_with_source(
            "Failed to read the downloaded file header",
            path.display().to_string(),
            err,
        )
    })?;

    if read < SQLITE_MAGIC.len() || &header != SQLITE_MAGIC {
        return Err(errors::validation(
            "Downloaded file is not a valid SQLite database; the local copy was left untouched",
            None,
        ));
    }

    Ok(())
}

/// Atomically swap the staged download over the live database. The staged
/// file must live on the same filesystem as the live one; the engine always
/// stages downloads next to the target.
pub fn replace_database(live: &Path, staged: &Path) -> SyncResult<()> {
    fs::rename(staged, live).map_err(|err| {
        errors::local_io_with_source(
            "Failed to swap the downloaded database into place",
            live.display().to_string(),
            err,
        )
    })
}

/// SHA-256 of a file's contents, hex encoded. Recorded after successful
/// transfers so divergence checks have something cheap to compare.
pub fn file_sha256(path: &Path) -> SyncResult<String> {
    let bytes = fs::read(path).map_err(|err| {
        errors::local_io_with_source(
            "Failed to read file for hashing",
            path.display().to_string(),
            err,
        )
    })?;

    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sqlite_bytes() -> Vec<u8> {
        let mut bytes = SQLITE_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 100]);
        bytes
    }

    #[test]
    fn backup_is_a_timestamped_copy() {
        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("puffin.db");
        fs::write(&db_path, sqlite_bytes()).unwrap();

        let database = FileDatabase::new(&db_path, temp.path().join("backups"));
        let backup = database.create_backup().unwrap();

        let name = backup.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("puffin-backup-"));
        assert!(name.ends_with(".db"));
        assert_eq!(fs::read(&backup).unwrap(), sqlite_bytes());
    }

    #[test]
    fn backup_of_missing_database_fails() {
        let temp = TempDir::new().unwrap();
        let database = FileDatabase::new(temp.path().join("missing.db"), temp.path());
        assert!(database.create_backup().is_err());
    }

    #[test]
    fn validation_accepts_sqlite_header() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("good.db");
        fs::write(&path, sqlite_bytes()).unwrap();
        assert!(validate_database_file(&path).is_ok());
    }

    #[test]
    fn validation_rejects_empty_and_garbage_files() {
        let temp = TempDir::new().unwrap();

        let empty = temp.path().join("empty.db");
        fs::write(&empty, b"").unwrap();
        assert!(validate_database_file(&empty).is_err());

        let garbage = temp.path().join("garbage.db");
        fs::write(&garbage, b"<html>rate limited</html>").unwrap();
        assert!(validate_database_file(&garbage).is_err());
    }

    #[test]
    fn replace_swaps_staged_file_over_live() {
        let temp = TempDir::new().unwrap();
        let live = temp.path().join("puffin.db");
        let staged = temp.path().join("puffin.db.download");
        fs::write(&live, b"old").unwrap();
        fs::write(&staged, b"new").unwrap();

        replace_database(&live, &staged).unwrap();

        assert_eq!(fs::read(&live).unwrap(), b"new");
        assert!(!staged.exists());
    }

    #[test]
    fn sha256_is_stable_hex() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
