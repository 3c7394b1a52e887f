//! Command-line surface.
//!
//! Stands in for the application UI: each subcommand maps 1:1 to an
//! orchestrator operation and reports the structured outcome on the
//! terminal.

use clap::{Parser, Subcommand};
use console::Term;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{FileStateStore, SyncStateStore};
use crate::oauth::SyncCredentials;
use crate::orchestrator::SyncOrchestrator;
use crate::storage::FileDatabase;

#[derive(Parser)]
#[command(
    name = "puffin-sync",
    about = "Back up and restore the Puffin database via Google Drive",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the Puffin database file (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Authorize access to Google Drive
    Connect,
    /// Select the sync target from a Drive folder/file link or id
    Target {
        /// Google Drive link or item id
        target: String,
    },
    /// Compare the local database with the remote backup
    Status,
    /// Upload the local database, overwriting the remote backup
    Push,
    /// Download the remote backup, overwriting the local database
    Pull,
    /// Remove the sync target and stored tokens
    Disconnect,
}

/// Run a parsed command and return the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let term = Term::stdout();

    let Some(credentials) = SyncCredentials::from_env() else {
        term.write_line("Sync is disabled: no OAuth credentials are configured.")?;
        term.write_line("")?;
        term.write_line("Set these environment variables and try again:")?;
        term.write_line("  PUFFIN_SYNC_CLIENT_ID")?;
        term.write_line("  PUFFIN_SYNC_CLIENT_SECRET")?;
        term.write_line("  PUFFIN_SYNC_REDIRECT_URI")?;
        return Ok(1);
    };

    let db_path = match cli.db_path {
        Some(path) => path,
        None => default_db_path()?,
    };
    let backup_dir = db_path
        .parent()
        .map(|p| p.join("backups"))
        .unwrap_or_else(|| PathBuf::from("backups"));

    let store: Arc<dyn SyncStateStore> = Arc::new(FileStateStore::new()?);
    let database = Arc::new(FileDatabase::new(&db_path, backup_dir));
    let orchestrator = SyncOrchestrator::new(credentials, store.clone(), database);

    match cli.command {
        Command::Connect => connect(&term, &orchestrator).await,
        Command::Target { target } => select_target(&term, &orchestrator, &target).await,
        Command::Status => status(&term, &orchestrator, store.as_ref()).await,
        Command::Push => transfer(&term, &orchestrator, Direction::Push).await,
        Command::Pull => transfer(&term, &orchestrator, Direction::Pull).await,
        Command::Disconnect => disconnect(&term, &orchestrator).await,
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine the user data directory"))?;
    Ok(data_dir.join("puffin").join("puffin.db"))
}

async fn connect(term: &Term, orchestrator: &SyncOrchestrator) -> anyhow::Result<i32> {
    let url = orchestrator.auth_url(None)?;

    term.write_line("Opening the Google consent screen in your browser...")?;
    if open::that(&url).is_err() {
        term.write_line("Could not open a browser. Visit this URL manually:")?;
    }
    term.write_line(&format!("  {url}"))?;
    term.write_line("")?;

    term.write_str("Paste the authorization code: ")?;
    io::stdout().flush()?;
    let mut code = String::new();
    io::stdin().lock().read_line(&mut code)?;

    let result = orchestrator.exchange_code(code.trim()).await;
    if result.success {
        match result.email {
            Some(email) => term.write_line(&format!("✓ Connected as {email}"))?,
            None => term.write_line("✓ Connected to Google Drive")?,
        }
        term.write_line("Next: pick a sync target with `puffin-sync target <link>`")?;
        Ok(0)
    } else {
        term.write_line(&format!(
            "✗ Connection failed: {}",
            result.error.unwrap_or_default()
        ))?;
        Ok(1)
    }
}

async fn select_target(
    term: &Term,
    orchestrator: &SyncOrchestrator,
    target: &str,
) -> anyhow::Result<i32> {
    let result = orchestrator.validate_target(target).await;
    if result.success {
        term.write_line(&format!(
            "✓ Sync target set to '{}'",
            result.display_name.unwrap_or_default()
        ))?;
        Ok(0)
    } else {
        term.write_line(&format!(
            "✗ Invalid target: {}",
            result.error.unwrap_or_default()
        ))?;
        Ok(1)
    }
}

async fn status(
    term: &Term,
    orchestrator: &SyncOrchestrator,
    store: &dyn SyncStateStore,
) -> anyhow::Result<i32> {
    let status = orchestrator.status().await;
    let state = store.load().unwrap_or_default();

    term.write_line("Sync status:")?;
    term.write_line(&format!(
        "  Configured: {}",
        if status.configured { "yes" } else { "no" }
    ))?;
    if let Some(email) = &state.user_email {
        term.write_line(&format!("  Account: {email}"))?;
    }
    if let Some(config) = &state.config {
        term.write_line(&format!("  Target: {}", config.display_name))?;
        if let Some(at) = config.last_synced_at {
            term.write_line(&format!("  Last synced: {}", at.to_rfc3339()))?;
        }
    }

    term.write_line(&format!(
        "  Local database: {}",
        describe(status.local.exists, status.local.modified_time)
    ))?;
    match &status.remote.error {
        Some(error) => term.write_line(&format!("  Remote backup: unavailable ({error})"))?,
        None => term.write_line(&format!(
            "  Remote backup: {}",
            describe(status.remote.exists, status.remote.modified_time)
        ))?,
    }

    // Advisory only: the user decides which side wins.
    if let (Some(local), Some(remote)) = (status.local.modified_time, status.remote.modified_time) {
        if remote > local {
            term.write_line("")?;
            term.write_line(
                "⚠ The remote backup is newer than the local database. A push would overwrite it.",
            )?;
        } else if local > remote {
            term.write_line("")?;
            term.write_line(
                "⚠ The local database is newer than the remote backup. A pull would overwrite it.",
            )?;
        }
    }

    Ok(0)
}

fn describe(exists: bool, modified: Option<chrono::DateTime<chrono::Utc>>) -> String {
    match (exists, modified) {
        (false, _) => "missing".to_string(),
        (true, Some(at)) => format!("present (modified {})", at.to_rfc3339()),
        (true, None) => "present".to_string(),
    }
}

enum Direction {
    Push,
    Pull,
}

async fn transfer(
    term: &Term,
    orchestrator: &SyncOrchestrator,
    direction: Direction,
) -> anyhow::Result<i32> {
    let label = match direction {
        Direction::Push => "Uploading database to Google Drive",
        Direction::Pull => "Restoring database from Google Drive",
    };

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    spinner.set_message(label);
    spinner.enable_steady_tick(Duration::from_millis(120));

    let outcome = match direction {
        Direction::Push => orchestrator.push().await,
        Direction::Pull => orchestrator.pull().await,
    };
    spinner.finish_and_clear();

    if outcome.success {
        let done = match direction {
            Direction::Push => "✓ Backup uploaded",
            Direction::Pull => "✓ Database restored",
        };
        term.write_line(done)?;
        Ok(0)
    } else {
        term.write_line(&format!("✗ {}", outcome.error.unwrap_or_default()))?;
        Ok(1)
    }
}

async fn disconnect(term: &Term, orchestrator: &SyncOrchestrator) -> anyhow::Result<i32> {
    let outcome = orchestrator.disconnect().await;
    if outcome.success {
        term.write_line("✓ Sync disconnected. Your financial data was not touched.")?;
        Ok(0)
    } else {
        term.write_line(&format!("✗ {}", outcome.error.unwrap_or_default()))?;
        Ok(1)
    }
}
