//! Backup CLI commands
//!
//! Implements the export, import and validate commands.

use clap::Subcommand;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::{timestamped_file_name, Exporter, Importer, RestoreOutcome};
use crate::config::AppPaths;
use crate::error::{BackupError, BackupResult};
use crate::storage::LiveState;

/// Backup subcommands
#[derive(Subcommand)]
pub enum BackupCommands {
    /// Export all app state into a backup document
    Export {
        /// Output file (defaults to a timestamped file in the backup directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Restore all app state from a backup document
    Import {
        /// Backup filename or path (use 'latest' for most recent)
        backup: String,

        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },

    /// Check a backup document without changing anything
    Validate {
        /// Backup filename or path (use 'latest' for most recent)
        backup: String,
    },
}

/// What the caller must do after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Continue,
    /// Stores were replaced; every open handle is stale
    Reopen,
}

/// Handle a backup command
pub fn handle_backup_command(
    paths: &AppPaths,
    state: &LiveState,
    cmd: BackupCommands,
) -> BackupResult<CommandOutcome> {
    match cmd {
        BackupCommands::Export { output } => {
            let target = output.unwrap_or_else(|| {
                paths
                    .backup_dir()
                    .join(timestamped_file_name(chrono::Utc::now()))
            });

            println!("Exporting backup...");
            let summary = Exporter::new(state).export_to_file(&target)?;
            println!("Backup created: {}", display_name(&target));
            println!("Location: {}", target.display());
            println!("{}", summary.summary());
        }

        BackupCommands::Import { backup, force } => {
            let backup_path = resolve_backup_path(paths, &backup)?;

            if !force {
                // Dry run only; nothing is touched
                let validation = Importer::new(state).validate_file(&backup_path)?;
                print_backup_info(&backup_path, &validation);

                println!("WARNING: This will overwrite ALL current data!");
                println!("To proceed, run again with --force flag:");
                println!("  reckon import {} --force", backup);
                return Ok(CommandOutcome::Continue);
            }

            // Keep the current state before overwriting it
            println!("Creating backup of current data before restore...");
            let pre_restore =
                paths.backup_dir().join(timestamped_file_name(chrono::Utc::now()));
            Exporter::new(state).export_to_file(&pre_restore)?;
            println!("Pre-restore backup saved: {}", display_name(&pre_restore));
            println!();

            // The import validates the whole document before it swaps anything in
            println!("Restoring from backup...");
            let outcome = Importer::new(state).import_file(&backup_path)?;
            print_backup_info(&backup_path, &outcome);

            println!("Restore complete!");

            if outcome.requires_reopen() {
                return Ok(CommandOutcome::Reopen);
            }
        }

        BackupCommands::Validate { backup } => {
            let backup_path = resolve_backup_path(paths, &backup)?;
            let metadata = fs::metadata(&backup_path)?;
            let validation = Importer::new(state).validate_file(&backup_path)?;

            println!("Backup Details");
            println!("==============");
            println!("File: {}", backup_path.display());
            println!("Size: {}", format_size(metadata.len()));
            println!("Database version: {}", validation.database_version);
            println!();
            println!("Contents:");
            println!("  Tables:      {}", validation.tables);
            println!("  Rows:        {}", validation.rows);
            println!("  Preferences: {}", validation.preferences);
            println!("  Highscores:  {}", validation.highscores);
            println!();
            println!("Status: Valid");
        }
    }

    Ok(CommandOutcome::Continue)
}

fn print_backup_info(backup_path: &Path, outcome: &RestoreOutcome) {
    println!("Backup Information");
    println!("==================");
    println!("File: {}", backup_path.display());
    println!("Database version: {}", outcome.database_version);
    println!("Status: {}", outcome.summary());
    println!();
}

/// Resolve a backup identifier to a full path
fn resolve_backup_path(paths: &AppPaths, backup: &str) -> BackupResult<PathBuf> {
    // Handle "latest" keyword
    if backup.eq_ignore_ascii_case("latest") {
        return latest_backup(&paths.backup_dir())?
            .ok_or_else(|| BackupError::Config("No backups found".into()));
    }

    // Check if it's a full path
    let path = PathBuf::from(backup);
    if path.exists() {
        return Ok(path);
    }

    // Check if it's a filename in the backup directory
    let backup_path = paths.backup_dir().join(backup);
    if backup_path.exists() {
        return Ok(backup_path);
    }

    let with_ext = paths.backup_dir().join(format!("{}.json", backup));
    if with_ext.exists() {
        return Ok(with_ext);
    }

    Err(BackupError::Config(format!("Backup not found: {}", backup)))
}

/// Newest timestamped document in `dir`
///
/// Timestamped names sort chronologically.
fn latest_backup(dir: &Path) -> BackupResult<Option<PathBuf>> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut latest: Option<PathBuf> = None;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let name = display_name(&path);
        if !(name.starts_with("backup-") && name.ends_with(".json")) {
            continue;
        }
        if latest.as_ref().map_or(true, |l| display_name(l) < name) {
            latest = Some(path);
        }
    }
    Ok(latest)
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Format a file size in human-readable form
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_latest_backup_picks_newest_name() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path();
        fs::write(dir.join("backup-20250101-000000-000.json"), "{}").unwrap();
        fs::write(dir.join("backup-20250301-120000-000.json"), "{}").unwrap();
        fs::write(dir.join("notes.txt"), "x").unwrap();

        let latest = latest_backup(dir).unwrap().unwrap();
        assert_eq!(display_name(&latest), "backup-20250301-120000-000.json");
    }

    #[test]
    fn test_latest_backup_missing_dir() {
        let temp = TempDir::new().unwrap();
        assert!(latest_backup(&temp.path().join("none")).unwrap().is_none());
    }

    #[test]
    fn test_resolve_backup_path() {
        let temp = TempDir::new().unwrap();
        let paths = AppPaths::with_base_dir(temp.path().to_path_buf());
        paths.ensure_directories().unwrap();
        fs::write(paths.backup_dir().join("mine.json"), "{}").unwrap();

        assert_eq!(
            resolve_backup_path(&paths, "mine").unwrap(),
            paths.backup_dir().join("mine.json")
        );
        assert!(resolve_backup_path(&paths, "other").is_err());
        assert!(resolve_backup_path(&paths, "latest").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
