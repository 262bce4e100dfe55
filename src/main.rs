use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};

use reckon::cli::{handle_backup_command, BackupCommands, CommandOutcome};
use reckon::config::{AppPaths, Settings};
use reckon::logging::{init_logging, LogConfig};
use reckon::storage::LiveState;

#[derive(Parser)]
#[command(
    name = "reckon",
    version,
    about = "Backup export and restore for the math trainer's app state",
    long_about = "reckon exports the relational store and both preference stores \
                  into a single JSON document and restores them from one. A restore \
                  replaces the relational store atomically."
)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Backup(BackupCommands),

    /// Show current configuration and paths
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_verbosity(cli.verbose)).map_err(|e| anyhow!(e))?;

    // Initialize paths and settings
    let paths = AppPaths::new()?;
    let settings = Settings::load_or_create(&paths)?;

    match cli.command {
        Some(Commands::Backup(cmd)) => {
            let state = LiveState::new(&paths, &settings)?;
            if handle_backup_command(&paths, &state, cmd)? == CommandOutcome::Reopen {
                println!();
                println!("All stores were replaced. Restart the app to load the restored data.");
                drop(state);
                std::process::exit(0);
            }
        }
        Some(Commands::Config) => {
            if !paths.settings_file().exists() {
                settings.save(&paths)?;
            }
            println!("reckon Configuration");
            println!("====================");
            println!("Base directory:     {}", paths.base_dir().display());
            println!("Database directory: {}", paths.database_dir().display());
            println!("Prefs directory:    {}", paths.prefs_dir().display());
            println!("Backup directory:   {}", paths.backup_dir().display());
            println!("Settings file:      {}", paths.settings_file().display());
            println!();
            println!("Settings:");
            println!("  Database:          {}", settings.database_name);
            println!("  Preferences store: {}", settings.preferences_name);
            println!("  Highscore store:   {}", settings.highscore_name);
        }
        None => {
            println!("reckon - backup export and restore");
            println!();
            println!("Run 'reckon --help' for usage information.");
        }
    }

    Ok(())
}
