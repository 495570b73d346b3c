//! Drive Backup - Main entry point
//!
//! Zips the given folders, uploads them to Google Drive and removes older
//! backups from the destination folder.

use anyhow::Result;
use clap::Parser;
use drive_backup::auth::{self, TokenRecord};
use drive_backup::executor::BackupOrchestrator;
use drive_backup::remote::{HttpDrive, RemoteStore};
use drive_backup::{utils, BackupError, Config};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Folders to back up (overrides folders_for_backup from config)
    #[arg(short, long, value_name = "FOLDER", num_args = 1..)]
    folders: Vec<PathBuf>,

    /// Do not remove old backups from Google Drive
    #[arg(long)]
    no_backup_clean: bool,

    /// Fetch the Google Drive OAuth2 token and exit
    #[arg(long)]
    fetch_token: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.yml")]
    config: PathBuf,

    /// Path to the OAuth2 token file (overrides config)
    #[arg(long, value_name = "FILE")]
    token_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration; fetching a token works without a config file
    let config = if args.fetch_token {
        Config::from_file_or_default(&args.config)?
    } else {
        Config::from_file(&args.config)?
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    let _log_guard = utils::logger::init(log_level, config.log.file.as_deref())?;

    let token_file = args.token_file.as_deref().unwrap_or(&config.token_file);

    if args.fetch_token {
        auth::fetch_token(token_file).await?;
        return Ok(());
    }

    tracing::info!("Starting drive-backup v{}", env!("CARGO_PKG_VERSION"));

    auth::check_token(token_file)?;

    let folders = config.folders_to_back_up(&args.folders);
    if folders.is_empty() {
        return Err(BackupError::NoFolders.into());
    }

    if config.destination_folder().is_none() {
        tracing::warn!(
            "No Google Drive backup folder ID specified. \
             The folders will be backed up to the Google Drive root folder"
        );
    }

    let token = TokenRecord::load(token_file)?;
    let drive = HttpDrive::authorize(&token).await?;
    let store = RemoteStore::new(drive, config.retry_policy(), config.batch_options());
    let orchestrator = BackupOrchestrator::new(store, config.backup_settings());

    orchestrator.run(&folders, !args.no_backup_clean).await?;

    Ok(())
}
