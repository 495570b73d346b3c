//! Drive Backup Library
//!
//! Zips local folders, uploads the archives to a Google Drive folder and
//! removes the archives left there by previous runs.

pub mod archive;
pub mod auth;
pub mod config;
pub mod executor;
pub mod fs;
pub mod remote;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
