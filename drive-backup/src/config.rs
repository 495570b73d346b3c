//! Configuration management for drive-backup.
//!
//! Loads configuration from a YAML or TOML file with environment variable
//! overrides (`DRIVE_BACKUP_<KEY>`, nested keys separated by `__`).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::executor::BackupSettings;
use crate::fs::filter::ExclusionSet;
use crate::remote::{BatchOptions, RetryPolicy};

/// Prefix of environment variables that override file values.
const ENV_PREFIX: &str = "DRIVE_BACKUP";

/// Config file extensions understood by [`Config::from_file`].
const SUPPORTED_EXTENSIONS: &[&str] = &["yml", "yaml", "toml"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Google Drive folder that receives the archives (Drive root when unset)
    #[serde(default)]
    pub google_drive_backup_folder_id: Option<String>,

    /// Folder names whose subtrees are left out of every archive
    #[serde(default)]
    pub exclude_folder_names: Vec<String>,

    /// Folders backed up when none are given on the command line
    #[serde(default)]
    pub folders_for_backup: Vec<PathBuf>,

    /// OAuth2 token record written by `--fetch-token`
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,

    /// Directory where archives are built before upload
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Number of folders processed in parallel (default: available parallelism)
    #[serde(default)]
    pub workers: Option<usize>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub prune: PruneConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per remote call, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base; attempt n waits `base * 2^n` plus jitter
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: f64,

    /// Upper bound of the uniform random jitter added to each backoff
    #[serde(default = "default_max_jitter_secs")]
    pub max_jitter_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Maximum number of deletes grouped in one batch request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between two batch requests, to stay under the API rate limit
    #[serde(default = "default_batch_pause_secs")]
    pub batch_pause_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file, rotated daily
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_token_file() -> PathBuf {
    PathBuf::from(".google_drive_token.json")
}

fn default_staging_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> f64 {
    1.0
}

fn default_max_jitter_secs() -> f64 {
    1.0
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_pause_secs() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_jitter_secs: default_max_jitter_secs(),
        }
    }
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_secs: default_batch_pause_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            google_drive_backup_folder_id: None,
            exclude_folder_names: Vec::new(),
            folders_for_backup: Vec::new(),
            token_file: default_token_file(),
            staging_dir: default_staging_dir(),
            workers: None,
            retry: RetryConfig::default(),
            prune: PruneConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML or TOML file, then apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ConfigError::UnsupportedExtension(path.to_path_buf()));
        }

        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let config = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Like [`Config::from_file`], but falls back to defaults when the file is absent.
    pub fn from_file_or_default(path: &Path) -> Result<Self, ConfigError> {
        match Self::from_file(path) {
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            other => other,
        }
    }

    /// Destination folder ID, ignoring blank values.
    pub fn destination_folder(&self) -> Option<&str> {
        self.google_drive_backup_folder_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    /// Worker pool size: configured value or the machine's available parallelism.
    pub fn worker_count(&self) -> usize {
        self.workers.filter(|w| *w > 0).unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    /// Retry policy for remote calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: secs(self.retry.base_delay_secs),
            max_jitter: secs(self.retry.max_jitter_secs),
        }
    }

    /// Chunking and pacing of batch deletions.
    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            chunk_size: self.prune.batch_size.max(1),
            pause: secs(self.prune.batch_pause_secs),
        }
    }

    /// Folders for this run: `requested` when given, else `folders_for_backup`.
    ///
    /// Spellings of the same folder are dropped, keeping the first occurrence.
    /// Folders that cannot be resolved are compared as given.
    pub fn folders_to_back_up(&self, requested: &[PathBuf]) -> Vec<PathBuf> {
        let source: &[PathBuf] = if requested.is_empty() {
            &self.folders_for_backup
        } else {
            requested
        };

        let mut seen = HashSet::new();
        source
            .iter()
            .filter(|folder| {
                let resolved = std::fs::canonicalize(folder).unwrap_or_else(|_| folder.to_path_buf());
                seen.insert(resolved)
            })
            .cloned()
            .collect()
    }

    /// Settings shared read-only by every backup worker.
    pub fn backup_settings(&self) -> BackupSettings {
        BackupSettings {
            exclusions: ExclusionSet::new(self.exclude_folder_names.iter().cloned()),
            staging_dir: self.staging_dir.clone(),
            destination: self.destination_folder().map(str::to_string),
            workers: self.worker_count(),
        }
    }
}

/// Negative or NaN durations from the config file are treated as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid config file type: {}. Only .yml, .yaml or .toml supported", .0.display())]
    UnsupportedExtension(PathBuf),

    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_load_yaml_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");
        fs::write(
            &path,
            "google_drive_backup_folder_id: folder123\n\
             exclude_folder_names:\n  - node_modules\n  - .git\n\
             folders_for_backup:\n  - /home/user/docs\n\
             retry:\n  max_attempts: 3\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.destination_folder(), Some("folder123"));
        assert_eq!(config.exclude_folder_names, vec!["node_modules", ".git"]);
        assert_eq!(config.folders_for_backup, vec![PathBuf::from("/home/user/docs")]);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_secs, 1.0);
        assert_eq!(config.prune.batch_size, 100);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_toml_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(
            &path,
            "exclude_folder_names = [\"target\"]\n\
             workers = 2\n\n\
             [prune]\nbatch_pause_secs = 0.5\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();

        assert_eq!(config.destination_folder(), None);
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.batch_options().pause, Duration::from_millis(500));
        assert_eq!(config.batch_options().chunk_size, 100);
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.ini");
        fs::write(&path, "workers = 2").unwrap();

        let result = Config::from_file(&path);
        assert!(matches!(result, Err(ConfigError::UnsupportedExtension(_))));
    }

    #[test]
    fn test_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");

        assert!(matches!(Config::from_file(&path), Err(ConfigError::NotFound(_))));

        let config = Config::from_file_or_default(&path).unwrap();
        assert!(config.folders_for_backup.is_empty());
        assert_eq!(config.token_file, PathBuf::from(".google_drive_token.json"));
    }

    #[test]
    fn test_blank_destination_is_ignored() {
        let config = Config {
            google_drive_backup_folder_id: Some("  ".to_string()),
            ..Config::default()
        };
        assert_eq!(config.destination_folder(), None);
        assert!(config.backup_settings().destination.is_none());
    }

    #[test]
    fn test_retry_policy_defaults() {
        let policy = Config::default().retry_policy();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(1));
        assert_eq!(policy.max_jitter, Duration::from_secs(1));
    }

    #[test]
    fn test_folders_to_back_up() {
        let config = Config {
            folders_for_backup: vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")],
            ..Config::default()
        };

        assert_eq!(config.folders_to_back_up(&[]), config.folders_for_backup);

        let requested = vec![
            PathBuf::from("/x"),
            PathBuf::from("/y"),
            PathBuf::from("/x"),
        ];
        assert_eq!(
            config.folders_to_back_up(&requested),
            vec![PathBuf::from("/x"), PathBuf::from("/y")]
        );
        assert!(Config::default().folders_to_back_up(&[]).is_empty());
    }

    #[test]
    fn test_folders_deduplicated_by_resolved_path() {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        fs::create_dir(&docs).unwrap();
        fs::create_dir(dir.path().join("music")).unwrap();

        let requested = vec![
            docs.clone(),
            dir.path().join(".").join("docs"),
            dir.path().join("music"),
            docs.join("..").join("docs"),
        ];

        assert_eq!(
            Config::default().folders_to_back_up(&requested),
            vec![docs, dir.path().join("music")]
        );
    }

    #[test]
    fn test_zero_workers_falls_back_to_parallelism() {
        let config = Config {
            workers: Some(0),
            ..Config::default()
        };
        assert!(config.worker_count() >= 1);
    }
}
