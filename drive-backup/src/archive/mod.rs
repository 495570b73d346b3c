//! Zip archive construction for a prepared folder.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Local, Timelike};
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::fs::walker::{PreparedEntry, PreparedFolder};
use crate::transfer::progress::format_bytes;
use crate::utils::Result;

/// Timestamp embedded in archive names (seconds precision).
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H-%M-%S";

/// Entries at or above this size need zip64 extensions.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

/// Gives up on finding a free archive name after this many suffixes.
const MAX_NAME_SUFFIX: u32 = 1000;

/// A finished archive in the staging directory.
#[derive(Debug, Clone)]
pub struct Archive {
    /// Absolute path of the zip file
    pub path: PathBuf,

    /// Number of files written into the archive
    pub entries: usize,

    /// Source files that vanished between the walk and the write
    pub skipped: Vec<PathBuf>,
}

impl Archive {
    /// File name of the archive, as uploaded.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Builds one deflate-compressed zip per folder in a staging directory.
#[derive(Debug, Clone)]
pub struct ArchiveBuilder {
    staging_dir: PathBuf,
}

/// Archive file name for a folder at a given time: `<folder>_<YYYYMMDD_HH-MM-SS>.zip`.
pub fn archive_name(root_name: &str, timestamp: &DateTime<Local>) -> String {
    format!("{}_{}.zip", root_name, timestamp.format(TIMESTAMP_FORMAT))
}

impl ArchiveBuilder {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Write `folder` into a new archive and return it once closed and synced.
    ///
    /// Files deleted after the walk started are skipped with a warning instead
    /// of failing the archive. The archive never contains itself, even when the
    /// staging directory sits inside `folder`. On error the partial archive is
    /// removed.
    pub fn build(&self, folder: &PreparedFolder) -> Result<Archive> {
        self.build_from(folder.root_name(), folder.entries())
    }

    /// Write an explicit entry list into a new archive named after `root_name`.
    pub fn build_from<I>(&self, root_name: &str, entries: I) -> Result<Archive>
    where
        I: IntoIterator<Item = PreparedEntry>,
    {
        std::fs::create_dir_all(&self.staging_dir)?;
        let staging_dir = std::fs::canonicalize(&self.staging_dir)?;

        let (path, file) = create_archive_file(&staging_dir, root_name, &Local::now())?;
        info!("Creating {}...", path.display());

        match write_entries(entries, &path, file) {
            Ok((entries, skipped)) => {
                let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                info!(
                    "{} created: {} files, {}",
                    path.display(),
                    entries,
                    format_bytes(size)
                );
                Ok(Archive {
                    path,
                    entries,
                    skipped,
                })
            }
            Err(e) => {
                if let Err(remove_err) = std::fs::remove_file(&path) {
                    warn!("Failed to remove partial archive {}: {}", path.display(), remove_err);
                }
                Err(e)
            }
        }
    }
}

/// Create the archive file exclusively, adding `_<n>` when the name is taken.
fn create_archive_file(
    staging_dir: &Path,
    root_name: &str,
    timestamp: &DateTime<Local>,
) -> Result<(PathBuf, File)> {
    let base = archive_name(root_name, timestamp);
    let stem = base.trim_end_matches(".zip");

    for suffix in 0..MAX_NAME_SUFFIX {
        let name = if suffix == 0 {
            base.clone()
        } else {
            format!("{}_{}.zip", stem, suffix)
        };
        let path = staging_dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("No free archive name for {} in {}", base, staging_dir.display()),
    )
    .into())
}

fn write_entries<I>(entries: I, archive_path: &Path, file: File) -> Result<(usize, Vec<PathBuf>)>
where
    I: IntoIterator<Item = PreparedEntry>,
{
    let mut zip = ZipWriter::new(BufWriter::new(file));

    let mut written = 0usize;
    let mut skipped = Vec::new();

    for entry in entries {
        if entry.source == archive_path {
            continue;
        }

        // Open before start_file so a vanished file leaves no empty entry behind.
        let mut source = match File::open(&entry.source) {
            Ok(source) => source,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("File missed: {}", entry.source.display());
                skipped.push(entry.source);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let metadata = source.metadata()?;
        let size = metadata.len();

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(size >= ZIP64_THRESHOLD)
            .last_modified_time(modified_time(&metadata));
        #[cfg(unix)]
        let options = {
            use std::os::unix::fs::PermissionsExt;
            options.unix_permissions(metadata.permissions().mode())
        };
        zip.start_file(entry.archive_path.as_str(), options)?;
        io::copy(&mut source, &mut zip)?;
        written += 1;

        debug!("Archived {} ({})", entry.archive_path, format_bytes(size));
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok((written, skipped))
}

/// Local modification time in zip (DOS) form; 1980-01-01 when out of range
fn modified_time(metadata: &std::fs::Metadata) -> zip::DateTime {
    metadata
        .modified()
        .ok()
        .and_then(|modified| {
            let local: DateTime<Local> = modified.into();
            zip::DateTime::from_date_and_time(
                u16::try_from(local.year()).ok()?,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}
