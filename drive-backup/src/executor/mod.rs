//! Backup orchestration: archive each folder, upload it, prune old archives.
//!
//! Every folder runs as its own task on a bounded worker pool:
//! - walk and zip on the blocking pool
//! - upload through the remote store
//! - remove the local archive
//!
//! Pruning runs once all workers have settled and keeps only the objects
//! uploaded by this run.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::archive::{Archive, ArchiveBuilder};
use crate::fs::filter::ExclusionSet;
use crate::fs::walker;
use crate::remote::{DeleteReport, RemoteObjectId, RemoteStorage};
use crate::transfer::progress::format_duration;
use crate::utils::{BackupError, Result};

/// Read-only settings shared by all workers
#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub exclusions: ExclusionSet,
    pub staging_dir: PathBuf,
    /// Destination folder ID; uploads go to the drive root and pruning is skipped when `None`
    pub destination: Option<String>,
    pub workers: usize,
}

/// Lifecycle of one folder within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderState {
    Pending,
    Archiving,
    Uploading,
    CleaningLocal,
    Done,
    Failed,
}

impl fmt::Display for FolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Archiving => "archiving",
            Self::Uploading => "uploading",
            Self::CleaningLocal => "cleaning local",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

struct FolderProgress {
    state: FolderState,
}

impl FolderProgress {
    fn new() -> Self {
        Self {
            state: FolderState::Pending,
        }
    }

    fn advance(&mut self, next: FolderState) {
        debug!("{} -> {}", self.state, next);
        self.state = next;
    }
}

/// Outcome of a run over several folders
#[derive(Debug, Default)]
pub struct RunReport {
    pub uploaded: Vec<(PathBuf, RemoteObjectId)>,
    pub failed: Vec<(PathBuf, String)>,
}

impl RunReport {
    /// Objects uploaded by this run
    pub fn succeeded(&self) -> HashSet<RemoteObjectId> {
        self.uploaded.iter().map(|(_, id)| id.clone()).collect()
    }
}

fn folder_span(folder: &Path) -> Span {
    info_span!("folder", path = %folder.display())
}

/// Drives archive, upload and prune against a [`RemoteStorage`]
pub struct BackupOrchestrator<S> {
    store: Arc<S>,
    settings: Arc<BackupSettings>,
}

impl<S: RemoteStorage + 'static> BackupOrchestrator<S> {
    pub fn new(store: S, settings: BackupSettings) -> Self {
        Self {
            store: Arc::new(store),
            settings: Arc::new(settings),
        }
    }

    /// Archive and upload a single folder, returning the new object ID
    pub async fn run_one(&self, folder: &Path) -> Result<RemoteObjectId> {
        Self::process(
            Arc::clone(&self.store),
            Arc::clone(&self.settings),
            folder.to_path_buf(),
        )
        .instrument(folder_span(folder))
        .await
    }

    /// Back up every folder on the worker pool.
    ///
    /// A failing or panicking folder is recorded in the report and does not
    /// stop the others.
    pub async fn run_all(&self, folders: &[PathBuf]) -> Result<RunReport> {
        if folders.is_empty() {
            return Err(BackupError::NoFolders);
        }

        let workers = self.settings.workers.max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut handles = Vec::with_capacity(folders.len());

        for folder in folders {
            let semaphore = Arc::clone(&semaphore);
            let store = Arc::clone(&self.store);
            let settings = Arc::clone(&self.settings);
            let path = folder.clone();

            let handle = tokio::spawn(
                async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| BackupError::Worker(format!("Worker pool closed: {}", e)))?;
                    Self::process(store, settings, path).await
                }
                .instrument(folder_span(folder)),
            );
            handles.push((folder.clone(), handle));
        }

        let mut pending: FuturesUnordered<_> = handles
            .into_iter()
            .map(|(folder, handle)| async move { (folder, handle.await) })
            .collect();

        let mut report = RunReport::default();
        while let Some((folder, joined)) = pending.next().await {
            match joined {
                Ok(Ok(id)) => report.uploaded.push((folder, id)),
                Ok(Err(e)) => report.failed.push((folder, e.to_string())),
                Err(e) => {
                    error!("Backup worker for {} panicked: {}", folder.display(), e);
                    report.failed.push((folder, format!("worker panicked: {}", e)));
                }
            }
        }

        Ok(report)
    }

    /// Delete every object in the destination folder that is not in `keep`.
    ///
    /// Returns `None` when no destination folder is configured.
    pub async fn prune(&self, keep: &HashSet<RemoteObjectId>) -> Result<Option<DeleteReport>> {
        let Some(destination) = self.settings.destination.as_deref() else {
            error!("No Google Drive backup folder ID specified, old backups are not removed");
            return Ok(None);
        };

        info!("Removing old backups from Google Drive folder {}...", destination);
        let listed = self.store.list_objects(destination).await?;

        let mut stale: Vec<RemoteObjectId> = listed.difference(keep).cloned().collect();
        stale.sort();

        if stale.is_empty() {
            info!("No old backups to remove");
            return Ok(Some(DeleteReport::default()));
        }

        debug!("Removing {} of {} listed objects", stale.len(), listed.len());
        Ok(Some(self.store.delete_batch(&stale).await))
    }

    /// Back up `folders`, then prune old archives when `prune` is set
    pub async fn run(&self, folders: &[PathBuf], prune: bool) -> Result<RunReport> {
        let started = Instant::now();
        info!(
            "Backing up {} folder(s) with {} worker(s)",
            folders.len(),
            self.settings.workers
        );

        let report = self.run_all(folders).await?;

        if prune {
            if !report.failed.is_empty() {
                let failed: Vec<String> = report
                    .failed
                    .iter()
                    .map(|(folder, _)| folder.display().to_string())
                    .collect();
                warn!(
                    "Previous backups of failed folders are removed as well: {}",
                    failed.join(", ")
                );
            }
            if let Some(deleted) = self.prune(&report.succeeded()).await? {
                if !deleted.failures.is_empty() {
                    warn!("{} old backup(s) could not be removed", deleted.failures.len());
                }
            }
        } else {
            info!("Removal of old backups disabled");
        }

        info!(
            "Backup finished in {}: {} uploaded, {} failed",
            format_duration(started.elapsed()),
            report.uploaded.len(),
            report.failed.len()
        );
        for (folder, reason) in &report.failed {
            error!("Backup of {} failed: {}", folder.display(), reason);
        }

        Ok(report)
    }

    async fn process(store: Arc<S>, settings: Arc<BackupSettings>, folder: PathBuf) -> Result<RemoteObjectId> {
        let mut progress = FolderProgress::new();
        let result = Self::archive_and_upload(&store, &settings, &folder, &mut progress).await;

        match &result {
            Ok(id) => {
                progress.advance(FolderState::Done);
                info!("Backed up {} as {}", folder.display(), id);
            }
            Err(e) => {
                progress.advance(FolderState::Failed);
                error!("Failed to back up {}: {}", folder.display(), e);
            }
        }
        result
    }

    async fn archive_and_upload(
        store: &S,
        settings: &Arc<BackupSettings>,
        folder: &Path,
        progress: &mut FolderProgress,
    ) -> Result<RemoteObjectId> {
        progress.advance(FolderState::Archiving);
        let archive = {
            let settings = Arc::clone(settings);
            let folder = folder.to_path_buf();
            // The blocking pool has neither the folder span nor a scoped subscriber
            let span = Span::current();
            let dispatch = tracing::dispatcher::get_default(|dispatch| dispatch.clone());
            tokio::task::spawn_blocking(move || -> Result<Archive> {
                tracing::dispatcher::with_default(&dispatch, || {
                    let _entered = span.enter();
                    let prepared = walker::prepare(&folder, &settings.exclusions)?;
                    ArchiveBuilder::new(settings.staging_dir.clone()).build(&prepared)
                })
            })
            .await
            .map_err(|e| BackupError::Worker(format!("Archiving task failed: {}", e)))??
        };
        if !archive.skipped.is_empty() {
            warn!("{} file(s) vanished while archiving", archive.skipped.len());
        }

        progress.advance(FolderState::Uploading);
        let uploaded = store.upload(&archive.path, settings.destination.as_deref()).await;

        progress.advance(FolderState::CleaningLocal);
        remove_local_archive(&archive.path);

        Ok(uploaded?)
    }
}

/// Best effort: a leftover archive is only worth a warning
fn remove_local_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) => warn!("Failed to remove local archive {}: {}", path.display(), e),
    }
}
