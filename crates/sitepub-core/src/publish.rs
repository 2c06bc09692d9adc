//! Publish executor: authenticate, index, plan, upload, verify, delete.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::backend::PublishBackend;
use crate::error::{PublishError, Result};
use crate::index::{ExcludeFilter, LocalIndex};
use crate::plan::{SyncPlan, SyncPlanner};
use crate::target::PublishTarget;
use crate::verify::{RetryPolicy, VerificationProbe};

/// Run-level knobs, from target options and CLI flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Worker count for uploads and deletes; 1 is fully sequential.
    pub parallelism: usize,
    /// Fetch and hash every upload through its public URL.
    pub verify: bool,
    /// Treat the remote store as empty: upload everything, delete nothing.
    pub ignore_remote_content: bool,
    /// Budget for per-upload verification.
    pub retry: RetryPolicy,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            parallelism: 1,
            verify: true,
            ignore_remote_content: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl PublishOptions {
    /// Read `PARALLEL_PUBLISH`, `VERIFY`, `IGNORE_REMOTE_CONTENT` and the
    /// verification budget from a target.
    pub fn from_target(target: &PublishTarget) -> Result<Self> {
        let defaults = Self::default();
        let parallelism = target
            .get_u64("PARALLEL_PUBLISH")?
            .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
            .unwrap_or(defaults.parallelism);
        if parallelism == 0 {
            return Err(PublishError::InvalidTarget(
                "PARALLEL_PUBLISH must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            parallelism,
            verify: target.get_bool("VERIFY")?.unwrap_or(defaults.verify),
            ignore_remote_content: target
                .get_bool("IGNORE_REMOTE_CONTENT")?
                .unwrap_or(defaults.ignore_remote_content),
            retry: RetryPolicy::from_target(target, defaults.retry)?,
        })
    }
}

/// Phases of one publish run, logged as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishPhase {
    Authenticating,
    Indexing,
    Planning,
    Uploading,
    FinalChecks,
    Deleting,
    Done,
    Failed,
}

impl fmt::Display for PublishPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Authenticating => "authenticating",
            Self::Indexing => "indexing",
            Self::Planning => "planning",
            Self::Uploading => "uploading",
            Self::FinalChecks => "final checks",
            Self::Deleting => "deleting",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Outcome of a run whose uploads all succeeded.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub plan: SyncPlan,
    pub uploaded: usize,
    pub deleted: usize,
    /// Orphans that could not be deleted, as `Deletion` errors.
    pub deletion_failures: Vec<PublishError>,
    pub elapsed: Duration,
}

impl PublishReport {
    /// The first deletion failure, if any orphan was left behind.
    pub fn deletion_error(&self) -> Option<&PublishError> {
        self.deletion_failures.first()
    }
}

/// Drives one backend through a full publish run.
#[derive(Debug, Clone, Default)]
pub struct Publisher {
    options: PublishOptions,
}

impl Publisher {
    pub fn new(options: PublishOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &PublishOptions {
        &self.options
    }

    /// Publish the backend's site root, pruning `filter` directories.
    ///
    /// The first fatal error ends the run. Uploads already dispatched to the
    /// pool keep running in the background; no further uploads start. A
    /// partially updated remote is left as is, and re-running converges.
    /// Failed deletes do not fail the run; they are listed in the report.
    pub async fn run(
        &self,
        backend: Arc<dyn PublishBackend>,
        filter: &ExcludeFilter,
    ) -> Result<PublishReport> {
        let started = Instant::now();
        let mut phase = PublishPhase::Authenticating;

        match self.run_phases(backend, filter, &mut phase).await {
            Ok(mut report) => {
                report.elapsed = started.elapsed();
                if let Some(e) = report.deletion_error() {
                    warn!(
                        "{} remote file(s) could not be deleted, first: {}",
                        report.deletion_failures.len(),
                        e
                    );
                }
                enter(PublishPhase::Done);
                info!(
                    "Published: {} uploaded, {} unchanged, {} deleted in {:.1?}",
                    report.uploaded,
                    report.plan.unchanged.len(),
                    report.deleted,
                    report.elapsed
                );
                Ok(report)
            }
            Err(e) => {
                error!("Publishing failed while {}: {}", phase, e);
                enter(PublishPhase::Failed);
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        backend: Arc<dyn PublishBackend>,
        filter: &ExcludeFilter,
        phase: &mut PublishPhase,
    ) -> Result<PublishReport> {
        let parallelism = self.options.parallelism.max(1);

        *phase = enter(PublishPhase::Authenticating);
        backend.authenticate().await?;

        *phase = enter(PublishPhase::Indexing);
        let root = backend.layout().root().to_path_buf();
        let walk_filter = filter.clone();
        let local = tokio::task::spawn_blocking(move || LocalIndex::scan(&root, &walk_filter))
            .await
            .map_err(|e| PublishError::Io(format!("indexing task failed: {}", e)))??;

        let remote = if self.options.ignore_remote_content {
            info!("Ignoring remote content, every local file will be uploaded");
            None
        } else {
            let remote = backend.list_remote_files().await?;
            info!("Listed {} remote files", remote.len());
            Some(remote)
        };

        *phase = enter(PublishPhase::Planning);
        let plan = SyncPlanner::plan(backend.as_ref(), &local, remote.as_ref(), parallelism).await?;
        info!("Plan: {}", plan.summary());

        *phase = enter(PublishPhase::Uploading);
        if !plan.to_upload.is_empty() {
            create_remote_dirs(backend.as_ref(), &local).await?;
        }
        let probe = VerificationProbe::new(backend.layout().hasher().clone(), self.options.retry);
        let uploaded = self
            .upload_all(&backend, &probe, &plan.to_upload, parallelism)
            .await?;

        *phase = enter(PublishPhase::FinalChecks);
        backend.final_checks(&probe).await?;

        *phase = enter(PublishPhase::Deleting);
        let (deleted, deletion_failures) = if self.options.ignore_remote_content {
            info!("Skipping deletion of remote files, remote content ignored");
            (0, Vec::new())
        } else {
            delete_all(&backend, &plan.to_delete, parallelism).await
        };

        Ok(PublishReport {
            plan,
            uploaded,
            deleted,
            deletion_failures,
            elapsed: Duration::ZERO,
        })
    }

    async fn upload_all(
        &self,
        backend: &Arc<dyn PublishBackend>,
        probe: &VerificationProbe,
        files: &BTreeSet<PathBuf>,
        parallelism: usize,
    ) -> Result<usize> {
        let verify = self.options.verify;
        let mut results = stream::iter(files.iter().cloned())
            .map(|file| {
                let backend = Arc::clone(backend);
                let probe = probe.clone();
                tokio::spawn(async move { upload_one(backend.as_ref(), &probe, file, verify).await })
            })
            .buffer_unordered(parallelism);

        let mut uploaded = 0;
        while let Some(joined) = results.next().await {
            joined.map_err(|e| PublishError::Backend(format!("upload task failed: {}", e)))??;
            uploaded += 1;
        }
        Ok(uploaded)
    }
}

fn enter(phase: PublishPhase) -> PublishPhase {
    info!("Phase: {}", phase);
    phase
}

async fn create_remote_dirs(backend: &dyn PublishBackend, local: &LocalIndex) -> Result<()> {
    for dir in local.dirs() {
        let remote_dir = backend.remote_path(dir)?;
        backend.create_remote_dir(&remote_dir).await?;
    }
    Ok(())
}

async fn upload_one(
    backend: &dyn PublishBackend,
    probe: &VerificationProbe,
    file: PathBuf,
    verify: bool,
) -> Result<()> {
    let is_file = tokio::fs::metadata(&file)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if !is_file {
        return Err(PublishError::LocalFileMissing { path: file });
    }

    let remote_path = backend.remote_path(&file)?;
    info!("Publishing: {} -> {}", file.display(), remote_path);
    backend.upload_file(&file, &remote_path).await?;

    if verify {
        let url = backend.remote_url(&file)?;
        info!("Verifying: {}", url);
        backend.check_file(&file, &url, probe).await?;
    }
    Ok(())
}

/// Issue every delete; return the count deleted and the failures, sorted by path.
async fn delete_all(
    backend: &Arc<dyn PublishBackend>,
    remote_paths: &BTreeSet<String>,
    parallelism: usize,
) -> (usize, Vec<PublishError>) {
    let mut results: Vec<(String, Result<()>)> = stream::iter(remote_paths.iter().cloned())
        .map(|remote_path| {
            let backend = Arc::clone(backend);
            async move {
                info!("Deleting remote: {}", remote_path);
                let result = backend.delete_remote_file(&remote_path).await;
                (remote_path, result)
            }
        })
        .buffer_unordered(parallelism)
        .collect()
        .await;
    results.sort_by(|a, b| a.0.cmp(&b.0));

    let mut deleted = 0;
    let mut failures = Vec::new();
    for (remote_path, result) in results {
        match result {
            Ok(()) => deleted += 1,
            Err(e) => {
                warn!("Failed to delete remote {}: {}", remote_path, e);
                failures.push(match e {
                    PublishError::Deletion { .. } => e,
                    other => PublishError::Deletion {
                        remote_path,
                        message: other.to_string(),
                    },
                });
            }
        }
    }
    (deleted, failures)
}
