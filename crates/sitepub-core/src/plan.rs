use std::collections::BTreeSet;
use std::path::PathBuf;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::info;

use crate::backend::PublishBackend;
use crate::error::Result;
use crate::index::LocalIndex;

/// Upload/skip/delete decision for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncPlan {
    /// Local files that are new or changed.
    pub to_upload: BTreeSet<PathBuf>,
    /// Remote keys already matching their local file.
    pub unchanged: BTreeSet<String>,
    /// Remote keys with no local counterpart.
    pub to_delete: BTreeSet<String>,
}

impl SyncPlan {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty() && self.to_delete.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} to upload, {} unchanged, {} to delete",
            self.to_upload.len(),
            self.unchanged.len(),
            self.to_delete.len()
        )
    }
}

enum Decision {
    New(PathBuf, String),
    Stale(PathBuf, String),
    Fresh(String),
}

/// Diffs a local index against a remote listing snapshot.
pub struct SyncPlanner;

impl SyncPlanner {
    /// Compute the plan.
    ///
    /// `remote` is `None` when remote content is ignored: every local file is
    /// uploaded and nothing is deleted. Digest comparisons for files present
    /// on both sides run up to `concurrency` at a time; the sets themselves
    /// are assembled by the caller only.
    pub async fn plan(
        backend: &dyn PublishBackend,
        local: &LocalIndex,
        remote: Option<&BTreeSet<String>>,
        concurrency: usize,
    ) -> Result<SyncPlan> {
        let empty = BTreeSet::new();
        let remote_files = remote.unwrap_or(&empty);

        let mut local_remote_paths = BTreeSet::new();
        let mut candidates = Vec::with_capacity(local.files().len());
        for file in local.files() {
            let remote_path = backend.remote_path(file)?;
            local_remote_paths.insert(remote_path.clone());
            candidates.push((file.clone(), remote_path));
        }

        let decisions: Vec<Decision> = stream::iter(candidates)
            .map(|(file, remote_path)| async move {
                if !remote_files.contains(&remote_path) {
                    return Ok::<_, crate::error::PublishError>(Decision::New(file, remote_path));
                }
                if backend.compare_file(&file, &remote_path).await? {
                    Ok(Decision::Fresh(remote_path))
                } else {
                    Ok(Decision::Stale(file, remote_path))
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

        let mut plan = SyncPlan::default();
        for decision in decisions {
            match decision {
                Decision::New(file, remote_path) => {
                    info!("File new: {}", remote_path);
                    plan.to_upload.insert(file);
                }
                Decision::Stale(file, remote_path) => {
                    info!("File stale (hash different): {}", remote_path);
                    plan.to_upload.insert(file);
                }
                Decision::Fresh(remote_path) => {
                    info!("File fresh: {}", remote_path);
                    plan.unchanged.insert(remote_path);
                }
            }
        }

        if remote.is_some() {
            for remote_path in remote_files.difference(&local_remote_paths) {
                info!("File orphaned: {}", remote_path);
                plan.to_delete.insert(remote_path.clone());
            }
        }

        Ok(plan)
    }
}
