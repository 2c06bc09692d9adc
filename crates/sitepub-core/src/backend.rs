use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::error::{PublishError, Result};
use crate::layout::SiteLayout;
use crate::target::PublishTarget;
use crate::verify::VerificationProbe;

/// Capability set of one remote object-storage provider.
///
/// A backend is built for one local site root and one publish target, is
/// shared across all worker tasks of a run, and must therefore be safe to
/// call concurrently once `authenticate` has returned.
#[async_trait]
pub trait PublishBackend: Send + Sync {
    /// Engine identifier this backend was registered under.
    fn engine(&self) -> &'static str;

    /// Local root and public URL mapping of this backend.
    fn layout(&self) -> &SiteLayout;

    /// Account identifier shown to the operator before publishing.
    fn account_username(&self) -> Option<String>;

    /// Bucket/container shown to the operator before publishing.
    fn account_container(&self) -> Option<String>;

    /// Establish the session; called once per run before any file operation.
    async fn authenticate(&self) -> Result<()>;

    /// Every remote key, across all pages.
    async fn list_remote_files(&self) -> Result<BTreeSet<String>>;

    /// True iff the local digest equals the remote object's digest.
    async fn compare_file(&self, local: &Path, remote_path: &str) -> Result<bool>;

    /// Overwrite-upload a local file, with a content type from its extension.
    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<()>;

    /// Remove a remote object; an already-absent object is success.
    async fn delete_remote_file(&self, remote_path: &str) -> Result<()>;

    fn remote_path(&self, local: &Path) -> Result<String> {
        self.layout().remote_path(local)
    }

    fn remote_url(&self, local: &Path) -> Result<Url> {
        self.layout().remote_url(local)
    }

    /// Flat object stores have no directories.
    async fn create_remote_dir(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Verify one upload through its public URL.
    async fn check_file(&self, local: &Path, url: &Url, probe: &VerificationProbe) -> Result<()> {
        probe.verify(local, url).await
    }

    /// Bulk verification after all uploads were issued.
    async fn final_checks(&self, _probe: &VerificationProbe) -> Result<()> {
        Ok(())
    }
}

/// Constructor of a backend for a site root and target.
pub type BackendConstructor = fn(&Path, &PublishTarget) -> Result<Arc<dyn PublishBackend>>;

/// Maps engine identifiers to backend constructors.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    constructors: BTreeMap<&'static str, BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: &'static str, constructor: BackendConstructor) -> &mut Self {
        self.constructors.insert(engine, constructor);
        self
    }

    pub fn engines(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    /// Build the backend named by the target's `ENGINE` option.
    pub fn build(&self, root: &Path, target: &PublishTarget) -> Result<Arc<dyn PublishBackend>> {
        let engine = target.engine()?;
        let constructor = self
            .constructors
            .get(engine)
            .ok_or_else(|| PublishError::UnknownEngine(engine.to_string()))?;
        constructor(root, target)
    }
}
