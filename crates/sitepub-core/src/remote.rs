use std::collections::BTreeSet;

use dashmap::DashMap;

/// One-shot listing of a remote store: key -> normalised hex digest.
///
/// Filled by a backend's `list_remote_files` and consulted by its
/// `compare_file`; never invalidated while a run is in progress.
#[derive(Debug, Default)]
pub struct RemoteSnapshot {
    objects: DashMap<String, Option<String>>,
}

impl RemoteSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a listed object, with its digest if the listing carried one.
    pub fn record(&self, key: impl Into<String>, digest: Option<String>) {
        self.objects.insert(key.into(), digest);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// `None` if the key was not listed or the listing had no digest.
    pub fn digest(&self, key: &str) -> Option<String> {
        self.objects.get(key).and_then(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.objects.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
