#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sitepub_core::{PublishBackend, PublishError, Result, SiteLayout, VerificationProbe};
use tempfile::TempDir;
use url::Url;
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

pub type Objects = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Serves the in-memory bucket over HTTP, like a public website endpoint.
pub struct BucketResponder {
    objects: Objects,
    visible: Arc<AtomicBool>,
}

impl Respond for BucketResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if !self.visible.load(Ordering::SeqCst) {
            return ResponseTemplate::new(404);
        }
        let key = request.url.path().trim_start_matches('/').to_string();
        match self.objects.lock().unwrap().get(&key) {
            Some(body) => ResponseTemplate::new(200).set_body_bytes(body.clone()),
            None => ResponseTemplate::new(404),
        }
    }
}

/// A public bucket: shared object map plus the HTTP server exposing it.
pub struct Bucket {
    pub server: MockServer,
    pub objects: Objects,
    pub visible: Arc<AtomicBool>,
}

impl Bucket {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let objects: Objects = Arc::default();
        let visible = Arc::new(AtomicBool::new(true));
        Mock::given(wiremock::matchers::method("GET"))
            .respond_with(BucketResponder {
                objects: objects.clone(),
                visible: visible.clone(),
            })
            .mount(&server)
            .await;
        Self {
            server,
            objects,
            visible,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("{}/", self.server.uri())).unwrap()
    }

    pub fn put(&self, key: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }
}

/// In-memory backend over a `Bucket`, recording every operation.
pub struct MemoryBackend {
    pub layout: SiteLayout,
    pub objects: Objects,
    pub events: Mutex<Vec<String>>,
    pub auth_calls: AtomicUsize,
    pub fail_upload: Option<String>,
    pub fail_delete: Option<String>,
    pub corrupt_uploads: bool,
    /// Local file removed from disk while any upload runs.
    pub remove_on_upload: Option<PathBuf>,
}

impl MemoryBackend {
    pub fn new(root: &Path, bucket: &Bucket) -> Self {
        Self {
            layout: SiteLayout::new(root, Some(bucket.url())),
            objects: bucket.objects.clone(),
            events: Mutex::new(Vec::new()),
            auth_calls: AtomicUsize::new(0),
            fail_upload: None,
            fail_delete: None,
            corrupt_uploads: false,
            remove_on_upload: None,
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl PublishBackend for MemoryBackend {
    fn engine(&self) -> &'static str {
        "memory"
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn account_username(&self) -> Option<String> {
        Some("tester".to_string())
    }

    fn account_container(&self) -> Option<String> {
        Some("bucket".to_string())
    }

    async fn authenticate(&self) -> Result<()> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        self.record("authenticate".to_string());
        Ok(())
    }

    async fn list_remote_files(&self) -> Result<BTreeSet<String>> {
        self.record("list".to_string());
        Ok(self.objects.lock().unwrap().keys().cloned().collect())
    }

    async fn compare_file(&self, local: &Path, remote_path: &str) -> Result<bool> {
        let local_digest = self.layout.hasher().digest(local).await?;
        let remote = self.objects.lock().unwrap().get(remote_path).cloned();
        Ok(remote.is_some_and(|data| md5_hex(&data) == local_digest))
    }

    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        if self.fail_upload.as_deref() == Some(remote_path) {
            return Err(PublishError::Upload {
                remote_path: remote_path.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        if let Some(path) = &self.remove_on_upload {
            let _ = std::fs::remove_file(path);
        }
        let mut data = tokio::fs::read(local).await?;
        if self.corrupt_uploads {
            data.push(b'!');
        }
        self.objects
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), data);
        self.record(format!("upload:{}", remote_path));
        Ok(())
    }

    async fn delete_remote_file(&self, remote_path: &str) -> Result<()> {
        if self.fail_delete.as_deref() == Some(remote_path) {
            return Err(PublishError::Deletion {
                remote_path: remote_path.to_string(),
                message: "simulated failure".to_string(),
            });
        }
        self.objects.lock().unwrap().remove(remote_path);
        self.record(format!("delete:{}", remote_path));
        Ok(())
    }

    async fn final_checks(&self, _probe: &VerificationProbe) -> Result<()> {
        self.record("final_checks".to_string());
        Ok(())
    }
}

pub fn md5_hex(data: &[u8]) -> String {
    use md5::{Digest, Md5};
    hex::encode(Md5::digest(data))
}

/// Write `(relative path, content)` pairs under a fresh site root.
pub fn site(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (rel, content) in files {
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    dir
}

pub fn local_path(dir: &TempDir, rel: &str) -> PathBuf {
    dir.path().join(rel)
}
