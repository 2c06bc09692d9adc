//! Azure Blob Storage publish backend.
//!
//! Publishes into the `$web` container of a storage account with static
//! website hosting enabled. Requests are authorised with the shared access
//! signature carried by the connection string, or signed with its account
//! key when it has no signature.
//!
//! Uploaded blobs can take a while to show up on the website endpoint, so
//! per-file checks are deferred and run together in `final_checks` with a
//! longer retry budget.

mod connection;
mod listing;
mod shared_key;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Request, RequestBuilder, StatusCode};
use sitepub_core::{
    base64_md5_to_hex, hex_md5_to_base64, join_key, PublishBackend, PublishError, PublishTarget,
    RemoteSnapshot, Result, RetryPolicy, SiteLayout, VerificationProbe,
};
use tracing::{debug, info, instrument};
use url::Url;

pub use connection::{ConnectionString, Credential};
pub use listing::BlobPage;
pub use shared_key::SharedKey;

pub const ENGINE: &str = "azure_storage";

pub const REQUIRED_OPTIONS: &[&str] = &["ENGINE", "PUBLIC_URL", "CONNECTION_STRING"];

/// Container served by the static website endpoint.
pub const CONTAINER: &str = "$web";

const API_VERSION: &str = "2021-08-06";
const FINAL_CHECK_ATTEMPTS: u32 = 30;
const FINAL_CHECK_INTERVAL_SECS: u64 = 3;

/// Publishes a site into an Azure static website container.
pub struct AzureBackend {
    layout: SiteLayout,
    http: Client,
    connection: ConnectionString,
    remote: RemoteSnapshot,
    final_policy: RetryPolicy,
    pending: Mutex<Vec<(PathBuf, Url)>>,
}

impl AzureBackend {
    pub fn new(layout: SiteLayout, connection: ConnectionString, final_policy: RetryPolicy) -> Self {
        Self {
            layout,
            http: Client::new(),
            connection,
            remote: RemoteSnapshot::new(),
            final_policy,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Build from target options. No request is sent.
    pub fn from_target(root: &Path, target: &PublishTarget) -> Result<Self> {
        target.require_all(REQUIRED_OPTIONS)?;
        let public_url = SiteLayout::parse_public_url(target.require("PUBLIC_URL")?)?;
        let connection = ConnectionString::parse(target.require("CONNECTION_STRING")?)?;
        let final_policy = RetryPolicy::from_target(
            target,
            RetryPolicy::fixed(
                FINAL_CHECK_ATTEMPTS,
                Duration::from_secs(FINAL_CHECK_INTERVAL_SECS),
            ),
        )?;

        Ok(Self::new(
            SiteLayout::new(root, Some(public_url)),
            connection,
            final_policy,
        ))
    }

    /// Registry constructor.
    pub fn build(root: &Path, target: &PublishTarget) -> Result<Arc<dyn PublishBackend>> {
        Ok(Arc::new(Self::from_target(root, target)?))
    }

    /// Uploads whose verification is waiting for `final_checks`.
    pub fn pending_checks(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or_default()
    }

    fn container_url(&self) -> Result<Url> {
        Ok(self.with_sas(join_key(&self.connection.blob_endpoint, CONTAINER)?))
    }

    fn blob_url(&self, remote_path: &str) -> Result<Url> {
        Ok(self.with_sas(join_key(
            &self.connection.blob_endpoint,
            &format!("{}/{}", CONTAINER, remote_path),
        )?))
    }

    fn with_sas(&self, mut url: Url) -> Url {
        if let Credential::SharedAccessSignature(sas) = &self.connection.credential {
            url.set_query(Some(sas));
        }
        url
    }

    /// Stamp the API version and, for account keys, sign the request.
    fn prepare(&self, builder: RequestBuilder) -> Result<Request> {
        let mut request = builder
            .header("x-ms-version", API_VERSION)
            .build()
            .map_err(|e| PublishError::Backend(format!("invalid Azure request: {}", e)))?;
        if let Credential::SharedKey(key) = &self.connection.credential {
            key.sign(&mut request)?;
        }
        Ok(request)
    }

    /// Stored MD5 of one blob, `None` if the blob does not exist.
    async fn head_digest(&self, remote_path: &str) -> Result<Option<String>> {
        let request = self.prepare(self.http.head(self.blob_url(remote_path)?))?;
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::Backend(format!("Azure HEAD failed: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(PublishError::Backend(format!(
                "Azure HEAD {} returned {}",
                remote_path,
                resp.status()
            )));
        }
        Ok(resp
            .headers()
            .get("Content-MD5")
            .and_then(|v| v.to_str().ok())
            .and_then(base64_md5_to_hex))
    }
}

#[async_trait]
impl PublishBackend for AzureBackend {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn account_username(&self) -> Option<String> {
        self.connection.account_name.clone()
    }

    fn account_container(&self) -> Option<String> {
        Some(CONTAINER.to_string())
    }

    #[instrument(skip(self), level = "debug")]
    async fn authenticate(&self) -> Result<()> {
        let mut url = self.container_url()?;
        url.query_pairs_mut().append_pair("restype", "container");

        let request = self.prepare(self.http.get(url))?;
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::Authentication(format!("Azure request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Authentication(format!(
                "cannot access container {}: {} {}",
                CONTAINER, status, body
            )));
        }
        debug!("Azure container accessible");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_remote_files(&self) -> Result<BTreeSet<String>> {
        let mut marker: Option<String> = None;

        loop {
            let mut url = self.container_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("restype", "container");
                query.append_pair("comp", "list");
                if let Some(marker) = marker.take() {
                    query.append_pair("marker", &marker);
                }
            }

            let request = self.prepare(self.http.get(url))?;
            let resp = self
                .http
                .execute(request)
                .await
                .map_err(|e| PublishError::Backend(format!("Azure list request failed: {}", e)))?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(PublishError::Backend(format!(
                    "Azure list error {}: {}",
                    status, body
                )));
            }
            let body = resp
                .text()
                .await
                .map_err(|e| PublishError::Backend(format!("Azure list body failed: {}", e)))?;

            let page = BlobPage::parse(&body)?;
            for (name, digest) in page.blobs {
                self.remote.record(name, digest);
            }
            match page.next_marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        debug!("Listed {} blobs", self.remote.len());
        Ok(self.remote.keys())
    }

    async fn compare_file(&self, local: &Path, remote_path: &str) -> Result<bool> {
        let local_digest = self.layout.hasher().digest(local).await?;
        let remote_digest = match self.remote.digest(remote_path) {
            Some(digest) => Some(digest),
            None => self.head_digest(remote_path).await?,
        };
        Ok(remote_digest.as_deref() == Some(local_digest.as_str()))
    }

    #[instrument(skip(self, local), level = "debug")]
    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        let data = tokio::fs::read(local).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PublishError::LocalFileMissing {
                path: local.to_path_buf(),
            },
            _ => PublishError::Io(format!("failed to read {}: {}", local.display(), e)),
        })?;
        let digest = self.layout.hasher().digest(local).await?;

        let mut builder = self
            .http
            .put(self.blob_url(remote_path)?)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-blob-content-type", SiteLayout::mime_type(local));
        if let Some(content_md5) = hex_md5_to_base64(&digest) {
            builder = builder.header("x-ms-blob-content-md5", content_md5);
        }

        let request = self.prepare(builder.body(data))?;
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::Upload {
                remote_path: remote_path.to_string(),
                message: e.to_string(),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Upload {
                remote_path: remote_path.to_string(),
                message: format!("Azure upload error {}: {}", status, body),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_remote_file(&self, remote_path: &str) -> Result<()> {
        let request = self.prepare(self.http.delete(self.blob_url(remote_path)?))?;
        let resp = self
            .http
            .execute(request)
            .await
            .map_err(|e| PublishError::Deletion {
                remote_path: remote_path.to_string(),
                message: e.to_string(),
            })?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(PublishError::Deletion {
            remote_path: remote_path.to_string(),
            message: format!("Azure delete error {}: {}", status, body),
        })
    }

    async fn check_file(&self, local: &Path, url: &Url, _probe: &VerificationProbe) -> Result<()> {
        debug!("Deferring verification of {}", url);
        self.pending
            .lock()
            .map_err(|_| PublishError::Backend("pending checks lock poisoned".to_string()))?
            .push((local.to_path_buf(), url.clone()));
        Ok(())
    }

    async fn final_checks(&self, probe: &VerificationProbe) -> Result<()> {
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .map_err(|_| PublishError::Backend("pending checks lock poisoned".to_string()))?,
        );
        if pending.is_empty() {
            return Ok(());
        }

        info!(
            "Verifying {} uploads (up to {} attempts each)",
            pending.len(),
            self.final_policy.max_attempts
        );
        let probe = probe.with_policy(self.final_policy);
        for (local, url) in &pending {
            probe.verify(local, url).await?;
        }
        Ok(())
    }
}
