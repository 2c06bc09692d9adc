//! Google Cloud Storage publish backend on the GCS JSON API.
//!
//! Objects are uploaded with the `publicRead` predefined ACL so the bucket
//! can be served directly from `https://storage.googleapis.com/{bucket}/`.

mod token;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sitepub_core::{
    base64_md5_to_hex, PublishBackend, PublishError, PublishTarget, RemoteSnapshot, Result,
    SiteLayout,
};
use tracing::{debug, instrument};
use url::Url;

pub use token::{Credentials, ServiceAccountKey, TokenManager, DEFAULT_TOKEN_URL, STORAGE_SCOPE};

pub const ENGINE: &str = "google_storage";

pub const REQUIRED_OPTIONS: &[&str] = &["ENGINE", "BUCKET"];

pub const DEFAULT_API_BASE_URL: &str = "https://storage.googleapis.com";

/// Object resource, restricted to the fields we request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMetadata {
    name: String,
    #[serde(default)]
    md5_hash: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectMetadata>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Publishes a site into a GCS bucket.
pub struct GcsBackend {
    layout: SiteLayout,
    http: Client,
    api_base: Url,
    bucket: String,
    tokens: TokenManager,
    remote: RemoteSnapshot,
}

impl GcsBackend {
    pub fn new(
        layout: SiteLayout,
        http: Client,
        api_base: Url,
        bucket: String,
        tokens: TokenManager,
    ) -> Self {
        Self {
            layout,
            http,
            api_base,
            bucket,
            tokens,
            remote: RemoteSnapshot::new(),
        }
    }

    /// Build from target options. No request is sent.
    pub fn from_target(root: &Path, target: &PublishTarget) -> Result<Self> {
        target.require_all(REQUIRED_OPTIONS)?;
        let bucket = target.require("BUCKET")?.to_string();
        let credentials = Credentials::from_target(target)?;

        let public_url = match target.get("PUBLIC_URL") {
            Some(url) => SiteLayout::parse_public_url(url)?,
            None => SiteLayout::parse_public_url(&format!(
                "{}/{}/",
                DEFAULT_API_BASE_URL, bucket
            ))?,
        };
        let api_base = Url::parse(target.get("API_BASE_URL").unwrap_or(DEFAULT_API_BASE_URL))
            .map_err(|e| PublishError::InvalidTarget(format!("invalid API_BASE_URL: {}", e)))?;
        let token_url = target
            .get("TOKEN_URL")
            .unwrap_or(DEFAULT_TOKEN_URL)
            .to_string();

        let http = Client::new();
        Ok(Self::new(
            SiteLayout::new(root, Some(public_url)),
            http.clone(),
            api_base,
            bucket,
            TokenManager::new(http, token_url, credentials),
        ))
    }

    /// Registry constructor.
    pub fn build(root: &Path, target: &PublishTarget) -> Result<Arc<dyn PublishBackend>> {
        Ok(Arc::new(Self::from_target(root, target)?))
    }

    /// `{api}/{prefix...}/b/{bucket}/o[/{object}]`, each part one encoded segment.
    fn api_url(&self, prefix: &[&str], object: Option<&str>) -> Result<Url> {
        let mut url = self.api_base.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                PublishError::InvalidTarget(format!("invalid API_BASE_URL: {}", self.api_base))
            })?;
            segments.pop_if_empty();
            segments.extend(prefix);
            segments.extend(["b", self.bucket.as_str(), "o"]);
            if let Some(object) = object {
                segments.push(object);
            }
        }
        Ok(url)
    }

    fn bucket_url(&self) -> Result<Url> {
        let mut url = self.api_url(&["storage", "v1"], None)?;
        url.path_segments_mut()
            .map_err(|_| PublishError::InvalidTarget("invalid API_BASE_URL".to_string()))?
            .pop();
        Ok(url)
    }

    /// Object metadata, `None` if the object does not exist.
    #[instrument(skip(self), level = "debug")]
    async fn get_metadata(&self, remote_path: &str) -> Result<Option<ObjectMetadata>> {
        let token = self.tokens.get_valid_token().await?;
        let url = self.api_url(&["storage", "v1"], Some(remote_path))?;

        let resp = self
            .http
            .get(url)
            .query(&[("fields", "name,md5Hash")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PublishError::Backend(format!("GCS metadata request failed: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = error_for_status(resp, "GCS metadata").await?;
        let metadata: ObjectMetadata = resp
            .json()
            .await
            .map_err(|e| PublishError::Backend(format!("invalid GCS metadata: {}", e)))?;
        Ok(Some(metadata))
    }
}

#[async_trait]
impl PublishBackend for GcsBackend {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn account_username(&self) -> Option<String> {
        self.tokens.credentials().client_id().map(str::to_string)
    }

    fn account_container(&self) -> Option<String> {
        Some(self.bucket.clone())
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket))]
    async fn authenticate(&self) -> Result<()> {
        let token = self.tokens.get_valid_token().await?;
        let resp = self
            .http
            .get(self.bucket_url()?)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| PublishError::Authentication(format!("GCS request failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Authentication(format!(
                "cannot access bucket {}: {} {}",
                self.bucket, status, body
            )));
        }
        debug!("GCS bucket accessible");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_remote_files(&self) -> Result<BTreeSet<String>> {
        let url = self.api_url(&["storage", "v1"], None)?;
        let mut page_token: Option<String> = None;

        loop {
            let token = self.tokens.get_valid_token().await?;
            let mut request = self
                .http
                .get(url.clone())
                .query(&[("fields", "items(name,md5Hash),nextPageToken")])
                .bearer_auth(token);
            if let Some(page) = page_token.take() {
                request = request.query(&[("pageToken", page)]);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| PublishError::Backend(format!("GCS list request failed: {}", e)))?;
            let resp = error_for_status(resp, "GCS list").await?;
            let page: ObjectList = resp
                .json()
                .await
                .map_err(|e| PublishError::Backend(format!("invalid GCS listing: {}", e)))?;

            for item in page.items {
                let digest = item.md5_hash.as_deref().and_then(base64_md5_to_hex);
                self.remote.record(item.name, digest);
            }

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        debug!("Listed {} objects", self.remote.len());
        Ok(self.remote.keys())
    }

    async fn compare_file(&self, local: &Path, remote_path: &str) -> Result<bool> {
        let local_digest = self.layout.hasher().digest(local).await?;
        let remote_digest = match self.remote.digest(remote_path) {
            Some(digest) => Some(digest),
            None => self
                .get_metadata(remote_path)
                .await?
                .and_then(|m| m.md5_hash)
                .as_deref()
                .and_then(base64_md5_to_hex),
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
        let data_len = data.len();

        let token = self.tokens.get_valid_token().await?;
        let url = self.api_url(&["upload", "storage", "v1"], None)?;
        let resp = self
            .http
            .post(url)
            .query(&[
                ("uploadType", "media"),
                ("name", remote_path),
                ("predefinedAcl", "publicRead"),
            ])
            .bearer_auth(token)
            .header("Content-Type", SiteLayout::mime_type(local))
            .body(data)
            .send()
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
                message: format!("GCS upload error {}: {}", status, body),
            });
        }

        debug!("Uploaded {} ({} bytes)", remote_path, data_len);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_remote_file(&self, remote_path: &str) -> Result<()> {
        let deletion_error = |message: String| PublishError::Deletion {
            remote_path: remote_path.to_string(),
            message,
        };

        let token = self.tokens.get_valid_token().await?;
        let url = self.api_url(&["storage", "v1"], Some(remote_path))?;
        let resp = self
            .http
            .delete(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| deletion_error(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(deletion_error(format!("GCS delete error {}: {}", status, body)))
    }
}

async fn error_for_status(resp: Response, context: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(PublishError::Backend(format!("{} error {}: {}", context, status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // base64 MD5 of b"hello"
    const HELLO_MD5_B64: &str = "XUFAKrxLKna5cZ2REBfFkg==";

    fn target(api_base: &str) -> PublishTarget {
        PublishTarget::from_pairs(
            "default",
            [
                ("ENGINE", ENGINE),
                ("BUCKET", "site-bucket"),
                ("ACCESS_TOKEN", "ya29.test"),
                ("API_BASE_URL", api_base),
            ],
        )
    }

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hello").unwrap();
        dir
    }

    #[test]
    fn test_default_public_url() {
        let backend =
            GcsBackend::from_target(Path::new("/srv/site"), &target(DEFAULT_API_BASE_URL)).unwrap();
        assert_eq!(
            backend
                .remote_url(Path::new("/srv/site/blog/index.html"))
                .unwrap()
                .as_str(),
            "https://storage.googleapis.com/site-bucket/blog/index.html"
        );
        assert_eq!(backend.account_container().as_deref(), Some("site-bucket"));
        assert_eq!(backend.account_username(), None);
    }

    #[test]
    fn test_missing_bucket() {
        let target = PublishTarget::from_pairs("default", [("ENGINE", ENGINE), ("ACCESS_TOKEN", "t")]);
        assert!(matches!(
            GcsBackend::from_target(Path::new("/srv/site"), &target).err(),
            Some(PublishError::Configuration { ref key }) if key == "BUCKET"
        ));
    }

    #[test]
    fn test_object_urls_encode_keys() {
        let backend =
            GcsBackend::from_target(Path::new("/srv/site"), &target("http://127.0.0.1:9")).unwrap();
        assert_eq!(
            backend
                .api_url(&["storage", "v1"], Some("css/site.css"))
                .unwrap()
                .as_str(),
            "http://127.0.0.1:9/storage/v1/b/site-bucket/o/css%2Fsite.css"
        );
        assert_eq!(
            backend.bucket_url().unwrap().as_str(),
            "http://127.0.0.1:9/storage/v1/b/site-bucket"
        );
    }

    #[tokio::test]
    async fn test_authenticate() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket"))
            .and(header("authorization", "Bearer ya29.test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "site-bucket"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = GcsBackend::from_target(Path::new("/srv/site"), &target(&server.uri())).unwrap();
        backend.authenticate().await.unwrap();
    }

    #[tokio::test]
    async fn test_authenticate_forbidden() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let backend = GcsBackend::from_target(Path::new("/srv/site"), &target(&server.uri())).unwrap();
        assert!(matches!(
            backend.authenticate().await,
            Err(PublishError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_list_paginates_and_decodes_digests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o"))
            .and(query_param_is_missing("pageToken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "index.html", "md5Hash": HELLO_MD5_B64}],
                "nextPageToken": "p2"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "css/site.css", "md5Hash": "AAAAAAAAAAAAAAAAAAAAAA=="}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = site();
        let backend = GcsBackend::from_target(dir.path(), &target(&server.uri())).unwrap();
        let keys = backend.list_remote_files().await.unwrap();
        assert_eq!(
            keys,
            ["css/site.css", "index.html"]
                .into_iter()
                .map(String::from)
                .collect()
        );
        assert!(backend
            .compare_file(&dir.path().join("index.html"), "index.html")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_uses_metadata_when_not_listed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o/index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "index.html",
                "md5Hash": HELLO_MD5_B64
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/site-bucket/o/other.html"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = site();
        std::fs::write(dir.path().join("other.html"), b"hello").unwrap();
        let backend = GcsBackend::from_target(dir.path(), &target(&server.uri())).unwrap();
        assert!(backend
            .compare_file(&dir.path().join("index.html"), "index.html")
            .await
            .unwrap());
        assert!(!backend
            .compare_file(&dir.path().join("other.html"), "other.html")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_upload_is_public_media_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/site-bucket/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "index.html"))
            .and(query_param("predefinedAcl", "publicRead"))
            .and(header("content-type", "text/html"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "index.html"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let dir = site();
        let backend = GcsBackend::from_target(dir.path(), &target(&server.uri())).unwrap();
        backend
            .upload_file(&dir.path().join("index.html"), "index.html")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend error"))
            .mount(&server)
            .await;

        let dir = site();
        let backend = GcsBackend::from_target(dir.path(), &target(&server.uri())).unwrap();
        let err = backend
            .upload_file(&dir.path().join("index.html"), "index.html")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Upload { ref remote_path, .. } if remote_path == "index.html"));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/site-bucket/o/gone.html"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/storage/v1/b/site-bucket/o/locked.html"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let backend = GcsBackend::from_target(Path::new("/srv/site"), &target(&server.uri())).unwrap();
        backend.delete_remote_file("gone.html").await.unwrap();
        assert!(matches!(
            backend.delete_remote_file("locked.html").await,
            Err(PublishError::Deletion { .. })
        ));
    }
}
