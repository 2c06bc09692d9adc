//! Rackspace Cloud Files (OpenStack Swift) publish backend.

mod identity;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use sitepub_core::{
    join_key, strip_etag_quotes, PublishBackend, PublishError, PublishTarget, RemoteSnapshot,
    Result, SiteLayout,
};
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use url::Url;

pub use identity::{Session, DEFAULT_IDENTITY_URL};

pub const ENGINE: &str = "rackspace_files";

pub const REQUIRED_OPTIONS: &[&str] = &[
    "ENGINE",
    "PUBLIC_URL",
    "USERNAME",
    "API_KEY",
    "REGION",
    "CONTAINER",
];

/// Maximum names per listing request accepted by Swift.
const LIST_PAGE_SIZE: usize = 10_000;

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";

#[derive(Debug, Deserialize)]
struct ObjectEntry {
    name: String,
    #[serde(default)]
    hash: Option<String>,
}

/// Publishes a site into a Cloud Files container.
pub struct SwiftBackend {
    layout: SiteLayout,
    http: Client,
    identity_url: Url,
    username: String,
    api_key: String,
    region: String,
    container: String,
    page_size: usize,
    session: RwLock<Option<Session>>,
    remote: RemoteSnapshot,
}

impl SwiftBackend {
    /// Build from target options. No request is sent.
    pub fn from_target(root: &Path, target: &PublishTarget) -> Result<Self> {
        target.require_all(REQUIRED_OPTIONS)?;
        let public_url = SiteLayout::parse_public_url(target.require("PUBLIC_URL")?)?;
        let identity_url = Url::parse(target.get("IDENTITY_URL").unwrap_or(DEFAULT_IDENTITY_URL))
            .map_err(|e| PublishError::InvalidTarget(format!("invalid IDENTITY_URL: {}", e)))?;

        Ok(Self {
            layout: SiteLayout::new(root, Some(public_url)),
            http: Client::new(),
            identity_url,
            username: target.require("USERNAME")?.to_string(),
            api_key: target.require("API_KEY")?.to_string(),
            region: target.require("REGION")?.to_string(),
            container: target.require("CONTAINER")?.to_string(),
            page_size: LIST_PAGE_SIZE,
            session: RwLock::new(None),
            remote: RemoteSnapshot::new(),
        })
    }

    /// Registry constructor.
    pub fn build(root: &Path, target: &PublishTarget) -> Result<Arc<dyn PublishBackend>> {
        Ok(Arc::new(Self::from_target(root, target)?))
    }

    async fn session(&self) -> Result<Session> {
        self.session.read().await.clone().ok_or_else(|| {
            PublishError::Authentication("not authenticated with the identity service".to_string())
        })
    }

    fn container_url(&self, session: &Session) -> Result<Url> {
        join_key(&session.storage_url, &self.container)
    }

    fn object_url(&self, session: &Session, remote_path: &str) -> Result<Url> {
        join_key(
            &session.storage_url,
            &format!("{}/{}", self.container, remote_path),
        )
    }

    /// ETag of one object, `None` if it does not exist.
    async fn head_etag(&self, remote_path: &str) -> Result<Option<String>> {
        let session = self.session().await?;
        let resp = self
            .http
            .head(self.object_url(&session, remote_path)?)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await
            .map_err(|e| PublishError::Backend(format!("Swift HEAD failed: {}", e)))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(PublishError::Backend(format!(
                "Swift HEAD {} returned {}",
                remote_path,
                resp.status()
            )));
        }
        Ok(resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(|v| strip_etag_quotes(v).to_string()))
    }
}

#[async_trait]
impl PublishBackend for SwiftBackend {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn account_username(&self) -> Option<String> {
        Some(self.username.clone())
    }

    fn account_container(&self) -> Option<String> {
        Some(self.container.clone())
    }

    #[instrument(skip(self), level = "debug", fields(region = %self.region))]
    async fn authenticate(&self) -> Result<()> {
        let session = identity::authenticate(
            &self.http,
            &self.identity_url,
            &self.username,
            &self.api_key,
            &self.region,
        )
        .await?;

        let resp = self
            .http
            .head(self.container_url(&session)?)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await
            .map_err(|e| PublishError::Authentication(format!("Swift request failed: {}", e)))?;
        if !resp.status().is_success() {
            return Err(PublishError::Authentication(format!(
                "cannot access container {}: {}",
                self.container,
                resp.status()
            )));
        }

        *self.session.write().await = Some(session);
        debug!("Swift container accessible");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_remote_files(&self) -> Result<BTreeSet<String>> {
        let session = self.session().await?;
        let url = self.container_url(&session)?;
        let limit = self.page_size.to_string();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(url.clone())
                .header(AUTH_TOKEN_HEADER, &session.token)
                .query(&[("format", "json"), ("limit", limit.as_str())]);
            if let Some(marker) = marker.take() {
                request = request.query(&[("marker", marker)]);
            }

            let resp = request
                .send()
                .await
                .map_err(|e| PublishError::Backend(format!("Swift list request failed: {}", e)))?;
            if resp.status() == StatusCode::NO_CONTENT {
                break;
            }
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(PublishError::Backend(format!(
                    "Swift list error {}: {}",
                    status, body
                )));
            }

            let entries: Vec<ObjectEntry> = resp
                .json()
                .await
                .map_err(|e| PublishError::Backend(format!("invalid Swift listing: {}", e)))?;

            // Clusters may cap pages below `limit`; only an empty page ends the listing
            let Some(last) = entries.last().map(|e| e.name.clone()) else {
                break;
            };
            for entry in entries {
                self.remote.record(entry.name, entry.hash);
            }
            marker = Some(last);
        }

        debug!("Listed {} objects", self.remote.len());
        Ok(self.remote.keys())
    }

    async fn compare_file(&self, local: &Path, remote_path: &str) -> Result<bool> {
        let local_digest = self.layout.hasher().digest(local).await?;
        let remote_digest = match self.remote.digest(remote_path) {
            Some(digest) => Some(digest),
            None => self.head_etag(remote_path).await?,
        };
        Ok(remote_digest.is_some_and(|d| d.eq_ignore_ascii_case(&local_digest)))
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
        let session = self.session().await?;

        // The store rejects the body with 422 when it does not hash to ETag
        let resp = self
            .http
            .put(self.object_url(&session, remote_path)?)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .header("ETag", digest)
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
                message: format!("Swift upload error {}: {}", status, body),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_remote_file(&self, remote_path: &str) -> Result<()> {
        let deletion_error = |message: String| PublishError::Deletion {
            remote_path: remote_path.to_string(),
            message,
        };

        let session = self.session().await?;
        let resp = self
            .http
            .delete(self.object_url(&session, remote_path)?)
            .header(AUTH_TOKEN_HEADER, &session.token)
            .send()
            .await
            .map_err(|e| deletion_error(e.to_string()))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(deletion_error(format!("Swift delete error {}", status)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn target(server: &MockServer) -> PublishTarget {
        let identity = format!("{}/v2.0/", server.uri());
        PublishTarget::from_pairs(
            "default",
            [
                ("ENGINE", ENGINE),
                ("PUBLIC_URL", "https://cdn.example.com/"),
                ("USERNAME", "ops"),
                ("API_KEY", "k3y"),
                ("REGION", "DFW"),
                ("CONTAINER", "site"),
                ("IDENTITY_URL", identity.as_str()),
            ],
        )
    }

    /// Identity and storage both served by `server`; the container exists.
    async fn mount_identity(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v2.0/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access": {
                    "token": {"id": "tok-123"},
                    "serviceCatalog": [{
                        "name": "cloudFiles",
                        "endpoints": [{"region": "DFW", "publicURL": format!("{}/v1/acct", server.uri())}]
                    }]
                }
            })))
            .mount(server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/v1/acct/site"))
            .and(header(AUTH_TOKEN_HEADER, "tok-123"))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    fn site() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hello").unwrap();
        dir
    }

    #[test]
    fn test_missing_container() {
        let target = PublishTarget::from_pairs(
            "default",
            [
                ("ENGINE", ENGINE),
                ("PUBLIC_URL", "https://cdn.example.com/"),
                ("USERNAME", "ops"),
                ("API_KEY", "k3y"),
                ("REGION", "DFW"),
            ],
        );
        assert!(matches!(
            SwiftBackend::from_target(Path::new("/srv/site"), &target).err(),
            Some(PublishError::Configuration { ref key }) if key == "CONTAINER"
        ));
    }

    #[tokio::test]
    async fn test_operations_require_authentication() {
        let server = MockServer::start().await;
        let backend = SwiftBackend::from_target(Path::new("/srv/site"), &target(&server)).unwrap();
        assert!(matches!(
            backend.list_remote_files().await,
            Err(PublishError::Authentication(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate_checks_container() {
        let server = MockServer::start().await;
        mount_identity(&server).await;

        let backend = SwiftBackend::from_target(Path::new("/srv/site"), &target(&server)).unwrap();
        backend.authenticate().await.unwrap();
        assert_eq!(backend.account_username().as_deref(), Some("ops"));
        assert_eq!(backend.account_container().as_deref(), Some("site"));
    }

    #[tokio::test]
    async fn test_list_paginates_with_marker() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("format", "json"))
            .and(query_param_is_missing("marker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "a.html", "hash": "0123"},
                {"name": "index.html", "hash": HELLO_MD5}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("marker", "index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "z.html", "hash": "4567"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("marker", "z.html"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let dir = site();
        let mut backend = SwiftBackend::from_target(dir.path(), &target(&server)).unwrap();
        backend.page_size = 2;
        backend.authenticate().await.unwrap();

        let keys = backend.list_remote_files().await.unwrap();
        assert_eq!(
            keys,
            ["a.html", "index.html", "z.html"]
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
    async fn test_list_follows_pages_shorter_than_limit() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("limit", "10"))
            .and(query_param_is_missing("marker"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "a.html", "hash": "0123"},
                {"name": "index.html", "hash": HELLO_MD5}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("marker", "index.html"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"name": "z.html", "hash": "4567"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .and(query_param("marker", "z.html"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut backend = SwiftBackend::from_target(Path::new("/srv/site"), &target(&server)).unwrap();
        backend.page_size = 10;
        backend.authenticate().await.unwrap();

        let keys = backend.list_remote_files().await.unwrap();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains("z.html"));
    }

    #[tokio::test]
    async fn test_empty_container_lists_nothing() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("GET"))
            .and(path("/v1/acct/site"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let backend = SwiftBackend::from_target(Path::new("/srv/site"), &target(&server)).unwrap();
        backend.authenticate().await.unwrap();
        assert!(backend.list_remote_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_sends_etag() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("PUT"))
            .and(path("/v1/acct/site/blog/index.html"))
            .and(header("etag", HELLO_MD5))
            .and(header("content-type", "text/html"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let dir = site();
        std::fs::create_dir(dir.path().join("blog")).unwrap();
        std::fs::write(dir.path().join("blog/index.html"), b"hello").unwrap();
        let backend = SwiftBackend::from_target(dir.path(), &target(&server)).unwrap();
        backend.authenticate().await.unwrap();
        backend
            .upload_file(&dir.path().join("blog/index.html"), "blog/index.html")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejected_upload() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(422).set_body_string("Unprocessable Entity"))
            .mount(&server)
            .await;

        let dir = site();
        let backend = SwiftBackend::from_target(dir.path(), &target(&server)).unwrap();
        backend.authenticate().await.unwrap();
        let err = backend
            .upload_file(&dir.path().join("index.html"), "index.html")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Upload { ref message, .. } if message.contains("422")));
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_object() {
        let server = MockServer::start().await;
        mount_identity(&server).await;
        Mock::given(method("DELETE"))
            .and(path("/v1/acct/site/gone.html"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let backend = SwiftBackend::from_target(Path::new("/srv/site"), &target(&server)).unwrap();
        backend.authenticate().await.unwrap();
        backend.delete_remote_file("gone.html").await.unwrap();
    }
}
