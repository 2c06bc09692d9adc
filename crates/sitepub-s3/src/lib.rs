//! Amazon S3 publish backend.
//!
//! Also works against S3-compatible stores (MinIO, R2) through `ENDPOINT_URL`
//! and `FORCE_PATH_STYLE`.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{BehaviorVersion, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use sitepub_core::{
    hex_md5_to_base64, strip_etag_quotes, PublishBackend, PublishError, PublishTarget, Result,
    RemoteSnapshot, SiteLayout,
};
use tracing::{debug, instrument, warn};

pub const ENGINE: &str = "amazon_s3";

pub const REQUIRED_OPTIONS: &[&str] = &[
    "ENGINE",
    "PUBLIC_URL",
    "ACCESS_KEY_ID",
    "SECRET_ACCESS_KEY",
    "BUCKET",
];

pub const DEFAULT_REGION: &str = "us-east-1";

/// Maximum retries for transient errors (429 / 5xx).
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff.
const BASE_DELAY_MS: u64 = 200;

/// Publishes a site into an S3 bucket.
///
/// Keys are the site-relative paths; the bucket is expected to be served
/// publicly (static website hosting or a CDN) at `PUBLIC_URL`.
pub struct S3Backend {
    layout: SiteLayout,
    s3_client: S3Client,
    bucket_name: String,
    access_key_id: String,
    remote: RemoteSnapshot,
}

impl S3Backend {
    pub fn new(
        layout: SiteLayout,
        s3_client: S3Client,
        bucket_name: String,
        access_key_id: String,
    ) -> Self {
        Self {
            layout,
            s3_client,
            bucket_name,
            access_key_id,
            remote: RemoteSnapshot::new(),
        }
    }

    /// Build a client from target options. No request is sent.
    pub fn from_target(root: &Path, target: &PublishTarget) -> Result<Self> {
        target.require_all(REQUIRED_OPTIONS)?;
        let public_url = SiteLayout::parse_public_url(target.require("PUBLIC_URL")?)?;
        let access_key_id = target.require("ACCESS_KEY_ID")?;

        let credentials = Credentials::new(
            access_key_id,
            target.require("SECRET_ACCESS_KEY")?,
            None,
            None,
            "sitepub",
        );

        let mut s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(
                target.get("REGION").unwrap_or(DEFAULT_REGION).to_string(),
            ));

        if let Some(endpoint) = target.get("ENDPOINT_URL") {
            s3_config = s3_config.endpoint_url(endpoint);
        }
        if let Some(force_path_style) = target.get_bool("FORCE_PATH_STYLE")? {
            s3_config = s3_config.force_path_style(force_path_style);
        }

        Ok(Self::new(
            SiteLayout::new(root, Some(public_url)),
            S3Client::from_conf(s3_config.build()),
            target.require("BUCKET")?.to_string(),
            access_key_id.to_string(),
        ))
    }

    /// Registry constructor.
    pub fn build(root: &Path, target: &PublishTarget) -> Result<Arc<dyn PublishBackend>> {
        Ok(Arc::new(Self::from_target(root, target)?))
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    // =========================================================================
    // Retry helper
    // =========================================================================

    /// Sleep with exponential backoff + jitter.
    async fn backoff_sleep(attempt: u32) {
        let base = Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt));
        let jitter = Duration::from_millis(rand_jitter());
        tokio::time::sleep(base + jitter).await;
    }

    /// Check if an S3 error is retryable (429 or 5xx).
    fn is_retryable_s3_error(err: &aws_sdk_s3::error::SdkError<impl std::fmt::Debug>) -> bool {
        use aws_sdk_s3::error::SdkError;
        match err {
            SdkError::ServiceError(e) => is_retryable_status(e.raw().status().as_u16()),
            SdkError::ResponseError(e) => is_retryable_status(e.raw().status().as_u16()),
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
            _ => false,
        }
    }

    /// ETag of one object via HeadObject, `None` if it does not exist.
    async fn head_etag(&self, key: &str) -> Result<Option<String>> {
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .head_object()
                .bucket(&self.bucket_name)
                .key(key)
                .send()
                .await;

            match result {
                Ok(output) => return Ok(output.e_tag().map(|e| strip_etag_quotes(e).to_string())),
                Err(e) => {
                    if Self::is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, key, "S3 head_object retryable error, retrying");
                        Self::backoff_sleep(attempt).await;
                        continue;
                    }
                    let service_error = e.into_service_error();
                    if service_error.is_not_found() {
                        return Ok(None);
                    }
                    return Err(PublishError::Backend(format!(
                        "S3 head_object error: {}",
                        DisplayErrorContext(&service_error)
                    )));
                }
            }
        }
        unreachable!()
    }
}

#[async_trait]
impl PublishBackend for S3Backend {
    fn engine(&self) -> &'static str {
        ENGINE
    }

    fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    fn account_username(&self) -> Option<String> {
        Some(self.access_key_id.clone())
    }

    fn account_container(&self) -> Option<String> {
        Some(self.bucket_name.clone())
    }

    #[instrument(skip(self), level = "debug", fields(bucket = %self.bucket_name))]
    async fn authenticate(&self) -> Result<()> {
        self.s3_client
            .head_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| {
                PublishError::Authentication(format!(
                    "cannot access bucket {}: {}",
                    self.bucket_name,
                    DisplayErrorContext(&e)
                ))
            })?;
        debug!("S3 bucket accessible");
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_remote_files(&self) -> Result<BTreeSet<String>> {
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = {
                let mut attempt = 0;
                loop {
                    match request.clone().send().await {
                        Ok(o) => break o,
                        Err(e) => {
                            if Self::is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                                warn!(attempt, "S3 list_objects retryable error, retrying");
                                Self::backoff_sleep(attempt).await;
                                attempt += 1;
                                continue;
                            }
                            return Err(PublishError::Backend(format!(
                                "S3 list_objects error: {}",
                                DisplayErrorContext(&e)
                            )));
                        }
                    }
                }
            };

            for obj in output.contents() {
                if let Some(key) = obj.key() {
                    let digest = obj.e_tag().map(|e| strip_etag_quotes(e).to_string());
                    self.remote.record(key, digest);
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
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
        // Multipart ETags ("<hash>-<parts>") never equal a plain MD5.
        Ok(remote_digest.is_some_and(|d| d.eq_ignore_ascii_case(&local_digest)))
    }

    #[instrument(skip(self, local), level = "debug")]
    async fn upload_file(&self, local: &Path, remote_path: &str) -> Result<()> {
        let content_type = SiteLayout::mime_type(local);
        let digest = self.layout.hasher().digest(local).await?;
        let content_md5 = hex_md5_to_base64(&digest);

        for attempt in 0..=MAX_RETRIES {
            let body = ByteStream::from_path(local).await.map_err(|e| {
                if local.exists() {
                    PublishError::Io(format!("failed to read {}: {}", local.display(), e))
                } else {
                    PublishError::LocalFileMissing {
                        path: local.to_path_buf(),
                    }
                }
            })?;

            let result = self
                .s3_client
                .put_object()
                .bucket(&self.bucket_name)
                .key(remote_path)
                .content_type(&content_type)
                .set_content_md5(content_md5.clone())
                .body(body)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if Self::is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, remote_path, "S3 put_object retryable error, retrying");
                        Self::backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(PublishError::Upload {
                        remote_path: remote_path.to_string(),
                        message: format!("S3 put_object error: {}", DisplayErrorContext(&e)),
                    });
                }
            }
        }
        unreachable!()
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_remote_file(&self, remote_path: &str) -> Result<()> {
        // S3 answers 204 for keys that do not exist
        for attempt in 0..=MAX_RETRIES {
            let result = self
                .s3_client
                .delete_object()
                .bucket(&self.bucket_name)
                .key(remote_path)
                .send()
                .await;

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    if Self::is_retryable_s3_error(&e) && attempt < MAX_RETRIES {
                        warn!(attempt, remote_path, "S3 delete_object retryable error, retrying");
                        Self::backoff_sleep(attempt).await;
                        continue;
                    }
                    return Err(PublishError::Deletion {
                        remote_path: remote_path.to_string(),
                        message: format!("S3 delete_object error: {}", DisplayErrorContext(&e)),
                    });
                }
            }
        }
        unreachable!()
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..=504).contains(&status)
}

fn rand_jitter() -> u64 {
    use std::time::SystemTime;
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 50)
        .unwrap_or(0)
}
