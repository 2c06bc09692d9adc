//! Post-upload verification: fetch the public URL and compare digests.

use std::path::Path;
use std::time::Duration;

use futures::StreamExt;
use md5::{Digest, Md5};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::error::{PublishError, Result};
use crate::hash::ContentHasher;
use crate::target::PublishTarget;

/// Query parameter carrying the random cache-busting token.
pub const CACHE_BUST_PARAM: &str = "sitepub-nocache";

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_INTERVAL_SECS: u64 = 1;

/// Bounded retry with a fixed sleep between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_ATTEMPTS, Duration::from_secs(DEFAULT_INTERVAL_SECS))
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            interval,
        }
    }

    /// A single attempt, no sleeping.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Override `fallback` with `VERIFY_ATTEMPTS` / `VERIFY_INTERVAL_SECS`.
    pub fn from_target(target: &PublishTarget, fallback: RetryPolicy) -> Result<Self> {
        let attempts = target
            .get_u64("VERIFY_ATTEMPTS")?
            .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
            .unwrap_or(fallback.max_attempts);
        let interval = target
            .get_u64("VERIFY_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(fallback.interval);
        Ok(Self::fixed(attempts, interval))
    }
}

/// Fetches objects by public URL and hashes them like local files.
#[derive(Debug, Clone)]
pub struct VerificationProbe {
    http: Client,
    hasher: ContentHasher,
    policy: RetryPolicy,
}

impl VerificationProbe {
    pub fn new(hasher: ContentHasher, policy: RetryPolicy) -> Self {
        Self {
            http: Client::new(),
            hasher,
            policy,
        }
    }

    /// Same client and digest cache, different retry budget.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            http: self.http.clone(),
            hasher: self.hasher.clone(),
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Digest of the object served at `url`, or `None` if it is not
    /// retrievable yet (404, other error status, transport failure).
    pub async fn fetch_digest(&self, url: &Url) -> Option<String> {
        let mut busted = url.clone();
        busted
            .query_pairs_mut()
            .append_pair(CACHE_BUST_PARAM, &uuid::Uuid::new_v4().simple().to_string());

        let resp = match self.http.get(busted).send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Verification request to {} failed: {}", url, e);
                return None;
            }
        };

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("{} not found (yet)", url);
            return None;
        }
        if !resp.status().is_success() {
            warn!("Verification of {} returned status {}", url, resp.status());
            return None;
        }

        let mut hasher = Md5::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => hasher.update(&bytes),
                Err(e) => {
                    warn!("Verification body of {} failed mid-stream: {}", url, e);
                    return None;
                }
            }
        }
        Some(hex::encode(hasher.finalize()))
    }

    /// Retry until the object at `url` hashes like `local`, or fail.
    pub async fn verify(&self, local: &Path, url: &Url) -> Result<()> {
        let local_digest = self.hasher.digest(local).await?;
        let attempts = self.policy.max_attempts;

        for attempt in 1..=attempts {
            match self.fetch_digest(url).await {
                Some(remote) if remote == local_digest => {
                    debug!(attempt, "Verified {}", url);
                    return Ok(());
                }
                Some(remote) => warn!(
                    attempt,
                    "Hash mismatch for {}: local {} remote {}", url, local_digest, remote
                ),
                None => debug!(attempt, "{} not available yet", url),
            }

            if attempt < attempts {
                tokio::time::sleep(self.policy.interval).await;
            }
        }

        Err(PublishError::Verification {
            path: local.to_path_buf(),
            url: url.to_string(),
            attempts,
        })
    }
}
