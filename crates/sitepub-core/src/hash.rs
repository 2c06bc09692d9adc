//! MD5 content hashing used for change detection.
//!
//! MD5 is the digest class that S3, Swift, GCS and Azure expose for plain
//! (non-multipart) objects, so local and remote digests compare directly.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use md5::{Digest, Md5};
use tracing::debug;

use crate::error::{PublishError, Result};

/// Block size for streamed file reads (1 MiB).
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Computes and caches local file digests for the duration of one run.
///
/// Clones share the same cache.
#[derive(Debug, Clone, Default)]
pub struct ContentHasher {
    cache: Arc<DashMap<PathBuf, String>>,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Digest of a local file, hashed at most once per path.
    pub async fn digest(&self, path: &Path) -> Result<String> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }

        let owned = path.to_path_buf();
        let digest = tokio::task::spawn_blocking(move || hash_file(&owned))
            .await
            .map_err(|e| PublishError::Io(format!("hashing task failed: {}", e)))??;

        debug!("Hashed {}: {}", path.display(), digest);
        self.cache.insert(path.to_path_buf(), digest.clone());
        Ok(digest)
    }

    /// Number of cached digests.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

/// Hash a file in `HASH_BLOCK_SIZE` blocks.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PublishError::LocalFileMissing {
            path: path.to_path_buf(),
        },
        _ => PublishError::Io(format!("failed to open {}: {}", path.display(), e)),
    })?;

    let mut hasher = Md5::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| PublishError::Io(format!("failed to read {}: {}", path.display(), e)))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// `"d41d8cd9..."` -> `d41d8cd9...`
pub fn strip_etag_quotes(etag: &str) -> &str {
    etag.trim().trim_matches('"')
}

/// Base64 MD5 (GCS `md5Hash`, Azure `Content-MD5`) to lowercase hex.
pub fn base64_md5_to_hex(encoded: &str) -> Option<String> {
    BASE64.decode(encoded.trim()).ok().map(hex::encode)
}

/// Hex MD5 to the base64 form expected in `Content-MD5` headers.
pub fn hex_md5_to_base64(digest: &str) -> Option<String> {
    hex::decode(digest).ok().map(|raw| BASE64.encode(raw))
}
