use tracing::{info, warn};
use url::Url;

use crate::backend::BackendRegistry;
use crate::error::Result;
use crate::target::PublishTarget;
use crate::verify::{RetryPolicy, VerificationProbe};

/// What a successful target self-test touched.
#[derive(Debug, Clone)]
pub struct SelfTestReport {
    pub engine: String,
    pub remote_path: String,
    pub url: Url,
}

/// Round-trip one random file through a target: upload, verify, final
/// checks, delete.
///
/// The remote test object is deleted even when verification fails; the
/// verification error is returned afterwards.
pub async fn run_self_test(
    registry: &BackendRegistry,
    target: &PublishTarget,
) -> Result<SelfTestReport> {
    let dir = tempfile::tempdir()?;
    let file_name = format!("sitepub-test-{}.txt", uuid::Uuid::new_v4().simple());
    let local = dir.path().join(&file_name);
    tokio::fs::write(&local, uuid::Uuid::new_v4().simple().to_string()).await?;

    info!("Connecting to backend engine");
    let backend = registry.build(dir.path(), target)?;

    info!("Authenticating");
    backend.authenticate().await?;

    let remote_path = backend.remote_path(&local)?;
    info!("Uploading test file: {}", local.display());
    backend.upload_file(&local, &remote_path).await?;

    let url = backend.remote_url(&local)?;
    let policy = RetryPolicy::from_target(target, RetryPolicy::default())?;
    let probe = VerificationProbe::new(backend.layout().hasher().clone(), policy);

    info!("Verifying remote test file: {}", url);
    let checked = backend.check_file(&local, &url, &probe).await;
    let checked = match checked {
        Ok(()) => {
            info!("Final checks");
            backend.final_checks(&probe).await
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &checked {
        warn!("Remote test file failed verification: {}", e);
    } else {
        info!("File uploaded correctly, file hash is correct");
    }

    info!("Deleting remote test file");
    backend.delete_remote_file(&remote_path).await?;
    checked?;

    Ok(SelfTestReport {
        engine: backend.engine().to_string(),
        remote_path,
        url,
    })
}
