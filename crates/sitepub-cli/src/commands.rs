//! Subcommand handlers.

use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::Context;
use sitepub_core::{
    run_self_test, BackendRegistry, ExcludeFilter, PublishBackend, PublishError, PublishOptions,
    PublishTarget, Publisher, TargetSet,
};
use tracing::{info, warn};

use crate::assets;
use crate::config::{CollectArgs, PublishArgs, TargetArgs, TestTargetArgs};

/// Every engine this binary can publish to.
pub fn registry() -> BackendRegistry {
    let mut registry = BackendRegistry::new();
    registry
        .register(sitepub_s3::ENGINE, sitepub_s3::S3Backend::build)
        .register(sitepub_gcs::ENGINE, sitepub_gcs::GcsBackend::build)
        .register(sitepub_azure::ENGINE, sitepub_azure::AzureBackend::build)
        .register(sitepub_swift::ENGINE, sitepub_swift::SwiftBackend::build);
    registry
}

fn load_target(args: &TargetArgs) -> anyhow::Result<PublishTarget> {
    let targets = TargetSet::from_path(&args.config)
        .with_context(|| format!("failed to load targets from {}", args.config.display()))?;
    Ok(targets.get(&args.target)?.clone())
}

pub async fn publish(args: PublishArgs) -> anyhow::Result<()> {
    let target = load_target(&args.target)?;

    let mut filter = ExcludeFilter::default();
    for name in &args.exclude {
        filter = filter.with(name.as_str());
    }

    if args.collect_assets {
        let static_dir = args
            .static_dir
            .as_deref()
            .context("--collect-assets needs --static-dir")?;
        assets::collect(static_dir, &args.site_dir.join(&args.static_prefix), &filter)?;
    }

    let site_dir = args
        .site_dir
        .canonicalize()
        .with_context(|| format!("site directory does not exist: {}", args.site_dir.display()))?;

    let mut options = PublishOptions::from_target(&target)?;
    if args.skip_verify {
        options.verify = false;
    }
    if args.ignore_remote_content {
        options.ignore_remote_content = true;
    }
    if let Some(parallel) = args.parallel {
        options.parallelism = usize::from(parallel);
    }

    let backend = registry().build(&site_dir, &target)?;
    print_summary(&target, backend.as_ref(), Some(&site_dir));
    if !args.target.force && !confirm_stdin()? {
        return Err(PublishError::Cancelled("publishing cancelled".to_string()).into());
    }

    let report = Publisher::new(options)
        .run(backend, &filter)
        .await
        .context("publishing failed")?;
    println!(
        "Publishing complete: {} uploaded, {} unchanged, {} deleted in {:.1?}",
        report.uploaded,
        report.plan.unchanged.len(),
        report.deleted,
        report.elapsed
    );
    for failure in &report.deletion_failures {
        warn!("{}", failure);
    }
    if !report.deletion_failures.is_empty() {
        println!(
            "Warning: {} remote file(s) could not be deleted",
            report.deletion_failures.len()
        );
    }
    Ok(())
}

pub async fn test_target(args: TestTargetArgs) -> anyhow::Result<()> {
    let target = load_target(&args.target)?;
    let registry = registry();

    // Show the account before touching it
    let probe_root = std::env::temp_dir();
    let backend = registry.build(&probe_root, &target)?;
    print_summary(&target, backend.as_ref(), None);
    if !args.target.force && !confirm_stdin()? {
        return Err(PublishError::Cancelled("target test cancelled".to_string()).into());
    }

    let report = run_self_test(&registry, &target)
        .await
        .context("target test failed")?;
    info!("Verified {}", report.url);
    println!(
        "Target \"{}\" ({}) is working: uploaded, verified and deleted {}",
        target.name, report.engine, report.remote_path
    );
    Ok(())
}

pub fn collect(args: CollectArgs) -> anyhow::Result<()> {
    let mut filter = ExcludeFilter::default();
    for name in &args.exclude {
        filter = filter.with(name.as_str());
    }
    let copied = assets::collect(&args.static_dir, &args.output_dir, &filter)?;
    println!("Collected {} static files", copied);
    Ok(())
}

fn print_summary(target: &PublishTarget, backend: &dyn PublishBackend, site_dir: Option<&Path>) {
    println!();
    println!("You have requested to publish to the following target:");
    println!();
    println!("    Name:      {}", target.name);
    println!("    Engine:    {}", backend.engine());
    if let Some(username) = backend.account_username() {
        println!("    Account:   {}", username);
    }
    if let Some(container) = backend.account_container() {
        println!("    Container: {}", container);
    }
    if let Some(url) = backend.layout().public_url() {
        println!("    URL:       {}", url);
    }
    if let Some(site_dir) = site_dir {
        println!("    Source:    {}", site_dir.display());
    }
    println!();
}

fn confirm_stdin() -> anyhow::Result<bool> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    confirm(&mut stdin.lock(), &mut stdout.lock())
}

/// Ask until the operator answers `yes` or `no`; end of input means no.
pub fn confirm(input: &mut impl BufRead, output: &mut impl Write) -> anyhow::Result<bool> {
    loop {
        write!(output, "Type 'yes' to continue, or 'no' to cancel: ")?;
        output.flush()?;

        let mut answer = String::new();
        if input.read_line(&mut answer)? == 0 {
            return Ok(false);
        }
        match answer.trim().to_ascii_lowercase().as_str() {
            "yes" => return Ok(true),
            "no" => return Ok(false),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_registry_knows_all_engines() {
        let engines: Vec<_> = registry().engines().collect();
        assert_eq!(
            engines,
            vec!["amazon_s3", "azure_storage", "google_storage", "rackspace_files"]
        );
    }

    #[test]
    fn test_confirm_answers() {
        let mut out = Vec::new();
        assert!(confirm(&mut Cursor::new("yes\n"), &mut out).unwrap());
        assert!(!confirm(&mut Cursor::new("no\n"), &mut out).unwrap());
        assert!(confirm(&mut Cursor::new("maybe\n YES \n"), &mut out).unwrap());
        assert!(!confirm(&mut Cursor::new(""), &mut out).unwrap());

        let prompt = String::from_utf8(out).unwrap();
        assert!(prompt.starts_with("Type 'yes' to continue, or 'no' to cancel:"));
    }

    #[test]
    fn test_load_target() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = dir.path().join("sitepub.json");
        std::fs::write(
            &config,
            r#"{"default": {"ENGINE": "amazon_s3", "BUCKET": "site"}}"#,
        )
        .unwrap();

        let args = TargetArgs {
            target: "default".to_string(),
            config: config.clone(),
            force: true,
        };
        let target = load_target(&args).unwrap();
        assert_eq!(target.engine().unwrap(), "amazon_s3");

        let missing = TargetArgs {
            target: "staging".to_string(),
            config,
            force: true,
        };
        assert!(load_target(&missing).is_err());
    }
}
