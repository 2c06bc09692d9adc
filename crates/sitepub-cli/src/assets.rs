//! Static asset collection into the rendered site.

use std::path::Path;

use anyhow::{bail, Context};
use sitepub_core::ExcludeFilter;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Copy every file under `static_dir` to the same relative path under
/// `output_dir`, pruning excluded directory names. Returns the number of
/// files copied.
pub fn collect(static_dir: &Path, output_dir: &Path, filter: &ExcludeFilter) -> anyhow::Result<usize> {
    if !static_dir.is_dir() {
        bail!("static directory does not exist: {}", static_dir.display());
    }
    if output_dir.starts_with(static_dir) {
        bail!(
            "output directory {} must not be inside the static directory {}",
            output_dir.display(),
            static_dir.display()
        );
    }

    let walker = WalkDir::new(static_dir)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !filter.is_excluded(&entry.file_name().to_string_lossy())
        });

    let mut copied = 0;
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", static_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(static_dir)
            .with_context(|| format!("{} is outside the static directory", entry.path().display()))?;
        let destination = output_dir.join(relative);

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::copy(entry.path(), &destination).with_context(|| {
            format!(
                "failed to copy {} to {}",
                entry.path().display(),
                destination.display()
            )
        })?;
        debug!("Copied {}", relative.display());
        copied += 1;
    }

    info!(
        "Collected {} static files from {} into {}",
        copied,
        static_dir.display(),
        output_dir.display()
    );
    Ok(copied)
}
