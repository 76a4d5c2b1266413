//! # Utility Module
//!
//! Startup checks and small helpers shared by `main` and the tests.

use std::fs::{File, OpenOptions};
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::fetch::{self, LinkFetcher};
use crate::pipeline::{ProgressReporter, ProgressSnapshot};

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)
            .with_context(|| format!("failed to create output dir {}", path.display()))?;
    }

    let probe_path = path.join(".cropsalvage_write_probe");
    match OpenOptions::new().write(true).create(true).open(&probe_path) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// Open the export archive.
pub fn open_package(path: &Path) -> Result<zip::ZipArchive<File>> {
    let file = File::open(path).with_context(|| format!("failed to open package {}", path.display()))?;
    zip::ZipArchive::new(file).with_context(|| format!("not a zip archive: {}", path.display()))
}

/// Read the recovery module from disk, or download it when no path is given.
pub fn load_module_bytes(
    local: Option<&Path>,
    fetcher: &dyn LinkFetcher,
    url: &str,
) -> Result<Vec<u8>> {
    match local {
        Some(path) => {
            info!("loading recovery module from {}", path.display());
            std::fs::read(path).with_context(|| format!("failed to read module {}", path.display()))
        }
        None => {
            info!("downloading recovery module from {url}");
            fetch::fetch_module_bytes(fetcher, url)
                .with_context(|| format!("failed to download module from {url}"))
        }
    }
}

/// Reports progress through the log.
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn on_progress(&self, s: &ProgressSnapshot) {
        info!(
            "progress processed={} recovered={} skipped={} failed={} rate={:.1}/s elapsed={:.0}s{}",
            s.links_processed,
            s.recovered,
            s.skipped,
            s.failed,
            s.links_per_second,
            s.elapsed_seconds,
            if s.cancelled { " (stopping)" } else { "" }
        );
    }
}
