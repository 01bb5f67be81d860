//! Staging Manager
//!
//! Fetches the file set of a candidate release into `new_version/`. Only files
//! that are missing or invalid in staging are fetched, so an interrupted stage
//! resumes where it stopped.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info};

use super::download::{FetchError, Fetcher};
use super::layout::{ensure_dirs, remove_tree, DeviceLayout};
use super::manifest::VersionManifest;
use super::verify::find_invalid;

#[derive(Error, Debug)]
pub enum StageError {
    #[error("Files outside the listed directories: {}", .0.join(", "))]
    Layout(Vec<String>),
    #[error("Failed to remove previous backup {path}: {source}")]
    ClearBackup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create staging directories under {path}: {source}")]
    Directories {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to fetch {local_path}: {source}")]
    Fetch {
        local_path: String,
        #[source]
        source: FetchError,
    },
}

/// What a staging pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    /// Local paths fetched during this pass
    pub fetched: Vec<String>,
    /// Files already valid in staging
    pub reused: usize,
    pub bytes: u64,
}

/// Bring the staging tree in line with `manifest`.
///
/// The previous backup generation is discarded first. Fetched files are not
/// re-verified here; run the validator before committing.
pub fn stage(
    layout: &DeviceLayout,
    fetcher: &Fetcher,
    manifest: &VersionManifest,
) -> Result<StageReport, StageError> {
    let violations = manifest.layout_violations();
    if !violations.is_empty() {
        return Err(StageError::Layout(
            violations.iter().map(|e| e.local_path.clone()).collect(),
        ));
    }

    let backup = layout.backup_dir();
    match remove_tree(&backup) {
        Ok(true) => info!("Removed previous backup {}", backup.display()),
        Ok(false) => {}
        Err(source) => return Err(StageError::ClearBackup { path: backup, source }),
    }

    let staging = layout.staging_dir();
    ensure_dirs(&staging, &manifest.directories_included).map_err(|source| {
        StageError::Directories {
            path: staging.clone(),
            source,
        }
    })?;

    let pending = find_invalid(manifest, &staging);
    let mut report = StageReport {
        reused: manifest.files_included.len() - pending.len(),
        ..StageReport::default()
    };
    info!(
        "Staging version {}: {} to fetch, {} already valid",
        manifest.version,
        pending.len(),
        report.reused
    );

    for entry in pending {
        let dest = layout.staged_path(&entry.local_path);
        let bytes = fetcher
            .fetch_retrying(&entry.remote_path, &dest)
            .map_err(|source| StageError::Fetch {
                local_path: entry.local_path.clone(),
                source,
            })?;
        debug!("Staged {} ({} bytes)", entry.local_path, bytes);
        report.bytes += bytes;
        report.fetched.push(entry.local_path.clone());
    }

    Ok(report)
}
