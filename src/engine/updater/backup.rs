//! Backup Manager
//!
//! Keeps exactly one previous generation in `backup_version/`. Data files are
//! moved, not copied, so the snapshot costs no extra flash; the live manifest is
//! copied because commit promotes over it.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::layout::{ensure_dirs, remove_tree, DeviceLayout};
use super::manifest::{ManifestError, VersionManifest};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Cannot read installed manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Failed to remove previous backup {path}: {source}")]
    Clear {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to create backup directories: {0}")]
    Directories(#[source] io::Error),
    #[error("Failed to move {local_path} into backup: {source}")]
    Move {
        local_path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to copy installed manifest into backup: {0}")]
    CopyManifest(#[source] io::Error),
    #[error("Failed to restore {} from backup", .unrestored.join(", "))]
    Restore { unrestored: Vec<String> },
}

/// Result of a completed snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub version: u32,
    /// Local paths moved out of the live tree, in move order
    pub moved: Vec<String>,
    /// Files named by the installed manifest but absent from the live tree
    pub missing: Vec<String>,
}

/// Snapshot the installed release into the backup tree.
///
/// On failure every file already moved is put back, so the live tree is as it
/// was before the call. `BackupError::Restore` means that put-back failed too.
pub fn snapshot_current(layout: &DeviceLayout) -> Result<BackupReport, BackupError> {
    let installed = VersionManifest::load(&layout.live_manifest())?;
    let backup = layout.backup_dir();
    info!("Backing up version {} to {}", installed.version, backup.display());

    if remove_tree(&backup).map_err(|source| BackupError::Clear {
        path: backup.clone(),
        source,
    })? {
        debug!("Removed previous backup");
    }
    ensure_dirs(&backup, &installed.directories_included).map_err(BackupError::Directories)?;

    let mut moved: Vec<String> = Vec::new();
    let mut missing = Vec::new();
    for local_path in installed.local_paths() {
        let live = layout.live_path(local_path);
        if !live.is_file() {
            warn!("Installed file {} is missing, not backed up", local_path);
            missing.push(local_path.to_string());
            continue;
        }
        match fs::rename(&live, layout.backup_path(local_path)) {
            Ok(()) => moved.push(local_path.to_string()),
            Err(source) => {
                error!("Failed to move {} into backup: {}", local_path, source);
                return Err(unwind(layout, &moved).unwrap_or(BackupError::Move {
                    local_path: local_path.to_string(),
                    source,
                }));
            }
        }
    }

    if let Err(e) = fs::copy(layout.live_manifest(), layout.backup_manifest()) {
        error!("Failed to copy installed manifest into backup: {}", e);
        return Err(unwind(layout, &moved).unwrap_or(BackupError::CopyManifest(e)));
    }

    info!("Backup complete: {} files", moved.len());
    Ok(BackupReport {
        version: installed.version,
        moved,
        missing,
    })
}

/// Move the files of a completed snapshot back into the live tree.
///
/// Only valid before anything was installed over them. The backup manifest
/// copy is left where it is.
pub fn restore(layout: &DeviceLayout, report: &BackupReport) -> Result<(), BackupError> {
    info!("Restoring {} files from backup", report.moved.len());
    let unrestored = restore_moved(layout, &report.moved);
    if unrestored.is_empty() {
        Ok(())
    } else {
        Err(BackupError::Restore { unrestored })
    }
}

/// Put back a partial snapshot; `Some` when the live tree stays incomplete
fn unwind(layout: &DeviceLayout, moved: &[String]) -> Option<BackupError> {
    let unrestored = restore_moved(layout, moved);
    (!unrestored.is_empty()).then_some(BackupError::Restore { unrestored })
}

/// Returns the paths that could not be moved back
fn restore_moved(layout: &DeviceLayout, moved: &[String]) -> Vec<String> {
    let mut unrestored = Vec::new();
    for local_path in moved.iter().rev() {
        if let Err(e) = fs::rename(layout.backup_path(local_path), layout.live_path(local_path)) {
            error!("Could not restore {} from backup: {}", local_path, e);
            unrestored.push(local_path.clone());
        }
    }
    unrestored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::updater::manifest::FileEntry;
    use tempfile::tempdir;

    const SUM: &str = "559aead08264d5795d3909718cdd05abd49572e84fe55590eef31a88a08fdffd";

    fn install(layout: &DeviceLayout, files: &[&str]) -> VersionManifest {
        let manifest = VersionManifest {
            version: 3,
            files_included: files
                .iter()
                .map(|f| FileEntry {
                    remote_path: f.to_string(),
                    local_path: f.to_string(),
                    checksum: SUM.to_string(),
                })
                .collect(),
            directories_included: vec!["components".to_string()],
            files_excluded: vec![],
        };
        fs::create_dir_all(layout.live_path("components")).unwrap();
        for f in files {
            fs::write(layout.live_path(f), f.as_bytes()).unwrap();
        }
        manifest.store(&layout.live_manifest()).unwrap();
        manifest
    }

    #[test]
    fn test_snapshot_moves_files_and_copies_manifest() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py", "components/app.py"]);

        let report = snapshot_current(&layout).unwrap();
        assert_eq!(report.version, 3);
        assert_eq!(report.moved, vec!["main.py", "components/app.py"]);

        assert!(!layout.live_path("main.py").exists());
        assert_eq!(fs::read(layout.backup_path("components/app.py")).unwrap(), b"components/app.py");
        assert!(layout.live_manifest().exists());
        assert_eq!(
            fs::read(layout.live_manifest()).unwrap(),
            fs::read(layout.backup_manifest()).unwrap()
        );
    }

    #[test]
    fn test_snapshot_replaces_previous_generation() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py"]);
        fs::create_dir_all(layout.backup_dir()).unwrap();
        fs::write(layout.backup_path("stale.py"), b"old").unwrap();

        snapshot_current(&layout).unwrap();
        assert!(!layout.backup_path("stale.py").exists());
        assert!(layout.backup_path("main.py").exists());
    }

    #[test]
    fn test_missing_installed_file_is_skipped() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py", "boot.py"]);
        fs::remove_file(layout.live_path("boot.py")).unwrap();

        let report = snapshot_current(&layout).unwrap();
        assert_eq!(report.moved, vec!["main.py"]);
        assert_eq!(report.missing, vec!["boot.py"]);
    }

    #[test]
    fn test_failed_move_restores_live_tree() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py", "components/app.py"]);
        // Without the directory entry the backup tree has no components/.
        let mut manifest = VersionManifest::load(&layout.live_manifest()).unwrap();
        manifest.directories_included.clear();
        manifest.store(&layout.live_manifest()).unwrap();

        let err = snapshot_current(&layout).unwrap_err();
        assert!(matches!(err, BackupError::Move { ref local_path, .. } if local_path == "components/app.py"));
        assert_eq!(fs::read(layout.live_path("main.py")).unwrap(), b"main.py");
        assert!(layout.live_path("components/app.py").exists());
    }

    #[test]
    fn test_restore_puts_snapshot_back() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py", "components/app.py"]);

        let report = snapshot_current(&layout).unwrap();
        restore(&layout, &report).unwrap();
        assert_eq!(fs::read(layout.live_path("main.py")).unwrap(), b"main.py");
        assert_eq!(
            fs::read(layout.live_path("components/app.py")).unwrap(),
            b"components/app.py"
        );
        assert!(!layout.backup_path("main.py").exists());
    }

    #[test]
    fn test_restore_reports_files_it_could_not_move() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        install(&layout, &["main.py", "boot.py"]);

        let report = snapshot_current(&layout).unwrap();
        fs::remove_file(layout.backup_path("boot.py")).unwrap();

        let err = restore(&layout, &report).unwrap_err();
        assert!(matches!(err, BackupError::Restore { ref unrestored } if unrestored == &["boot.py"]));
        assert!(layout.live_path("main.py").exists());
    }

    #[test]
    fn test_missing_installed_manifest() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());

        let err = snapshot_current(&layout).unwrap_err();
        assert!(matches!(err, BackupError::Manifest(ManifestError::Read { .. })));
    }
}
