//! Commit Engine
//!
//! Moves a validated staging tree into the live tree. Every step that can leave
//! the live tree mixed is preceded by a durable `rollback: true` record and
//! followed by the matching clear:
//!
//! ```text
//! Idle -> BackingUp -> FlaggedUnsafe -> Installing -> Promoting -> Safe -> Cleaning -> Done
//!   \________\______________\______________\____________\__________\-> Aborted
//! ```
//!
//! Errors from `Installing` onward are not retried; the persisted flag is
//! what the next boot acts on. If the flag itself cannot be written the backup
//! is moved back before returning.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, info, warn};

use super::backup::{self, snapshot_current, BackupError, BackupReport};
use super::layout::{ensure_dirs, remove_file_if_exists, remove_tree, rename_durable, DeviceLayout};
use super::manifest::{ManifestError, VersionManifest};
use super::state::{StatusError, UpdateStatus};
use super::verify::find_invalid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Idle,
    BackingUp,
    FlaggedUnsafe,
    Installing,
    Promoting,
    Safe,
    Cleaning,
    Done,
    Aborted,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::BackingUp => "backing_up",
            Self::FlaggedUnsafe => "flagged_unsafe",
            Self::Installing => "installing",
            Self::Promoting => "promoting",
            Self::Safe => "safe",
            Self::Cleaning => "cleaning",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Failed to create live directories: {0}")]
    Directories(#[source] io::Error),
    #[error("Failed to install {local_path}: {source}")]
    Move {
        local_path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Staged manifest unusable: {0}")]
    Manifest(#[from] ManifestError),
    #[error("Checksum mismatch in staged files: {}", .invalid.join(", "))]
    ChecksumMismatch { invalid: Vec<String> },
    #[error("Backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("Could not flag commit in progress: {source}")]
    FlagUnsafe {
        #[source]
        source: StatusError,
        /// The backed-up files were moved back into the live tree
        restored: bool,
    },
    #[error("Install failed: {0}")]
    Install(#[from] InstallError),
    #[error("Failed to promote {path}: {source}")]
    Promote {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not clear commit flag: {0}")]
    FlagSafe(#[source] StatusError),
}

impl CommitError {
    /// State the commit was in when it aborted
    pub fn state(&self) -> CommitState {
        match self {
            Self::Manifest(_) | Self::ChecksumMismatch { .. } => CommitState::Idle,
            Self::Backup(_) => CommitState::BackingUp,
            Self::FlagUnsafe { .. } => CommitState::FlaggedUnsafe,
            Self::Install(_) => CommitState::Installing,
            Self::Promote { .. } => CommitState::Promoting,
            Self::FlagSafe(_) => CommitState::Safe,
        }
    }

    /// Whether the live tree may differ from the installed release
    pub fn live_tree_touched(&self) -> bool {
        match self {
            Self::Manifest(_) | Self::ChecksumMismatch { .. } => false,
            Self::Backup(e) => matches!(e, BackupError::Restore { .. }),
            Self::FlagUnsafe { restored, .. } => !restored,
            Self::Install(_) | Self::Promote { .. } | Self::FlagSafe(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub version: u32,
    pub previous: BackupReport,
    pub installed: usize,
    pub pruned: usize,
    /// States passed through, `Idle` to `Done`
    pub trail: Vec<CommitState>,
}

/// Drives one commit and records the states it passes
struct Commit<'a, 'f> {
    layout: &'a DeviceLayout,
    trail: Vec<CommitState>,
    on_enter: &'f mut dyn FnMut(CommitState),
}

impl Commit<'_, '_> {
    fn enter(&mut self, state: CommitState) {
        info!("Commit: {}", state);
        self.trail.push(state);
        (self.on_enter)(state);
    }
}

/// Commit the staged release described by `remote-version.json`
pub fn commit(layout: &DeviceLayout) -> Result<CommitReport, CommitError> {
    commit_with(layout, &mut |_: CommitState| {})
}

/// Like [`commit`], calling `on_enter` as each state begins, before its work
pub fn commit_with(
    layout: &DeviceLayout,
    on_enter: &mut dyn FnMut(CommitState),
) -> Result<CommitReport, CommitError> {
    let result = run(layout, on_enter);
    if let Err(e) = &result {
        error!("Commit aborted in state {}: {}", e.state(), e);
        if e.live_tree_touched() {
            error!("Live tree may be inconsistent; rollback flag left set");
        }
    }
    result
}

fn run(
    layout: &DeviceLayout,
    on_enter: &mut dyn FnMut(CommitState),
) -> Result<CommitReport, CommitError> {
    let mut commit = Commit {
        layout,
        trail: Vec::new(),
        on_enter,
    };
    commit.enter(CommitState::Idle);

    let staged = VersionManifest::load(&layout.remote_manifest())?;
    let invalid = find_invalid(&staged, &layout.staging_dir());
    if !invalid.is_empty() {
        return Err(CommitError::ChecksumMismatch {
            invalid: invalid.iter().map(|e| e.local_path.clone()).collect(),
        });
    }

    commit.enter(CommitState::BackingUp);
    let previous = snapshot_current(commit.layout)?;

    commit.enter(CommitState::FlaggedUnsafe);
    if let Err(source) = UpdateStatus::UNSAFE.save(&layout.status_path()) {
        let restored = match backup::restore(layout, &previous) {
            Ok(()) => true,
            Err(e) => {
                error!("Live tree left without its files: {}", e);
                false
            }
        };
        return Err(CommitError::FlagUnsafe { source, restored });
    }

    commit.enter(CommitState::Installing);
    let installed = install(layout, &staged)?;

    commit.enter(CommitState::Promoting);
    let live_manifest = layout.live_manifest();
    rename_durable(&layout.remote_manifest(), &live_manifest).map_err(|source| {
        CommitError::Promote {
            path: live_manifest,
            source,
        }
    })?;

    commit.enter(CommitState::Safe);
    UpdateStatus::SAFE
        .save(&layout.status_path())
        .map_err(CommitError::FlagSafe)?;

    commit.enter(CommitState::Cleaning);
    let pruned = clean(layout, &staged);

    commit.enter(CommitState::Done);
    info!("Version {} installed", staged.version);
    Ok(CommitReport {
        version: staged.version,
        previous,
        installed,
        pruned,
        trail: commit.trail,
    })
}

fn install(layout: &DeviceLayout, staged: &VersionManifest) -> Result<usize, InstallError> {
    ensure_dirs(layout.root(), &staged.directories_included).map_err(InstallError::Directories)?;
    for local_path in staged.local_paths() {
        rename_durable(&layout.staged_path(local_path), &layout.live_path(local_path)).map_err(
            |source| InstallError::Move {
                local_path: local_path.to_string(),
                source,
            },
        )?;
    }
    Ok(staged.files_included.len())
}

/// Best effort; leftovers do not affect the running release
fn clean(layout: &DeviceLayout, staged: &VersionManifest) -> usize {
    if let Err(e) = remove_tree(&layout.staging_dir()) {
        warn!("Could not remove staging tree: {}", e);
    }

    let mut pruned = 0;
    for local_path in &staged.files_excluded {
        match remove_file_if_exists(&layout.live_path(local_path)) {
            Ok(true) => {
                info!("Removed obsolete {}", local_path);
                pruned += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Could not remove obsolete {}: {}", local_path, e),
        }
    }
    pruned
}
