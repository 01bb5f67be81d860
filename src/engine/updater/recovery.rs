//! Boot Recovery Decider
//!
//! Runs once at startup before the network comes up and acts on the update
//! status left by the previous boot.

use tracing::{error, info, warn};

use super::commit::{commit, CommitError, CommitReport};
use super::layout::DeviceLayout;
use super::state::UpdateStatus;
use crate::engine::device::{DeviceControl, StatusSignal};

/// What the decider found and did
#[derive(Debug)]
pub struct RecoveryOutcome {
    /// Record read at boot; `None` means no update has ever run
    pub status: Option<UpdateStatus>,
    /// A previous commit stopped inside the unsafe window
    pub interrupted: bool,
    /// Result of the pending install, when one was performed
    pub install: Option<Result<CommitReport, CommitError>>,
}

impl RecoveryOutcome {
    /// Normal boot continues; no reset was requested
    pub fn is_normal_boot(&self) -> bool {
        self.install.is_none()
    }
}

/// Decide how this boot proceeds.
///
/// When an install was pending the device is reset whatever its result;
/// on hardware `device.reset()` does not return.
pub fn decide(
    layout: &DeviceLayout,
    signal: &dyn StatusSignal,
    device: &dyn DeviceControl,
) -> RecoveryOutcome {
    let outcome = evaluate(layout, signal, device);
    device.reclaim_memory();
    outcome
}

fn evaluate(
    layout: &DeviceLayout,
    signal: &dyn StatusSignal,
    device: &dyn DeviceControl,
) -> RecoveryOutcome {
    let Some(status) = UpdateStatus::load(&layout.status_path()) else {
        info!("No update status, normal boot");
        return RecoveryOutcome {
            status: None,
            interrupted: false,
            install: None,
        };
    };

    if status.rollback {
        // TODO: restore backup_version/ over the live tree and re-promote its manifest
        error!("Previous update was interrupted; rollback not implemented, booting as is");
    }

    let install = if status.ok {
        info!("Staged update approved, installing");
        signal.update_in_progress();
        let result = commit(layout);
        match &result {
            Ok(report) => {
                info!("Installed version {}", report.version);
                signal.update_succeeded();
            }
            Err(e) => {
                warn!("Pending install failed: {}", e);
                signal.update_failed();
                // Withdraw the approval; a touched tree keeps or gains the rollback flag.
                let settled = if e.live_tree_touched() {
                    UpdateStatus::UNSAFE
                } else {
                    UpdateStatus::SAFE
                };
                if let Err(e) = settled.save(&layout.status_path()) {
                    error!("Could not clear pending install: {}", e);
                }
            }
        }
        device.reset();
        Some(result)
    } else {
        None
    };

    RecoveryOutcome {
        status: Some(status),
        interrupted: status.rollback,
        install,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn push(&self, event: &'static str) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }
    }

    impl StatusSignal for Recorder {
        fn update_in_progress(&self) {
            self.push("in_progress");
        }

        fn update_succeeded(&self) {
            self.push("succeeded");
        }

        fn update_failed(&self) {
            self.push("failed");
        }
    }

    impl DeviceControl for Recorder {
        fn reset(&self) {
            self.push("reset");
        }

        fn reclaim_memory(&self) {
            self.push("reclaim");
        }
    }

    #[test]
    fn test_no_status_is_normal_boot() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        let rec = Recorder::default();

        let outcome = decide(&layout, &rec, &rec);
        assert!(outcome.is_normal_boot());
        assert!(outcome.status.is_none());
        assert_eq!(rec.events(), vec!["reclaim"]);
    }

    #[test]
    fn test_malformed_status_is_normal_boot() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        fs::write(layout.status_path(), "garbage").unwrap();
        let rec = Recorder::default();

        let outcome = decide(&layout, &rec, &rec);
        assert!(outcome.is_normal_boot());
        assert!(!outcome.interrupted);
    }

    #[test]
    fn test_interrupted_commit_is_reported_not_repaired() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        UpdateStatus::UNSAFE.save(&layout.status_path()).unwrap();
        let rec = Recorder::default();

        let outcome = decide(&layout, &rec, &rec);
        assert!(outcome.interrupted);
        assert!(outcome.is_normal_boot());
        assert_eq!(rec.events(), vec!["reclaim"]);
        assert_eq!(UpdateStatus::load(&layout.status_path()), Some(UpdateStatus::UNSAFE));
    }

    #[test]
    fn test_safe_status_is_normal_boot() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        UpdateStatus::SAFE.save(&layout.status_path()).unwrap();
        let rec = Recorder::default();

        let outcome = decide(&layout, &rec, &rec);
        assert!(!outcome.interrupted);
        assert!(outcome.is_normal_boot());
    }

    #[test]
    fn test_failed_pending_install_still_resets() {
        let dir = tempdir().unwrap();
        let layout = DeviceLayout::new(dir.path());
        UpdateStatus::READY.save(&layout.status_path()).unwrap();
        let rec = Recorder::default();

        let outcome = decide(&layout, &rec, &rec);
        assert!(matches!(outcome.install, Some(Err(_))));
        assert_eq!(rec.events(), vec!["in_progress", "failed", "reset", "reclaim"]);
        assert_eq!(UpdateStatus::load(&layout.status_path()), Some(UpdateStatus::SAFE));
    }
}
