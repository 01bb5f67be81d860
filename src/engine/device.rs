//! Device Collaborators
//!
//! Capabilities the updater needs from the board but does not implement:
//! a visual status signal and the restart primitive.

use std::io::Write;
use tracing::{info, warn};

/// Exit code `ProcessDevice` uses to ask its supervisor for a restart
pub const RESTART_EXIT_CODE: i32 = 75;

/// Visual states shown on the status LED
pub trait StatusSignal: Send + Sync {
    fn update_in_progress(&self);
    fn update_succeeded(&self);
    fn update_failed(&self);
}

pub trait DeviceControl: Send + Sync {
    /// Unconditional restart. Does not return on hardware.
    fn reset(&self);

    /// Forced memory-reclaim point around transfers
    fn reclaim_memory(&self) {}
}

/// Signal sink for boards without an LED; records the state in the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSignal;

impl StatusSignal for LogSignal {
    fn update_in_progress(&self) {
        info!("status: update in progress");
    }

    fn update_succeeded(&self) {
        info!("status: update ok");
    }

    fn update_failed(&self) {
        warn!("status: update error");
    }
}

/// Restarts by exiting the process; the service manager brings the node back up
#[derive(Debug, Clone, Copy)]
pub struct ProcessDevice {
    exit_code: i32,
}

impl ProcessDevice {
    pub fn new() -> Self {
        Self {
            exit_code: RESTART_EXIT_CODE,
        }
    }
}

impl Default for ProcessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceControl for ProcessDevice {
    fn reset(&self) {
        warn!("Device reset requested, exiting with code {}", self.exit_code);
        let _ = std::io::stdout().flush();
        let _ = std::io::stderr().flush();
        std::process::exit(self.exit_code);
    }
}
