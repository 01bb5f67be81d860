//! Durable Update Status
//!
//! The single record that survives a reset and tells the next boot whether a
//! commit was interrupted or an install is pending.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use super::layout::write_durable;

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Failed to write update status {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to serialize update status: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Contents of `update.json`
///
/// Keys missing from an otherwise readable record take the unsafe reading:
/// a record without `rollback` is treated as an interrupted commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    /// Staged version verified and approved for install on next boot
    #[serde(default)]
    pub ok: bool,
    /// A commit is mutating the live tree
    #[serde(default = "default_rollback")]
    pub rollback: bool,
}

fn default_rollback() -> bool {
    true
}

impl Default for UpdateStatus {
    fn default() -> Self {
        Self {
            ok: false,
            rollback: true,
        }
    }
}

impl UpdateStatus {
    /// Written before the first live file is touched
    pub const UNSAFE: Self = Self { ok: false, rollback: true };
    /// Written once the new manifest is promoted
    pub const SAFE: Self = Self { ok: false, rollback: false };
    /// Staged tree verified; install on next boot
    pub const READY: Self = Self { ok: true, rollback: false };

    /// Read the record. `None` when it is absent or unreadable, which means
    /// no update has ever run on this device.
    pub fn load(path: &Path) -> Option<Self> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No update status at {}", path.display());
                return None;
            }
            Err(e) => {
                warn!("Unreadable update status {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&content) {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Malformed update status {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Persist atomically; the previous record stays intact on failure
    pub fn save(&self, path: &Path) -> Result<(), StatusError> {
        let content = serde_json::to_vec(self)?;
        write_durable(path, &content).map_err(|source| StatusError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}
