//! Laiska OTA Update System
//!
//! Staged, checksum-verified firmware replacement that survives a reset at any
//! point of the commit.
//!
//! Components:
//! - `layout` - Device directory trees and filesystem primitives
//! - `manifest` - Version manifest model
//! - `verify` - Checksum engine and staged-tree validator
//! - `download` - TLS fetcher with chunk and file retry
//! - `staging` - Resumable download into `new_version/`
//! - `backup` - Single-generation snapshot of the installed release
//! - `state` - Durable update status record
//! - `commit` - Commit state machine
//! - `recovery` - Boot-time decision on the persisted status
//! - `pipeline` - `OtaContext` and the update entry points

pub mod backup;
pub mod commit;
pub mod download;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod recovery;
pub mod staging;
pub mod state;
pub mod verify;

pub use commit::{commit_with, CommitError, CommitReport, CommitState};
pub use download::{Connector, FetchError, Fetcher, RetryPolicy};
pub use layout::DeviceLayout;
pub use manifest::{FileEntry, VersionManifest};
pub use pipeline::{
    check_for_updates, install_staged, prepare_update, run_update, OtaContext, OtaError,
    VersionCheck,
};
pub use recovery::{decide, RecoveryOutcome};
pub use state::UpdateStatus;
