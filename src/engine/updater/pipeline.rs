//! OTA pipeline
//!
//! `OtaContext` carries everything one update run needs; the entry points
//! below chain version check, staging, validation and commit.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::info;

use super::commit::{commit, CommitError, CommitReport};
use super::download::{BaseUrl, FetchError, Fetcher, TlsConnector};
use super::layout::{DeviceLayout, LIVE_MANIFEST};
use super::manifest::{ManifestError, VersionManifest};
use super::staging::{stage, StageError, StageReport};
use super::state::{StatusError, UpdateStatus};
use super::verify::find_invalid;
use crate::engine::config::OtaConfig;
use crate::engine::device::DeviceControl;

#[derive(Error, Debug)]
pub enum OtaError {
    #[error("Installed manifest unusable: {0}")]
    LiveManifest(#[source] ManifestError),
    #[error("Remote manifest unusable: {0}")]
    RemoteManifest(#[source] ManifestError),
    #[error("Failed to fetch remote manifest: {0}")]
    Fetch(#[from] FetchError),
    #[error("No update available (installed {current}, remote {remote})")]
    NoUpdateAvailable { current: u32, remote: u32 },
    #[error("Staging failed: {0}")]
    Stage(#[from] StageError),
    #[error("Staged files failed verification: {}", .invalid.join(", "))]
    Incomplete { invalid: Vec<String> },
    #[error("Could not record staged update: {0}")]
    Status(#[from] StatusError),
    #[error("Commit failed: {0}")]
    Commit(#[from] CommitError),
}

/// Per-device state of the update pipeline
pub struct OtaContext {
    pub layout: DeviceLayout,
    pub fetcher: Fetcher,
}

impl OtaContext {
    pub fn new(layout: DeviceLayout, fetcher: Fetcher) -> Self {
        Self { layout, fetcher }
    }

    /// Context with the TLS fetcher described by `config`
    pub fn from_config(
        root: impl Into<PathBuf>,
        config: &OtaConfig,
        device: Arc<dyn DeviceControl>,
    ) -> Result<Self, FetchError> {
        let base = BaseUrl::parse(&config.base_url)?;
        let connector = TlsConnector::new(config.connect_timeout(), config.read_timeout())?;
        let fetcher = Fetcher::new(Box::new(connector), base, config.retry_policy(), device)
            .with_chunk_size(config.chunk_size)
            .with_max_header_bytes(config.max_header_bytes);
        Ok(Self::new(DeviceLayout::new(root), fetcher))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionCheck {
    #[serde(rename = "currentVersion")]
    pub current: u32,
    #[serde(rename = "remoteVersion")]
    pub remote: u32,
    pub updates_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedUpdate {
    pub version: u32,
    pub stage: StageReport,
}

/// Compare the installed version with the one on the distribution host.
///
/// The remote manifest is kept as `remote-version.json` for staging and commit.
pub fn check_for_updates(ctx: &OtaContext) -> Result<VersionCheck, OtaError> {
    negotiate(ctx).map(|(check, _)| check)
}

fn negotiate(ctx: &OtaContext) -> Result<(VersionCheck, VersionManifest), OtaError> {
    let installed =
        VersionManifest::load(&ctx.layout.live_manifest()).map_err(OtaError::LiveManifest)?;

    let remote_path = ctx.layout.remote_manifest();
    ctx.fetcher.fetch_retrying(LIVE_MANIFEST, &remote_path)?;
    let remote = VersionManifest::load(&remote_path).map_err(OtaError::RemoteManifest)?;

    let check = VersionCheck {
        current: installed.version,
        remote: remote.version,
        updates_available: remote.is_newer_than(&installed),
    };
    info!(
        "Installed version {}, remote version {}",
        check.current, check.remote
    );
    Ok((check, remote))
}

fn staged_release(ctx: &OtaContext, force: bool) -> Result<VersionManifest, OtaError> {
    let (check, remote) = negotiate(ctx)?;
    if !check.updates_available && !force {
        return Err(OtaError::NoUpdateAvailable {
            current: check.current,
            remote: check.remote,
        });
    }
    Ok(remote)
}

/// Stage and verify the remote release, then mark it approved for install on
/// the next boot.
pub fn prepare_update(ctx: &OtaContext, force: bool) -> Result<PreparedUpdate, OtaError> {
    let remote = staged_release(ctx, force)?;
    let report = stage(&ctx.layout, &ctx.fetcher, &remote)?;

    let invalid = find_invalid(&remote, &ctx.layout.staging_dir());
    if !invalid.is_empty() {
        return Err(OtaError::Incomplete {
            invalid: invalid.iter().map(|e| e.local_path.clone()).collect(),
        });
    }

    UpdateStatus::READY.save(&ctx.layout.status_path())?;
    info!("Version {} staged and ready to install", remote.version);
    Ok(PreparedUpdate {
        version: remote.version,
        stage: report,
    })
}

/// Check, stage and commit in one call. The caller schedules the reset.
pub fn run_update(ctx: &OtaContext) -> Result<CommitReport, OtaError> {
    let remote = staged_release(ctx, false)?;
    stage(&ctx.layout, &ctx.fetcher, &remote)?;
    Ok(commit(&ctx.layout)?)
}

/// Commit whatever is currently staged
pub fn install_staged(ctx: &OtaContext) -> Result<CommitReport, OtaError> {
    Ok(commit(&ctx.layout)?)
}
