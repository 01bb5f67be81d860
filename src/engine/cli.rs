//! Laiska Manifest CLI Module
//! Command-line interface for authoring and checking release manifests

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::engine::updater::manifest::VersionManifest;
use crate::engine::updater::verify::checksum_file;

#[derive(Parser, Debug)]
#[command(name = "laiska-manifest")]
#[command(author = "Laiska Team")]
#[command(version)]
#[command(about = "Author and check Laiska firmware release manifests", long_about = None)]
pub struct Cli {
    /// Repository checkout the manifest paths are relative to (defaults to current directory)
    #[arg(short, long, global = true)]
    pub dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Recompute the checksum of every file in a manifest
    Update {
        /// Manifest to rewrite
        #[arg(short, long, default_value = "version.json")]
        manifest: PathBuf,

        /// Also increment the release version
        #[arg(long)]
        bump: bool,
    },

    /// Print the SHA-256 of files
    Checksum {
        /// Files to hash
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Check a device tree against a manifest
    Verify {
        /// Manifest to check against
        #[arg(short, long, default_value = "version.json")]
        manifest: PathBuf,

        /// Tree holding the files at their device paths
        root: PathBuf,
    },

    /// Show the update state of a device root
    Status {
        /// Device root
        root: PathBuf,
    },
}

impl Cli {
    pub fn get_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[derive(Error, Debug)]
pub enum AuthoringError {
    #[error("{remote_path}: file missing or unreadable under {}", .source_dir.display())]
    MissingSource {
        remote_path: String,
        source_dir: PathBuf,
    },
}

/// Fill in the `check` field of every entry from the files under `source_dir`.
///
/// Entries are hashed at their repository path, the same bytes the device
/// downloads. Returns the number of checksums that changed.
pub fn recompute_checksums(
    manifest: &mut VersionManifest,
    source_dir: &Path,
) -> Result<usize, AuthoringError> {
    let mut changed = 0;
    for entry in &mut manifest.files_included {
        let path = source_dir.join(&entry.remote_path);
        let checksum = checksum_file(&path)
            .computed()
            .ok_or_else(|| AuthoringError::MissingSource {
                remote_path: entry.remote_path.clone(),
                source_dir: source_dir.to_path_buf(),
            })?;
        if checksum != entry.checksum {
            entry.checksum = checksum;
            changed += 1;
        }
    }
    Ok(changed)
}
