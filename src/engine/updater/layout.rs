//! Device Filesystem Layout
//!
//! Names the three directory trees the updater works with and provides the
//! small set of filesystem primitives they are mutated through.
//!
//! ```text
//! <root>/
//!   version.json          live manifest
//!   remote-version.json   downloaded manifest of the candidate version
//!   update.json           durable update status
//!   new_version/          staging tree
//!   backup_version/       single-generation backup tree
//! ```

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

pub const LIVE_MANIFEST: &str = "version.json";
pub const REMOTE_MANIFEST: &str = "remote-version.json";
pub const STATUS_FILE: &str = "update.json";
pub const STAGING_DIR: &str = "new_version";
pub const BACKUP_DIR: &str = "backup_version";

/// Paths of every tree and record the updater touches
#[derive(Debug, Clone)]
pub struct DeviceLayout {
    root: PathBuf,
}

impl DeviceLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn live_manifest(&self) -> PathBuf {
        self.root.join(LIVE_MANIFEST)
    }

    pub fn remote_manifest(&self) -> PathBuf {
        self.root.join(REMOTE_MANIFEST)
    }

    pub fn status_path(&self) -> PathBuf {
        self.root.join(STATUS_FILE)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR)
    }

    /// Manifest copy kept next to the backed-up files
    pub fn backup_manifest(&self) -> PathBuf {
        self.backup_dir().join(LIVE_MANIFEST)
    }

    pub fn live_path(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    pub fn staged_path(&self, rel: &str) -> PathBuf {
        self.staging_dir().join(rel)
    }

    pub fn backup_path(&self, rel: &str) -> PathBuf {
        self.backup_dir().join(rel)
    }
}

/// Outcome of an idempotent directory creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirOutcome {
    Created,
    AlreadyExisted,
}

/// Create a single directory, treating an existing directory as success.
///
/// An existing non-directory at `path` is an error, as is a missing parent.
pub fn ensure_dir(path: &Path) -> io::Result<DirOutcome> {
    match fs::create_dir(path) {
        Ok(()) => Ok(DirOutcome::Created),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if fs::metadata(path)?.is_dir() {
                Ok(DirOutcome::AlreadyExisted)
            } else {
                Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists and is not a directory", path.display()),
                ))
            }
        }
        Err(e) => Err(e),
    }
}

/// Create `base` and every relative directory beneath it, parents first
pub fn ensure_dirs<'a, I>(base: &Path, dirs: I) -> io::Result<()>
where
    I: IntoIterator<Item = &'a String>,
{
    ensure_dir(base)?;
    for dir in dirs {
        let mut path = base.to_path_buf();
        for component in Path::new(dir).components() {
            path.push(component);
            if ensure_dir(&path)? == DirOutcome::Created {
                debug!("Created directory {}", path.display());
            }
        }
    }
    Ok(())
}

/// Recursively delete a tree. Returns `false` when there was nothing to delete.
pub fn remove_tree(path: &Path) -> io::Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(path)?;
            Ok(true)
        }
        Ok(_) => {
            fs::remove_file(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete a file, treating absence as success
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Move `src` onto `dest` in one rename; an existing `dest` file is replaced
/// atomically and stays in place if the rename fails.
pub fn rename_durable(src: &Path, dest: &Path) -> io::Result<()> {
    fs::rename(src, dest)?;
    sync_parent(dest);
    Ok(())
}

/// Directory fsync is unsupported on some filesystems; by the time this runs
/// the rename has already happened.
fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = File::open(parent).and_then(|d| d.sync_all()) {
            warn!("Could not sync directory {}: {}", parent.display(), e);
        }
    }
}

/// Write `bytes` to `path` so that a reset leaves either the old or the new content
pub fn write_durable(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    {
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    rename_durable(&temp_path, path)
}

/// Reject absolute paths and parent traversal in manifest-supplied paths
pub fn is_safe_relative(rel: &str) -> bool {
    let path = Path::new(rel);
    !rel.is_empty()
        && !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
