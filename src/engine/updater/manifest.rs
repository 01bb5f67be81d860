//! Version Manifest
//!
//! The descriptor of one firmware release: which files make it up, where they
//! come from and go to, and the digest each one must have.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::layout::{is_safe_relative, write_durable};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read manifest {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write manifest {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid manifest format: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Unsafe path in manifest: {0}")]
    UnsafePath(String),
}

/// One file of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Location relative to the distribution base URL
    #[serde(rename = "repository")]
    pub remote_path: String,
    /// Location relative to the device root
    #[serde(rename = "pico")]
    pub local_path: String,
    /// Lowercase hex SHA-256 of the expected content
    #[serde(rename = "check", deserialize_with = "deserialize_checksum")]
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    pub version: u32,
    pub files_included: Vec<FileEntry>,
    #[serde(default)]
    pub directories_included: Vec<String>,
    #[serde(default)]
    pub files_excluded: Vec<String>,
}

fn deserialize_checksum<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if is_sha256_hex(&raw) {
        Ok(raw.to_ascii_lowercase())
    } else {
        Err(serde::de::Error::custom(format!(
            "checksum must be 64 hex characters, got {:?}",
            raw
        )))
    }
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl VersionManifest {
    /// Load and type-check a manifest
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let manifest: VersionManifest = serde_json::from_str(content)?;
        manifest.check_paths()?;
        Ok(manifest)
    }

    /// Persist the manifest with the same durability as the status record
    pub fn store(&self, path: &Path) -> Result<(), ManifestError> {
        let content = serde_json::to_string_pretty(self)?;
        write_durable(path, content.as_bytes()).map_err(|source| ManifestError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    fn check_paths(&self) -> Result<(), ManifestError> {
        let local = self.files_included.iter().map(|f| &f.local_path);
        let unsafe_path = local
            .chain(self.directories_included.iter())
            .chain(self.files_excluded.iter())
            .find(|p| !is_safe_relative(p));
        match unsafe_path {
            Some(p) => Err(ManifestError::UnsafePath(p.clone())),
            None => Ok(()),
        }
    }

    /// Files whose parent directory is neither the root nor a listed directory
    pub fn layout_violations(&self) -> Vec<&FileEntry> {
        let dirs: BTreeSet<PathBuf> = self
            .directories_included
            .iter()
            .map(|d| normalize(Path::new(d)))
            .collect();

        self.files_included
            .iter()
            .filter(|entry| {
                let parent = Path::new(&entry.local_path)
                    .parent()
                    .map(normalize)
                    .unwrap_or_default();
                !(parent.as_os_str().is_empty() || dirs.contains(&parent))
            })
            .collect()
    }

    /// Local paths of every file in the release
    pub fn local_paths(&self) -> impl Iterator<Item = &str> {
        self.files_included.iter().map(|f| f.local_path.as_str())
    }

    pub fn is_newer_than(&self, other: &VersionManifest) -> bool {
        self.version > other.version
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, std::path::Component::CurDir))
        .collect()
}
