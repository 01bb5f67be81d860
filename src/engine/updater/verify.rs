//! Integrity Verification
//!
//! Streaming SHA-256 digests and the validator that decides which staged files
//! still disagree with their manifest.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, warn};

use super::manifest::{FileEntry, VersionManifest};

/// Read size used when hashing files on the device
pub const HASH_CHUNK_SIZE: usize = 1024;

/// Digest of a file, or the fact that it could not be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChecksum {
    Computed(String),
    Unreadable,
}

impl FileChecksum {
    pub fn matches(&self, expected: &str) -> bool {
        match self {
            Self::Computed(actual) => actual.eq_ignore_ascii_case(expected),
            Self::Unreadable => false,
        }
    }

    pub fn computed(self) -> Option<String> {
        match self {
            Self::Computed(hex) => Some(hex),
            Self::Unreadable => None,
        }
    }
}

/// Hash a byte stream in `chunk_size` reads; peak memory is one chunk
pub fn checksum_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    loop {
        let bytes_read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a file; open or read failures become `Unreadable`
pub fn checksum_file(path: &Path) -> FileChecksum {
    checksum_file_with(path, HASH_CHUNK_SIZE)
}

pub fn checksum_file_with(path: &Path, chunk_size: usize) -> FileChecksum {
    let result = File::open(path).and_then(|file| checksum_reader(file, chunk_size));
    match result {
        Ok(hex) => FileChecksum::Computed(hex),
        Err(e) if e.kind() == io::ErrorKind::NotFound => FileChecksum::Unreadable,
        Err(e) => {
            warn!("Error opening/reading {}: {}", path.display(), e);
            FileChecksum::Unreadable
        }
    }
}

/// Every manifest entry whose file under `root` is missing or has the wrong digest.
///
/// No side effects. Empty means the tree at `root` is exactly the release.
pub fn find_invalid<'m>(manifest: &'m VersionManifest, root: &Path) -> Vec<&'m FileEntry> {
    manifest
        .files_included
        .iter()
        .filter(|entry| {
            let path = root.join(&entry.local_path);
            let valid = checksum_file(&path).matches(&entry.checksum);
            if !valid {
                debug!("Invalid or missing: {}", path.display());
            }
            !valid
        })
        .collect()
}
