//! Content-addressed blob storage implementation
//!
//! This module provides [`FilesService`], which stores opaque byte blobs (record ciphertext)
//! under their SHA-256 digest.
//!
//! # Content Addressing
//!
//! - **Deduplication**: Identical blobs are stored once
//! - **Integrity**: Content is verified against its hash on read
//! - **Immutability**: Blobs cannot be modified after creation
//! - **Deterministic paths**: Same content always produces the same path
//!
//! # Security Model
//!
//! - The root path is canonicalised at construction time
//! - Locators are validated as 64-character hex digests before any path is built, so a
//!   caller-supplied locator can never traverse outside the root

use crate::{FilesError, HASH_FOLDER_NAME};
use chrono::{DateTime, Utc};
use consent_types::NonEmptyText;
use consent_uuid::Sha256Hash;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Metadata for a stored blob
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct FileMetadata {
    /// Hexadecimal digest of the blob content
    pub hash: Sha256Hash,

    /// Path relative to the storage root where the blob is stored
    pub relative_path: String,

    /// Size of the blob in bytes
    pub size_bytes: u64,

    /// UTC timestamp when the blob was stored
    pub stored_at: DateTime<Utc>,
}

/// Best-effort media type detection from magic bytes.
///
/// Returns `None` when the content is not recognised. This should not be considered
/// authoritative.
pub fn detect_media_type(bytes: &[u8]) -> Option<NonEmptyText> {
    infer::get(bytes).and_then(|kind| NonEmptyText::new(kind.mime_type()).ok())
}

/// Service for managing blobs under a single storage root
#[derive(Debug, Clone)]
pub struct FilesService {
    /// Canonicalised storage root
    root_directory: PathBuf,
}

impl FilesService {
    /// Creates a new `FilesService` rooted at `root_directory`.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::InvalidRootDirectory` if the root does not exist, is not a
    /// directory, or cannot be canonicalised.
    pub fn new(root_directory: &Path) -> Result<Self, FilesError> {
        if !root_directory.exists() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Directory does not exist: {}",
                root_directory.display()
            )));
        }

        if !root_directory.is_dir() {
            return Err(FilesError::InvalidRootDirectory(format!(
                "Path is not a directory: {}",
                root_directory.display()
            )));
        }

        let root_directory = root_directory.canonicalize().map_err(|e| {
            FilesError::InvalidRootDirectory(format!(
                "Cannot canonicalize path {}: {}",
                root_directory.display(),
                e
            ))
        })?;

        Ok(Self { root_directory })
    }

    /// Stores `bytes` and returns their metadata.
    ///
    /// Storing content that is already present returns the existing locator without
    /// touching the file.
    ///
    /// # Errors
    ///
    /// Returns `FilesError::Io` if the shard directories or the blob cannot be written.
    pub fn put(&self, bytes: &[u8]) -> Result<FileMetadata, FilesError> {
        let hash = hash_bytes(bytes);
        let relative_path = self.compute_relative_path(&hash);
        let storage_path = self.root_directory.join(&relative_path);

        if !storage_path.exists() {
            if let Some(parent) = storage_path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    FilesError::Io(std::io::Error::new(
                        e.kind(),
                        format!(
                            "Failed to create storage directory {}: {}",
                            parent.display(),
                            e
                        ),
                    ))
                })?;
            }

            // The final path only ever holds complete content.
            let tmp_path = storage_path.with_extension("tmp");
            fs::write(&tmp_path, bytes)?;
            fs::rename(&tmp_path, &storage_path)?;
        }

        Ok(FileMetadata {
            hash,
            relative_path,
            size_bytes: bytes.len() as u64,
            stored_at: Utc::now(),
        })
    }

    /// Reads a blob by its hash, verifying the content against the address.
    ///
    /// # Errors
    ///
    /// Returns `FilesError` if:
    /// - the hash is malformed
    /// - no blob is stored under it
    /// - the stored bytes no longer hash to the address
    pub fn read(&self, hash: &str) -> Result<Vec<u8>, FilesError> {
        let hash = Sha256Hash::parse(hash)?;
        let storage_path = self.compute_storage_path(&hash);

        let bytes = match fs::read(&storage_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FilesError::NotFound(hash.to_string()))
            }
            Err(e) => return Err(FilesError::Io(e)),
        };

        if hash_bytes(&bytes) != hash {
            return Err(FilesError::IntegrityMismatch(hash.to_string()));
        }

        Ok(bytes)
    }

    /// Removes a blob. Removing a blob that is already absent is not an error.
    pub fn remove(&self, hash: &str) -> Result<(), FilesError> {
        let hash = Sha256Hash::parse(hash)?;
        match fs::remove_file(self.compute_storage_path(&hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FilesError::Io(e)),
        }
    }

    /// Returns true if a blob is stored under `hash`.
    pub fn contains(&self, hash: &str) -> bool {
        Sha256Hash::parse(hash)
            .map(|h| self.compute_storage_path(&h).is_file())
            .unwrap_or(false)
    }

    /// Returns the canonicalised storage root.
    #[must_use]
    pub fn root_directory(&self) -> &Path {
        &self.root_directory
    }

    fn compute_storage_path(&self, hash: &Sha256Hash) -> PathBuf {
        self.root_directory
            .join(self.compute_relative_path(hash))
    }

    /// `sha256/<shard1>/<shard2>/<hash>`
    fn compute_relative_path(&self, hash: &Sha256Hash) -> String {
        let (shard1, shard2) = hash.shards();
        format!("{}/{}/{}/{}", HASH_FOLDER_NAME, shard1, shard2, hash)
    }
}

fn hash_bytes(bytes: &[u8]) -> Sha256Hash {
    let digest: [u8; 32] = Sha256::digest(bytes).into();
    Sha256Hash::from_bytes(&digest)
}
