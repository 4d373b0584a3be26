//! Content-addressed ciphertext storage.
//!
//! Encrypted record bodies are kept out of the record store and written to a flat,
//! content-addressed file tree instead. The record only carries the locator (the SHA-256 of
//! the ciphertext), so the store stays small and the blobs can be backed up independently.
//!
//! ```text
//! <root>/
//! └── sha256/
//!     └── ab/
//!         └── cd/
//!             └── abcd9e…   # full hash as filename
//! ```
//!
//! Blobs are immutable. Writing the same ciphertext twice yields the same locator and does not
//! rewrite the file.
//!
//! ## Example Usage
//!
//! ```no_run
//! use consent_files::FilesService;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = FilesService::new(Path::new("consent_data/blobs"))?;
//! let stored = service.put(b"ciphertext bytes")?;
//! let bytes = service.read(stored.hash.as_str())?;
//! # Ok(())
//! # }
//! ```

mod files;

pub use consent_uuid::Sha256Hash;
pub use files::{detect_media_type, FileMetadata, FilesService};

/// Name of the folder holding SHA-256 addressed blobs under the storage root.
pub const HASH_FOLDER_NAME: &str = "sha256";

/// Errors that can occur during file operations
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    /// Root directory does not exist or is not a directory
    #[error("Invalid root directory: {0}")]
    InvalidRootDirectory(String),

    /// No blob is stored under the requested hash
    #[error("File not found for hash: {0}")]
    NotFound(String),

    /// Stored bytes no longer match their content address
    #[error("Integrity check failed for hash: {0}")]
    IntegrityMismatch(String),

    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed hash supplied as a locator
    #[error("UUID error: {0}")]
    Uuid(#[from] consent_uuid::UuidError),
}
