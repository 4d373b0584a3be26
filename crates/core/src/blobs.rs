//! Filesystem-backed [`BlobStore`] built on the content-addressed `consent-files` crate.

use crate::external::{BlobLocator, BlobStore, ExternalError};
use async_trait::async_trait;
use consent_files::{FilesError, FilesService};
use std::path::Path;

const SERVICE: &str = "blob store";

/// Blob store writing ciphertext under `<data_dir>/blobs/sha256/..`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    files: FilesService,
}

impl FsBlobStore {
    /// Open (creating if needed) a blob store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, ExternalError> {
        std::fs::create_dir_all(root).map_err(|e| ExternalError::Unavailable {
            service: SERVICE,
            message: format!("cannot create {}: {e}", root.display()),
        })?;
        let files = FilesService::new(root).map_err(map_files_error)?;
        Ok(Self { files })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, ciphertext: &[u8]) -> Result<BlobLocator, ExternalError> {
        let metadata = self.files.put(ciphertext).map_err(map_files_error)?;
        Ok(BlobLocator::new(metadata.hash.as_str()))
    }

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, ExternalError> {
        self.files.read(locator.as_str()).map_err(map_files_error)
    }

    async fn delete(&self, locator: &BlobLocator) -> Result<(), ExternalError> {
        self.files.remove(locator.as_str()).map_err(map_files_error)
    }
}

fn map_files_error(err: FilesError) -> ExternalError {
    match err {
        FilesError::NotFound(_) | FilesError::IntegrityMismatch(_) | FilesError::Uuid(_) => {
            ExternalError::Rejected {
                service: SERVICE,
                message: err.to_string(),
            }
        }
        FilesError::InvalidRootDirectory(_) | FilesError::Io(_) => ExternalError::Unavailable {
            service: SERVICE,
            message: err.to_string(),
        },
    }
}
