//! JSON state snapshot.
//!
//! The relational store is an external concern; for the binaries the whole state is kept in
//! memory and checkpointed to a single pretty-printed JSON file. Writes go to a sibling temp
//! file first and are renamed into place, so a reader never sees a half-written snapshot.

use crate::access::AccessRequest;
use crate::error::{ConsentError, ConsentResult};
use crate::records::HealthRecord;
use crate::transfer::TransferRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub format_version: u32,
    pub saved_at: DateTime<Utc>,
    pub records: Vec<HealthRecord>,
    pub access_requests: Vec<AccessRequest>,
    pub transfer_requests: Vec<TransferRequest>,
}

impl StateSnapshot {
    pub fn new(
        records: Vec<HealthRecord>,
        access_requests: Vec<AccessRequest>,
        transfer_requests: Vec<TransferRequest>,
    ) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            records,
            access_requests,
            transfer_requests,
        }
    }

    /// Write the snapshot to `path`, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> ConsentResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConsentError::FileWrite)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(ConsentError::Serialization)?;

        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = Path::new(&temp_name);
        fs::write(temp_path, json).map_err(ConsentError::FileWrite)?;
        fs::rename(temp_path, path).map_err(ConsentError::FileWrite)?;

        tracing::debug!(
            path = %path.display(),
            records = self.records.len(),
            access_requests = self.access_requests.len(),
            transfer_requests = self.transfer_requests.len(),
            "snapshot saved"
        );
        Ok(())
    }

    /// Read a snapshot. A missing file is `Ok(None)`.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::FileRead`] if the file exists but cannot be read.
    /// - [`ConsentError::Deserialization`] if the JSON is malformed.
    /// - [`ConsentError::SnapshotVersion`] if it was written by an incompatible format.
    pub fn load(path: &Path) -> ConsentResult<Option<Self>> {
        let json = match fs::read_to_string(path) {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(ConsentError::FileRead(err)),
        };
        let snapshot: StateSnapshot =
            serde_json::from_str(&json).map_err(ConsentError::Deserialization)?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(ConsentError::SnapshotVersion(snapshot.format_version));
        }
        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::tests::sample_record;
    use tempfile::TempDir;

    #[test]
    fn test_missing_snapshot_is_none() {
        let temp = TempDir::new().unwrap();
        assert!(StateSnapshot::load(&temp.path().join("state.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_save_then_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("state.json");
        let snapshot = StateSnapshot::new(vec![sample_record("0xP", &["0xD"])], vec![], vec![]);

        snapshot.save(&path).unwrap();
        assert!(!temp.path().join("nested").join("state.json.tmp").exists());
        assert_eq!(StateSnapshot::load(&path).unwrap(), Some(snapshot));
    }

    #[test]
    fn test_unknown_format_version_is_refused() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state.json");
        let mut snapshot = StateSnapshot::new(vec![], vec![], vec![]);
        snapshot.format_version = 99;
        snapshot.save(&path).unwrap();

        assert!(matches!(
            StateSnapshot::load(&path),
            Err(ConsentError::SnapshotVersion(99))
        ));
    }
}
