//! Record Store.
//!
//! Owns [`HealthRecord`] entities and their access policies. Policy writes go through
//! [`RecordStore::update_policy`], which is a compare-and-swap on the record's
//! `policy_version`: a writer that read an older version is refused with
//! [`ConsentError::VersionMismatch`] and has to re-read, re-merge and try again. Two grants
//! racing on the same record therefore both land; neither can overwrite the other's principal.
//!
//! The store itself never talks to the crypto service. Resealing is the job of the
//! [`GrantExecutor`](crate::grant::GrantExecutor), which is the only caller of `update_policy`.

use crate::error::{ConsentError, ConsentResult};
use crate::external::{BlobLocator, WrappedKey};
use crate::ids::RecordId;
use crate::policy::AccessPolicy;
use chrono::{DateTime, Utc};
use consent_types::{NonEmptyText, Principal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// An encrypted medical document and the policy governing who may decrypt it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub id: RecordId,
    /// Owning patient. Always a member of `policy`.
    pub patient: Principal,
    /// Principal that performed the upload (the patient, or a doctor on their behalf).
    pub uploaded_by: Principal,
    pub title: NonEmptyText,
    /// Free-form type tag, for example `lab-result` or `imaging`.
    pub record_type: NonEmptyText,
    pub locator: BlobLocator,
    pub wrapped_key: WrappedKey,
    pub policy: AccessPolicy,
    pub size_bytes: u64,
    pub mime_type: Option<NonEmptyText>,
    pub created_at: DateTime<Utc>,
    /// Incremented on every successful policy write.
    pub policy_version: u64,
}

impl HealthRecord {
    /// Whether `principal` may decrypt this record.
    pub fn authorizes(&self, principal: &Principal) -> bool {
        principal == &self.patient || self.policy.contains(principal)
    }
}

/// In-process transactional record table.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: RwLock<HashMap<RecordId, HealthRecord>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Validation`] if the policy owner is not the record's patient, or the
    ///   id is already taken.
    pub fn create(&self, record: HealthRecord) -> ConsentResult<()> {
        if record.policy.owner() != &record.patient {
            return Err(ConsentError::Validation(
                "record policy must be owned by the record's patient".into(),
            ));
        }

        let mut records = self.write()?;
        if records.contains_key(&record.id) {
            return Err(ConsentError::Validation(format!(
                "record {} already exists",
                record.id
            )));
        }
        tracing::debug!(record_id = %record.id, patient = %record.patient, "record created");
        records.insert(record.id, record);
        Ok(())
    }

    pub fn get(&self, id: &RecordId) -> ConsentResult<HealthRecord> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or(ConsentError::RecordNotFound(*id))
    }

    pub fn contains(&self, id: &RecordId) -> ConsentResult<bool> {
        Ok(self.read()?.contains_key(id))
    }

    /// Records owned by `patient`, oldest first.
    pub fn list_by_patient(&self, patient: &Principal) -> ConsentResult<Vec<HealthRecord>> {
        let mut out: Vec<HealthRecord> = self
            .read()?
            .values()
            .filter(|r| &r.patient == patient)
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    /// Records whose policy contains `principal` but which `principal` does not own.
    pub fn list_by_authorized(&self, principal: &Principal) -> ConsentResult<Vec<HealthRecord>> {
        let mut out: Vec<HealthRecord> = self
            .read()?
            .values()
            .filter(|r| &r.patient != principal && r.policy.contains(principal))
            .cloned()
            .collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    /// Replace the policy and wrapped key of a record, provided nobody else wrote it since
    /// `expected_version` was read.
    ///
    /// Returns the updated record (with its new version).
    ///
    /// # Errors
    ///
    /// - [`ConsentError::RecordNotFound`] if the record is gone (for example deleted while a
    ///   grant was resealing).
    /// - [`ConsentError::VersionMismatch`] if another writer got there first.
    /// - [`ConsentError::Validation`] if the new policy has a different owner.
    pub fn update_policy(
        &self,
        id: &RecordId,
        expected_version: u64,
        policy: AccessPolicy,
        wrapped_key: WrappedKey,
    ) -> ConsentResult<HealthRecord> {
        let mut records = self.write()?;
        let record = records
            .get_mut(id)
            .ok_or(ConsentError::RecordNotFound(*id))?;

        if record.policy_version != expected_version {
            return Err(ConsentError::VersionMismatch {
                record_id: *id,
                expected: expected_version,
                found: record.policy_version,
            });
        }
        if policy.owner() != &record.patient {
            return Err(ConsentError::Validation(
                "policy owner cannot change".into(),
            ));
        }

        record.policy = policy;
        record.wrapped_key = wrapped_key;
        record.policy_version += 1;
        Ok(record.clone())
    }

    /// Remove a record. Only the owning patient may delete.
    ///
    /// Cascading to requests is performed by
    /// [`ConsentService::delete_record`](crate::service::ConsentService::delete_record).
    pub fn delete(&self, id: &RecordId, requester: &Principal) -> ConsentResult<HealthRecord> {
        let mut records = self.write()?;
        let record = records.get(id).ok_or(ConsentError::RecordNotFound(*id))?;
        if &record.patient != requester {
            return Err(ConsentError::unauthorized(requester, "delete this record"));
        }
        records
            .remove(id)
            .ok_or(ConsentError::RecordNotFound(*id))
    }

    pub(crate) fn export(&self) -> ConsentResult<Vec<HealthRecord>> {
        let mut out: Vec<HealthRecord> = self.read()?.values().cloned().collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    pub(crate) fn import(&self, records: Vec<HealthRecord>) -> ConsentResult<()> {
        let mut table = self.write()?;
        table.clear();
        table.extend(records.into_iter().map(|r| (r.id, r)));
        Ok(())
    }

    fn read(&self) -> ConsentResult<RwLockReadGuard<'_, HashMap<RecordId, HealthRecord>>> {
        self.records
            .read()
            .map_err(|_| ConsentError::LockPoisoned("records"))
    }

    fn write(&self) -> ConsentResult<RwLockWriteGuard<'_, HashMap<RecordId, HealthRecord>>> {
        self.records
            .write()
            .map_err(|_| ConsentError::LockPoisoned("records"))
    }
}

fn sort_oldest_first(records: &mut [HealthRecord]) {
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn p(s: &str) -> Principal {
        Principal::parse(s).unwrap()
    }

    pub(crate) fn sample_record(patient: &str, co_authorized: &[&str]) -> HealthRecord {
        let patient = p(patient);
        HealthRecord {
            id: RecordId::new(),
            uploaded_by: patient.clone(),
            policy: AccessPolicy::for_owner(patient.clone(), co_authorized.iter().map(|s| p(s))),
            patient,
            title: NonEmptyText::new("Blood panel").unwrap(),
            record_type: NonEmptyText::new("lab-result").unwrap(),
            locator: BlobLocator::new("loc"),
            wrapped_key: WrappedKey::new(vec![0; 4]),
            size_bytes: 4,
            mime_type: None,
            created_at: Utc::now(),
            policy_version: 0,
        }
    }

    #[test]
    fn create_rejects_foreign_policy_owner() {
        let store = RecordStore::new();
        let mut record = sample_record("0xP", &[]);
        record.policy = AccessPolicy::for_owner(p("0xOther"), []);
        assert!(matches!(
            store.create(record),
            Err(ConsentError::Validation(_))
        ));
    }

    #[test]
    fn list_queries_split_owner_and_delegates() {
        let store = RecordStore::new();
        let r1 = sample_record("0xP", &["0xD1"]);
        let r2 = sample_record("0xP", &[]);
        store.create(r1.clone()).unwrap();
        store.create(r2).unwrap();

        assert_eq!(store.list_by_patient(&p("0xp")).unwrap().len(), 2);
        let shared = store.list_by_authorized(&p("0xd1")).unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, r1.id);
        assert!(store.list_by_authorized(&p("0xP")).unwrap().is_empty());
    }

    #[test]
    fn update_policy_refuses_stale_version() {
        let store = RecordStore::new();
        let record = sample_record("0xP", &[]);
        store.create(record.clone()).unwrap();

        let first = store
            .update_policy(
                &record.id,
                0,
                record.policy.with(&p("0xD1")),
                WrappedKey::new(vec![1]),
            )
            .unwrap();
        assert_eq!(first.policy_version, 1);

        let stale = store.update_policy(
            &record.id,
            0,
            record.policy.with(&p("0xD2")),
            WrappedKey::new(vec![2]),
        );
        assert!(matches!(
            stale,
            Err(ConsentError::VersionMismatch {
                expected: 0,
                found: 1,
                ..
            })
        ));

        let current = store.get(&record.id).unwrap();
        assert!(current.policy.contains(&p("0xD1")));
        assert!(!current.policy.contains(&p("0xD2")));
    }

    #[test]
    fn delete_is_owner_only() {
        let store = RecordStore::new();
        let record = sample_record("0xP", &["0xD1"]);
        store.create(record.clone()).unwrap();

        let err = store.delete(&record.id, &p("0xD1")).unwrap_err();
        assert!(matches!(err, ConsentError::Unauthorized { .. }));
        assert!(store.contains(&record.id).unwrap());

        store.delete(&record.id, &p("0xP")).unwrap();
        assert!(matches!(
            store.get(&record.id),
            Err(ConsentError::RecordNotFound(_))
        ));
    }
}
