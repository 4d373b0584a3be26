//! Service facade.
//!
//! [`ConsentService`] wires the Identity Registry, Record Store, Grant Executor and both request
//! engines together and is what the REST API and CLI talk to. It adds the pieces that span
//! components:
//!
//! - uploading (seal, store ciphertext, create the record) and authorised reads;
//! - record deletion with its cascade onto every referencing request;
//! - revocation, which needs to know what else still covers a (record, doctor) pair;
//! - role checks against the identity directory;
//! - checkpointing the in-memory state to the JSON snapshot after each change.
//!
//! All timestamps are taken from the wall clock here; the engines themselves take `now` as an
//! argument.

use crate::access::{
    AccessDisplayStatus, AccessRequest, AccessRequestEngine, AccessStatus, NewAccessRequest,
};
use crate::config::CoreConfig;
use crate::error::{ConsentError, ConsentResult};
use crate::external::{BlobStore, CryptoService, ExternalError, Sealed};
use crate::grant::{BatchReport, GrantExecutor};
use crate::identity::{Actor, IdentityRegistry};
use crate::ids::{AccessRequestId, RecordId, TransferRequestId};
use crate::policy::AccessPolicy;
use crate::records::{HealthRecord, RecordStore};
use crate::request::{optional_text, required_text};
use crate::snapshot::StateSnapshot;
use crate::transfer::{
    NewTransferRequest, OrganizationSnapshot, TransferRequest, TransferRequestEngine,
};
use chrono::{DateTime, Utc};
use consent_files::detect_media_type;
use consent_types::{Principal, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Input for [`ConsentService::upload_record`].
#[derive(Clone, Debug)]
pub struct UploadRecord {
    pub patient: Principal,
    pub title: String,
    pub record_type: String,
    pub content: Vec<u8>,
    /// Detected from the content when absent.
    pub mime_type: Option<String>,
    pub co_authorized: Vec<Principal>,
}

/// A record together with its ciphertext, returned to authorised principals only.
#[derive(Clone, Debug)]
pub struct RecordCiphertext {
    pub record: HealthRecord,
    pub ciphertext: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionReport {
    pub record_id: RecordId,
    pub access_requests_flagged: usize,
    pub transfer_requests_flagged: usize,
    pub blob_removed: bool,
}

/// Which slice of the transfer table a caller wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferQuery {
    /// Doctor A's inbox.
    Incoming,
    /// Doctor B's requests.
    Outgoing,
    /// Waiting on the patient.
    Actionable,
    /// Everything the patient has been involved in.
    History,
}

pub struct ConsentService {
    identities: Arc<IdentityRegistry>,
    records: Arc<RecordStore>,
    blobs: Arc<dyn BlobStore>,
    crypto: Arc<dyn CryptoService>,
    crypto_timeout: Duration,
    access: AccessRequestEngine,
    transfers: TransferRequestEngine,
    snapshot_path: Option<PathBuf>,
    checkpoint_lock: Mutex<()>,
}

impl std::fmt::Debug for ConsentService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentService")
            .field("identities", &self.identities)
            .field("access", &self.access)
            .field("transfers", &self.transfers)
            .field("snapshot_path", &self.snapshot_path)
            .finish_non_exhaustive()
    }
}

impl ConsentService {
    /// Build the service from its collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if `cfg` fails [`CoreConfig::validate`].
    pub fn new(
        cfg: &CoreConfig,
        identities: Arc<IdentityRegistry>,
        blobs: Arc<dyn BlobStore>,
        crypto: Arc<dyn CryptoService>,
    ) -> ConsentResult<Self> {
        cfg.validate()?;
        let records = Arc::new(RecordStore::new());
        let executor = GrantExecutor::new(records.clone(), crypto.clone(), cfg);
        Ok(Self {
            access: AccessRequestEngine::new(records.clone(), executor.clone(), cfg.min_purpose_len()),
            transfers: TransferRequestEngine::new(records.clone(), executor, cfg.min_purpose_len()),
            identities,
            records,
            blobs,
            crypto,
            crypto_timeout: cfg.reseal_timeout(),
            snapshot_path: None,
            checkpoint_lock: Mutex::new(()),
        })
    }

    /// Checkpoint to `path` after every state change.
    pub fn with_snapshot(mut self, path: PathBuf) -> Self {
        self.snapshot_path = Some(path);
        self
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn access(&self) -> &AccessRequestEngine {
        &self.access
    }

    pub fn transfers(&self) -> &TransferRequestEngine {
        &self.transfers
    }

    // ----- records -----

    /// Seal `upload.content` for the patient (plus co-authorised principals), store the
    /// ciphertext and create the record.
    ///
    /// A patient uploads their own records. A doctor may upload on a patient's behalf and is
    /// then co-authorised on the new record.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Unauthorized`] for admins, or a patient uploading for someone else.
    /// - [`ConsentError::Validation`] for blank title/type, empty content, or a target that
    ///   the directory does not know as a patient.
    /// - [`ConsentError::External`] if sealing or the blob store fails.
    pub async fn upload_record(&self, actor: &Actor, upload: UploadRecord) -> ConsentResult<HealthRecord> {
        let mut co_authorized = upload.co_authorized;
        match actor.role {
            Role::Patient if actor.principal == upload.patient => {}
            Role::Doctor if actor.principal != upload.patient => {
                self.identities.check_role(&upload.patient, Role::Patient)?;
                co_authorized.push(actor.principal.clone());
            }
            _ => return Err(ConsentError::unauthorized(&actor.principal, "upload this record")),
        }

        let title = required_text("title", &upload.title)?;
        let record_type = required_text("record type", &upload.record_type)?;
        if upload.content.is_empty() {
            return Err(ConsentError::Validation("record content is empty".into()));
        }
        let mime_type = match optional_text("mime type", upload.mime_type.as_deref())? {
            Some(mime) => Some(mime),
            None => detect_media_type(&upload.content),
        };

        let policy = AccessPolicy::for_owner(upload.patient.clone(), co_authorized);
        let sealed = self.seal(&upload.content, &policy).await?;
        let locator = self.blobs.put(&sealed.ciphertext).await?;

        let record = HealthRecord {
            id: RecordId::new(),
            patient: upload.patient,
            uploaded_by: actor.principal.clone(),
            title,
            record_type,
            locator,
            wrapped_key: sealed.wrapped_key,
            policy,
            size_bytes: upload.content.len() as u64,
            mime_type,
            created_at: Utc::now(),
            policy_version: 0,
        };
        if let Err(err) = self.records.create(record.clone()) {
            if let Err(cleanup) = self.blobs.delete(&record.locator).await {
                tracing::warn!(locator = %record.locator, error = %cleanup, "orphaned blob after failed create");
            }
            return Err(err);
        }

        tracing::info!(
            record_id = %record.id,
            patient = %record.patient,
            uploaded_by = %record.uploaded_by,
            size_bytes = record.size_bytes,
            "record uploaded"
        );
        self.checkpoint();
        Ok(record)
    }

    /// Ciphertext and wrapped key for a principal in the record's policy.
    pub async fn fetch_ciphertext(&self, actor: &Actor, record_id: &RecordId) -> ConsentResult<RecordCiphertext> {
        let record = self.records.get(record_id)?;
        if !record.authorizes(&actor.principal) {
            return Err(ConsentError::unauthorized(&actor.principal, "read this record"));
        }
        let ciphertext = self.blobs.get(&record.locator).await?;
        Ok(RecordCiphertext { record, ciphertext })
    }

    /// Patients see what they own; doctors see what has been shared with them.
    pub fn list_records(&self, actor: &Actor) -> ConsentResult<Vec<HealthRecord>> {
        match actor.role {
            Role::Patient => self.records.list_by_patient(&actor.principal),
            Role::Doctor => self.records.list_by_authorized(&actor.principal),
            Role::Admin => Err(ConsentError::unauthorized(&actor.principal, "list records")),
        }
    }

    /// Delete a record and flag it on every request that references it.
    ///
    /// The ciphertext is removed last and on a best-effort basis: once the record row is gone
    /// nothing can reach the blob, so a failed blob delete is logged rather than surfaced.
    pub async fn delete_record(&self, actor: &Actor, record_id: &RecordId) -> ConsentResult<DeletionReport> {
        actor.require_role(Role::Patient, "delete records")?;
        let record = self.records.delete(record_id, &actor.principal)?;
        let now = Utc::now();

        let access_requests_flagged = self.access.mark_record_deleted(record_id)?;
        let transfer_requests_flagged = self.transfers.mark_record_deleted(record_id, now)?;

        let blob_removed = match self.blobs.delete(&record.locator).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(%record_id, locator = %record.locator, error = %err, "blob cleanup failed");
                false
            }
        };

        tracing::info!(
            %record_id,
            access_requests_flagged,
            transfer_requests_flagged,
            "record deleted"
        );
        self.checkpoint();
        Ok(DeletionReport {
            record_id: *record_id,
            access_requests_flagged,
            transfer_requests_flagged,
            blob_removed,
        })
    }

    // ----- access requests -----

    pub fn create_access_request(&self, actor: &Actor, new: NewAccessRequest) -> ConsentResult<AccessRequest> {
        self.identities.check_role(&new.patient, Role::Patient)?;
        let created = self.access.create(actor, new, Utc::now())?;
        self.checkpoint();
        Ok(created)
    }

    pub fn create_access_draft(&self, actor: &Actor, new: NewAccessRequest) -> ConsentResult<AccessRequest> {
        self.identities.check_role(&new.patient, Role::Patient)?;
        let created = self.access.create_draft(actor, new, Utc::now())?;
        self.checkpoint();
        Ok(created)
    }

    pub fn send_access_request(&self, actor: &Actor, id: &AccessRequestId) -> ConsentResult<AccessRequest> {
        let sent = self.access.send(actor, id, Utc::now())?;
        self.checkpoint();
        Ok(sent)
    }

    pub async fn approve_access_request(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        expires_at: Option<DateTime<Utc>>,
    ) -> ConsentResult<AccessRequest> {
        let approved = self.access.approve(actor, id, expires_at, Utc::now()).await?;
        self.checkpoint();
        Ok(approved)
    }

    pub fn deny_access_request(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        reason: Option<&str>,
    ) -> ConsentResult<AccessRequest> {
        let denied = self.access.deny(actor, id, reason, Utc::now())?;
        self.checkpoint();
        Ok(denied)
    }

    /// Withdraw an approval. The doctor keeps records still covered by a granted transfer,
    /// another live approved request, or their own upload.
    pub async fn revoke_access_request(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
    ) -> ConsentResult<(AccessRequest, BatchReport)> {
        let doctor = self.access.get(id)?.doctor;
        let mut still_covered: HashSet<RecordId> = self.transfers.granted_records(&doctor)?;
        still_covered.extend(
            self.records
                .list_by_authorized(&doctor)?
                .into_iter()
                .filter(|r| r.uploaded_by == doctor)
                .map(|r| r.id),
        );

        let outcome = self
            .access
            .revoke(actor, id, &still_covered, Utc::now())
            .await?;
        self.checkpoint();
        Ok(outcome)
    }

    pub async fn retry_access_grants(&self, actor: &Actor, id: &AccessRequestId) -> ConsentResult<AccessRequest> {
        let retried = self.access.retry_grants(actor, id, Utc::now()).await?;
        self.checkpoint();
        Ok(retried)
    }

    /// A request visible to `actor` (its patient or its doctor).
    pub fn access_request(&self, actor: &Actor, id: &AccessRequestId) -> ConsentResult<AccessRequest> {
        let request = self.access.get(id)?;
        let visible = match actor.role {
            Role::Patient => request.patient == actor.principal && request.status != AccessStatus::Draft,
            Role::Doctor => request.doctor == actor.principal,
            Role::Admin => true,
        };
        if !visible {
            return Err(ConsentError::unauthorized(&actor.principal, "view this access request"));
        }
        Ok(request)
    }

    pub fn access_requests_for(
        &self,
        actor: &Actor,
        status: Option<AccessDisplayStatus>,
    ) -> ConsentResult<Vec<AccessRequest>> {
        let now = Utc::now();
        match actor.role {
            Role::Patient => self.access.list_for_patient(&actor.principal, status, now),
            Role::Doctor => self.access.list_for_doctor(&actor.principal, status, now),
            Role::Admin => Err(ConsentError::unauthorized(&actor.principal, "list access requests")),
        }
    }

    // ----- transfer requests -----

    /// Open a transfer, snapshotting both doctors' organisation names.
    pub fn create_transfer_request(&self, actor: &Actor, new: NewTransferRequest) -> ConsentResult<TransferRequest> {
        self.identities.check_role(&new.patient, Role::Patient)?;
        self.identities.check_role(&new.source_doctor, Role::Doctor)?;
        let organizations = OrganizationSnapshot {
            requesting: self.identities.organization(&actor.principal)?,
            source: self.identities.organization(&new.source_doctor)?,
        };
        let created = self
            .transfers
            .create(actor, new, organizations, Utc::now())?;
        self.checkpoint();
        Ok(created)
    }

    pub fn reject_transfer(&self, actor: &Actor, id: &TransferRequestId, reason: &str) -> ConsentResult<TransferRequest> {
        let rejected = self.transfers.reject(actor, id, reason, Utc::now())?;
        self.checkpoint();
        Ok(rejected)
    }

    pub fn attach_transfer_upload(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        record_id: &RecordId,
        title: Option<&str>,
    ) -> ConsentResult<TransferRequest> {
        let attached = self
            .transfers
            .attach_upload(actor, id, record_id, title, Utc::now())?;
        self.checkpoint();
        Ok(attached)
    }

    pub async fn approve_transfer(&self, actor: &Actor, id: &TransferRequestId) -> ConsentResult<TransferRequest> {
        let approved = self.transfers.approve(actor, id, Utc::now()).await?;
        self.checkpoint();
        Ok(approved)
    }

    pub fn deny_transfer(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        reason: Option<&str>,
    ) -> ConsentResult<TransferRequest> {
        let denied = self.transfers.deny(actor, id, reason, Utc::now())?;
        self.checkpoint();
        Ok(denied)
    }

    pub async fn retry_transfer_grant(&self, actor: &Actor, id: &TransferRequestId) -> ConsentResult<TransferRequest> {
        let retried = self.transfers.retry_grant(actor, id, Utc::now()).await?;
        self.checkpoint();
        Ok(retried)
    }

    /// A transfer visible to one of its three parties (or an admin).
    pub fn transfer_request(&self, actor: &Actor, id: &TransferRequestId) -> ConsentResult<TransferRequest> {
        let request = self.transfers.get(id)?;
        let visible = actor.role == Role::Admin
            || [&request.patient, &request.requesting_doctor, &request.source_doctor]
                .contains(&&actor.principal);
        if !visible {
            return Err(ConsentError::unauthorized(&actor.principal, "view this transfer"));
        }
        Ok(request)
    }

    pub fn transfers_for(&self, actor: &Actor, query: TransferQuery) -> ConsentResult<Vec<TransferRequest>> {
        match (actor.role, query) {
            (Role::Doctor, TransferQuery::Incoming) => self.transfers.incoming(&actor.principal),
            (Role::Doctor, TransferQuery::Outgoing) => self.transfers.outgoing(&actor.principal),
            (Role::Patient, TransferQuery::Actionable) => {
                self.transfers.actionable(&actor.principal, Utc::now())
            }
            (Role::Patient, TransferQuery::History) => self.transfers.history(&actor.principal),
            _ => Err(ConsentError::unauthorized(&actor.principal, "run this transfer query")),
        }
    }

    // ----- persistence -----

    pub fn snapshot(&self) -> ConsentResult<StateSnapshot> {
        Ok(StateSnapshot::new(
            self.records.export()?,
            self.access.export()?,
            self.transfers.export()?,
        ))
    }

    /// Replace the in-memory state with `snapshot`.
    pub fn restore(&self, snapshot: StateSnapshot) -> ConsentResult<()> {
        tracing::info!(
            records = snapshot.records.len(),
            access_requests = snapshot.access_requests.len(),
            transfer_requests = snapshot.transfer_requests.len(),
            "restoring state"
        );
        self.records.import(snapshot.records)?;
        self.access.import(snapshot.access_requests)?;
        self.transfers.import(snapshot.transfer_requests)
    }

    /// Load the configured snapshot file if there is one. Returns whether state was restored.
    pub fn load(&self) -> ConsentResult<bool> {
        let Some(path) = &self.snapshot_path else {
            return Ok(false);
        };
        match StateSnapshot::load(path)? {
            Some(snapshot) => {
                self.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Write the configured snapshot file now. A no-op when no snapshot path is set.
    pub fn persist(&self) -> ConsentResult<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let _serialised = self
            .checkpoint_lock
            .lock()
            .map_err(|_| ConsentError::LockPoisoned("checkpoint"))?;
        self.snapshot()?.save(path)
    }

    fn checkpoint(&self) {
        if let Err(err) = self.persist() {
            tracing::error!(error = %err, "failed to checkpoint state");
        }
    }

    async fn seal(&self, plaintext: &[u8], policy: &AccessPolicy) -> ConsentResult<Sealed> {
        match tokio::time::timeout(self.crypto_timeout, self.crypto.seal(plaintext, policy)).await {
            Ok(sealed) => Ok(sealed?),
            Err(_) => Err(ExternalError::Timeout {
                service: "crypto service",
                after: self.crypto_timeout,
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::FsBlobStore;
    use crate::identity::{Identity, IdentityCache, StaticDirectory};
    use crate::keyring::DevKeyring;
    use consent_types::NonEmptyText;
    use tempfile::TempDir;

    fn p(s: &str) -> Principal {
        Principal::parse(s).unwrap()
    }

    fn identity(principal: &str, role: Role, org: Option<&str>) -> Identity {
        Identity {
            principal: p(principal),
            role,
            display_name: NonEmptyText::new(principal).unwrap(),
            organization: org.map(|o| NonEmptyText::new(o).unwrap()),
        }
    }

    fn service(temp: &TempDir) -> ConsentService {
        let cfg = CoreConfig::new(temp.path().to_path_buf());
        let directory = StaticDirectory::new([
            identity("0xP", Role::Patient, None),
            identity("0xA", Role::Doctor, Some("General Hospital")),
            identity("0xB", Role::Doctor, Some("City Clinic")),
        ]);
        let identities = Arc::new(IdentityRegistry::new(Arc::new(directory), IdentityCache::disabled()));
        let blobs = Arc::new(FsBlobStore::open(&cfg.blobs_dir()).unwrap());
        ConsentService::new(&cfg, identities, blobs, Arc::new(DevKeyring::random()))
            .unwrap()
            .with_snapshot(cfg.snapshot_path())
    }

    fn upload(patient: &str) -> UploadRecord {
        UploadRecord {
            patient: p(patient),
            title: "X-ray".into(),
            record_type: "imaging".into(),
            content: b"%PDF-1.4 pretend".to_vec(),
            mime_type: None,
            co_authorized: vec![],
        }
    }

    #[tokio::test]
    async fn test_doctor_upload_is_co_authorised() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let doctor = Actor::doctor(p("0xA"));

        let record = svc.upload_record(&doctor, upload("0xP")).await.unwrap();
        assert!(record.policy.authorizes_only(&p("0xA")));
        assert_eq!(record.mime_type.as_ref().map(|m| m.as_str()), Some("application/pdf"));

        let fetched = svc.fetch_ciphertext(&doctor, &record.id).await.unwrap();
        assert_eq!(fetched.ciphertext.len(), record.size_bytes as usize);
        assert!(svc
            .fetch_ciphertext(&Actor::doctor(p("0xB")), &record.id)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upload_refuses_foreign_patient_and_unknown_target() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);

        let err = svc
            .upload_record(&Actor::patient(p("0xQ")), upload("0xP"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::Unauthorized { .. }));

        // 0xB is registered as a doctor.
        let err = svc
            .upload_record(&Actor::doctor(p("0xA")), upload("0xB"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_and_checkpoints() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let patient = Actor::patient(p("0xP"));
        let record = svc.upload_record(&patient, upload("0xP")).await.unwrap();

        let request = svc
            .create_access_request(
                &Actor::doctor(p("0xB")),
                NewAccessRequest {
                    patient: p("0xP"),
                    record_ids: vec![record.id],
                    purpose: "Second opinion on imaging".into(),
                    urgency: Default::default(),
                    requested_duration_days: None,
                },
            )
            .unwrap();

        assert!(svc.delete_record(&Actor::doctor(p("0xB")), &record.id).await.is_err());
        let report = svc.delete_record(&patient, &record.id).await.unwrap();
        assert_eq!(report.access_requests_flagged, 1);
        assert!(report.blob_removed);

        let flagged = svc.access_request(&patient, &request.id).unwrap();
        assert!(flagged.deleted_record_ids.contains(&record.id));

        let restored = service(&temp);
        assert!(restored.load().unwrap());
        assert!(restored.records().get(&record.id).is_err());
        assert_eq!(restored.access().get(&request.id).unwrap(), flagged);
    }

    #[tokio::test]
    async fn test_transfer_snapshots_organisations() {
        let temp = TempDir::new().unwrap();
        let svc = service(&temp);
        let transfer = svc
            .create_transfer_request(
                &Actor::doctor(p("0xB")),
                NewTransferRequest {
                    patient: p("0xP"),
                    source_doctor: p("0xA"),
                    description: "Latest ECG".into(),
                    purpose: "Cardiology referral".into(),
                    urgency: Default::default(),
                    expires_at: None,
                },
            )
            .unwrap();
        assert_eq!(
            transfer.requesting_organization.unwrap().as_str(),
            "City Clinic"
        );
        assert_eq!(
            transfer.source_organization.unwrap().as_str(),
            "General Hospital"
        );
        assert!(svc
            .transfers_for(&Actor::doctor(p("0xB")), TransferQuery::Actionable)
            .is_err());
        assert_eq!(
            svc.transfers_for(&Actor::doctor(p("0xA")), TransferQuery::Incoming)
                .unwrap()
                .len(),
            1
        );
    }
}
