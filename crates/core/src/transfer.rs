//! Transfer Request Engine.
//!
//! Doctor B asks doctor A for a patient's document; the patient has to sign off before B can
//! decrypt it. The aggregate carries two independent status fields:
//!
//! ```text
//! source_status:  awaiting_upload ─┬─reject──▶ rejected          (terminal)
//!                                  └─attach──▶ uploaded ─┬─▶ granted
//!                                                        └─▶ failed ──retry──▶ granted
//! patient_status: pending ─┬─approve──▶ approved
//!                          └─deny─────▶ denied
//! ```
//!
//! The patient can act only while `uploaded` + `pending`. A successful approval moves both
//! fields in one write, so `granted` is never observed without `approved`. Denial leaves
//! `source_status` alone.

use crate::error::{ConsentError, ConsentResult};
use crate::grant::GrantExecutor;
use crate::identity::Actor;
use crate::ids::{RecordId, TransferRequestId};
use crate::inflight::InFlight;
use crate::records::RecordStore;
use crate::request::{deleted_title, optional_text, purpose_text, required_text, Urgency};
use chrono::{DateTime, Utc};
use consent_types::{NonEmptyText, Principal, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Failure reason recorded when an uploaded document is deleted before the patient decides.
pub const DELETED_ATTACHMENT_REASON: &str = "attached record was deleted";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    AwaitingUpload,
    Uploaded,
    Rejected,
    Granted,
    Failed,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::AwaitingUpload => "awaiting_upload",
            SourceStatus::Uploaded => "uploaded",
            SourceStatus::Rejected => "rejected",
            SourceStatus::Granted => "granted",
            SourceStatus::Failed => "failed",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientStatus {
    Pending,
    Approved,
    Denied,
}

impl PatientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatientStatus::Pending => "pending",
            PatientStatus::Approved => "approved",
            PatientStatus::Denied => "denied",
        }
    }
}

/// Single label for lists, derived from both status fields and the clock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferPhase {
    AwaitingUpload,
    Rejected,
    AwaitingPatient,
    Denied,
    Granted,
    Failed,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub id: TransferRequestId,
    pub patient: Principal,
    /// Doctor B, who wants the document.
    pub requesting_doctor: Principal,
    /// Doctor A, who holds it.
    pub source_doctor: Principal,
    pub description: NonEmptyText,
    pub purpose: NonEmptyText,
    pub urgency: Urgency,
    pub requesting_organization: Option<NonEmptyText>,
    pub source_organization: Option<NonEmptyText>,
    pub source_status: SourceStatus,
    pub patient_status: PatientStatus,
    /// Empty until A uploads, then fixed.
    pub record_ids: Vec<RecordId>,
    pub attached_titles: Vec<String>,
    #[serde(default)]
    pub deleted_record_ids: BTreeSet<RecordId>,
    pub rejection_reason: Option<NonEmptyText>,
    pub denial_reason: Option<NonEmptyText>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_updated_at: Option<DateTime<Utc>>,
    pub patient_updated_at: Option<DateTime<Utc>>,
}

impl TransferRequest {
    /// Still waiting on doctor A or on the patient.
    pub fn awaiting_action(&self) -> bool {
        matches!(
            (self.source_status, self.patient_status),
            (SourceStatus::AwaitingUpload, PatientStatus::Pending)
                | (SourceStatus::Uploaded, PatientStatus::Pending)
        )
    }

    /// Pure: past `expires_at` while still awaiting action.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_action() && self.expires_at.is_some_and(|at| at < now)
    }

    pub fn is_patient_actionable(&self, now: DateTime<Utc>) -> bool {
        self.source_status == SourceStatus::Uploaded
            && self.patient_status == PatientStatus::Pending
            && !self.is_expired(now)
    }

    pub fn phase(&self, now: DateTime<Utc>) -> TransferPhase {
        if self.is_expired(now) {
            return TransferPhase::Expired;
        }
        match (self.source_status, self.patient_status) {
            (SourceStatus::Rejected, _) => TransferPhase::Rejected,
            (_, PatientStatus::Denied) => TransferPhase::Denied,
            (SourceStatus::AwaitingUpload, _) => TransferPhase::AwaitingUpload,
            (SourceStatus::Uploaded, _) => TransferPhase::AwaitingPatient,
            (SourceStatus::Granted, _) => TransferPhase::Granted,
            (SourceStatus::Failed, _) => TransferPhase::Failed,
        }
    }

    pub fn view(self, now: DateTime<Utc>) -> TransferRequestView {
        TransferRequestView {
            phase: self.phase(now),
            patient_actionable: self.is_patient_actionable(now),
            request: self,
        }
    }

    fn state_label(&self) -> String {
        format!(
            "{}/{}",
            self.source_status.as_str(),
            self.patient_status.as_str()
        )
    }

    fn refuse_if_expired(&self, now: DateTime<Utc>, action: &'static str) -> ConsentResult<()> {
        if self.is_expired(now) {
            return Err(ConsentError::invalid_transition("expired", action));
        }
        Ok(())
    }

    fn refuse_if_attachment_deleted(&self, action: &'static str) -> ConsentResult<()> {
        if self.record_ids.iter().any(|r| self.deleted_record_ids.contains(r)) {
            return Err(ConsentError::invalid_transition("attached record deleted", action));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TransferRequestView {
    #[serde(flatten)]
    pub request: TransferRequest,
    pub phase: TransferPhase,
    pub patient_actionable: bool,
}

/// Input for [`TransferRequestEngine::create`].
#[derive(Clone, Debug, Deserialize)]
pub struct NewTransferRequest {
    pub patient: Principal,
    pub source_doctor: Principal,
    pub description: String,
    pub purpose: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Organisation names captured when a transfer is created.
#[derive(Clone, Debug, Default)]
pub struct OrganizationSnapshot {
    pub requesting: Option<NonEmptyText>,
    pub source: Option<NonEmptyText>,
}

pub struct TransferRequestEngine {
    requests: RwLock<HashMap<TransferRequestId, TransferRequest>>,
    in_flight: InFlight<TransferRequestId>,
    store: Arc<RecordStore>,
    executor: GrantExecutor,
    min_purpose_len: usize,
}

impl fmt::Debug for TransferRequestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequestEngine")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl TransferRequestEngine {
    pub fn new(store: Arc<RecordStore>, executor: GrantExecutor, min_purpose_len: usize) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            in_flight: InFlight::default(),
            store,
            executor,
            min_purpose_len,
        }
    }

    /// Doctor B opens a transfer naming the patient and doctor A.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Unauthorized`] unless the actor is a doctor.
    /// - [`ConsentError::Validation`] if B names themselves (or the patient) as source, the
    ///   description is blank, the purpose is short or the expiry is not in the future.
    pub fn create(
        &self,
        actor: &Actor,
        new: NewTransferRequest,
        organizations: OrganizationSnapshot,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        actor.require_role(Role::Doctor, "request a transfer")?;
        if new.source_doctor == actor.principal {
            return Err(ConsentError::Validation(
                "source doctor must differ from the requesting doctor".into(),
            ));
        }
        if new.patient == actor.principal || new.patient == new.source_doctor {
            return Err(ConsentError::Validation(
                "patient must differ from both doctors".into(),
            ));
        }
        let description = required_text("description", &new.description)?;
        let purpose = purpose_text(&new.purpose, self.min_purpose_len)?;
        if new.expires_at.is_some_and(|at| at <= now) {
            return Err(ConsentError::Validation(
                "expiry must be in the future".into(),
            ));
        }

        let request = TransferRequest {
            id: TransferRequestId::new(),
            patient: new.patient,
            requesting_doctor: actor.principal.clone(),
            source_doctor: new.source_doctor,
            description,
            purpose,
            urgency: new.urgency,
            requesting_organization: organizations.requesting,
            source_organization: organizations.source,
            source_status: SourceStatus::AwaitingUpload,
            patient_status: PatientStatus::Pending,
            record_ids: Vec::new(),
            attached_titles: Vec::new(),
            deleted_record_ids: BTreeSet::new(),
            rejection_reason: None,
            denial_reason: None,
            failure_reason: None,
            created_at: now,
            expires_at: new.expires_at,
            source_updated_at: None,
            patient_updated_at: None,
        };

        self.write()?.insert(request.id, request.clone());
        tracing::info!(
            transfer_id = %request.id,
            patient = %request.patient,
            requesting_doctor = %request.requesting_doctor,
            source_doctor = %request.source_doctor,
            "transfer request created"
        );
        Ok(request)
    }

    /// Doctor A declines to provide the document. Terminal.
    pub fn reject(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        let reason = required_text("rejection reason", reason)?;
        let rejected = self.modify(id, |request| {
            actor.require(&request.source_doctor, Role::Doctor, "reject this transfer")?;
            if request.source_status != SourceStatus::AwaitingUpload {
                return Err(ConsentError::invalid_transition(request.state_label(), "reject"));
            }
            request.refuse_if_expired(now, "reject")?;
            request.source_status = SourceStatus::Rejected;
            request.rejection_reason = Some(reason);
            request.source_updated_at = Some(now);
            Ok(())
        })?;
        tracing::info!(transfer_id = %id, "transfer rejected by source doctor");
        Ok(rejected)
    }

    /// Doctor A attaches the uploaded record.
    ///
    /// The record must belong to the transfer's patient and its policy must authorise only A
    /// besides the patient. `title` overrides the record's own title in the snapshot.
    pub fn attach_upload(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        record_id: &RecordId,
        title: Option<&str>,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        let title = optional_text("title", title)?;
        let record = match self.store.get(record_id) {
            Ok(record) => record,
            Err(ConsentError::RecordNotFound(_)) => {
                return Err(ConsentError::Validation(format!(
                    "record {record_id} does not exist"
                )))
            }
            Err(err) => return Err(err),
        };

        let attached = self.modify(id, |request| {
            actor.require(&request.source_doctor, Role::Doctor, "attach an upload to this transfer")?;
            if request.source_status != SourceStatus::AwaitingUpload {
                return Err(ConsentError::invalid_transition(request.state_label(), "attach an upload"));
            }
            request.refuse_if_expired(now, "attach an upload")?;
            // Checked under the transfer lock so a concurrent delete either wins here or finds
            // this request when it flags references.
            if !self.store.contains(record_id)? {
                return Err(ConsentError::Validation(format!(
                    "record {record_id} does not exist"
                )));
            }
            if record.patient != request.patient {
                return Err(ConsentError::Validation(format!(
                    "record {record_id} does not belong to {}",
                    request.patient
                )));
            }
            if !record.policy.authorizes_only(&request.source_doctor) {
                return Err(ConsentError::Validation(format!(
                    "record {record_id} must be shared with the source doctor only"
                )));
            }
            request.record_ids = vec![*record_id];
            request.attached_titles = vec![title
                .map(|t| t.to_string())
                .unwrap_or_else(|| record.title.to_string())];
            request.source_status = SourceStatus::Uploaded;
            request.source_updated_at = Some(now);
            Ok(())
        })?;
        tracing::info!(transfer_id = %id, %record_id, "transfer upload attached");
        Ok(attached)
    }

    /// Patient approves: grant doctor B on the attached record.
    ///
    /// On success both fields move together to `granted` + `approved`. On failure the decision
    /// still lands (`approved`) and the source side becomes `failed` with the reason; see
    /// [`Self::retry_grant`].
    pub async fn approve(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let request = self.get(id)?;
        actor.require(&request.patient, Role::Patient, "approve this transfer")?;
        if !(request.source_status == SourceStatus::Uploaded
            && request.patient_status == PatientStatus::Pending)
        {
            return Err(ConsentError::invalid_transition(request.state_label(), "approve"));
        }
        request.refuse_if_expired(now, "approve")?;

        let failure = self.deliver(&request).await;
        let updated = self.modify(id, |stored| {
            stored.refuse_if_attachment_deleted("approve")?;
            stored.patient_status = PatientStatus::Approved;
            stored.patient_updated_at = Some(now);
            apply_delivery(stored, failure.clone(), now);
            Ok(())
        })?;
        log_delivery(&updated, "transfer approved");
        Ok(updated)
    }

    /// Patient denies. `source_status` is left as it is.
    pub fn deny(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let reason = optional_text("denial reason", reason)?;
        let denied = self.modify(id, |request| {
            actor.require(&request.patient, Role::Patient, "deny this transfer")?;
            if !(request.source_status == SourceStatus::Uploaded
                && request.patient_status == PatientStatus::Pending)
            {
                return Err(ConsentError::invalid_transition(request.state_label(), "deny"));
            }
            request.refuse_if_expired(now, "deny")?;
            request.patient_status = PatientStatus::Denied;
            request.denial_reason = reason;
            request.patient_updated_at = Some(now);
            Ok(())
        })?;
        tracing::info!(transfer_id = %id, "transfer denied by patient");
        Ok(denied)
    }

    /// Re-run a failed grant without asking the patient again. The patient or an admin may
    /// retry.
    pub async fn retry_grant(
        &self,
        actor: &Actor,
        id: &TransferRequestId,
        now: DateTime<Utc>,
    ) -> ConsentResult<TransferRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let request = self.get(id)?;
        let allowed = actor.role == Role::Admin
            || (actor.role == Role::Patient && actor.principal == request.patient);
        if !allowed {
            return Err(ConsentError::unauthorized(&actor.principal, "retry this transfer grant"));
        }
        if !(request.source_status == SourceStatus::Failed
            && request.patient_status == PatientStatus::Approved)
        {
            return Err(ConsentError::invalid_transition(request.state_label(), "retry the grant"));
        }
        request.refuse_if_attachment_deleted("retry the grant")?;

        let failure = self.deliver(&request).await;
        let updated = self.modify(id, |stored| {
            stored.refuse_if_attachment_deleted("retry the grant")?;
            apply_delivery(stored, failure.clone(), now);
            Ok(())
        })?;
        log_delivery(&updated, "transfer grant retried");
        Ok(updated)
    }

    pub fn get(&self, id: &TransferRequestId) -> ConsentResult<TransferRequest> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or(ConsentError::TransferRequestNotFound(*id))
    }

    /// Transfers where `doctor` is the source (doctor A), newest first.
    pub fn incoming(&self, doctor: &Principal) -> ConsentResult<Vec<TransferRequest>> {
        self.list(|r| &r.source_doctor == doctor)
    }

    /// Transfers opened by `doctor` (doctor B), newest first.
    pub fn outgoing(&self, doctor: &Principal) -> ConsentResult<Vec<TransferRequest>> {
        self.list(|r| &r.requesting_doctor == doctor)
    }

    /// Transfers waiting on `patient`'s decision.
    pub fn actionable(&self, patient: &Principal, now: DateTime<Utc>) -> ConsentResult<Vec<TransferRequest>> {
        self.list(|r| &r.patient == patient && r.is_patient_actionable(now))
    }

    /// Every transfer about `patient` that has left the source doctor's hands.
    pub fn history(&self, patient: &Principal) -> ConsentResult<Vec<TransferRequest>> {
        self.list(|r| &r.patient == patient && r.source_status != SourceStatus::AwaitingUpload)
    }

    /// Records `doctor` holds through granted transfers.
    pub fn granted_records(&self, doctor: &Principal) -> ConsentResult<HashSet<RecordId>> {
        Ok(self
            .read()?
            .values()
            .filter(|r| &r.requesting_doctor == doctor && r.source_status == SourceStatus::Granted)
            .flat_map(|r| {
                r.record_ids
                    .iter()
                    .copied()
                    .filter(|id| !r.deleted_record_ids.contains(id))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    /// Flag `record_id` on every transfer that has it attached. A transfer still waiting on
    /// the patient fails, since there is nothing left to grant.
    pub fn mark_record_deleted(&self, record_id: &RecordId, now: DateTime<Utc>) -> ConsentResult<usize> {
        let mut requests = self.write()?;
        let mut touched = 0;
        for request in requests.values_mut() {
            let Some(index) = request.record_ids.iter().position(|id| id == record_id) else {
                continue;
            };
            if !request.deleted_record_ids.insert(*record_id) {
                continue;
            }
            if let Some(title) = request.attached_titles.get_mut(index) {
                *title = deleted_title(title);
            }
            if request.source_status == SourceStatus::Uploaded
                && request.patient_status == PatientStatus::Pending
            {
                request.source_status = SourceStatus::Failed;
                request.failure_reason = Some(DELETED_ATTACHMENT_REASON.to_string());
                request.source_updated_at = Some(now);
            }
            touched += 1;
        }
        if touched > 0 {
            tracing::info!(%record_id, transfers = touched, "flagged deleted record on transfers");
        }
        Ok(touched)
    }

    pub(crate) fn export(&self) -> ConsentResult<Vec<TransferRequest>> {
        let mut all: Vec<TransferRequest> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub(crate) fn import(&self, requests: Vec<TransferRequest>) -> ConsentResult<()> {
        let mut table = self.write()?;
        table.clear();
        table.extend(requests.into_iter().map(|r| (r.id, r)));
        Ok(())
    }

    /// Grant B on the attached records. `None` on success, otherwise the failure reason.
    async fn deliver(&self, request: &TransferRequest) -> Option<String> {
        for record_id in &request.record_ids {
            if let Err(err) = self
                .executor
                .grant(record_id, &request.requesting_doctor)
                .await
            {
                tracing::warn!(transfer_id = %request.id, %record_id, error = %err, "transfer grant failed");
                return Some(err.to_string());
            }
        }
        None
    }

    fn list(&self, filter: impl Fn(&TransferRequest) -> bool) -> ConsentResult<Vec<TransferRequest>> {
        let mut out: Vec<TransferRequest> = self
            .read()?
            .values()
            .filter(|r| filter(r))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    fn modify(
        &self,
        id: &TransferRequestId,
        change: impl FnOnce(&mut TransferRequest) -> ConsentResult<()>,
    ) -> ConsentResult<TransferRequest> {
        let mut requests = self.write()?;
        let stored = requests
            .get_mut(id)
            .ok_or(ConsentError::TransferRequestNotFound(*id))?;
        let mut next = stored.clone();
        change(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    fn read(&self) -> ConsentResult<RwLockReadGuard<'_, HashMap<TransferRequestId, TransferRequest>>> {
        self.requests
            .read()
            .map_err(|_| ConsentError::LockPoisoned("transfer requests"))
    }

    fn write(&self) -> ConsentResult<RwLockWriteGuard<'_, HashMap<TransferRequestId, TransferRequest>>> {
        self.requests
            .write()
            .map_err(|_| ConsentError::LockPoisoned("transfer requests"))
    }
}

/// The joint write: `granted` only ever lands next to `approved`.
fn apply_delivery(request: &mut TransferRequest, failure: Option<String>, now: DateTime<Utc>) {
    match failure {
        None => {
            request.source_status = SourceStatus::Granted;
            request.failure_reason = None;
        }
        Some(reason) => {
            request.source_status = SourceStatus::Failed;
            request.failure_reason = Some(reason);
        }
    }
    request.source_updated_at = Some(now);
}

fn log_delivery(request: &TransferRequest, message: &'static str) {
    match request.source_status {
        SourceStatus::Granted => {
            tracing::info!(transfer_id = %request.id, doctor = %request.requesting_doctor, "{message}: granted")
        }
        _ => tracing::warn!(
            transfer_id = %request.id,
            reason = request.failure_reason.as_deref().unwrap_or(""),
            "{message}: grant failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::external::{CryptoService, ExternalError, Sealed, WrappedKey};
    use crate::keyring::DevKeyring;
    use crate::policy::AccessPolicy;
    use crate::records::tests::{p, sample_record};
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Notify;
    use std::path::PathBuf;

    struct Fixture {
        store: Arc<RecordStore>,
        engine: TransferRequestEngine,
        keyring: DevKeyring,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(RecordStore::new());
        let keyring = DevKeyring::random();
        let cfg = CoreConfig::new(PathBuf::from("unused"));
        let executor = GrantExecutor::new(store.clone(), Arc::new(keyring.clone()), &cfg);
        Fixture {
            engine: TransferRequestEngine::new(store.clone(), executor, cfg.min_purpose_len()),
            store,
            keyring,
        }
    }

    impl Fixture {
        /// Record owned by 0xP, shared with `shared_with`.
        async fn record(&self, shared_with: &[&str]) -> RecordId {
            let mut record = sample_record("0xP", shared_with);
            record.wrapped_key = self
                .keyring
                .seal(b"scan", &record.policy)
                .await
                .unwrap()
                .wrapped_key;
            let id = record.id;
            self.store.create(record).unwrap();
            id
        }

        fn open(&self, now: DateTime<Utc>) -> TransferRequest {
            self.engine
                .create(
                    &Actor::doctor(p("0xB")),
                    NewTransferRequest {
                        patient: p("0xP"),
                        source_doctor: p("0xA"),
                        description: "MRI knee".into(),
                        purpose: "Pre-operative assessment".into(),
                        urgency: Urgency::Urgent,
                        expires_at: None,
                    },
                    OrganizationSnapshot::default(),
                    now,
                )
                .unwrap()
        }
    }

    fn doctor_a() -> Actor {
        Actor::doctor(p("0xA"))
    }

    fn patient() -> Actor {
        Actor::patient(p("0xP"))
    }

    #[tokio::test]
    async fn test_full_transfer_grants_requesting_doctor() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx.open(now);
        assert_eq!(transfer.phase(now), TransferPhase::AwaitingUpload);
        assert!(fx.engine.actionable(&p("0xP"), now).unwrap().is_empty());

        let record = fx.record(&["0xA"]).await;
        let attached = fx
            .engine
            .attach_upload(&doctor_a(), &transfer.id, &record, Some("MRI Left Knee"), now)
            .unwrap();
        assert_eq!(attached.source_status, SourceStatus::Uploaded);
        assert_eq!(attached.attached_titles, vec!["MRI Left Knee".to_string()]);
        assert_eq!(fx.engine.actionable(&p("0xP"), now).unwrap().len(), 1);

        let approved = fx.engine.approve(&patient(), &transfer.id, now).await.unwrap();
        assert_eq!(approved.source_status, SourceStatus::Granted);
        assert_eq!(approved.patient_status, PatientStatus::Approved);
        assert!(fx.store.get(&record).unwrap().policy.contains(&p("0xB")));
        assert_eq!(fx.engine.granted_records(&p("0xB")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reject_is_terminal() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx.open(now);
        let record = fx.record(&["0xA"]).await;

        assert!(fx.engine.reject(&doctor_a(), &transfer.id, "  ", now).is_err());
        let rejected = fx
            .engine
            .reject(&doctor_a(), &transfer.id, "no such document", now)
            .unwrap();
        assert_eq!(rejected.source_status, SourceStatus::Rejected);

        let err = fx
            .engine
            .attach_upload(&doctor_a(), &transfer.id, &record, None, now)
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidTransition { .. }));
        assert!(fx.engine.actionable(&p("0xP"), now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attach_requires_record_shared_only_with_source() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx.open(now);

        let wide = fx.record(&["0xA", "0xC"]).await;
        let private = fx.record(&[]).await;
        for record in [wide, private] {
            assert!(matches!(
                fx.engine.attach_upload(&doctor_a(), &transfer.id, &record, None, now),
                Err(ConsentError::Validation(_))
            ));
        }
        let record = fx.record(&["0xA"]).await;
        assert!(matches!(
            fx.engine
                .attach_upload(&Actor::doctor(p("0xB")), &transfer.id, &record, None, now),
            Err(ConsentError::Unauthorized { .. })
        ));
        assert_eq!(
            fx.engine.get(&transfer.id).unwrap().source_status,
            SourceStatus::AwaitingUpload
        );
    }

    #[tokio::test]
    async fn test_deny_leaves_source_status() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx.open(now);
        let record = fx.record(&["0xA"]).await;
        fx.engine
            .attach_upload(&doctor_a(), &transfer.id, &record, None, now)
            .unwrap();

        let denied = fx
            .engine
            .deny(&patient(), &transfer.id, Some("prefer not"), now)
            .unwrap();
        assert_eq!(denied.patient_status, PatientStatus::Denied);
        assert_eq!(denied.source_status, SourceStatus::Uploaded);
        assert_eq!(denied.phase(now), TransferPhase::Denied);
        assert!(!fx.store.get(&record).unwrap().policy.contains(&p("0xB")));
        assert!(fx.engine.approve(&patient(), &transfer.id, now).await.is_err());
    }

    #[tokio::test]
    async fn test_deleted_attachment_fails_pending_transfer() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx.open(now);
        let record = fx.record(&["0xA"]).await;
        fx.engine
            .attach_upload(&doctor_a(), &transfer.id, &record, None, now)
            .unwrap();

        fx.store.delete(&record, &p("0xP")).unwrap();
        assert_eq!(fx.engine.mark_record_deleted(&record, now).unwrap(), 1);

        let failed = fx.engine.get(&transfer.id).unwrap();
        assert_eq!(failed.source_status, SourceStatus::Failed);
        assert_eq!(failed.patient_status, PatientStatus::Pending);
        assert_eq!(failed.failure_reason.as_deref(), Some(DELETED_ATTACHMENT_REASON));
        assert_eq!(failed.attached_titles, vec!["Blood panel (Deleted)".to_string()]);
        assert!(fx.engine.actionable(&p("0xP"), now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_transfer_refuses_actions() {
        let fx = fixture();
        let now = Utc::now();
        let transfer = fx
            .engine
            .create(
                &Actor::doctor(p("0xB")),
                NewTransferRequest {
                    patient: p("0xP"),
                    source_doctor: p("0xA"),
                    description: "Discharge letter".into(),
                    purpose: "Continuity of care".into(),
                    urgency: Urgency::Routine,
                    expires_at: Some(now + Duration::days(1)),
                },
                OrganizationSnapshot::default(),
                now,
            )
            .unwrap();

        let later = now + Duration::days(2);
        assert_eq!(transfer.phase(later), TransferPhase::Expired);
        assert_eq!(transfer.source_status, SourceStatus::AwaitingUpload);
        let err = fx
            .engine
            .reject(&doctor_a(), &transfer.id, "too late", later)
            .unwrap_err();
        assert!(matches!(err, ConsentError::InvalidTransition { .. }));
    }

    #[test]
    fn test_create_validates_parties() {
        let fx = fixture();
        let now = Utc::now();
        let new = |source: &str| NewTransferRequest {
            patient: p("0xP"),
            source_doctor: p(source),
            description: "Echo report".into(),
            purpose: "Cardiology referral".into(),
            urgency: Urgency::Routine,
            expires_at: None,
        };
        let b = Actor::doctor(p("0xB"));
        assert!(fx
            .engine
            .create(&b, new("0xB"), OrganizationSnapshot::default(), now)
            .is_err());
        assert!(fx
            .engine
            .create(&Actor::patient(p("0xQ")), new("0xA"), OrganizationSnapshot::default(), now)
            .is_err());
        assert!(fx.engine.create(&b, new("0xP"), OrganizationSnapshot::default(), now).is_err());
    }

    #[tokio::test]
    async fn test_attach_racing_delete_leaves_no_unflagged_reference() {
        let fx = fixture();
        let now = Utc::now();
        for _ in 0..200 {
            let transfer = fx.open(now);
            let record = fx.record(&["0xA"]).await;
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let _ = fx
                        .engine
                        .attach_upload(&doctor_a(), &transfer.id, &record, None, now);
                });
                scope.spawn(|| {
                    fx.store.delete(&record, &p("0xP")).unwrap();
                    fx.engine.mark_record_deleted(&record, now).unwrap();
                });
            });

            let stored = fx.engine.get(&transfer.id).unwrap();
            if stored.record_ids.contains(&record) {
                assert!(stored.deleted_record_ids.contains(&record));
                assert!(!stored.is_patient_actionable(now));
            } else {
                assert_eq!(stored.source_status, SourceStatus::AwaitingUpload);
            }
        }
    }

    /// Holds every reseal until the test releases it.
    struct GatedCrypto {
        inner: DevKeyring,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CryptoService for GatedCrypto {
        async fn seal(&self, plaintext: &[u8], policy: &AccessPolicy) -> Result<Sealed, ExternalError> {
            self.inner.seal(plaintext, policy).await
        }

        async fn reseal(
            &self,
            wrapped_key: &WrappedKey,
            old_policy: &AccessPolicy,
            new_policy: &AccessPolicy,
        ) -> Result<WrappedKey, ExternalError> {
            self.started.notify_one();
            self.release.notified().await;
            self.inner.reseal(wrapped_key, old_policy, new_policy).await
        }
    }

    #[tokio::test]
    async fn test_approve_does_not_overwrite_a_delete_that_lands_mid_grant() {
        let keyring = DevKeyring::random();
        let crypto = Arc::new(GatedCrypto {
            inner: keyring.clone(),
            started: Notify::new(),
            release: Notify::new(),
        });
        let store = Arc::new(RecordStore::new());
        let cfg = CoreConfig::new(PathBuf::from("unused"));
        let executor = GrantExecutor::new(store.clone(), crypto.clone(), &cfg);
        let fx = Fixture {
            engine: TransferRequestEngine::new(store.clone(), executor, cfg.min_purpose_len()),
            store,
            keyring,
        };
        let now = Utc::now();
        let transfer = fx.open(now);
        let record = fx.record(&["0xA"]).await;
        fx.engine
            .attach_upload(&doctor_a(), &transfer.id, &record, None, now)
            .unwrap();

        let patient = patient();
        let (approved, ()) = tokio::join!(fx.engine.approve(&patient, &transfer.id, now), async {
            crypto.started.notified().await;
            fx.store.delete(&record, &p("0xP")).unwrap();
            fx.engine.mark_record_deleted(&record, now).unwrap();
            crypto.release.notify_one();
        });

        let err = approved.unwrap_err();
        assert!(matches!(err, ConsentError::InvalidTransition { .. }));
        let stored = fx.engine.get(&transfer.id).unwrap();
        assert_eq!(stored.source_status, SourceStatus::Failed);
        assert_eq!(stored.patient_status, PatientStatus::Pending);
        assert_eq!(stored.failure_reason.as_deref(), Some(DELETED_ATTACHMENT_REASON));
    }
}
