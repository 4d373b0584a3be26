//! Access Request Engine.
//!
//! Direct patient↔doctor requests:
//!
//! ```text
//! draft ──send──▶ sent ──approve──▶ approved ──revoke──▶ revoked
//!                   │                   │
//!                   └──deny──▶ denied   └─(expires_at < now)─▶ expired  (display only)
//! ```
//!
//! The engine records decisions. Approval hands every requested record to the
//! [`GrantExecutor`]; the request becomes `approved` whatever the per-record outcome, and the
//! [`BatchReport`] is stored on the request so a partially delivered approval stays visible.
//!
//! Expiry is never written back: [`display_status`] projects it from `expires_at` and the
//! caller's clock.

use crate::constants::MAX_RECORDS_PER_REQUEST;
use crate::error::{ConsentError, ConsentResult};
use crate::grant::{BatchReport, DeliverySummary, GrantExecutor, RecordGrantResult};
use crate::identity::Actor;
use crate::ids::{AccessRequestId, RecordId};
use crate::inflight::InFlight;
use crate::records::RecordStore;
use crate::request::{deleted_title, optional_text, purpose_text, Urgency};
use chrono::{DateTime, Duration, Utc};
use consent_types::{NonEmptyText, Principal, Role};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Longest duration a doctor may ask for, in days.
pub const MAX_REQUESTED_DURATION_DAYS: u32 = 3_650;

/// Stored status. `expired` is not here; see [`AccessDisplayStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Draft,
    Sent,
    Approved,
    Denied,
    Revoked,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessStatus::Draft => "draft",
            AccessStatus::Sent => "sent",
            AccessStatus::Approved => "approved",
            AccessStatus::Denied => "denied",
            AccessStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status as shown to users at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDisplayStatus {
    Draft,
    Sent,
    Approved,
    Denied,
    Expired,
    Revoked,
}

impl AccessDisplayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessDisplayStatus::Draft => "draft",
            AccessDisplayStatus::Sent => "sent",
            AccessDisplayStatus::Approved => "approved",
            AccessDisplayStatus::Denied => "denied",
            AccessDisplayStatus::Expired => "expired",
            AccessDisplayStatus::Revoked => "revoked",
        }
    }
}

impl fmt::Display for AccessDisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AccessDisplayStatus {
    type Err = ConsentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(AccessDisplayStatus::Draft),
            "sent" => Ok(AccessDisplayStatus::Sent),
            "approved" => Ok(AccessDisplayStatus::Approved),
            "denied" => Ok(AccessDisplayStatus::Denied),
            "expired" => Ok(AccessDisplayStatus::Expired),
            "revoked" => Ok(AccessDisplayStatus::Revoked),
            other => Err(ConsentError::Validation(format!(
                "unknown access request status: {other}"
            ))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: AccessRequestId,
    pub patient: Principal,
    pub doctor: Principal,
    /// Fixed at creation. Deleted records stay listed and are flagged in `deleted_record_ids`.
    pub record_ids: Vec<RecordId>,
    /// Titles at creation time, parallel to `record_ids`.
    pub requested_titles: Vec<String>,
    #[serde(default)]
    pub deleted_record_ids: BTreeSet<RecordId>,
    pub purpose: NonEmptyText,
    pub urgency: Urgency,
    pub status: AccessStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub requested_duration_days: Option<u32>,
    pub expires_at: Option<DateTime<Utc>>,
    pub denial_reason: Option<NonEmptyText>,
    pub last_delivery: Option<BatchReport>,
}

impl AccessRequest {
    pub fn display_status(&self, now: DateTime<Utc>) -> AccessDisplayStatus {
        display_status(self, now)
    }

    /// Requested ids whose record still exists.
    pub fn live_record_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.record_ids
            .iter()
            .copied()
            .filter(|id| !self.deleted_record_ids.contains(id))
    }

    pub fn view(self, now: DateTime<Utc>) -> AccessRequestView {
        AccessRequestView {
            display_status: self.display_status(now),
            delivery: self.last_delivery.as_ref().map(BatchReport::summary),
            request: self,
        }
    }
}

/// Pure expiry projection: an approved request whose `expires_at` lies before `now` reads as
/// expired. Nothing is written.
pub fn display_status(request: &AccessRequest, now: DateTime<Utc>) -> AccessDisplayStatus {
    match request.status {
        AccessStatus::Draft => AccessDisplayStatus::Draft,
        AccessStatus::Sent => AccessDisplayStatus::Sent,
        AccessStatus::Approved if request.expires_at.is_some_and(|at| at < now) => {
            AccessDisplayStatus::Expired
        }
        AccessStatus::Approved => AccessDisplayStatus::Approved,
        AccessStatus::Denied => AccessDisplayStatus::Denied,
        AccessStatus::Revoked => AccessDisplayStatus::Revoked,
    }
}

/// A request with its status projected at a given instant.
#[derive(Clone, Debug, Serialize)]
pub struct AccessRequestView {
    #[serde(flatten)]
    pub request: AccessRequest,
    pub display_status: AccessDisplayStatus,
    pub delivery: Option<DeliverySummary>,
}

/// Input for [`AccessRequestEngine::create`].
#[derive(Clone, Debug, Deserialize)]
pub struct NewAccessRequest {
    pub patient: Principal,
    pub record_ids: Vec<RecordId>,
    pub purpose: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub requested_duration_days: Option<u32>,
}

pub struct AccessRequestEngine {
    requests: RwLock<HashMap<AccessRequestId, AccessRequest>>,
    in_flight: InFlight<AccessRequestId>,
    store: Arc<RecordStore>,
    executor: GrantExecutor,
    min_purpose_len: usize,
}

impl fmt::Debug for AccessRequestEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessRequestEngine")
            .field("executor", &self.executor)
            .field("min_purpose_len", &self.min_purpose_len)
            .finish_non_exhaustive()
    }
}

impl AccessRequestEngine {
    pub fn new(store: Arc<RecordStore>, executor: GrantExecutor, min_purpose_len: usize) -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            in_flight: InFlight::default(),
            store,
            executor,
            min_purpose_len,
        }
    }

    /// Create a request and send it to the patient straight away.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Unauthorized`] unless the actor is a doctor.
    /// - [`ConsentError::Validation`] for an empty, oversized or duplicated record list, a record
    ///   the patient does not own, a short purpose or an out-of-range duration. Nothing is
    ///   persisted in that case.
    pub fn create(
        &self,
        actor: &Actor,
        new: NewAccessRequest,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        self.insert(actor, new, AccessStatus::Sent, now)
    }

    /// Create a request in `draft`; nothing reaches the patient until [`Self::send`].
    pub fn create_draft(
        &self,
        actor: &Actor,
        new: NewAccessRequest,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        self.insert(actor, new, AccessStatus::Draft, now)
    }

    pub fn send(&self, actor: &Actor, id: &AccessRequestId, now: DateTime<Utc>) -> ConsentResult<AccessRequest> {
        let sent = self.modify(id, |request| {
            actor.require(&request.doctor, Role::Doctor, "send this access request")?;
            if request.status != AccessStatus::Draft {
                return Err(ConsentError::invalid_transition(request.status.as_str(), "send"));
            }
            request.status = AccessStatus::Sent;
            request.sent_at = Some(now);
            Ok(())
        })?;
        tracing::info!(request_id = %id, patient = %sent.patient, "access request sent");
        Ok(sent)
    }

    /// Patient approves: grant the doctor on every requested record, then record the decision.
    ///
    /// `expires_at` overrides the requested duration. Per-record failures do not prevent the
    /// transition; they are reported in `last_delivery`.
    ///
    /// # Errors
    ///
    /// - [`ConsentError::Unauthorized`] unless the actor is the request's patient.
    /// - [`ConsentError::InvalidTransition`] unless the request is `sent`.
    /// - [`ConsentError::Validation`] if `expires_at` is not in the future.
    /// - [`ConsentError::RequestBusy`] if another decision on this request is running.
    pub async fn approve(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let request = self.get(id)?;
        actor.require(&request.patient, Role::Patient, "approve this access request")?;
        if request.status != AccessStatus::Sent {
            return Err(ConsentError::invalid_transition(request.status.as_str(), "approve"));
        }
        let expires_at = match expires_at {
            Some(at) if at <= now => {
                return Err(ConsentError::Validation(
                    "expiry must be in the future".into(),
                ))
            }
            Some(at) => Some(at),
            None => request
                .requested_duration_days
                .map(|days| now + Duration::days(i64::from(days))),
        };

        let report = self.deliver(&request, now).await;
        let approved = self.modify(id, |stored| {
            stored.status = AccessStatus::Approved;
            stored.responded_at = Some(now);
            stored.expires_at = expires_at;
            stored.last_delivery = Some(report.clone());
            Ok(())
        })?;

        tracing::info!(
            request_id = %id,
            doctor = %approved.doctor,
            success_count = report.success_count,
            fail_count = report.fail_count,
            summary = report.summary().as_str(),
            "access request approved"
        );
        Ok(approved)
    }

    /// Patient denies. No cryptographic effect.
    pub fn deny(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let reason = optional_text("denial reason", reason)?;
        let denied = self.modify(id, |request| {
            actor.require(&request.patient, Role::Patient, "deny this access request")?;
            if request.status != AccessStatus::Sent {
                return Err(ConsentError::invalid_transition(request.status.as_str(), "deny"));
            }
            request.status = AccessStatus::Denied;
            request.responded_at = Some(now);
            request.denial_reason = reason;
            Ok(())
        })?;
        tracing::info!(request_id = %id, doctor = %denied.doctor, "access request denied");
        Ok(denied)
    }

    /// Patient withdraws an approval and removes the doctor from the requested records.
    ///
    /// A record stays shared when `still_covered` lists it (a granted transfer, an upload by the
    /// doctor) or another live approved request for the same doctor includes it.
    pub async fn revoke(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        still_covered: &HashSet<RecordId>,
        now: DateTime<Utc>,
    ) -> ConsentResult<(AccessRequest, BatchReport)> {
        let _guard = self.in_flight.acquire(*id)?;
        let revoked = self.modify(id, |request| {
            actor.require(&request.patient, Role::Patient, "revoke this access request")?;
            if request.status != AccessStatus::Approved {
                return Err(ConsentError::invalid_transition(request.status.as_str(), "revoke"));
            }
            request.status = AccessStatus::Revoked;
            request.revoked_at = Some(now);
            Ok(())
        })?;

        let covered_elsewhere = self.live_grants(&revoked.doctor, Some(id), now)?;
        let to_remove: Vec<RecordId> = revoked
            .live_record_ids()
            .filter(|rid| !still_covered.contains(rid) && !covered_elsewhere.contains(rid))
            .collect();
        let report = self.executor.revoke_batch(&to_remove, &revoked.doctor).await;

        tracing::info!(
            request_id = %id,
            doctor = %revoked.doctor,
            removed = report.success_count,
            failed = report.fail_count,
            "access request revoked"
        );
        Ok((revoked, report))
    }

    /// Re-run delivery for an approved, unexpired request. The decision is unchanged.
    pub async fn retry_grants(
        &self,
        actor: &Actor,
        id: &AccessRequestId,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        let _guard = self.in_flight.acquire(*id)?;
        let request = self.get(id)?;
        actor.require(&request.patient, Role::Patient, "retry grants for this access request")?;
        let status = request.display_status(now);
        if status != AccessDisplayStatus::Approved {
            return Err(ConsentError::invalid_transition(status.as_str(), "retry grants"));
        }

        let report = self.deliver(&request, now).await;
        let updated = self.modify(id, |stored| {
            stored.last_delivery = Some(report.clone());
            Ok(())
        })?;
        tracing::info!(
            request_id = %id,
            success_count = report.success_count,
            fail_count = report.fail_count,
            "access grants retried"
        );
        Ok(updated)
    }

    pub fn get(&self, id: &AccessRequestId) -> ConsentResult<AccessRequest> {
        self.read()?
            .get(id)
            .cloned()
            .ok_or(ConsentError::AccessRequestNotFound(*id))
    }

    /// Requests addressed to `patient`, newest first. Drafts are the doctor's own business and
    /// are never listed here.
    pub fn list_for_patient(
        &self,
        patient: &Principal,
        status: Option<AccessDisplayStatus>,
        now: DateTime<Utc>,
    ) -> ConsentResult<Vec<AccessRequest>> {
        self.list(
            |r| &r.patient == patient && r.status != AccessStatus::Draft,
            status,
            now,
        )
    }

    /// Requests made by `doctor`, newest first.
    pub fn list_for_doctor(
        &self,
        doctor: &Principal,
        status: Option<AccessDisplayStatus>,
        now: DateTime<Utc>,
    ) -> ConsentResult<Vec<AccessRequest>> {
        self.list(|r| &r.doctor == doctor, status, now)
    }

    /// Flag `record_id` as deleted in every request that references it.
    ///
    /// Returns the number of requests touched. A `sent` request keeps its record list; the
    /// deleted id is reported as failed when the patient approves.
    pub fn mark_record_deleted(&self, record_id: &RecordId) -> ConsentResult<usize> {
        let mut requests = self.write()?;
        let mut touched = 0;
        for request in requests.values_mut() {
            let Some(index) = request.record_ids.iter().position(|id| id == record_id) else {
                continue;
            };
            if !request.deleted_record_ids.insert(*record_id) {
                continue;
            }
            if let Some(title) = request.requested_titles.get_mut(index) {
                *title = deleted_title(title);
            }
            touched += 1;
        }
        if touched > 0 {
            tracing::info!(%record_id, requests = touched, "flagged deleted record on access requests");
        }
        Ok(touched)
    }

    /// Records `doctor` holds through live approved requests, optionally ignoring one request.
    pub fn live_grants(
        &self,
        doctor: &Principal,
        excluding: Option<&AccessRequestId>,
        now: DateTime<Utc>,
    ) -> ConsentResult<HashSet<RecordId>> {
        Ok(self
            .read()?
            .values()
            .filter(|r| &r.doctor == doctor && Some(&r.id) != excluding)
            .filter(|r| r.display_status(now) == AccessDisplayStatus::Approved)
            .flat_map(|r| r.live_record_ids().collect::<Vec<_>>())
            .collect())
    }

    pub(crate) fn export(&self) -> ConsentResult<Vec<AccessRequest>> {
        let mut all: Vec<AccessRequest> = self.read()?.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    pub(crate) fn import(&self, requests: Vec<AccessRequest>) -> ConsentResult<()> {
        let mut table = self.write()?;
        table.clear();
        table.extend(requests.into_iter().map(|r| (r.id, r)));
        Ok(())
    }

    fn insert(
        &self,
        actor: &Actor,
        new: NewAccessRequest,
        status: AccessStatus,
        now: DateTime<Utc>,
    ) -> ConsentResult<AccessRequest> {
        actor.require_role(Role::Doctor, "request record access")?;
        if new.patient == actor.principal {
            return Err(ConsentError::Validation(
                "a doctor cannot request access from themselves".into(),
            ));
        }
        validate_record_ids(&new.record_ids)?;
        let purpose = purpose_text(&new.purpose, self.min_purpose_len)?;
        if let Some(days) = new.requested_duration_days {
            if days == 0 || days > MAX_REQUESTED_DURATION_DAYS {
                return Err(ConsentError::Validation(format!(
                    "requested duration must be between 1 and {MAX_REQUESTED_DURATION_DAYS} days"
                )));
            }
        }

        let mut titles = Vec::with_capacity(new.record_ids.len());
        for record_id in &new.record_ids {
            let record = match self.store.get(record_id) {
                Ok(record) => record,
                Err(ConsentError::RecordNotFound(_)) => {
                    return Err(ConsentError::Validation(format!(
                        "record {record_id} does not exist"
                    )))
                }
                Err(err) => return Err(err),
            };
            if record.patient != new.patient {
                return Err(ConsentError::Validation(format!(
                    "record {record_id} does not belong to {}",
                    new.patient
                )));
            }
            titles.push(record.title.to_string());
        }

        let request = AccessRequest {
            id: AccessRequestId::new(),
            patient: new.patient,
            doctor: actor.principal.clone(),
            record_ids: new.record_ids,
            requested_titles: titles,
            deleted_record_ids: BTreeSet::new(),
            purpose,
            urgency: new.urgency,
            status,
            created_at: now,
            sent_at: (status == AccessStatus::Sent).then_some(now),
            responded_at: None,
            revoked_at: None,
            requested_duration_days: new.requested_duration_days,
            expires_at: None,
            denial_reason: None,
            last_delivery: None,
        };

        {
            // Re-checked under the request lock; see `mark_record_deleted`.
            let mut requests = self.write()?;
            for record_id in &request.record_ids {
                if !self.store.contains(record_id)? {
                    return Err(ConsentError::Validation(format!(
                        "record {record_id} does not exist"
                    )));
                }
            }
            requests.insert(request.id, request.clone());
        }
        tracing::info!(
            request_id = %request.id,
            patient = %request.patient,
            doctor = %request.doctor,
            records = request.record_ids.len(),
            status = status.as_str(),
            "access request created"
        );
        Ok(request)
    }

    /// Grant every live record and fold in deleted ones as failures, in request order.
    async fn deliver(&self, request: &AccessRequest, now: DateTime<Utc>) -> BatchReport {
        let live: Vec<RecordId> = request.live_record_ids().collect();
        let batch = self.executor.grant_batch(&live, &request.doctor).await;
        let mut by_id: HashMap<RecordId, RecordGrantResult> = batch
            .results
            .into_iter()
            .map(|r| (r.record_id, r))
            .collect();

        let results = request
            .record_ids
            .iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .unwrap_or_else(|| RecordGrantResult::failed(*id, "record was deleted", false))
            })
            .collect();
        BatchReport::from_results(results, now)
    }

    fn list(
        &self,
        filter: impl Fn(&AccessRequest) -> bool,
        status: Option<AccessDisplayStatus>,
        now: DateTime<Utc>,
    ) -> ConsentResult<Vec<AccessRequest>> {
        let mut out: Vec<AccessRequest> = self
            .read()?
            .values()
            .filter(|r| filter(r))
            .filter(|r| status.map_or(true, |s| r.display_status(now) == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Apply `change` to a copy and store it only if the closure succeeds.
    fn modify(
        &self,
        id: &AccessRequestId,
        change: impl FnOnce(&mut AccessRequest) -> ConsentResult<()>,
    ) -> ConsentResult<AccessRequest> {
        let mut requests = self.write()?;
        let stored = requests
            .get_mut(id)
            .ok_or(ConsentError::AccessRequestNotFound(*id))?;
        let mut next = stored.clone();
        change(&mut next)?;
        *stored = next.clone();
        Ok(next)
    }

    fn read(&self) -> ConsentResult<RwLockReadGuard<'_, HashMap<AccessRequestId, AccessRequest>>> {
        self.requests
            .read()
            .map_err(|_| ConsentError::LockPoisoned("access requests"))
    }

    fn write(&self) -> ConsentResult<RwLockWriteGuard<'_, HashMap<AccessRequestId, AccessRequest>>> {
        self.requests
            .write()
            .map_err(|_| ConsentError::LockPoisoned("access requests"))
    }
}

fn validate_record_ids(record_ids: &[RecordId]) -> ConsentResult<()> {
    if record_ids.is_empty() {
        return Err(ConsentError::Validation(
            "at least one record must be requested".into(),
        ));
    }
    if record_ids.len() > MAX_RECORDS_PER_REQUEST {
        return Err(ConsentError::Validation(format!(
            "at most {MAX_RECORDS_PER_REQUEST} records may be requested at once"
        )));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = record_ids.iter().find(|id| !seen.insert(**id)) {
        return Err(ConsentError::Validation(format!(
            "record {dup} is listed more than once"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::external::CryptoService;
    use crate::grant::GrantOutcome;
    use crate::keyring::DevKeyring;
    use crate::records::tests::{p, sample_record};
    use std::path::PathBuf;

    struct Fixture {
        store: Arc<RecordStore>,
        engine: AccessRequestEngine,
        keyring: DevKeyring,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(RecordStore::new());
        let keyring = DevKeyring::random();
        let cfg = CoreConfig::new(PathBuf::from("unused"));
        let executor = GrantExecutor::new(store.clone(), Arc::new(keyring.clone()), &cfg);
        Fixture {
            engine: AccessRequestEngine::new(store.clone(), executor, cfg.min_purpose_len()),
            store,
            keyring,
        }
    }

    impl Fixture {
        async fn record(&self, patient: &str) -> RecordId {
            let mut record = sample_record(patient, &[]);
            record.wrapped_key = self
                .keyring
                .seal(b"content", &record.policy)
                .await
                .unwrap()
                .wrapped_key;
            let id = record.id;
            self.store.create(record).unwrap();
            id
        }
    }

    fn doctor() -> Actor {
        Actor::doctor(p("0xD"))
    }

    fn patient() -> Actor {
        Actor::patient(p("0xP"))
    }

    fn new_request(record_ids: Vec<RecordId>) -> NewAccessRequest {
        NewAccessRequest {
            patient: p("0xP"),
            record_ids,
            purpose: "Follow-up consultation".into(),
            urgency: Urgency::Routine,
            requested_duration_days: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_empty_and_foreign_records() {
        let fx = fixture();
        let foreign = fx.record("0xOther").await;
        let now = Utc::now();

        let err = fx.engine.create(&doctor(), new_request(vec![]), now).unwrap_err();
        assert!(matches!(err, ConsentError::Validation(_)));

        let err = fx
            .engine
            .create(&doctor(), new_request(vec![foreign]), now)
            .unwrap_err();
        assert!(matches!(err, ConsentError::Validation(_)));

        assert!(fx.engine.list_for_doctor(&p("0xD"), None, now).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_requires_doctor_and_purpose() {
        let fx = fixture();
        let r = fx.record("0xP").await;
        let now = Utc::now();

        let err = fx
            .engine
            .create(&Actor::patient(p("0xQ")), new_request(vec![r]), now)
            .unwrap_err();
        assert!(matches!(err, ConsentError::Unauthorized { .. }));

        let mut short = new_request(vec![r]);
        short.purpose = "checkup".into();
        assert!(matches!(
            fx.engine.create(&doctor(), short, now),
            Err(ConsentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_draft_must_be_sent_by_its_author() {
        let fx = fixture();
        let r = fx.record("0xP").await;
        let now = Utc::now();

        let draft = fx.engine.create_draft(&doctor(), new_request(vec![r]), now).unwrap();
        assert_eq!(draft.status, AccessStatus::Draft);
        assert!(fx.engine.list_for_patient(&p("0xP"), None, now).unwrap().is_empty());

        assert!(fx.engine.send(&Actor::doctor(p("0xD2")), &draft.id, now).is_err());
        let sent = fx.engine.send(&doctor(), &draft.id, now).unwrap();
        assert_eq!(sent.status, AccessStatus::Sent);
        assert_eq!(sent.sent_at, Some(now));
        assert!(matches!(
            fx.engine.send(&doctor(), &draft.id, now),
            Err(ConsentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_approve_grants_every_record_and_applies_duration() {
        let fx = fixture();
        let r1 = fx.record("0xP").await;
        let r2 = fx.record("0xP").await;
        let now = Utc::now();

        let mut new = new_request(vec![r1, r2]);
        new.requested_duration_days = Some(30);
        let request = fx.engine.create(&doctor(), new, now).unwrap();

        let approved = fx.engine.approve(&patient(), &request.id, None, now).await.unwrap();
        assert_eq!(approved.status, AccessStatus::Approved);
        assert_eq!(approved.expires_at, Some(now + Duration::days(30)));
        let report = approved.last_delivery.unwrap();
        assert_eq!(report.summary(), DeliverySummary::AccessGranted);

        for id in [r1, r2] {
            assert!(fx.store.get(&id).unwrap().policy.contains(&p("0xD")));
        }
    }

    #[tokio::test]
    async fn test_only_the_patient_decides() {
        let fx = fixture();
        let r = fx.record("0xP").await;
        let now = Utc::now();
        let request = fx.engine.create(&doctor(), new_request(vec![r]), now).unwrap();

        let err = fx
            .engine
            .approve(&doctor(), &request.id, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::Unauthorized { .. }));
        assert!(fx.engine.deny(&Actor::patient(p("0xQ")), &request.id, None, now).is_err());
        assert_eq!(fx.engine.get(&request.id).unwrap().status, AccessStatus::Sent);
    }

    #[tokio::test]
    async fn test_explicit_expiry_must_be_future() {
        let fx = fixture();
        let r = fx.record("0xP").await;
        let now = Utc::now();
        let request = fx.engine.create(&doctor(), new_request(vec![r]), now).unwrap();

        let err = fx
            .engine
            .approve(&patient(), &request.id, Some(now - Duration::hours(1)), now)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsentError::Validation(_)));
        assert!(!fx.store.get(&r).unwrap().policy.contains(&p("0xD")));
    }

    #[tokio::test]
    async fn test_deleted_record_is_reported_failed_on_approval() {
        let fx = fixture();
        let kept = fx.record("0xP").await;
        let gone = fx.record("0xP").await;
        let now = Utc::now();
        let request = fx
            .engine
            .create(&doctor(), new_request(vec![kept, gone]), now)
            .unwrap();

        fx.store.delete(&gone, &p("0xP")).unwrap();
        assert_eq!(fx.engine.mark_record_deleted(&gone).unwrap(), 1);

        let flagged = fx.engine.get(&request.id).unwrap();
        assert_eq!(flagged.requested_titles[1], "Blood panel (Deleted)");

        let approved = fx.engine.approve(&patient(), &request.id, None, now).await.unwrap();
        let report = approved.last_delivery.unwrap();
        assert_eq!((report.success_count, report.fail_count), (1, 1));
        assert_eq!(report.summary(), DeliverySummary::PartialSuccess);
        assert!(matches!(
            report.results[1].outcome,
            GrantOutcome::Failed { retriable: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_decision_in_flight_blocks_a_second_one() {
        let fx = fixture();
        let r = fx.record("0xP").await;
        let now = Utc::now();
        let request = fx.engine.create(&doctor(), new_request(vec![r]), now).unwrap();

        let guard = fx.engine.in_flight.acquire(request.id).unwrap();
        let err = fx.engine.deny(&patient(), &request.id, None, now).unwrap_err();
        assert!(matches!(err, ConsentError::RequestBusy(_)));
        assert!(err.is_retriable());
        drop(guard);

        let denied = fx
            .engine
            .deny(&patient(), &request.id, Some("not needed"), now)
            .unwrap();
        assert_eq!(denied.status, AccessStatus::Denied);
        assert!(!fx.store.get(&r).unwrap().policy.contains(&p("0xD")));
    }

    #[tokio::test]
    async fn test_revoke_keeps_records_covered_by_another_request() {
        let fx = fixture();
        let shared = fx.record("0xP").await;
        let only_first = fx.record("0xP").await;
        let now = Utc::now();

        let first = fx
            .engine
            .create(&doctor(), new_request(vec![shared, only_first]), now)
            .unwrap();
        let second = fx.engine.create(&doctor(), new_request(vec![shared]), now).unwrap();
        fx.engine.approve(&patient(), &first.id, None, now).await.unwrap();
        fx.engine.approve(&patient(), &second.id, None, now).await.unwrap();

        let (revoked, report) = fx
            .engine
            .revoke(&patient(), &first.id, &HashSet::new(), now)
            .await
            .unwrap();
        assert_eq!(revoked.status, AccessStatus::Revoked);
        assert_eq!(report.results.len(), 1);

        assert!(fx.store.get(&shared).unwrap().policy.contains(&p("0xD")));
        assert!(!fx.store.get(&only_first).unwrap().policy.contains(&p("0xD")));
    }

    #[test]
    fn test_display_status_projects_expiry() {
        let now = Utc::now();
        let mut request = AccessRequest {
            id: AccessRequestId::new(),
            patient: p("0xP"),
            doctor: p("0xD"),
            record_ids: vec![RecordId::new()],
            requested_titles: vec!["Blood panel".into()],
            deleted_record_ids: BTreeSet::new(),
            purpose: NonEmptyText::new("Follow-up consultation").unwrap(),
            urgency: Urgency::Routine,
            status: AccessStatus::Approved,
            created_at: now,
            sent_at: Some(now),
            responded_at: Some(now),
            revoked_at: None,
            requested_duration_days: None,
            expires_at: Some(now - Duration::seconds(1)),
            denial_reason: None,
            last_delivery: None,
        };
        assert_eq!(display_status(&request, now), AccessDisplayStatus::Expired);
        assert_eq!(request.status, AccessStatus::Approved);

        request.expires_at = Some(now);
        assert_eq!(display_status(&request, now), AccessDisplayStatus::Approved);

        request.status = AccessStatus::Denied;
        request.expires_at = Some(now - Duration::days(1));
        assert_eq!(display_status(&request, now), AccessDisplayStatus::Denied);
    }

    #[tokio::test]
    async fn test_create_racing_delete_leaves_no_unflagged_reference() {
        let fx = fixture();
        let now = Utc::now();
        for _ in 0..200 {
            let record = fx.record("0xP").await;
            let created = std::sync::Mutex::new(None);
            std::thread::scope(|scope| {
                scope.spawn(|| {
                    let result = fx.engine.create(&doctor(), new_request(vec![record]), now);
                    *created.lock().unwrap() = result.ok();
                });
                scope.spawn(|| {
                    fx.store.delete(&record, &p("0xP")).unwrap();
                    fx.engine.mark_record_deleted(&record).unwrap();
                });
            });

            if let Some(request) = created.into_inner().unwrap() {
                let stored = fx.engine.get(&request.id).unwrap();
                assert!(stored.deleted_record_ids.contains(&record));
                assert_eq!(stored.live_record_ids().count(), 0);
            }
        }
    }
}

