//! Invariants over arbitrary action sequences on one transfer:
//! - `source_status = granted` only together with `patient_status = approved`
//! - a patient denial never changes `source_status`
//! - once rejected, nothing else ever succeeds

use crate::support::{harness, p};
use chrono::Utc;
use consent_core::{
    Actor, NewTransferRequest, OrganizationSnapshot, PatientStatus, SourceStatus,
    TransferRequestEngine, Urgency,
};
use proptest::prelude::*;

#[derive(Clone, Copy, Debug)]
enum Action {
    Attach,
    Reject,
    Approve,
    Deny,
    Retry,
}

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Attach),
        Just(Action::Reject),
        Just(Action::Approve),
        Just(Action::Deny),
        Just(Action::Retry),
    ]
}

fn actor() -> impl Strategy<Value = Actor> {
    prop_oneof![
        Just(Actor::patient(p("0xP"))),
        Just(Actor::doctor(p("0xA"))),
        Just(Actor::doctor(p("0xB"))),
    ]
}

proptest! {
    #[test]
    fn prop_transfer_sides_stay_in_lockstep(
        steps in proptest::collection::vec((action(), actor()), 1..12),
    ) {
        let rt = crate::support::runtime();
        rt.block_on(async {
            let h = harness();
            let engine = TransferRequestEngine::new(h.store.clone(), h.executor.clone(), h.cfg.min_purpose_len());
            let record = h.record("0xP", &["0xA"]).await;
            let now = Utc::now();
            let transfer = engine
                .create(
                    &Actor::doctor(p("0xB")),
                    NewTransferRequest {
                        patient: p("0xP"),
                        source_doctor: p("0xA"),
                        description: "Imaging".into(),
                        purpose: "Specialist review".into(),
                        urgency: Urgency::Routine,
                        expires_at: None,
                    },
                    OrganizationSnapshot::default(),
                    now,
                )
                .unwrap();

            for (action, who) in steps {
                let before = engine.get(&transfer.id).unwrap();
                let result = match action {
                    Action::Attach => engine.attach_upload(&who, &transfer.id, &record, None, now),
                    Action::Reject => engine.reject(&who, &transfer.id, "not available", now),
                    Action::Approve => engine.approve(&who, &transfer.id, now).await,
                    Action::Deny => engine.deny(&who, &transfer.id, None, now),
                    Action::Retry => engine.retry_grant(&who, &transfer.id, now).await,
                };
                let after = engine.get(&transfer.id).unwrap();

                if result.is_err() {
                    prop_assert_eq!(&after, &before);
                }
                if after.source_status == SourceStatus::Granted {
                    prop_assert_eq!(after.patient_status, PatientStatus::Approved);
                    prop_assert!(h.store.get(&record).unwrap().policy.contains(&p("0xB")));
                }
                if matches!(action, Action::Deny) && result.is_ok() {
                    prop_assert_eq!(after.source_status, before.source_status);
                }
                if before.source_status == SourceStatus::Rejected {
                    prop_assert!(result.is_err());
                }
            }
            Ok(())
        })?;
    }
}
