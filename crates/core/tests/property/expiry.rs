//! Invariants:
//! - `display_status` never mutates the request and is deterministic for a given `now`
//! - an approved request reads as expired exactly when `expires_at < now`

use chrono::{Duration, TimeZone, Utc};
use consent_core::{
    display_status, AccessDisplayStatus, AccessRequest, AccessRequestId, AccessStatus,
    NonEmptyText, Principal, RecordId, Urgency,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn status_from_u8(n: u8) -> AccessStatus {
    match n % 5 {
        0 => AccessStatus::Draft,
        1 => AccessStatus::Sent,
        2 => AccessStatus::Approved,
        3 => AccessStatus::Denied,
        _ => AccessStatus::Revoked,
    }
}

fn request(status: AccessStatus, expires_offset: Option<i64>) -> AccessRequest {
    let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    AccessRequest {
        id: AccessRequestId::new(),
        patient: Principal::parse("0xP").unwrap(),
        doctor: Principal::parse("0xD").unwrap(),
        record_ids: vec![RecordId::new()],
        requested_titles: vec!["Report".into()],
        deleted_record_ids: BTreeSet::new(),
        purpose: NonEmptyText::new("follow-up care").unwrap(),
        urgency: Urgency::Routine,
        status,
        created_at: created,
        sent_at: None,
        responded_at: None,
        revoked_at: None,
        requested_duration_days: None,
        expires_at: expires_offset.map(|s| created + Duration::seconds(s)),
        denial_reason: None,
        last_delivery: None,
    }
}

proptest! {
    #[test]
    fn prop_display_status_is_pure(
        status_seed in 0u8..=255u8,
        expires in proptest::option::of(-1_000_000i64..1_000_000),
        now_offset in -1_000_000i64..1_000_000,
    ) {
        let req = request(status_from_u8(status_seed), expires);
        let snapshot = req.clone();
        let now = req.created_at + Duration::seconds(now_offset);

        let first = display_status(&req, now);
        let second = display_status(&req, now);
        prop_assert_eq!(first, second);
        prop_assert_eq!(&req, &snapshot);

        let expected_expired = req.status == AccessStatus::Approved
            && req.expires_at.is_some_and(|at| at < now);
        prop_assert_eq!(first == AccessDisplayStatus::Expired, expected_expired);
    }
}
