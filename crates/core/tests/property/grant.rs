//! Invariants:
//! - granting the same principal any number of times reseals exactly once
//! - after a grant every member of the new policy can unwrap the key
//! - grant then revoke restores the original membership

use crate::support::{harness, p, runtime};
use consent_core::GrantOutcome;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_grant_is_idempotent(repeats in 1usize..6, doctor in "0x[a-f0-9]{4}") {
        let rt = runtime();
        rt.block_on(async {
            let h = harness();
            let id = h.record("0xpatient", &[]).await;

            let mut resealed = 0;
            for _ in 0..repeats {
                if h.executor.grant(&id, &p(&doctor)).await.unwrap() == GrantOutcome::Resealed {
                    resealed += 1;
                }
            }
            let record = h.store.get(&id).unwrap();
            prop_assert_eq!(resealed, 1);
            prop_assert_eq!(record.policy_version, 1);
            prop_assert_eq!(record.policy.len(), 2);
            for member in record.policy.members() {
                prop_assert!(h.keyring.unwrap_for(&record.wrapped_key, &record.policy, member).is_ok());
            }
            Ok(())
        })?;
    }

    #[test]
    fn prop_grant_then_revoke_restores_membership(
        doctors in proptest::collection::btree_set("0x[a-f0-9]{4}", 1..5),
    ) {
        let rt = runtime();
        rt.block_on(async {
            let h = harness();
            let id = h.record("0xpatient", &[]).await;
            let before = h.store.get(&id).unwrap().policy;

            for d in &doctors {
                h.executor.grant(&id, &p(d)).await.unwrap();
            }
            for d in &doctors {
                h.executor.revoke(&id, &p(d)).await.unwrap();
            }

            let after = h.store.get(&id).unwrap();
            prop_assert_eq!(&after.policy, &before);
            for d in &doctors {
                prop_assert!(h.keyring.unwrap_for(&after.wrapped_key, &after.policy, &p(d)).is_err());
            }
            Ok(())
        })?;
    }
}
