//! The access policy attached to every health record.
//!
//! A policy is the set of principals allowed to decrypt a record. It is the *sole* source of
//! truth for decryption rights. The owning patient is always a member and cannot be removed.

use consent_types::Principal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Set of principals authorised to decrypt one record.
///
/// Insertion order is irrelevant; members are kept sorted so that two policies with the same
/// members compare and serialise identically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredPolicy")]
pub struct AccessPolicy {
    owner: Principal,
    members: BTreeSet<Principal>,
}

/// Serialised form; restored through [`AccessPolicy::for_owner`] so the owner is always a member.
#[derive(Deserialize)]
struct StoredPolicy {
    owner: Principal,
    members: BTreeSet<Principal>,
}

impl From<StoredPolicy> for AccessPolicy {
    fn from(stored: StoredPolicy) -> Self {
        Self::for_owner(stored.owner, stored.members)
    }
}

impl AccessPolicy {
    /// Policy for a freshly uploaded record: the owner plus any co-authorised principals.
    pub fn for_owner(owner: Principal, co_authorized: impl IntoIterator<Item = Principal>) -> Self {
        let mut members: BTreeSet<Principal> = co_authorized.into_iter().collect();
        members.insert(owner.clone());
        Self { owner, members }
    }

    pub fn owner(&self) -> &Principal {
        &self.owner
    }

    pub fn contains(&self, principal: &Principal) -> bool {
        self.members.contains(principal)
    }

    /// All members, owner included, in sorted order.
    pub fn members(&self) -> impl Iterator<Item = &Principal> {
        self.members.iter()
    }

    /// Members other than the owner.
    pub fn delegates(&self) -> impl Iterator<Item = &Principal> {
        self.members.iter().filter(move |p| *p != &self.owner)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// `self ∪ {principal}`.
    pub fn with(&self, principal: &Principal) -> Self {
        let mut next = self.clone();
        next.members.insert(principal.clone());
        next
    }

    /// `self \ {principal}`. The owner is never removed.
    pub fn without(&self, principal: &Principal) -> Self {
        let mut next = self.clone();
        if principal != &self.owner {
            next.members.remove(principal);
        }
        next
    }

    /// True if the only delegate is `principal` (the owner is ignored).
    pub fn authorizes_only(&self, principal: &Principal) -> bool {
        let mut delegates = self.delegates();
        matches!((delegates.next(), delegates.next()), (Some(p), None) if p == principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> Principal {
        Principal::parse(s).unwrap()
    }

    #[test]
    fn owner_is_always_a_member() {
        let policy = AccessPolicy::for_owner(p("0xP"), []);
        assert!(policy.contains(&p("0xp")));
        assert_eq!(policy.len(), 1);
        assert_eq!(policy.without(&p("0xP")), policy);
    }

    #[test]
    fn with_is_set_union() {
        let policy = AccessPolicy::for_owner(p("0xP"), [p("0xD1")]);
        let granted = policy.with(&p("0xd1"));
        assert_eq!(granted, policy);
        let granted = policy.with(&p("0xD2"));
        assert_eq!(granted.len(), 3);
        assert_eq!(granted.without(&p("0xD2")), policy);
    }

    #[test]
    fn authorizes_only_ignores_owner() {
        let policy = AccessPolicy::for_owner(p("0xP"), [p("0xDA")]);
        assert!(policy.authorizes_only(&p("0xDA")));
        assert!(!policy.with(&p("0xDB")).authorizes_only(&p("0xDA")));
        assert!(!AccessPolicy::for_owner(p("0xP"), []).authorizes_only(&p("0xDA")));
    }

    #[test]
    fn restored_policy_always_contains_owner() {
        let policy: AccessPolicy =
            serde_json::from_str(r#"{"owner":"0xP","members":["0xD1"]}"#).unwrap();
        assert!(policy.contains(&p("0xP")));
        assert_eq!(policy, AccessPolicy::for_owner(p("0xP"), [p("0xD1")]));
    }
}
