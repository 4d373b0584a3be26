//! Typed identifiers for records and requests.
//!
//! All three wrap a [`CanonicalUuid`] so they share its canonical 32-hex rendering, but they are
//! distinct types: a transfer request id can never be passed where a record id is expected.

use consent_uuid::{CanonicalUuid, UuidError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! canonical_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(CanonicalUuid);

        impl $name {
            /// Allocates a fresh random identifier.
            pub fn new() -> Self {
                Self(CanonicalUuid::new())
            }

            /// Validates an identifier that must already be in canonical form.
            pub fn parse(input: &str) -> Result<Self, UuidError> {
                CanonicalUuid::parse(input).map(Self)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = UuidError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

canonical_id!(
    /// Identifier of a [`HealthRecord`](crate::records::HealthRecord).
    RecordId
);

canonical_id!(
    /// Identifier of an [`AccessRequest`](crate::access::AccessRequest).
    AccessRequestId
);

canonical_id!(
    /// Identifier of a [`TransferRequest`](crate::transfer::TransferRequest).
    TransferRequestId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_render_canonically() {
        let id = RecordId::new();
        let rendered = id.to_string();
        assert!(CanonicalUuid::is_canonical(&rendered));
        assert_eq!(rendered.parse::<RecordId>().unwrap(), id);
    }

    #[test]
    fn ids_reject_hyphenated_input() {
        assert!(AccessRequestId::parse("550e8400-e29b-41d4-a716-446655440000").is_err());
    }
}
