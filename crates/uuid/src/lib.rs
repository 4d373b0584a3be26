//! Canonical identifiers for consent records and requests.
//!
//! Every record and request identifier is a UUID held in a *canonical* representation:
//! **32 lowercase hexadecimal characters** (no hyphens). This is the same value produced by
//! `Uuid::new_v4().simple().to_string()`.
//!
//! Canonical form is *required* for externally supplied identifiers (REST paths, CLI arguments).
//! Non-canonical values (uppercase, hyphenated, wrong length, non-hex) are rejected rather than
//! normalised so that one identifier has exactly one spelling in logs and snapshots.
//!
//! The crate also provides [`Sha256Hash`], the validated hex digest used as a locator by the
//! content-addressed blob store.

mod service;

pub use service::{CanonicalUuid, Sha256Hash, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
