//! Contracts for the collaborators this crate does not implement itself.
//!
//! The core consumes exactly two external services:
//!
//! - a **blob store** holding record ciphertext behind an opaque locator, and
//! - a **crypto service** that seals content under an access policy and reseals a wrapped
//!   content key when the policy changes.
//!
//! The crypto contract is the property the whole subsystem leans on: after
//! `reseal(key, old, new)` every principal in `new` can derive the content key and every
//! principal dropped from `old` cannot. The core treats the service as a black box satisfying
//! that property. Development implementations live in [`crate::keyring`] and [`crate::blobs`].

use crate::policy::AccessPolicy;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Failure reported by (or about) an external collaborator.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ExternalError {
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },
    #[error("{service} did not answer within {after:?}")]
    Timeout {
        service: &'static str,
        after: Duration,
    },
    #[error("{service} rejected the request: {message}")]
    Rejected {
        service: &'static str,
        message: String,
    },
}

/// A content key wrapped so that only members of a policy can unwrap it.
///
/// Serialised as standard base64.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WrappedKey(Vec<u8>);

impl WrappedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.0)
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

impl Serialize for WrappedKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for WrappedKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s)
            .map(WrappedKey)
            .map_err(serde::de::Error::custom)
    }
}

/// Opaque handle into the blob store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobLocator(String);

impl BlobLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Output of [`CryptoService::seal`].
#[derive(Clone, Debug)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub wrapped_key: WrappedKey,
}

/// Seal/reseal operations of the external crypto service.
#[async_trait]
pub trait CryptoService: Send + Sync {
    /// Encrypt `plaintext` under a fresh content key wrapped for `policy`.
    async fn seal(&self, plaintext: &[u8], policy: &AccessPolicy) -> Result<Sealed, ExternalError>;

    /// Re-wrap the content key held in `wrapped_key` from `old_policy` to `new_policy`.
    async fn reseal(
        &self,
        wrapped_key: &WrappedKey,
        old_policy: &AccessPolicy,
        new_policy: &AccessPolicy,
    ) -> Result<WrappedKey, ExternalError>;
}

/// Storage for record ciphertext.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, ciphertext: &[u8]) -> Result<BlobLocator, ExternalError>;

    async fn get(&self, locator: &BlobLocator) -> Result<Vec<u8>, ExternalError>;

    async fn delete(&self, locator: &BlobLocator) -> Result<(), ExternalError>;
}
