//! Development crypto service.
//!
//! [`DevKeyring`] implements [`CryptoService`] entirely in-process so the binaries and tests can
//! run without the threshold decryption network. It is **not** a production cipher:
//!
//! - every record gets a random 256-bit content key;
//! - content is XORed with a SHA-256 counter keystream derived from that key;
//! - the content key is wrapped with a key-encryption key derived from the keyring's master
//!   secret and a digest of the policy members, and the envelope records that digest;
//! - a check tag over the key-encryption key and the content key lets unwrapping detect an
//!   envelope produced under a different master secret.
//!
//! Binding the envelope to the policy digest gives the contract the core relies on a testable
//! shape: a reseal only succeeds from the policy the key is currently wrapped for, and
//! [`DevKeyring::unwrap_for`] only hands the content key to members of that policy.
//!
//! Envelope layout:
//! `b"DK2" || policy_digest[32] || (content_key XOR kek)[32] || SHA-256(kek || content_key)[..16]`.

use crate::external::{CryptoService, ExternalError, Sealed, WrappedKey};
use crate::policy::AccessPolicy;
use async_trait::async_trait;
use consent_types::Principal;
use sha2::{Digest, Sha256};

const ENVELOPE_MAGIC: &[u8; 3] = b"DK2";
const CHECK_TAG_LEN: usize = 16;
const ENVELOPE_LEN: usize = 3 + 32 + 32 + CHECK_TAG_LEN;
const SERVICE: &str = "crypto service";

/// In-process keyring keyed by a single master secret.
#[derive(Clone)]
pub struct DevKeyring {
    master: [u8; 32],
}

impl std::fmt::Debug for DevKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DevKeyring { .. }")
    }
}

impl DevKeyring {
    pub fn new(master: [u8; 32]) -> Self {
        Self { master }
    }

    /// Derive the master secret from a passphrase (SHA-256).
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self::new(Sha256::digest(passphrase.as_bytes()).into())
    }

    /// Keyring with a random master secret; wrapped keys do not survive a restart.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    /// SHA-256 over the sorted policy members, newline separated.
    pub fn policy_digest(policy: &AccessPolicy) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for member in policy.members() {
            hasher.update(member.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().into()
    }

    /// Recover the content key for `principal`, who must be a member of `policy`, and the key
    /// must currently be wrapped for exactly that policy.
    pub fn unwrap_for(
        &self,
        wrapped_key: &WrappedKey,
        policy: &AccessPolicy,
        principal: &Principal,
    ) -> Result<[u8; 32], ExternalError> {
        if !policy.contains(principal) {
            return Err(ExternalError::Rejected {
                service: SERVICE,
                message: format!("{principal} is not authorised by the policy"),
            });
        }
        self.unwrap(wrapped_key, policy)
    }

    /// Decrypt content sealed by this keyring.
    pub fn open(&self, ciphertext: &[u8], content_key: &[u8; 32]) -> Vec<u8> {
        apply_keystream(ciphertext, content_key)
    }

    fn kek(&self, digest: &[u8; 32]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.master);
        hasher.update(digest);
        hasher.finalize().into()
    }

    fn check_tag(kek: &[u8; 32], content_key: &[u8; 32]) -> [u8; CHECK_TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(kek);
        hasher.update(content_key);
        let digest: [u8; 32] = hasher.finalize().into();
        let mut tag = [0u8; CHECK_TAG_LEN];
        tag.copy_from_slice(&digest[..CHECK_TAG_LEN]);
        tag
    }

    fn wrap(&self, content_key: &[u8; 32], policy: &AccessPolicy) -> WrappedKey {
        let digest = Self::policy_digest(policy);
        let kek = self.kek(&digest);

        let mut envelope = Vec::with_capacity(ENVELOPE_LEN);
        envelope.extend_from_slice(ENVELOPE_MAGIC);
        envelope.extend_from_slice(&digest);
        envelope.extend(content_key.iter().zip(kek.iter()).map(|(k, e)| k ^ e));
        envelope.extend_from_slice(&Self::check_tag(&kek, content_key));
        WrappedKey::new(envelope)
    }

    fn unwrap(&self, wrapped_key: &WrappedKey, policy: &AccessPolicy) -> Result<[u8; 32], ExternalError> {
        let bytes = wrapped_key.as_bytes();
        if bytes.len() != ENVELOPE_LEN || &bytes[..3] != ENVELOPE_MAGIC {
            return Err(ExternalError::Rejected {
                service: SERVICE,
                message: "malformed wrapped key".into(),
            });
        }

        let digest = Self::policy_digest(policy);
        if bytes[3..35] != digest {
            return Err(ExternalError::Rejected {
                service: SERVICE,
                message: "wrapped key is not bound to the supplied policy".into(),
            });
        }

        let kek = self.kek(&digest);
        let mut content_key = [0u8; 32];
        for (i, (w, e)) in bytes[35..67].iter().zip(kek.iter()).enumerate() {
            content_key[i] = w ^ e;
        }
        if bytes[67..] != Self::check_tag(&kek, &content_key) {
            return Err(ExternalError::Rejected {
                service: SERVICE,
                message: "wrapped key was not produced by this keyring".into(),
            });
        }
        Ok(content_key)
    }
}

#[async_trait]
impl CryptoService for DevKeyring {
    async fn seal(&self, plaintext: &[u8], policy: &AccessPolicy) -> Result<Sealed, ExternalError> {
        let content_key: [u8; 32] = rand::random();
        Ok(Sealed {
            ciphertext: apply_keystream(plaintext, &content_key),
            wrapped_key: self.wrap(&content_key, policy),
        })
    }

    async fn reseal(
        &self,
        wrapped_key: &WrappedKey,
        old_policy: &AccessPolicy,
        new_policy: &AccessPolicy,
    ) -> Result<WrappedKey, ExternalError> {
        let content_key = self.unwrap(wrapped_key, old_policy)?;
        Ok(self.wrap(&content_key, new_policy))
    }
}

fn apply_keystream(input: &[u8], key: &[u8; 32]) -> Vec<u8> {
    input
        .chunks(32)
        .enumerate()
        .flat_map(|(block, chunk)| {
            let mut hasher = Sha256::new();
            hasher.update(key);
            hasher.update((block as u64).to_le_bytes());
            let pad: [u8; 32] = hasher.finalize().into();
            chunk
                .iter()
                .zip(pad)
                .map(|(b, k)| b ^ k)
                .collect::<Vec<u8>>()
        })
        .collect()
}
