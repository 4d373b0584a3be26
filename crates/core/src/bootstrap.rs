//! Startup wiring shared by the binaries.
//!
//! The binaries pass in an environment lookup (normally `std::env::var`) so this module never
//! touches process-wide state itself and can be exercised with a plain map in tests.

use crate::blobs::FsBlobStore;
use crate::config::{u64_from_env_value, CoreConfig};
use crate::constants::{
    DEFAULT_DATA_DIR, DEFAULT_GRANT_CONCURRENCY, DEFAULT_IDENTITY_CACHE_CAPACITY,
    DEFAULT_IDENTITY_CACHE_TTL_SECS, DEFAULT_RESEAL_TIMEOUT_SECS,
};
use crate::error::{ConsentError, ConsentResult};
use crate::identity::{IdentityCache, IdentityRegistry, StaticDirectory};
use crate::keyring::DevKeyring;
use crate::service::ConsentService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub const DATA_DIR_ENV: &str = "CONSENT_DATA_DIR";
pub const IDENTITIES_FILE_ENV: &str = "CONSENT_IDENTITIES_FILE";
pub const RESEAL_TIMEOUT_ENV: &str = "CONSENT_RESEAL_TIMEOUT_SECS";
pub const GRANT_CONCURRENCY_ENV: &str = "CONSENT_GRANT_CONCURRENCY";
pub const IDENTITY_CACHE_TTL_ENV: &str = "CONSENT_IDENTITY_CACHE_TTL_SECS";
pub const KEYRING_SECRET_ENV: &str = "CONSENT_KEYRING_SECRET";

/// Everything needed to assemble a [`ConsentService`] backed by the development adapters.
#[derive(Clone)]
pub struct ServiceSettings {
    pub core: CoreConfig,
    pub identities_file: Option<PathBuf>,
    keyring_secret: Option<String>,
}

impl std::fmt::Debug for ServiceSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSettings")
            .field("core", &self.core)
            .field("identities_file", &self.identities_file)
            .field("keyring_secret", &self.keyring_secret.as_ref().map(|_| "<set>"))
            .finish()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl ServiceSettings {
    /// Resolve settings through `lookup`, falling back to the defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`](crate::ConsentError::Validation) when a numeric
    /// variable does not parse, or the resulting [`CoreConfig`] fails validation.
    pub fn from_lookup<F>(lookup: F) -> ConsentResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = non_blank(lookup(DATA_DIR_ENV)).unwrap_or_else(|| DEFAULT_DATA_DIR.into());
        let reseal_timeout = u64_from_env_value(
            RESEAL_TIMEOUT_ENV,
            lookup(RESEAL_TIMEOUT_ENV),
            DEFAULT_RESEAL_TIMEOUT_SECS,
        )?;
        let concurrency = u64_from_env_value(
            GRANT_CONCURRENCY_ENV,
            lookup(GRANT_CONCURRENCY_ENV),
            DEFAULT_GRANT_CONCURRENCY as u64,
        )?;
        let cache_ttl = u64_from_env_value(
            IDENTITY_CACHE_TTL_ENV,
            lookup(IDENTITY_CACHE_TTL_ENV),
            DEFAULT_IDENTITY_CACHE_TTL_SECS,
        )?;

        let core = CoreConfig::new(PathBuf::from(data_dir))
            .with_reseal_timeout(Duration::from_secs(reseal_timeout))
            .with_grant_concurrency(usize::try_from(concurrency).unwrap_or(usize::MAX))
            .with_identity_cache(
                Duration::from_secs(cache_ttl),
                DEFAULT_IDENTITY_CACHE_CAPACITY,
            );
        core.validate()?;

        Ok(Self {
            core,
            identities_file: non_blank(lookup(IDENTITIES_FILE_ENV)).map(PathBuf::from),
            keyring_secret: non_blank(lookup(KEYRING_SECRET_ENV)),
        })
    }

    /// Assemble the service and restore the snapshot under the data directory, if present.
    ///
    /// Without an identities file the directory is empty: callers are trusted for their stated
    /// role. Without a keyring secret the keyring is random, so a snapshot that already holds
    /// sealed records is refused rather than restored under a key that cannot open them.
    pub fn build(&self) -> ConsentResult<ConsentService> {
        let directory = match &self.identities_file {
            Some(path) => StaticDirectory::load(path)?,
            None => {
                tracing::warn!("{IDENTITIES_FILE_ENV} not set; roles are taken from callers unchecked");
                StaticDirectory::new(Vec::new())
            }
        };
        let cache = IdentityCache::new(
            self.core.identity_cache_ttl(),
            self.core.identity_cache_capacity(),
        );
        let registry = IdentityRegistry::new(Arc::new(directory), cache);

        let keyring = match &self.keyring_secret {
            Some(secret) => DevKeyring::from_passphrase(secret),
            None => {
                tracing::warn!("{KEYRING_SECRET_ENV} not set; using an ephemeral keyring");
                DevKeyring::random()
            }
        };
        let blobs = FsBlobStore::open(&self.core.blobs_dir())?;

        let service = ConsentService::new(&self.core, Arc::new(registry), Arc::new(blobs), Arc::new(keyring))?
            .with_snapshot(self.core.snapshot_path());
        if service.load()? {
            if self.keyring_secret.is_none() && !service.records().export()?.is_empty() {
                return Err(ConsentError::Validation(format!(
                    "{} holds sealed records; set {KEYRING_SECRET_ENV} to the secret they were sealed with",
                    self.core.snapshot_path().display()
                )));
            }
            tracing::info!(path = %self.core.snapshot_path().display(), "state restored from snapshot");
        }
        Ok(service)
    }
}
