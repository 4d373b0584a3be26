//! Core runtime configuration.
//!
//! Configuration is resolved once at process startup and then passed into the core services.
//! Nothing in this crate reads process-wide environment variables during request handling;
//! binaries read the environment and hand the parsed values over through [`CoreConfig`].

use crate::constants::{
    BLOBS_DIR_NAME, DEFAULT_GRANT_CONCURRENCY, DEFAULT_GRANT_MAX_RETRIES,
    DEFAULT_IDENTITY_CACHE_CAPACITY, DEFAULT_IDENTITY_CACHE_TTL_SECS, DEFAULT_MIN_PURPOSE_LEN,
    DEFAULT_RESEAL_TIMEOUT_SECS, SNAPSHOT_FILENAME,
};
use crate::error::{ConsentError, ConsentResult};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    data_dir: PathBuf,
    min_purpose_len: usize,
    grant_max_retries: u32,
    reseal_timeout: Duration,
    grant_concurrency: usize,
    identity_cache_ttl: Duration,
    identity_cache_capacity: usize,
}

impl CoreConfig {
    /// Create a configuration rooted at `data_dir` with default tuning values.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            min_purpose_len: DEFAULT_MIN_PURPOSE_LEN,
            grant_max_retries: DEFAULT_GRANT_MAX_RETRIES,
            reseal_timeout: Duration::from_secs(DEFAULT_RESEAL_TIMEOUT_SECS),
            grant_concurrency: DEFAULT_GRANT_CONCURRENCY,
            identity_cache_ttl: Duration::from_secs(DEFAULT_IDENTITY_CACHE_TTL_SECS),
            identity_cache_capacity: DEFAULT_IDENTITY_CACHE_CAPACITY,
        }
    }

    pub fn with_min_purpose_len(mut self, len: usize) -> Self {
        self.min_purpose_len = len;
        self
    }

    pub fn with_grant_max_retries(mut self, retries: u32) -> Self {
        self.grant_max_retries = retries;
        self
    }

    pub fn with_reseal_timeout(mut self, timeout: Duration) -> Self {
        self.reseal_timeout = timeout;
        self
    }

    pub fn with_grant_concurrency(mut self, concurrency: usize) -> Self {
        self.grant_concurrency = concurrency;
        self
    }

    /// Configure the identity cache. A zero TTL or zero capacity disables memoisation.
    pub fn with_identity_cache(mut self, ttl: Duration, capacity: usize) -> Self {
        self.identity_cache_ttl = ttl;
        self.identity_cache_capacity = capacity;
        self
    }

    /// Check the tuning values for combinations the services cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConsentError::Validation`] if the retry bound, concurrency or reseal timeout
    /// is zero.
    pub fn validate(&self) -> ConsentResult<()> {
        if self.grant_max_retries == 0 {
            return Err(ConsentError::Validation(
                "grant_max_retries must be at least 1".into(),
            ));
        }
        if self.grant_concurrency == 0 {
            return Err(ConsentError::Validation(
                "grant_concurrency must be at least 1".into(),
            ));
        }
        if self.reseal_timeout.is_zero() {
            return Err(ConsentError::Validation(
                "reseal_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join(BLOBS_DIR_NAME)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(SNAPSHOT_FILENAME)
    }

    pub fn min_purpose_len(&self) -> usize {
        self.min_purpose_len
    }

    pub fn grant_max_retries(&self) -> u32 {
        self.grant_max_retries
    }

    pub fn reseal_timeout(&self) -> Duration {
        self.reseal_timeout
    }

    pub fn grant_concurrency(&self) -> usize {
        self.grant_concurrency
    }

    pub fn identity_cache_ttl(&self) -> Duration {
        self.identity_cache_ttl
    }

    pub fn identity_cache_capacity(&self) -> usize {
        self.identity_cache_capacity
    }
}

/// Parse an optional numeric setting read from the environment by a binary.
///
/// `None`, empty and whitespace-only values fall back to `default`.
///
/// # Errors
///
/// Returns [`ConsentError::Validation`] naming the setting when the value is not a number.
pub fn u64_from_env_value(name: &str, value: Option<String>, default: u64) -> ConsentResult<u64> {
    let value = value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    match value {
        None => Ok(default),
        Some(v) => v
            .parse::<u64>()
            .map_err(|e| ConsentError::Validation(format!("{name} must be a number: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = CoreConfig::new(PathBuf::from("/tmp/consent"));
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.min_purpose_len(), 10);
        assert_eq!(cfg.snapshot_path(), PathBuf::from("/tmp/consent/state.json"));
        assert_eq!(cfg.blobs_dir(), PathBuf::from("/tmp/consent/blobs"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let cfg = CoreConfig::new(PathBuf::from("x")).with_grant_concurrency(0);
        assert!(matches!(cfg.validate(), Err(ConsentError::Validation(_))));
    }

    #[test]
    fn env_values_fall_back_and_parse() {
        assert_eq!(u64_from_env_value("X", None, 7).unwrap(), 7);
        assert_eq!(u64_from_env_value("X", Some("  ".into()), 7).unwrap(), 7);
        assert_eq!(u64_from_env_value("X", Some(" 12 ".into()), 7).unwrap(), 12);
        assert!(u64_from_env_value("X", Some("abc".into()), 7).is_err());
    }
}
