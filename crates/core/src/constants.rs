//! Constants used throughout the consent core crate.

/// Minimum number of characters a request purpose must contain.
pub const DEFAULT_MIN_PURPOSE_LEN: usize = 10;

/// How many times a conflicting policy update is retried before surfacing a conflict.
pub const DEFAULT_GRANT_MAX_RETRIES: u32 = 5;

/// Deadline for a single call to the crypto service, in seconds.
pub const DEFAULT_RESEAL_TIMEOUT_SECS: u64 = 30;

/// Number of records resealed in parallel within one batch grant.
pub const DEFAULT_GRANT_CONCURRENCY: usize = 4;

/// Lifetime of a memoised identity lookup, in seconds.
pub const DEFAULT_IDENTITY_CACHE_TTL_SECS: u64 = 300;

/// Maximum number of memoised identity lookups.
pub const DEFAULT_IDENTITY_CACHE_CAPACITY: usize = 1024;

/// Default directory for consent data when no explicit directory is configured.
pub const DEFAULT_DATA_DIR: &str = "consent_data";

/// Directory (under the data dir) holding content-addressed ciphertext.
pub const BLOBS_DIR_NAME: &str = "blobs";

/// Filename of the JSON state snapshot (under the data dir).
pub const SNAPSHOT_FILENAME: &str = "state.json";

/// Suffix appended to a title snapshot once its record has been deleted.
pub const DELETED_TITLE_SUFFIX: &str = " (Deleted)";

/// Maximum length of free-text fields (purpose, description, reasons).
pub const MAX_FREE_TEXT_LEN: usize = 2_000;

/// Upper bound on the number of records in a single access request.
pub const MAX_RECORDS_PER_REQUEST: usize = 100;
