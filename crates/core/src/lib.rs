//! # Consent Core
//!
//! Consent-gated access control for encrypted medical records.
//!
//! This crate holds the data model and state machines that decide who may decrypt a record:
//! - [`records`]: health records and their access policies, with versioned policy writes
//! - [`access`]: direct patient↔doctor access requests
//! - [`transfer`]: doctor↔doctor transfers gated on patient approval
//! - [`grant`]: the executor that turns an approval into a resealed policy
//! - [`identity`]: principal → role / display name / organisation lookup
//! - [`service`]: the facade binaries talk to, assembled at startup by [`bootstrap`]
//!
//! **No transport concerns**: HTTP handlers and command-line parsing live in `api-rest` and
//! `consent-cli`. The blob store and crypto service are traits in [`external`]; [`blobs`] and
//! [`keyring`] are development implementations.

pub mod access;
pub mod blobs;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod error;
pub mod external;
pub mod grant;
pub mod identity;
pub mod ids;
mod inflight;
pub mod keyring;
pub mod policy;
pub mod records;
pub mod request;
pub mod service;
pub mod snapshot;
pub mod transfer;

pub use access::{
    display_status, AccessDisplayStatus, AccessRequest, AccessRequestEngine, AccessRequestView,
    AccessStatus, NewAccessRequest,
};
pub use blobs::FsBlobStore;
pub use bootstrap::ServiceSettings;
pub use config::{u64_from_env_value, CoreConfig};
pub use error::{ConsentError, ConsentResult, ErrorKind};
pub use external::{BlobLocator, BlobStore, CryptoService, ExternalError, Sealed, WrappedKey};
pub use grant::{BatchReport, DeliverySummary, GrantExecutor, GrantOutcome, RecordGrantResult};
pub use identity::{
    Actor, Identity, IdentityCache, IdentityDirectory, IdentityRegistry, StaticDirectory,
};
pub use ids::{AccessRequestId, RecordId, TransferRequestId};
pub use keyring::DevKeyring;
pub use policy::AccessPolicy;
pub use records::{HealthRecord, RecordStore};
pub use request::Urgency;
pub use service::{ConsentService, DeletionReport, RecordCiphertext, TransferQuery, UploadRecord};
pub use snapshot::StateSnapshot;
pub use transfer::{
    NewTransferRequest, OrganizationSnapshot, PatientStatus, SourceStatus, TransferPhase,
    TransferRequest, TransferRequestEngine, TransferRequestView,
};

pub use consent_types::{NonEmptyText, Principal, Role, UnknownRole};
