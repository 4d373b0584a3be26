use crate::external::ExternalError;
use crate::ids::{AccessRequestId, RecordId, TransferRequestId};
use consent_types::{Principal, PrincipalError};

#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("malformed principal identifier: {0}")]
    InvalidPrincipal(#[from] PrincipalError),
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] consent_uuid::UuidError),

    #[error("{actor} is not permitted to {action}")]
    Unauthorized {
        actor: Principal,
        action: &'static str,
    },

    #[error("record not found: {0}")]
    RecordNotFound(RecordId),
    #[error("access request not found: {0}")]
    AccessRequestNotFound(AccessRequestId),
    #[error("transfer request not found: {0}")]
    TransferRequestNotFound(TransferRequestId),
    #[error("unknown principal: {0}")]
    UnknownPrincipal(Principal),

    #[error("cannot {action} while {state}")]
    InvalidTransition { state: String, action: &'static str },
    #[error("another operation is in progress for request {0}")]
    RequestBusy(String),

    #[error("policy update for record {record_id} lost {attempts} consecutive races")]
    PolicyConflict { record_id: RecordId, attempts: u32 },
    #[error("policy version mismatch for record {record_id}: expected {expected}, found {found}")]
    VersionMismatch {
        record_id: RecordId,
        expected: u64,
        found: u64,
    },

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
    #[error("failed to write file: {0}")]
    FileWrite(std::io::Error),
    #[error("failed to serialize state: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize state: {0}")]
    Deserialization(serde_json::Error),
    #[error("unsupported snapshot format version {0}")]
    SnapshotVersion(u32),
    #[error("identity directory schema mismatch: {0}")]
    IdentityDirectory(String),
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// Coarse classification of [`ConsentError`] used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input was rejected before any state change.
    Validation,
    /// The actor may not perform this transition.
    Authorization,
    NotFound,
    /// The entity is not in a state that allows the transition.
    InvalidState,
    /// A concurrent writer won; safe to retry.
    Conflict,
    /// Blob store or crypto service failed; safe to retry.
    ExternalService,
    Storage,
}

impl ConsentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConsentError::Validation(_)
            | ConsentError::InvalidPrincipal(_)
            | ConsentError::InvalidId(_) => ErrorKind::Validation,
            ConsentError::Unauthorized { .. } => ErrorKind::Authorization,
            ConsentError::RecordNotFound(_)
            | ConsentError::AccessRequestNotFound(_)
            | ConsentError::TransferRequestNotFound(_)
            | ConsentError::UnknownPrincipal(_) => ErrorKind::NotFound,
            ConsentError::InvalidTransition { .. } => ErrorKind::InvalidState,
            ConsentError::RequestBusy(_)
            | ConsentError::PolicyConflict { .. }
            | ConsentError::VersionMismatch { .. } => ErrorKind::Conflict,
            ConsentError::External(_) => ErrorKind::ExternalService,
            ConsentError::FileRead(_)
            | ConsentError::FileWrite(_)
            | ConsentError::Serialization(_)
            | ConsentError::Deserialization(_)
            | ConsentError::SnapshotVersion(_)
            | ConsentError::IdentityDirectory(_)
            | ConsentError::LockPoisoned(_) => ErrorKind::Storage,
        }
    }

    /// Whether repeating the same call unchanged may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::ExternalService
        )
    }

    pub(crate) fn unauthorized(actor: &Principal, action: &'static str) -> Self {
        ConsentError::Unauthorized {
            actor: actor.clone(),
            action,
        }
    }

    pub(crate) fn invalid_transition(state: impl Into<String>, action: &'static str) -> Self {
        ConsentError::InvalidTransition {
            state: state.into(),
            action,
        }
    }
}

pub type ConsentResult<T> = std::result::Result<T, ConsentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_and_external_failures_are_retriable() {
        let conflict = ConsentError::PolicyConflict {
            record_id: RecordId::new(),
            attempts: 5,
        };
        assert_eq!(conflict.kind(), ErrorKind::Conflict);
        assert!(conflict.is_retriable());

        let external = ConsentError::External(ExternalError::Unavailable {
            service: "crypto",
            message: "down".into(),
        });
        assert!(external.is_retriable());

        let validation = ConsentError::Validation("purpose too short".into());
        assert_eq!(validation.kind(), ErrorKind::Validation);
        assert!(!validation.is_retriable());
    }
}
