//! Wire shapes for request bodies and the few responses that are not core types.
//!
//! Identifiers and principals arrive as plain strings and are parsed in the handlers, so a
//! malformed value is a 400 carrying the parse error rather than a generic body rejection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
    /// Whether repeating the same call unchanged may succeed.
    pub retriable: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UploadRecordReq {
    /// Owning patient. Defaults to the caller.
    #[serde(default)]
    pub patient: Option<String>,
    pub title: String,
    pub record_type: String,
    /// Plaintext, standard base64.
    pub content_base64: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub co_authorized: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecordCiphertextRes {
    pub record_id: String,
    pub patient: String,
    pub title: String,
    pub mime_type: Option<String>,
    pub policy_version: u64,
    /// Wrapped content key, standard base64.
    pub wrapped_key: String,
    /// Ciphertext, standard base64.
    pub ciphertext: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateAccessRequestReq {
    pub patient: String,
    pub record_ids: Vec<String>,
    pub purpose: String,
    /// `routine`, `urgent` or `emergency`.
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub requested_duration_days: Option<u32>,
    /// Save without sending to the patient.
    #[serde(default)]
    pub draft: bool,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ApproveAccessReq {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ReasonReq {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateTransferReq {
    pub patient: String,
    pub source_doctor: String,
    pub description: String,
    pub purpose: String,
    #[serde(default)]
    pub urgency: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AttachUploadReq {
    pub record_id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AccessListParams {
    /// Display status filter: `draft`, `sent`, `approved`, `denied`, `revoked` or `expired`.
    pub status: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TransferListParams {
    /// `incoming`, `outgoing`, `actionable` or `history`.
    pub query: String,
}
