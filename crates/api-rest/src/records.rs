//! Record upload, listing, authorised read and deletion.

use crate::caller::Caller;
use crate::dto::{ErrorRes, RecordCiphertextRes, UploadRecordReq};
use crate::error::{ApiError, ApiResult};
use crate::{parse, AppState};
use axum::extract::{Path, State};
use axum::Json;
use base64::{engine::general_purpose, Engine as _};
use consent_core::{DeletionReport, HealthRecord, UploadRecord};

#[utoipa::path(
    post,
    path = "/records",
    request_body = UploadRecordReq,
    responses(
        (status = 200, description = "Record sealed and stored"),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 403, description = "Caller may not upload for this patient", body = ErrorRes),
        (status = 503, description = "Blob store or crypto service unavailable", body = ErrorRes)
    )
)]
/// Upload a record.
///
/// Patients upload their own records. A doctor may name a patient and is then co-authorised on
/// the new record.
#[axum::debug_handler]
pub async fn upload_record(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(req): Json<UploadRecordReq>,
) -> ApiResult<HealthRecord> {
    let patient = match req.patient.as_deref() {
        Some(p) => parse::principal("patient", p)?,
        None => actor.principal.clone(),
    };
    let content = general_purpose::STANDARD
        .decode(req.content_base64.as_bytes())
        .map_err(|e| ApiError::bad_request(format!("content_base64: {e}")))?;

    let upload = UploadRecord {
        patient,
        title: req.title,
        record_type: req.record_type,
        content,
        mime_type: req.mime_type,
        co_authorized: parse::principals("co_authorized", &req.co_authorized)?,
    };
    Ok(Json(state.service.upload_record(&actor, upload).await?))
}

#[utoipa::path(
    get,
    path = "/records",
    responses(
        (status = 200, description = "Records owned by, or shared with, the caller")
    )
)]
#[axum::debug_handler]
pub async fn list_records(
    State(state): State<AppState>,
    Caller(actor): Caller,
) -> ApiResult<Vec<HealthRecord>> {
    Ok(Json(state.service.list_records(&actor)?))
}

#[utoipa::path(
    get,
    path = "/records/{id}",
    params(("id" = String, Path, description = "Record id")),
    responses(
        (status = 200, description = "Ciphertext and wrapped key", body = RecordCiphertextRes),
        (status = 403, description = "Caller is not in the record's policy", body = ErrorRes),
        (status = 404, description = "No such record", body = ErrorRes)
    )
)]
/// Ciphertext and wrapped key, for principals in the record's policy only.
///
/// # Errors
/// * 403 - the caller is not authorised to decrypt the record
/// * 404 - unknown record id
#[axum::debug_handler]
pub async fn fetch_record(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<RecordCiphertextRes> {
    let id = parse::record_id(&id)?;
    let fetched = state.service.fetch_ciphertext(&actor, &id).await?;
    let record = fetched.record;
    Ok(Json(RecordCiphertextRes {
        record_id: record.id.to_string(),
        patient: record.patient.to_string(),
        title: record.title.to_string(),
        mime_type: record.mime_type.map(|m| m.to_string()),
        policy_version: record.policy_version,
        wrapped_key: record.wrapped_key.to_base64(),
        ciphertext: general_purpose::STANDARD.encode(fetched.ciphertext),
    }))
}

#[utoipa::path(
    delete,
    path = "/records/{id}",
    params(("id" = String, Path, description = "Record id")),
    responses(
        (status = 200, description = "Record deleted; referencing requests flagged"),
        (status = 403, description = "Only the owning patient may delete", body = ErrorRes),
        (status = 404, description = "No such record", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn delete_record(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<DeletionReport> {
    let id = parse::record_id(&id)?;
    Ok(Json(state.service.delete_record(&actor, &id).await?))
}
