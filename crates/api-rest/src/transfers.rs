//! Doctor-to-doctor transfer requests gated on patient approval.

use crate::caller::Caller;
use crate::dto::{AttachUploadReq, CreateTransferReq, ErrorRes, ReasonReq, TransferListParams};
use crate::error::ApiResult;
use crate::{parse, AppState};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use consent_core::{NewTransferRequest, TransferRequest, TransferRequestView};

fn views(requests: Vec<TransferRequest>) -> Vec<TransferRequestView> {
    let now = Utc::now();
    requests.into_iter().map(|r| r.view(now)).collect()
}

#[utoipa::path(
    post,
    path = "/transfer-requests",
    request_body = CreateTransferReq,
    responses(
        (status = 200, description = "Transfer opened; awaiting the source doctor's upload"),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 403, description = "Only doctors may request transfers", body = ErrorRes)
    )
)]
/// Ask `source_doctor` to send a document about `patient` to the calling doctor.
#[axum::debug_handler]
pub async fn create(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(req): Json<CreateTransferReq>,
) -> ApiResult<TransferRequestView> {
    let new = NewTransferRequest {
        patient: parse::principal("patient", &req.patient)?,
        source_doctor: parse::principal("source_doctor", &req.source_doctor)?,
        description: req.description,
        purpose: req.purpose,
        urgency: parse::urgency(req.urgency.as_deref())?,
        expires_at: req.expires_at,
    };
    let created = state.service.create_transfer_request(&actor, new)?;
    Ok(Json(created.view(Utc::now())))
}

#[utoipa::path(
    get,
    path = "/transfer-requests",
    params(TransferListParams),
    responses(
        (status = 200, description = "Transfers in the requested slice"),
        (status = 403, description = "Query does not apply to the caller's role", body = ErrorRes)
    )
)]
/// `incoming` and `outgoing` are for doctors; `actionable` and `history` for patients.
#[axum::debug_handler]
pub async fn list(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(params): Query<TransferListParams>,
) -> ApiResult<Vec<TransferRequestView>> {
    let query = parse::transfer_query(&params.query)?;
    Ok(Json(views(state.service.transfers_for(&actor, query)?)))
}

#[utoipa::path(
    get,
    path = "/transfer-requests/{id}",
    params(("id" = String, Path, description = "Transfer request id")),
    responses(
        (status = 200, description = "The transfer"),
        (status = 403, description = "Caller is not a party to the transfer", body = ErrorRes),
        (status = 404, description = "No such transfer", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn get_one(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    Ok(Json(state.service.transfer_request(&actor, &id)?.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/transfer-requests/{id}/reject",
    params(("id" = String, Path, description = "Transfer request id")),
    request_body = ReasonReq,
    responses(
        (status = 200, description = "Rejected by the source doctor; never shown to the patient"),
        (status = 400, description = "A reason is required", body = ErrorRes),
        (status = 409, description = "Transfer is not awaiting upload", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn reject(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    Json(req): Json<ReasonReq>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    let reason = req.reason.unwrap_or_default();
    let rejected = state.service.reject_transfer(&actor, &id, &reason)?;
    Ok(Json(rejected.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/transfer-requests/{id}/attach",
    params(("id" = String, Path, description = "Transfer request id")),
    request_body = AttachUploadReq,
    responses(
        (status = 200, description = "Record attached; the patient can now decide"),
        (status = 409, description = "Transfer is not awaiting upload", body = ErrorRes)
    )
)]
/// Attach a record the source doctor uploaded for the patient. Upload it first via `POST /records`.
#[axum::debug_handler]
pub async fn attach(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    Json(req): Json<AttachUploadReq>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    let record_id = parse::record_id(&req.record_id)?;
    let attached = state
        .service
        .attach_transfer_upload(&actor, &id, &record_id, req.title.as_deref())?;
    Ok(Json(attached.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/transfer-requests/{id}/approve",
    params(("id" = String, Path, description = "Transfer request id")),
    responses(
        (status = 200, description = "Approved; `source_status` shows whether the grant landed"),
        (status = 409, description = "Transfer is not awaiting the patient", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn approve(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    let approved = state.service.approve_transfer(&actor, &id).await?;
    Ok(Json(approved.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/transfer-requests/{id}/deny",
    params(("id" = String, Path, description = "Transfer request id")),
    request_body = ReasonReq,
    responses(
        (status = 200, description = "Denied by the patient"),
        (status = 409, description = "Transfer is not awaiting the patient", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn deny(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Option<Json<ReasonReq>>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    let Json(req) = body.unwrap_or_default();
    let denied = state
        .service
        .deny_transfer(&actor, &id, req.reason.as_deref())?;
    Ok(Json(denied.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/transfer-requests/{id}/retry",
    params(("id" = String, Path, description = "Transfer request id")),
    responses(
        (status = 200, description = "Grant re-run for an approved transfer whose grant failed"),
        (status = 409, description = "Transfer has no failed grant to retry", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn retry(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<TransferRequestView> {
    let id = parse::transfer_request_id(&id)?;
    let retried = state.service.retry_transfer_grant(&actor, &id).await?;
    Ok(Json(retried.view(Utc::now())))
}
