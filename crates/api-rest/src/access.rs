//! Direct patient↔doctor access requests.

use crate::caller::Caller;
use crate::dto::{AccessListParams, ApproveAccessReq, CreateAccessRequestReq, ErrorRes, ReasonReq};
use crate::error::ApiResult;
use crate::{parse, AppState};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use consent_core::{AccessDisplayStatus, AccessRequestView, BatchReport, NewAccessRequest};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RevokeAccessRes {
    pub request: AccessRequestView,
    pub report: BatchReport,
}

#[utoipa::path(
    post,
    path = "/access-requests",
    request_body = CreateAccessRequestReq,
    responses(
        (status = 200, description = "Request sent, or saved as a draft"),
        (status = 400, description = "Bad request", body = ErrorRes),
        (status = 403, description = "Only doctors may request access", body = ErrorRes)
    )
)]
/// Create an access request as the calling doctor.
///
/// Every record must belong to `patient`. With `draft: true` the request is saved without
/// being shown to the patient.
#[axum::debug_handler]
pub async fn create(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Json(req): Json<CreateAccessRequestReq>,
) -> ApiResult<AccessRequestView> {
    let new = NewAccessRequest {
        patient: parse::principal("patient", &req.patient)?,
        record_ids: parse::record_ids(&req.record_ids)?,
        purpose: req.purpose,
        urgency: parse::urgency(req.urgency.as_deref())?,
        requested_duration_days: req.requested_duration_days,
    };
    let created = if req.draft {
        state.service.create_access_draft(&actor, new)?
    } else {
        state.service.create_access_request(&actor, new)?
    };
    Ok(Json(created.view(Utc::now())))
}

#[utoipa::path(
    get,
    path = "/access-requests",
    params(AccessListParams),
    responses(
        (status = 200, description = "Requests involving the caller, newest first for doctors"),
        (status = 400, description = "Unknown status filter", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn list(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Query(params): Query<AccessListParams>,
) -> ApiResult<Vec<AccessRequestView>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<AccessDisplayStatus>)
        .transpose()?;
    let now = Utc::now();
    let requests = state.service.access_requests_for(&actor, status)?;
    Ok(Json(requests.into_iter().map(|r| r.view(now)).collect()))
}

#[utoipa::path(
    get,
    path = "/access-requests/{id}",
    params(("id" = String, Path, description = "Access request id")),
    responses(
        (status = 200, description = "The request"),
        (status = 403, description = "Caller is not a party to the request", body = ErrorRes),
        (status = 404, description = "No such request", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn get_one(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<AccessRequestView> {
    let id = parse::access_request_id(&id)?;
    Ok(Json(state.service.access_request(&actor, &id)?.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/access-requests/{id}/send",
    params(("id" = String, Path, description = "Access request id")),
    responses(
        (status = 200, description = "Draft sent to the patient"),
        (status = 409, description = "Request is not a draft", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn send(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<AccessRequestView> {
    let id = parse::access_request_id(&id)?;
    Ok(Json(state.service.send_access_request(&actor, &id)?.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/access-requests/{id}/approve",
    params(("id" = String, Path, description = "Access request id")),
    request_body = ApproveAccessReq,
    responses(
        (status = 200, description = "Approved; `delivery` reports how the grants went"),
        (status = 409, description = "Request is not awaiting a decision, or is being processed", body = ErrorRes)
    )
)]
/// Approve a sent request and grant the doctor every live record on it.
///
/// Without `expires_at` the requested duration (if any) sets the expiry.
#[axum::debug_handler]
pub async fn approve(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Option<Json<ApproveAccessReq>>,
) -> ApiResult<AccessRequestView> {
    let id = parse::access_request_id(&id)?;
    let Json(req) = body.unwrap_or_default();
    let approved = state
        .service
        .approve_access_request(&actor, &id, req.expires_at)
        .await?;
    Ok(Json(approved.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/access-requests/{id}/deny",
    params(("id" = String, Path, description = "Access request id")),
    request_body = ReasonReq,
    responses(
        (status = 200, description = "Denied; no policy changes"),
        (status = 409, description = "Request is not awaiting a decision", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn deny(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
    body: Option<Json<ReasonReq>>,
) -> ApiResult<AccessRequestView> {
    let id = parse::access_request_id(&id)?;
    let Json(req) = body.unwrap_or_default();
    let denied = state
        .service
        .deny_access_request(&actor, &id, req.reason.as_deref())?;
    Ok(Json(denied.view(Utc::now())))
}

#[utoipa::path(
    post,
    path = "/access-requests/{id}/revoke",
    params(("id" = String, Path, description = "Access request id")),
    responses(
        (status = 200, description = "Revoked; report lists the records resealed without the doctor"),
        (status = 409, description = "Request is not approved", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn revoke(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<RevokeAccessRes> {
    let id = parse::access_request_id(&id)?;
    let (request, report) = state.service.revoke_access_request(&actor, &id).await?;
    Ok(Json(RevokeAccessRes {
        request: request.view(Utc::now()),
        report,
    }))
}

#[utoipa::path(
    post,
    path = "/access-requests/{id}/retry",
    params(("id" = String, Path, description = "Access request id")),
    responses(
        (status = 200, description = "Grant delivery re-run for an approved request"),
        (status = 409, description = "Request is not approved", body = ErrorRes)
    )
)]
#[axum::debug_handler]
pub async fn retry(
    State(state): State<AppState>,
    Caller(actor): Caller,
    Path(id): Path<String>,
) -> ApiResult<AccessRequestView> {
    let id = parse::access_request_id(&id)?;
    let retried = state.service.retry_access_grants(&actor, &id).await?;
    Ok(Json(retried.view(Utc::now())))
}
