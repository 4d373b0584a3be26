//! REST API for the consent service.
//!
//! Every route except `/health` and the Swagger UI identifies the caller from the `x-principal`
//! and `x-role` headers (see [`caller`]). Errors are JSON bodies whose status follows the error
//! classification in `consent-core`.

pub mod access;
pub mod caller;
pub mod dto;
pub mod error;
mod parse;
pub mod records;
pub mod transfers;

use anyhow::Context;
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use caller::Caller;
use consent_core::{ConsentService, Identity};
use dto::{
    ApproveAccessReq, AttachUploadReq, CreateAccessRequestReq, CreateTransferReq, ErrorRes,
    HealthRes, ReasonReq, RecordCiphertextRes, UploadRecordReq,
};
use error::ApiResult;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use consent_core::ServiceSettings;

/// Application state shared across REST API handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ConsentService>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        list_identities,
        records::upload_record,
        records::list_records,
        records::fetch_record,
        records::delete_record,
        access::create,
        access::list,
        access::get_one,
        access::send,
        access::approve,
        access::deny,
        access::revoke,
        access::retry,
        transfers::create,
        transfers::list,
        transfers::get_one,
        transfers::reject,
        transfers::attach,
        transfers::approve,
        transfers::deny,
        transfers::retry,
    ),
    components(schemas(
        HealthRes,
        ErrorRes,
        UploadRecordReq,
        RecordCiphertextRes,
        CreateAccessRequestReq,
        ApproveAccessReq,
        ReasonReq,
        CreateTransferReq,
        AttachUploadReq,
    ))
)]
struct ApiDoc;

/// Build the router with all routes, Swagger UI and a permissive CORS layer.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/identities", get(list_identities))
        .route(
            "/records",
            get(records::list_records).post(records::upload_record),
        )
        .route(
            "/records/:id",
            get(records::fetch_record).delete(records::delete_record),
        )
        .route("/access-requests", get(access::list).post(access::create))
        .route("/access-requests/:id", get(access::get_one))
        .route("/access-requests/:id/send", post(access::send))
        .route("/access-requests/:id/approve", post(access::approve))
        .route("/access-requests/:id/deny", post(access::deny))
        .route("/access-requests/:id/revoke", post(access::revoke))
        .route("/access-requests/:id/retry", post(access::retry))
        .route(
            "/transfer-requests",
            get(transfers::list).post(transfers::create),
        )
        .route("/transfer-requests/:id", get(transfers::get_one))
        .route("/transfer-requests/:id/reject", post(transfers::reject))
        .route("/transfer-requests/:id/attach", post(transfers::attach))
        .route("/transfer-requests/:id/approve", post(transfers::approve))
        .route("/transfer-requests/:id/deny", post(transfers::deny))
        .route("/transfer-requests/:id/retry", post(transfers::retry))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the REST API on `addr` until Ctrl-C, then write a final snapshot.
///
/// # Errors
/// * If the address cannot be bound, the server fails, or the final snapshot cannot be written
pub async fn serve(addr: &str, service: Arc<ConsentService>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind REST listener on {addr}"))?;
    tracing::info!("++ Starting consent REST on {}", addr);

    let app = router(AppState {
        service: service.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.persist().context("failed to write final snapshot")?;
    tracing::info!("-- Consent REST stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for monitoring and load balancers.
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "consent service is alive".to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/identities",
    responses(
        (status = 200, description = "Every principal in the identity directory"),
        (status = 401, description = "Missing caller headers", body = ErrorRes)
    )
)]
#[axum::debug_handler]
async fn list_identities(
    State(state): State<AppState>,
    Caller(_actor): Caller,
) -> ApiResult<Vec<Identity>> {
    Ok(Json(state.service.identities().list()?))
}
