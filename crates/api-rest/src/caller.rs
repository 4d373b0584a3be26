//! Caller identity taken from headers set by the upstream session layer.
//!
//! Wallet connection and login happen in front of this service; by the time a request arrives the
//! gateway has attached `x-principal` and `x-role`. A role the directory contradicts is refused.

use crate::error::ApiError;
use crate::AppState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use consent_core::{Actor, ErrorKind, Principal, Role};

pub const PRINCIPAL_HEADER: &str = "x-principal";
pub const ROLE_HEADER: &str = "x-role";

#[derive(Debug, Clone)]
pub struct Caller(pub Actor);

fn header<'a>(parts: &'a Parts, name: &'static str) -> Result<&'a str, ApiError> {
    parts
        .headers
        .get(name)
        .ok_or_else(|| ApiError::unauthorized(format!("missing {name} header")))?
        .to_str()
        .map_err(|_| ApiError::bad_request(format!("{name} header is not valid text")))
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let principal = Principal::parse(header(parts, PRINCIPAL_HEADER)?)
            .map_err(|e| ApiError::bad_request(e.to_string()))?;
        let role: Role = header(parts, ROLE_HEADER)?
            .parse()
            .map_err(|e: consent_core::UnknownRole| ApiError::bad_request(e.to_string()))?;

        if let Err(err) = state.service.identities().check_role(&principal, role) {
            return Err(match err.kind() {
                ErrorKind::Validation => ApiError::forbidden(err.to_string()),
                _ => err.into(),
            });
        }
        Ok(Caller(Actor::new(principal, role)))
    }
}
