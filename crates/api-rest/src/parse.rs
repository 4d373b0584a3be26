use crate::error::ApiError;
use consent_core::{AccessRequestId, Principal, RecordId, TransferQuery, TransferRequestId, Urgency};
use std::str::FromStr;

pub fn principal(field: &str, input: &str) -> Result<Principal, ApiError> {
    Principal::parse(input).map_err(|e| ApiError::bad_request(format!("{field}: {e}")))
}

pub fn principals(field: &str, inputs: &[String]) -> Result<Vec<Principal>, ApiError> {
    inputs.iter().map(|p| principal(field, p)).collect()
}

fn id<T>(field: &str, input: &str) -> Result<T, ApiError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    input
        .parse()
        .map_err(|e| ApiError::bad_request(format!("{field}: {e}")))
}

pub fn record_id(input: &str) -> Result<RecordId, ApiError> {
    id("record id", input)
}

pub fn record_ids(inputs: &[String]) -> Result<Vec<RecordId>, ApiError> {
    inputs.iter().map(|r| record_id(r)).collect()
}

pub fn access_request_id(input: &str) -> Result<AccessRequestId, ApiError> {
    id("access request id", input)
}

pub fn transfer_request_id(input: &str) -> Result<TransferRequestId, ApiError> {
    id("transfer request id", input)
}

pub fn urgency(input: Option<&str>) -> Result<Urgency, ApiError> {
    match input {
        None => Ok(Urgency::default()),
        Some(u) => id("urgency", u),
    }
}

pub fn transfer_query(input: &str) -> Result<TransferQuery, ApiError> {
    match input.trim().to_ascii_lowercase().as_str() {
        "incoming" => Ok(TransferQuery::Incoming),
        "outgoing" => Ok(TransferQuery::Outgoing),
        "actionable" => Ok(TransferQuery::Actionable),
        "history" => Ok(TransferQuery::History),
        other => Err(ApiError::bad_request(format!("unknown transfer query: {other}"))),
    }
}
