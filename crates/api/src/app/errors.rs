use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::{json, Value};

use procura_core::DomainError;
use procura_infra::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::Domain(e) => domain_error_to_response(e),
        StoreError::PayloadTooLarge { .. } => {
            json_error(StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", err.to_string())
        }
        StoreError::Backend { .. } => {
            tracing::error!(error = %err, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "storage backend failure")
        }
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        DomainError::NotFound { .. } => json_error(StatusCode::NOT_FOUND, "not_found", message),
        DomainError::Validation { details, .. } => json_error_with_details(
            StatusCode::BAD_REQUEST,
            "validation_error",
            message,
            json!(details),
        ),
        DomainError::InvalidId(_) => json_error(StatusCode::BAD_REQUEST, "invalid_id", message),
        DomainError::DuplicateKey { field, value } => json_error_with_details(
            StatusCode::CONFLICT,
            "duplicate_key",
            message,
            json!({ "field": field, "value": value }),
        ),
        DomainError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn json_error_with_details(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
    details: Value,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
            "details": details,
        })),
    )
        .into_response()
}
