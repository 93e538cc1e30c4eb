//! HTTP response building helpers
//!
//! Every JSON body carries `success`; errors add `error` (and `resetAt` when
//! rate limited).

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::error::ConquestError;

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    success: bool,
    #[serde(flatten)]
    body: &'a T,
}

/// Build a JSON response with the given status code
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize response body");
        r#"{"success":false,"error":"Failed to serialize response"}"#.to_string()
    });
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// `{ "success": <success>, ...body }`
pub fn envelope<T: Serialize>(status: StatusCode, success: bool, body: &T) -> Response<Full<Bytes>> {
    json_response(status, &Envelope { success, body })
}

/// 200 OK with `success: true`
pub fn ok<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    envelope(StatusCode::OK, true, body)
}

/// 202 Accepted with `success: true`
pub fn accepted<T: Serialize>(body: &T) -> Response<Full<Bytes>> {
    envelope(StatusCode::ACCEPTED, true, body)
}

fn failure(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &serde_json::json!({ "success": false, "error": message }),
    )
}

pub fn not_found(message: &str) -> Response<Full<Bytes>> {
    failure(StatusCode::NOT_FOUND, message)
}

pub fn bad_request(message: &str) -> Response<Full<Bytes>> {
    failure(StatusCode::BAD_REQUEST, message)
}

pub fn payload_too_large(message: &str) -> Response<Full<Bytes>> {
    failure(StatusCode::PAYLOAD_TOO_LARGE, message)
}

/// Convert a ConquestError to an appropriate HTTP response
pub fn error_response(err: &ConquestError) -> Response<Full<Bytes>> {
    match err {
        ConquestError::RateLimited { reset_at_ms } => {
            let now = chrono::Utc::now().timestamp_millis();
            let retry_after_secs = ((reset_at_ms - now).max(0) + 999) / 1000;
            let mut response = json_response(
                StatusCode::TOO_MANY_REQUESTS,
                &serde_json::json!({
                    "success": false,
                    "error": "Rate limit exceeded. Please wait before making more requests.",
                    "resetAt": chrono::DateTime::from_timestamp_millis(*reset_at_ms)
                        .map(|t| t.to_rfc3339()),
                }),
            );
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs.max(1)));
            response
        }
        ConquestError::CellNotFound { .. } | ConquestError::JobNotFound(_) => {
            not_found(&err.to_string())
        }
        ConquestError::Json(e) => bad_request(&format!("Invalid request body: {e}")),
        e if e.is_client_error() => bad_request(&e.to_string()),
        e => {
            error!(error = %e, "Request failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}
