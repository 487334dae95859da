// Input validation shared by REST handlers and the chat socket.
//
// - `ValidatedJson<T>` extractor: content-type check + serde with the
//   gateway error envelope on failure.
// - Size limits for REST bodies and WebSocket frames.
// - Mapping of message content errors to VALIDATION_FAILED.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    response::{IntoResponse, Response},
    Json,
};
use carechat_common::content::ContentError;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::error::{ErrorCode, GatewayError};

/// Maximum WebSocket frame payload in bytes (256 KiB).
pub const MAX_WS_FRAME_BYTES: usize = 256 * 1024;

/// Maximum REST request body in bytes (1 MiB).
pub const MAX_REST_BODY_BYTES: usize = 1024 * 1024;

/// A JSON body extractor that returns a structured `GatewayError` on failure.
pub struct ValidatedJson<T>(pub T);

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidatedJson(value)),
            Err(rejection) => {
                let (message, details) = classify_json_rejection(&rejection);
                Err(GatewayError::new(ErrorCode::ValidationFailed, message)
                    .with_details(details)
                    .into_response())
            }
        }
    }
}

fn classify_json_rejection(rejection: &JsonRejection) -> (String, serde_json::Value) {
    match rejection {
        JsonRejection::JsonDataError(e) => {
            (format!("invalid JSON payload: {e}"), json!({ "kind": "data_error" }))
        }
        JsonRejection::JsonSyntaxError(e) => {
            (format!("malformed JSON: {e}"), json!({ "kind": "syntax_error" }))
        }
        JsonRejection::MissingJsonContentType(_) => (
            "expected Content-Type: application/json".to_string(),
            json!({ "kind": "missing_content_type" }),
        ),
        JsonRejection::BytesRejection(e) => {
            (format!("request body error: {e}"), json!({ "kind": "body_error" }))
        }
        other => (format!("request body error: {other}"), json!({ "kind": "unknown" })),
    }
}

pub fn content_error(error: &ContentError) -> GatewayError {
    let details = match error {
        ContentError::Empty => json!({ "field": "message", "kind": "empty" }),
        ContentError::TooLong { max, actual } => {
            json!({ "field": "message", "kind": "too_long", "max": max, "actual": actual })
        }
    };
    GatewayError::new(ErrorCode::ValidationFailed, error.to_string()).with_details(details)
}
