// Error envelope shared by every REST response and rejected handshake:
//
//   {"error": {"code", "message", "retryable", "request_id", "details"}}
//
// Domain errors from the store and the messaging pipeline convert into it
// here so handlers can use `?` throughout.

use std::future::Future;

use axum::{
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::error;
use uuid::Uuid;

use crate::{
    messaging::{DeleteError, SendError},
    store::StoreError,
    validation::content_error,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

tokio::task_local! {
    static REQUEST_ID: String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationFailed,
    AuthInvalidToken,
    AuthForbidden,
    NotFound,
    InternalError,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::AuthInvalidToken => "AUTH_INVALID_TOKEN",
            Self::AuthForbidden => "AUTH_FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn status(self) -> StatusCode {
        match self {
            Self::ValidationFailed => StatusCode::BAD_REQUEST,
            Self::AuthInvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthForbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only server-side failures are worth retrying unchanged.
    pub const fn retryable(self) -> bool {
        matches!(self, Self::InternalError)
    }

    const fn default_message(self) -> &'static str {
        match self {
            Self::ValidationFailed => "request validation failed",
            Self::AuthInvalidToken => "invalid authentication token",
            Self::AuthForbidden => "caller is not a participant of this conversation",
            Self::NotFound => "requested resource not found",
            Self::InternalError => "internal server error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayError {
    code: ErrorCode,
    message: String,
    details: Value,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: json!({}) }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let body = json!({
            "error": {
                "code": self.code.as_str(),
                "message": self.message,
                "retryable": self.code.retryable(),
                "request_id": request_id,
                "details": self.details,
            }
        });

        let mut response = (self.code.status(), Json(body)).into_response();
        if let Some(request_id) = request_id.as_deref() {
            attach_request_id_header(&mut response, request_id);
        }
        response
    }
}

impl From<StoreError> for GatewayError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::UserNotFound(_)
            | StoreError::ConversationNotFound(_)
            | StoreError::MessageNotFound(_) => Self::new(ErrorCode::NotFound, error.to_string()),
            StoreError::NotParticipant { .. } => Self::from_code(ErrorCode::AuthForbidden),
            StoreError::InvalidPair { .. } => {
                Self::new(ErrorCode::ValidationFailed, error.to_string())
            }
            StoreError::Backend(source) => {
                // Backend details stay in the log, never in the response.
                error!(error = ?source, "chat store operation failed");
                Self::from_code(ErrorCode::InternalError)
            }
        }
    }
}

impl From<SendError> for GatewayError {
    fn from(error: SendError) -> Self {
        match error {
            SendError::Invalid(error) => content_error(&error),
            SendError::Store(error) => error.into(),
        }
    }
}

impl From<DeleteError> for GatewayError {
    fn from(error: DeleteError) -> Self {
        match error {
            DeleteError::NotFound(_) => Self::new(ErrorCode::NotFound, error.to_string()),
            DeleteError::NotSender(_) => Self::new(ErrorCode::AuthForbidden, error.to_string()),
            DeleteError::Store(error) => error.into(),
        }
    }
}

/// Runs `future` with `request_id` visible to [`current_request_id`].
pub async fn with_request_id_scope<F>(request_id: String, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_ID.scope(request_id, future).await
}

pub fn current_request_id() -> Option<String> {
    REQUEST_ID.try_with(Clone::clone).ok()
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}
