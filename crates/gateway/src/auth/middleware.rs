use crate::{
    auth::identity::{AuthError, IdentityResolver},
    error::{ErrorCode, GatewayError},
};
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

pub async fn require_bearer_auth(
    State(resolver): State<IdentityResolver>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token);

    let identity = match resolver.resolve(token).await {
        Ok(identity) => identity,
        Err(error) => return auth_error_response(&error),
    };

    request.extensions_mut().insert(identity);

    next.run(request).await
}

pub(crate) fn extract_bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("Bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() {
        return None;
    }

    Some(token)
}

pub(crate) fn auth_error_response(error: &AuthError) -> Response {
    let error = match error {
        AuthError::MissingToken => {
            GatewayError::new(ErrorCode::AuthInvalidToken, "missing bearer token")
        }
        AuthError::InvalidToken | AuthError::UnknownSubject => {
            GatewayError::new(ErrorCode::AuthInvalidToken, "invalid bearer token")
        }
        AuthError::Unavailable(_) => GatewayError::from_code(ErrorCode::InternalError),
    };
    error.into_response()
}
