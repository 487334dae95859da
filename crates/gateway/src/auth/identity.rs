use std::sync::Arc;

use carechat_common::types::{Role, UserId, UserSummary};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    auth::jwt::JwtAccessTokenService,
    store::{ChatStore, StoreError},
};

/// The authenticated principal behind a request or socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub display_name: String,
    pub role: Role,
}

impl From<UserSummary> for Identity {
    fn from(user: UserSummary) -> Self {
        Self {
            user_id: user.id,
            username: user.username,
            display_name: user.display_name,
            role: user.role,
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("invalid access token")]
    InvalidToken,
    #[error("access token subject does not match a user")]
    UnknownSubject,
    #[error("identity lookup failed")]
    Unavailable(#[source] StoreError),
}

/// Maps an access token to an [`Identity`].
///
/// Validation is local (signature, expiry); the subject is then resolved
/// against the user table so deleted accounts stop authenticating.
#[derive(Clone)]
pub struct IdentityResolver {
    jwt_service: Arc<JwtAccessTokenService>,
    store: ChatStore,
}

impl IdentityResolver {
    pub fn new(jwt_service: Arc<JwtAccessTokenService>, store: ChatStore) -> Self {
        Self { jwt_service, store }
    }

    pub async fn resolve(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token.map(str::trim).filter(|token| !token.is_empty());
        let Some(token) = token else {
            return Err(AuthError::MissingToken);
        };

        let user_id = self.jwt_service.validate_access_token(token).map_err(|error| {
            debug!(error = %error, "access token rejected");
            AuthError::InvalidToken
        })?;

        match self.store.user(user_id).await {
            Ok(Some(user)) => Ok(Identity::from(user)),
            Ok(None) => {
                debug!(user_id, "access token subject has no user record");
                Err(AuthError::UnknownSubject)
            }
            Err(error) => {
                warn!(user_id, error = %error, "identity lookup failed");
                Err(AuthError::Unavailable(error))
            }
        }
    }
}
