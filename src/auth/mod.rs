//! Admin authorization gate
//!
//! Identity lives outside this service. The core only asks an `Authorizer`
//! whether a bearer token may perform admin operations, and records the
//! resulting principal in the audit trail.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AuthConfig;
use crate::error::{FleetError, FleetResult};
use crate::AppState;

/// Operator on whose behalf an admin request runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn anonymous() -> Self {
        Principal {
            name: "anonymous".to_string(),
        }
    }
}

pub trait Authorizer: Send + Sync {
    /// `bearer` is the raw token from the `Authorization` header, if any.
    fn authorize(&self, bearer: Option<&str>) -> FleetResult<Principal>;
}

/// Static token list from the config file
pub struct TokenAuthorizer {
    require_token: bool,
    tokens: HashMap<String, String>,
}

impl TokenAuthorizer {
    pub fn new(config: &AuthConfig) -> Self {
        TokenAuthorizer {
            require_token: config.require_token,
            tokens: config
                .tokens
                .iter()
                .map(|t| (t.token.clone(), t.name.clone()))
                .collect(),
        }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(&self, bearer: Option<&str>) -> FleetResult<Principal> {
        match bearer {
            Some(token) => match self.tokens.get(token) {
                Some(name) => Ok(Principal { name: name.clone() }),
                None if self.require_token => {
                    Err(FleetError::Unauthorized("invalid or expired token".into()))
                }
                None => Ok(Principal::anonymous()),
            },
            None if self.require_token => Err(FleetError::Unauthorized(
                "include header: Authorization: Bearer <token>".into(),
            )),
            None => Ok(Principal::anonymous()),
        }
    }
}

/// Middleware for admin routes: resolves the principal or rejects the request.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let bearer = match header_value {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(token) => Some(token.trim()),
            None => {
                warn!("Invalid authorization header format");
                return FleetError::Unauthorized(
                    "invalid authorization header format, use: Bearer <token>".into(),
                )
                .into_response();
            }
        },
        None => None,
    };

    match state.authorizer.authorize(bearer) {
        Ok(principal) => {
            debug!(principal = %principal.name, path = %request.uri().path(), "Admin request authorized");
            request.extensions_mut().insert(principal);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %request.uri().path(), "Admin request rejected");
            e.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiToken;

    fn authorizer(require_token: bool) -> TokenAuthorizer {
        TokenAuthorizer::new(&AuthConfig {
            require_token,
            tokens: vec![ApiToken {
                token: "abc123".to_string(),
                name: "ops".to_string(),
            }],
        })
    }

    #[test]
    fn known_token_resolves_operator() {
        let principal = authorizer(true).authorize(Some("abc123")).unwrap();
        assert_eq!(principal.name, "ops");
    }

    #[test]
    fn missing_or_unknown_token_rejected_when_required() {
        let auth = authorizer(true);
        assert!(matches!(auth.authorize(None), Err(FleetError::Unauthorized(_))));
        assert!(matches!(auth.authorize(Some("nope")), Err(FleetError::Unauthorized(_))));
    }

    #[test]
    fn open_mode_falls_back_to_anonymous() {
        let auth = authorizer(false);
        assert_eq!(auth.authorize(None).unwrap(), Principal::anonymous());
        assert_eq!(auth.authorize(Some("abc123")).unwrap().name, "ops");
    }
}
