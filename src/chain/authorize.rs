//! Authorization policy handle consulted by the processing chain.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Method, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

/// What a policy sees about one inbound request.
#[derive(Debug, Clone, Copy)]
pub struct AuthorizationRequest<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    /// Bearer token presented by the caller, if any.
    pub token: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("permission denied: {0}")]
    Denied(String),
}

/// Decides whether a request may proceed.
pub trait Authorizer: Send + Sync + 'static {
    fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<(), AuthorizationError>;
}

/// Policy that admits every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _request: &AuthorizationRequest<'_>) -> Result<(), AuthorizationError> {
        Ok(())
    }
}

/// Rejects requests the policy denies with `403 Forbidden`.
pub async fn authorization_middleware(
    State(authorizer): State<Arc<dyn Authorizer>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    let decision = authorizer.authorize(&AuthorizationRequest {
        method: request.method(),
        path: request.uri().path(),
        token,
    });

    match decision {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), error = %e, "Request denied");
            (StatusCode::FORBIDDEN, e.to_string()).into_response()
        }
    }
}
