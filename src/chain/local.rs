//! Default chain served by a standalone manager.
//!
//! # Routes
//! - `GET /healthz`: `ok` while running, `503` once shutdown has begun
//! - `GET /manager`: the manager record and registry mode as JSON

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::chain::{
    authorization_middleware, Authorizer, ChainBuilder, ChainError, ChainInputs, ManagerRecord,
    ProcessingChain,
};
use crate::lifecycle::ProcessContext;

/// Builds a chain exposing health and self-description endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChainBuilder;

impl ChainBuilder for LocalChainBuilder {
    fn build(&self, inputs: ChainInputs) -> Result<Box<dyn ProcessingChain>, ChainError> {
        if inputs.record.name.is_empty() {
            return Err(ChainError::Invalid("manager name is empty".into()));
        }

        let status = ManagerStatus {
            registry: inputs
                .registry
                .as_ref()
                .map(|connection| connection.target().to_string()),
            mode: if inputs.registry.is_some() {
                "registered"
            } else {
                "standalone"
            },
            manager: inputs.record,
        };

        Ok(Box::new(LocalChain {
            state: Arc::new(LocalState {
                ctx: inputs.ctx,
                status,
            }),
            authorizer: inputs.authorizer,
        }))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ManagerStatus {
    #[serde(flatten)]
    manager: ManagerRecord,
    mode: &'static str,
    registry: Option<String>,
}

struct LocalState {
    ctx: ProcessContext,
    status: ManagerStatus,
}

struct LocalChain {
    state: Arc<LocalState>,
    authorizer: Arc<dyn Authorizer>,
}

impl ProcessingChain for LocalChain {
    fn register(&self, server: Router) -> Router {
        let routes = Router::new()
            .route("/healthz", get(healthz))
            .route("/manager", get(manager))
            .with_state(Arc::clone(&self.state))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.authorizer),
                authorization_middleware,
            ));

        server.merge(routes).layer(TraceLayer::new_for_http())
    }
}

async fn healthz(State(state): State<Arc<LocalState>>) -> Response {
    if state.ctx.is_cancelled() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response()
    } else {
        (StatusCode::OK, "ok").into_response()
    }
}

async fn manager(State(state): State<Arc<LocalState>>) -> Json<ManagerStatus> {
    Json(state.status.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{AllowAll, AuthorizationError, AuthorizationRequest, ClientOptions};
    use crate::identity::bundle::fixtures;
    use crate::identity::{mtls_client_config, IdentityTokenGenerator, TokenGenerator};
    use crate::lifecycle::ShutdownCause;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct DenyManager;

    impl Authorizer for DenyManager {
        fn authorize(&self, request: &AuthorizationRequest<'_>) -> Result<(), AuthorizationError> {
            if request.path == "/manager" {
                return Err(AuthorizationError::Denied("manager record is private".into()));
            }
            Ok(())
        }
    }

    async fn chain(ctx: &ProcessContext, authorizer: Arc<dyn Authorizer>) -> Router {
        let source = fixtures::source().await;
        let tokens: Arc<dyn TokenGenerator> = Arc::new(IdentityTokenGenerator::new(
            source.clone(),
            Duration::from_secs(60),
        ));
        let inputs = ChainInputs {
            ctx: ctx.clone(),
            record: ManagerRecord {
                name: "nsmgr-a".into(),
                url: "tcp://10.0.0.7:5001".into(),
            },
            authorizer,
            tokens: Arc::clone(&tokens),
            registry: None,
            client: ClientOptions::new(mtls_client_config(&source).unwrap(), tokens),
        };
        let chain = LocalChainBuilder.build(inputs).unwrap();
        source.close();
        chain.register(Router::new())
    }

    async fn get(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_reports_ok_until_shutdown() {
        let ctx = ProcessContext::new();
        let router = chain(&ctx, Arc::new(AllowAll)).await;

        assert_eq!(get(router.clone(), "/healthz").await, (StatusCode::OK, "ok".into()));

        ctx.cancel(ShutdownCause::Stopped);
        let (status, _) = get(router, "/healthz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn manager_route_describes_standalone_manager() {
        let router = chain(&ProcessContext::new(), Arc::new(AllowAll)).await;
        let (status, body) = get(router, "/manager").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["name"], "nsmgr-a");
        assert_eq!(json["url"], "tcp://10.0.0.7:5001");
        assert_eq!(json["mode"], "standalone");
        assert!(json["registry"].is_null());
    }

    #[tokio::test]
    async fn denied_requests_get_forbidden() {
        let router = chain(&ProcessContext::new(), Arc::new(DenyManager)).await;

        let (status, body) = get(router.clone(), "/manager").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("manager record is private"));

        let (status, _) = get(router, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn empty_name_is_rejected() {
        let source = fixtures::source().await;
        let tokens: Arc<dyn TokenGenerator> = Arc::new(IdentityTokenGenerator::new(
            source.clone(),
            Duration::from_secs(60),
        ));
        let inputs = ChainInputs {
            ctx: ProcessContext::new(),
            record: ManagerRecord {
                name: String::new(),
                url: "unix:///nsm.sock".into(),
            },
            authorizer: Arc::new(AllowAll),
            tokens: Arc::clone(&tokens),
            registry: None,
            client: ClientOptions::new(mtls_client_config(&source).unwrap(), tokens),
        };

        assert!(matches!(
            LocalChainBuilder.build(inputs),
            Err(ChainError::Invalid(_))
        ));
        source.close();
    }
}
