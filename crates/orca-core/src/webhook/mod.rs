//! Webhook Receiver: the HTTP endpoint the tracker delivers deltas to
//! (§4.J).
//!
//! Every request body must carry a valid HMAC-SHA256 signature over the raw
//! payload, computed with the configured shared secret. The signature is
//! checked in constant time; a bad or missing signature is a 401, a
//! well-signed but unparseable body is a 400, and a signed, well-formed
//! payload always gets a 200 once handed to tracker sync, because replays
//! of the same delta are harmless there.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::SqlitePool;
use tokio::sync::RwLock as AsyncRwLock;

use crate::config::OrcaConfig;
use crate::graph::DependencyGraph;
use crate::tracker::{self, WebhookEvent};

const SIGNATURE_HEADER: &str = "x-orca-signature";

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn unauthorized(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::UNAUTHORIZED, message: msg.into() }
    }

    fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct WebhookState {
    db: SqlitePool,
    graph: Arc<AsyncRwLock<DependencyGraph>>,
    secret: Vec<u8>,
    ready_state_type: String,
    repo_path_overrides: std::collections::HashMap<String, String>,
    default_cwd: Option<String>,
}

impl WebhookState {
    pub fn new(db: SqlitePool, graph: Arc<AsyncRwLock<DependencyGraph>>, config: &OrcaConfig) -> Self {
        Self {
            db,
            graph,
            secret: config.webhook_secret.as_bytes().to_vec(),
            ready_state_type: config.ready_state_type.clone(),
            repo_path_overrides: config.repo_path_overrides.clone(),
            default_cwd: config.default_cwd.clone(),
        }
    }
}

pub fn build_router(state: WebhookState) -> Router {
    Router::new().route("/webhook", post(receive_webhook)).with_state(state)
}

/// Verify `body` against the hex-encoded signature in `signature`, in
/// constant time. The signature covers the raw request bytes, not the
/// parsed JSON, so verification must happen before decoding.
fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> bool {
    let Ok(sig_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&sig_bytes).is_ok()
}

async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::unauthorized("missing signature header"))?;

    if !verify_signature(&state.secret, &body, signature) {
        return Err(AppError::unauthorized("invalid signature"));
    }

    let event: WebhookEvent =
        serde_json::from_slice(&body).map_err(|e| AppError::bad_request(format!("malformed payload: {e}")))?;

    tracker::handle_webhook_event(
        &state.db,
        &state.graph,
        event,
        &state.ready_state_type,
        &state.repo_path_overrides,
        state.default_cwd.as_deref(),
        chrono::Utc::now(),
    )
    .await
    .map_err(|e| AppError::internal(e.into()))?;

    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn test_state() -> (WebhookState, Vec<u8>, tempfile::TempDir) {
        let (db, dir) = orca_test_utils::create_test_db().await;
        let graph = Arc::new(AsyncRwLock::new(DependencyGraph::new()));
        let secret = b"test-secret".to_vec();
        let state = WebhookState {
            db,
            graph,
            secret: secret.clone(),
            ready_state_type: "ready".to_string(),
            repo_path_overrides: Default::default(),
            default_cwd: Some("/tmp/repo".to_string()),
        };
        (state, secret, dir)
    }

    #[tokio::test]
    async fn rejects_missing_signature() {
        let (state, _secret, _dir) = test_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(Request::builder().method("POST").uri("/webhook").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_bad_signature() {
        let (state, _secret, _dir) = test_state().await;
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, "deadbeef")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn rejects_malformed_payload_with_valid_signature() {
        let (state, secret, _dir) = test_state().await;
        let body = b"not json".to_vec();
        let sig = sign(&secret, &body);
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, sig)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepts_signed_relation_event() {
        let (state, secret, _dir) = test_state().await;
        let body = serde_json::to_vec(&serde_json::json!({
            "event": "relation_created",
            "blocker": "PROJ-1",
            "blocked": "PROJ-2",
        }))
        .unwrap();
        let sig = sign(&secret, &body);
        let graph = state.graph.clone();
        let app = build_router(state);
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/webhook")
                    .header(SIGNATURE_HEADER, sig)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!graph.read().await.is_dispatchable("PROJ-2", |_| None));
    }

    #[tokio::test]
    async fn duplicate_delivery_is_harmless() {
        let (state, secret, _dir) = test_state().await;
        let body = serde_json::to_vec(&serde_json::json!({
            "event": "relation_created",
            "blocker": "PROJ-1",
            "blocked": "PROJ-2",
        }))
        .unwrap();
        let sig = sign(&secret, &body);
        let app = build_router(state);
        for _ in 0..2 {
            let resp = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method("POST")
                        .uri("/webhook")
                        .header(SIGNATURE_HEADER, sig.clone())
                        .body(Body::from(body.clone()))
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }
    }
}
