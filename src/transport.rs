//! The Transport & Auth Boundary (§2.K, §6): a minimal `axum` binding of
//! `planner::SynthDb::handle` over a single endpoint, plus the `Api-Key`
//! middleware layer gated behind `--secure`.
//!
//! Grounded on the host crate's `http_server.rs` (`AppState`, `Router`
//! construction, `ServiceBuilder`/`TraceLayer`/`CorsLayer` stack) and
//! `auth_middleware.rs` (header extraction, `IntoResponse` error type),
//! generalized from document-CRUD routes to the single PreQL request
//! envelope this spec defines. `Handler::handle` is the seam a real
//! production transport would plug into instead of this `axum` router.

use crate::planner::{RequestEnvelope, Response as PlannerResponse, SynthDb};
use crate::stream::{event_stream_framed, tab_framed};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json};
use axum::routing::post;
use axum::Router;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// `Handler::handle` is the in-process request seam §2.K specifies:
/// any transport (this `axum` router, a future gRPC binding, a test
/// harness) drives `SynthDb` through this one method.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<PlannerResponse, crate::errors::SynthError>;
}

#[async_trait]
impl Handler for SynthDb {
    async fn handle(&self, envelope: RequestEnvelope) -> Result<PlannerResponse, crate::errors::SynthError> {
        SynthDb::handle(self, envelope).await
    }
}

#[derive(Clone)]
struct AppState {
    db: Arc<dyn Handler>,
}

/// Build the router: one POST endpoint reading the four headers of §6,
/// with the `Api-Key` layer installed only when `expected_api_key` is
/// `Some` (i.e. the server was started with `--secure`).
pub fn router(db: Arc<dyn Handler>, expected_api_key: Option<String>) -> Router {
    let state = AppState { db };
    let mut router = Router::new().route("/query", post(handle_query)).with_state(state);

    if let Some(expected) = expected_api_key {
        router = router.layer(middleware::from_fn_with_state(expected, check_api_key));
    }

    router.layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive())
}

/// Read the secret file named by `--secure`'s key path. A production
/// deployment would rotate this; loading it once at startup matches the
/// host crate's `ApiKeyService` bootstrap, simplified to the single
/// shared-secret model §6 describes.
pub fn load_api_key(path: &Path) -> anyhow::Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

async fn check_api_key(State(expected): State<String>, request: Request, next: Next) -> axum::response::Response {
    let provided = request.headers().get("Api-Key").and_then(|v| v.to_str().ok());
    match provided {
        Some(key) if key == expected => next.run(request).await,
        _ => {
            warn!("rejected request with missing or incorrect Api-Key");
            (StatusCode::FORBIDDEN, Json(serde_json::json!({"error": {"type": "Forbidden", "msg": "invalid Api-Key"}})))
                .into_response()
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn status_for(err: &crate::errors::SynthError) -> StatusCode {
    use crate::errors::SynthError::*;
    match err {
        Nonexistence { .. } => StatusCode::NOT_FOUND,
        PreqlSyntax { .. } | ValueType { .. } => StatusCode::BAD_REQUEST,
        InvalidOperation { .. } => StatusCode::BAD_REQUEST,
        DuplicateId { .. } => StatusCode::CONFLICT,
        Topology { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        LimitsExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// `q`/`g`/`params` arrive as headers per §6; the request body (if any)
/// is the JSON payload `insert`/`update`/`commit` read as `body`.
async fn handle_query(State(state): State<AppState>, headers: HeaderMap, body: Body) -> axum::response::Response {
    let q = match header_str(&headers, "q") {
        Some(q) => q.to_string(),
        None => {
            let err = crate::errors::SynthError::missing_required_params(&["q"]);
            return (status_for(&err), Json(err.to_envelope(None, None))).into_response();
        }
    };
    let g = header_str(&headers, "g").map(str::to_string);
    let params = match header_str(&headers, "params") {
        Some(raw) if !raw.is_empty() => match serde_json::from_str::<Value>(raw) {
            Ok(v) => v,
            Err(e) => {
                let err = crate::errors::SynthError::wrong_param_type("params", format!("JSON ({e})"));
                return (status_for(&err), Json(err.to_envelope(None, None))).into_response();
            }
        },
        _ => Value::Null,
    };

    let bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            let err = crate::errors::SynthError::wrong_param_type("body", format!("readable ({e})"));
            return (status_for(&err), Json(err.to_envelope(None, None))).into_response();
        }
    };
    let body_value = if bytes.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                let err = crate::errors::SynthError::wrong_param_type("body", format!("JSON ({e})"));
                return (status_for(&err), Json(err.to_envelope(None, None))).into_response();
            }
        }
    };

    let streamed = q == "stream";
    let accept = header_str(&headers, "Accept").unwrap_or("").to_string();
    let envelope = RequestEnvelope { q, g, params, body: body_value };

    info!(q = %envelope.q, g = ?envelope.g, "handling request");
    match state.db.handle(envelope).await {
        Ok(PlannerResponse::Text(text)) => text.into_response(),
        Ok(PlannerResponse::Json(value)) => {
            if streamed {
                if let Value::Array(items) = value {
                    let body_stream = stream::iter(items).boxed();
                    return frame_stream(body_stream, &accept);
                }
            }
            Json(value).into_response()
        }
        Err(err) => (status_for(&err), Json(err.to_envelope(None, None))).into_response(),
    }
}

fn frame_stream(items: futures::stream::BoxStream<'static, Value>, accept: &str) -> axum::response::Response {
    let framed = if accept.contains("text/event-stream") {
        event_stream_framed(items)
    } else {
        tab_framed(items)
    };
    Body::from_stream(framed.map(Ok::<_, std::convert::Infallible>)).into_response()
}
