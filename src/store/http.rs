//! HTTP API for the parameter server
//!
//! - `GET /health`
//! - `GET /v1/params/{*key}`
//! - `PUT /v1/params/{*key}` with `{"value": "..."}`
//!
//! Requests carry `Authorization: Bearer <token>`; a token is bound to one
//! session and one role. Parameter values never appear in logs.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, Request, Response, StatusCode},
    middleware::{self, Next},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::common::utils::validate_segment;
use crate::common::{Access, AccessPolicy, Error};
use crate::store::api::{ParamResponse, PutParamRequest, PutParamResponse};
use crate::store::params::ParameterStore;

/// Header name for request ID
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

#[derive(Clone)]
pub struct StoreState {
    pub params: Arc<ParameterStore>,
    pub policy: Arc<AccessPolicy>,
}

/// Error wrapper rendered as a JSON body
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.0.to_http_status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub fn create_router(state: StoreState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/params/*key", get(get_param).put(put_param))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn health(State(state): State<StoreState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "params": state.params.len(),
        "encrypted": state.params.is_encrypted(),
    }))
}

async fn get_param(
    State(state): State<StoreState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ParamResponse>, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &headers, &key, Access::Read)?;

    let param = state
        .params
        .get(&key)?
        .ok_or_else(|| Error::NotFound(key.clone()))?;

    Ok(Json(ParamResponse {
        key: param.key,
        value: param.value,
        version: param.version,
        updated_at: param.updated_at.to_rfc3339(),
    }))
}

async fn put_param(
    State(state): State<StoreState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PutParamRequest>,
) -> Result<Json<PutParamResponse>, ApiError> {
    let key = normalize_key(&key)?;
    authorize(&state, &headers, &key, Access::Write)?;

    if body.value.trim().is_empty() {
        return Err(Error::InvalidConfig("value cannot be empty".into()).into());
    }

    let version = state.params.put(&key, &body.value)?;
    info!(key = %key, version, "Parameter written");

    Ok(Json(PutParamResponse { key, version }))
}

/// `a/b/c` -> `/a/b/c`, every segment validated, at least domain and session
fn normalize_key(raw: &str) -> Result<String, Error> {
    let segments: Vec<&str> = raw.trim_matches('/').split('/').collect();
    if segments.len() < 2 {
        return Err(Error::InvalidConfig(format!(
            "key must be /<domain>/<session>/...: /{}",
            raw
        )));
    }
    for segment in &segments {
        validate_segment("key segment", segment)?;
    }
    Ok(format!("/{}", segments.join("/")))
}

fn authorize(
    state: &StoreState,
    headers: &HeaderMap,
    key: &str,
    access: Access,
) -> Result<(), Error> {
    if state.policy.is_open() {
        return Ok(());
    }

    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let ctx = state.policy.authenticate(token)?;
    state.policy.authorize(&ctx, key, access)
}

/// Tag every request with an ID and log its outcome
async fn request_id_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let start = Instant::now();

    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;
    if status.is_success() || status == StatusCode::NOT_FOUND {
        info!(request_id = %request_id, method = %method, path = %path, status = status.as_u16(), duration_ms, "Request completed");
    } else {
        warn!(request_id = %request_id, method = %method, path = %path, status = status.as_u16(), duration_ms, "Request failed");
    }

    response
}
