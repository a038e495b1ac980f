use std::convert::Infallible;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tnet_process::{InstanceId, InstanceView, ServiceKind};
use tokio::sync::broadcast::error::RecvError;

use crate::args::ServiceConfiguration;
use crate::error::ControlError;
use crate::secret;
use crate::security;
use crate::state::AppState;

const DEFAULT_LOG_LIMIT: usize = 200;
const MAX_LOG_LIMIT: usize = 1000;

/// Envelope shared by every mutating endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let message = secret::mask_text(&self.to_string());
        (self.status_code(), Json(ApiResponse::failed(message))).into_response()
    }
}

fn failure(action: &str, kind: ServiceKind, err: &ControlError) -> Response {
    failure_with(action, kind, err, None::<()>)
}

fn failure_with<T: Serialize>(
    action: &str,
    kind: ServiceKind,
    err: &ControlError,
    data: Option<T>,
) -> Response {
    let message = secret::mask_text(&format!("Failed to {action} {kind}: {err}"));
    let status = err.status_code();
    if status.is_server_error() {
        tracing::warn!(%kind, action, error = %message, "lifecycle request failed");
    } else {
        tracing::debug!(%kind, action, error = %message, "lifecycle request rejected");
    }
    let body = ApiResponse {
        success: false,
        data,
        error: Some(message),
    };
    (status, Json(body)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    (StatusCode::BAD_REQUEST, Json(ApiResponse::failed(message))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: Option<String>,
}

fn required_id(kind: ServiceKind, q: &IdQuery) -> Result<InstanceId, Response> {
    match q.id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => Ok(InstanceId::from(id)),
        _ => Err(bad_request(format!("Missing {kind} ID"))),
    }
}

/// Malformed query strings get the JSON envelope rather than axum's plain-text rejection.
fn query_or_reject<T>(query: Result<Query<T>, QueryRejection>) -> Result<T, Response> {
    query
        .map(|Query(q)| q)
        .map_err(|e| bad_request(format!("Invalid request: {}", e.body_text())))
}

fn query_id(
    kind: ServiceKind,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Result<InstanceId, Response> {
    let q = query_or_reject(query)?;
    required_id(kind, &q)
}

/// `POST .../start` body: a plain argument list or a tagged configuration.
#[derive(Debug)]
enum StartBody {
    Args(Vec<String>),
    Config(ServiceConfiguration),
}

#[derive(Deserialize)]
struct ArgsBody {
    args: Vec<String>,
}

fn parse_start_body(body: &[u8]) -> Result<StartBody, ControlError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ControlError::Validation(format!("invalid request: {e}")))?;

    let is_config = value.get("inputMode").is_some();
    if is_config {
        let cfg = serde_json::from_value::<ServiceConfiguration>(value)
            .map_err(|e| ControlError::Validation(format!("invalid configuration: {e}")))?;
        return Ok(StartBody::Config(cfg));
    }
    if value.get("args").is_some() {
        let ArgsBody { args } = serde_json::from_value(value)
            .map_err(|e| ControlError::Validation(format!("invalid request: {e}")))?;
        return Ok(StartBody::Args(args));
    }
    Err(ControlError::Validation(
        "expected {\"args\": [...]} or a configuration with inputMode".to_string(),
    ))
}

async fn list(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
) -> Json<Vec<InstanceView>> {
    Json(state.controller.list(kind))
}

/// Without `?id=` the body describes a new instance; with it, an existing
/// instance is relaunched.
async fn start(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<IdQuery>, QueryRejection>,
    body: Bytes,
) -> Response {
    let q = match query_or_reject(query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    if q.id.is_some() {
        let id = match required_id(kind, &q) {
            Ok(v) => v,
            Err(res) => return res,
        };
        return match state.controller.start(kind, &id).await {
            Ok(()) => Json(ApiResponse::done()).into_response(),
            Err(err) => failure("start", kind, &err),
        };
    }

    let created = match parse_start_body(&body) {
        Ok(StartBody::Args(args)) => state.controller.create_from_args(kind, args).await,
        Ok(StartBody::Config(cfg)) => state.controller.create(kind, &cfg).await,
        Err(err) => Err(err),
    };

    match created {
        Ok(outcome) => {
            let view = outcome.instance.view();
            match outcome.launch_error {
                None => Json(ApiResponse::ok(view)).into_response(),
                Some(err) => failure_with("start", kind, &err, Some(view)),
            }
        }
        Err(err) => failure("start", kind, &err),
    }
}

async fn restart(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Response {
    let id = match query_id(kind, query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match state.controller.restart(kind, &id).await {
        Ok(()) => Json(ApiResponse::done()).into_response(),
        Err(err) => failure("restart", kind, &err),
    }
}

async fn stop(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Response {
    let id = match query_id(kind, query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match state.controller.stop(kind, &id).await {
        Ok(()) => Json(ApiResponse::done()).into_response(),
        Err(err) => failure("stop", kind, &err),
    }
}

async fn delete(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Response {
    let id = match query_id(kind, query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match state.controller.delete(kind, &id).await {
        Ok(()) => Json(ApiResponse::done()).into_response(),
        Err(err) => failure("delete", kind, &err),
    }
}

#[derive(Debug, Serialize)]
struct CommandPayload {
    command: String,
}

async fn command(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<IdQuery>, QueryRejection>,
) -> Response {
    let id = match query_id(kind, query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    match state.controller.reveal(kind, &id) {
        // Not masked: this is the one place the full command is handed out.
        Ok(command) => Json(ApiResponse::ok(CommandPayload { command })).into_response(),
        Err(err) => failure("reveal command for", kind, &err),
    }
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    id: Option<String>,
    cursor: Option<u64>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct LogsPayload {
    lines: Vec<String>,
    next_cursor: u64,
}

async fn logs(
    State(state): State<AppState>,
    Extension(kind): Extension<ServiceKind>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Response {
    let q = match query_or_reject(query) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let id = match required_id(kind, &IdQuery { id: q.id }) {
        Ok(v) => v,
        Err(res) => return res,
    };
    let limit = q.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);

    match state
        .controller
        .tail_logs(kind, &id, q.cursor.unwrap_or(0), limit)
        .await
    {
        Ok((lines, next_cursor)) => {
            Json(ApiResponse::ok(LogsPayload { lines, next_cursor })).into_response()
        }
        Err(err) => failure("read logs of", kind, &err),
    }
}

#[derive(Debug, Serialize)]
struct CryptKeyPayload {
    key: String,
}

async fn crypt_key() -> Json<ApiResponse<CryptKeyPayload>> {
    Json(ApiResponse::ok(CryptKeyPayload {
        key: secret::generate_crypt_key(),
    }))
}

async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.controller.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(ev) => match Event::default().event("instance").json_data(&ev) {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(err) => tracing::warn!(%err, "failed to encode instance event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    agents: usize,
    proxies: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let store = state.controller.store();
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        agents: store.count(ServiceKind::Agent),
        proxies: store.count(ServiceKind::Proxy),
    })
}

fn kind_routes(kind: ServiceKind) -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/start", post(start))
        .route("/restart", post(restart))
        .route("/stop", post(stop))
        .route("/delete", post(delete))
        .route("/command", post(command))
        .route("/logs", get(logs))
        .layer(Extension(kind))
}

pub fn router(state: AppState) -> Router {
    let mut api = Router::new()
        .route("/crypt-key", get(crypt_key))
        .route("/events", get(events));
    for kind in ServiceKind::ALL {
        api = api.nest(&format!("/{}", kind.collection()), kind_routes(kind));
    }
    // Mutating routes are gated by Origin allowlist + admin token.
    let api = api.layer(middleware::from_fn_with_state(
        state.clone(),
        security::admin_guard,
    ));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api)
        .layer(middleware::from_fn(security::request_id))
        .with_state(state)
}
