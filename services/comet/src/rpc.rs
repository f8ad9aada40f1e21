//! Admin RPC consumed by the router tier and operators.
//!
//! JSON over HTTP. Every response carries a `code`: `ok` on success, otherwise
//! one of `param_error`, `channel_not_found`, `push_failed`,
//! `migrate_refused` or `internal_error` with a matching HTTP status.
use crate::node::CometNode;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use comet_channel::{Channel, ChannelError};
use comet_common::{Message, MessageGroup, deadline_after};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub const CODE_OK: &str = "ok";
pub const CODE_PARAM_ERROR: &str = "param_error";
pub const CODE_CHANNEL_NOT_FOUND: &str = "channel_not_found";
pub const CODE_PUSH_FAILED: &str = "push_failed";
pub const CODE_MIGRATE_REFUSED: &str = "migrate_refused";
pub const CODE_INTERNAL_ERROR: &str = "internal_error";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

/// Structured error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                code: code.to_string(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        api_param_error(&rejection.body_text())
    }
}

pub fn api_param_error(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, CODE_PARAM_ERROR, message)
}

pub fn api_internal(message: &str, err: &dyn std::fmt::Display) -> ApiError {
    // Details stay in the log; the caller only sees the summary.
    tracing::error!(error = %err, "{message}");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, CODE_INTERNAL_ERROR, message)
}

/// Map a channel failure onto the admin status taxonomy.
pub fn channel_error(err: ChannelError) -> ApiError {
    let message = err.to_string();
    let (status, code) = match &err {
        ChannelError::NotExist | ChannelError::Expired => {
            (StatusCode::NOT_FOUND, CODE_CHANNEL_NOT_FOUND)
        }
        ChannelError::MessageExpired | ChannelError::Config(_) => {
            (StatusCode::BAD_REQUEST, CODE_PARAM_ERROR)
        }
        ChannelError::TokenExists => (StatusCode::CONFLICT, CODE_PARAM_ERROR),
        ChannelError::TokenNotFound | ChannelError::TokenExpired => {
            (StatusCode::NOT_FOUND, CODE_PARAM_ERROR)
        }
        ChannelError::DuplicateMessage(_) => (StatusCode::CONFLICT, CODE_PUSH_FAILED),
        ChannelError::Store(_) => (StatusCode::BAD_GATEWAY, CODE_PUSH_FAILED),
        ChannelError::Closed | ChannelError::Write(_) | ChannelError::Id(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, CODE_PUSH_FAILED)
        }
        ChannelError::MaxConn { .. } => (StatusCode::SERVICE_UNAVAILABLE, CODE_INTERNAL_ERROR),
        ChannelError::MigrateRefused { .. } => (StatusCode::CONFLICT, CODE_MIGRATE_REFUSED),
        ChannelError::Encode(_) => return api_internal("encode message", &err),
    };
    ApiError::new(status, code, message)
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub code: String,
}

impl StatusResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            code: CODE_OK.to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct KeyRequest {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub key: String,
    pub body: String,
    pub expire_secs: u64,
    /// 0 asks the node to assign an id.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub group: MessageGroup,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushResponse {
    pub code: String,
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BatchPushRequest {
    pub keys: Vec<String>,
    pub body: String,
    pub expire_secs: u64,
    #[serde(default)]
    pub group: MessageGroup,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushFailure {
    pub key: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchPushResponse {
    pub code: String,
    pub id: i64,
    pub pushed: usize,
    pub failures: Vec<PushFailure>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub key: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub nodes: Vec<String>,
    #[serde(default)]
    pub vnodes: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResponse {
    pub code: String,
    pub closed: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    pub node_id: String,
    pub channels: usize,
    pub connections: usize,
    pub nodes: Vec<String>,
}

pub fn router(node: CometNode) -> Router {
    Router::new()
        .route("/v1/channel/new", post(new_channel))
        .route("/v1/channel/close", post(close_channel))
        .route("/v1/push", post(push))
        .route("/v1/push/batch", post(push_batch))
        .route("/v1/token", post(add_token))
        .route("/v1/migrate", post(migrate))
        .route("/v1/stats", get(stats))
        .with_state(node)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: tokio::net::TcpListener, node: CometNode) -> std::io::Result<()> {
    axum::serve(listener, router(node).into_make_service()).await
}

fn require_key(key: &str) -> Result<(), ApiError> {
    if key.is_empty() {
        return Err(api_param_error("key must not be empty"));
    }
    Ok(())
}

// Pushes revive expired channels instead of failing.
fn channel_for_push(node: &CometNode, key: &str) -> Result<Arc<dyn Channel>, ApiError> {
    match node.registry.lookup(key) {
        Ok(channel) => Ok(channel),
        Err(err) if err.is_not_found() => Ok(node.registry.get_or_create(key)),
        Err(err) => Err(channel_error(err)),
    }
}

fn build_message(
    id: i64,
    body: String,
    expire_secs: u64,
    group: MessageGroup,
) -> Result<Message, ApiError> {
    if expire_secs == 0 {
        return Err(api_param_error("expire_secs must be positive"));
    }
    let expire = deadline_after(Duration::from_secs(expire_secs));
    Ok(Message::new(id, Bytes::from(body), group, expire))
}

async fn assign_id(node: &CometNode, requested: i64) -> Result<i64, ApiError> {
    match requested {
        0 => node
            .next_message_id()
            .await
            .map_err(|err| api_internal("assign message id", &err)),
        id if id < 0 => Err(api_param_error("id must not be negative")),
        id => Ok(id),
    }
}

async fn new_channel(
    State(node): State<CometNode>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = payload?;
    require_key(&request.key)?;
    node.registry.get_or_create(&request.key);
    tracing::debug!(key = %request.key, "channel created by admin");
    Ok(StatusResponse::ok())
}

async fn close_channel(
    State(node): State<CometNode>,
    payload: Result<Json<KeyRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = payload?;
    require_key(&request.key)?;
    node.registry.close(&request.key).map_err(channel_error)?;
    tracing::info!(key = %request.key, "channel closed by admin");
    Ok(StatusResponse::ok())
}

async fn push(
    State(node): State<CometNode>,
    payload: Result<Json<PushRequest>, JsonRejection>,
) -> Result<Json<PushResponse>, ApiError> {
    let Json(request) = payload?;
    require_key(&request.key)?;
    let id = assign_id(&node, request.id).await?;
    let message = build_message(id, request.body, request.expire_secs, request.group)?;
    let channel = channel_for_push(&node, &request.key)?;
    let id = channel
        .push_msg(message, &request.key)
        .await
        .map_err(|err| {
            tracing::warn!(key = %request.key, error = %err, "push failed");
            channel_error(err)
        })?;
    Ok(Json(PushResponse {
        code: CODE_OK.to_string(),
        id,
    }))
}

async fn push_batch(
    State(node): State<CometNode>,
    payload: Result<Json<BatchPushRequest>, JsonRejection>,
) -> Result<Json<BatchPushResponse>, ApiError> {
    let Json(request) = payload?;
    if request.keys.is_empty() {
        return Err(api_param_error("keys must not be empty"));
    }
    let id = assign_id(&node, 0).await?;
    let message = build_message(id, request.body, request.expire_secs, request.group)?;
    let mut pushed = 0;
    let mut failures = Vec::new();
    for key in &request.keys {
        let result = match channel_for_push(&node, key) {
            Ok(channel) => channel
                .push_msg(message.clone(), key)
                .await
                .map_err(channel_error),
            Err(err) => Err(err),
        };
        match result {
            Ok(_) => pushed += 1,
            Err(err) => {
                tracing::warn!(key = %key, code = %err.body.code, "batch push failed for key");
                failures.push(PushFailure {
                    key: key.clone(),
                    code: err.body.code,
                    message: err.body.message,
                });
            }
        }
    }
    Ok(Json(BatchPushResponse {
        code: CODE_OK.to_string(),
        id,
        pushed,
        failures,
    }))
}

async fn add_token(
    State(node): State<CometNode>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(request) = payload?;
    require_key(&request.key)?;
    if request.token.is_empty() {
        return Err(api_param_error("token must not be empty"));
    }
    let channel = node.registry.get_or_create(&request.key);
    channel.add_token(&request.token).map_err(channel_error)?;
    Ok(StatusResponse::ok())
}

async fn migrate(
    State(node): State<CometNode>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<MigrateResponse>, ApiError> {
    let Json(request) = payload?;
    if request.nodes.is_empty() {
        return Err(api_param_error("nodes must not be empty"));
    }
    let vnodes = match request.vnodes {
        0 => node.config.vnodes,
        vnodes => vnodes,
    };
    let closed = node.migrate(&request.nodes, vnodes).map_err(|err| {
        tracing::warn!(error = %err, "migration refused");
        channel_error(err)
    })?;
    tracing::info!(nodes = ?request.nodes, closed = closed.len(), "migration applied");
    Ok(Json(MigrateResponse {
        code: CODE_OK.to_string(),
        closed: closed.len(),
    }))
}

async fn stats(State(node): State<CometNode>) -> Json<StatsResponse> {
    Json(StatsResponse {
        node_id: node.node_id().to_string(),
        channels: node.registry.len(),
        connections: node.registry.connection_count(),
        nodes: node.ring().nodes().to_vec(),
    })
}
