use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use server_api::ApiContext;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::MessagePayload,
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};

mod channels;
mod config;

use channels::ChannelManager;
use config::{load_settings, prepare_database_url};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) channels: Arc<ChannelManager>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadRequest {
    user_id: i64,
    counterpart_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkReadResponse {
    success: bool,
    updated_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCountResponse {
    unread_count: u64,
}

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let state = AppState {
        api: ApiContext { storage },
        channels: Arc::new(ChannelManager::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(home))
        .route("/healthz", get(healthz))
        .route("/messages/read", put(http_mark_read))
        .route("/messages/unread/:user_id", get(http_unread_count))
        .route("/messages/:user_id/:counterpart_id", get(http_history))
        .route("/locations/:user_id/:counterpart_id", get(http_location_history))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

async fn home() -> &'static str {
    "Repair chat service with real-time messaging and location sharing running"
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Storage, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_history(
    State(state): State<Arc<AppState>>,
    Path((user_id, counterpart_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let messages =
        server_api::conversation_history(&state.api, UserId(user_id), UserId(counterpart_id))
            .await
            .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_location_history(
    State(state): State<Arc<AppState>>,
    Path((user_id, counterpart_id)): Path<(i64, i64)>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let messages =
        server_api::location_history(&state.api, UserId(user_id), UserId(counterpart_id))
            .await
            .map_err(error_response)?;
    Ok(Json(messages))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, (StatusCode, Json<ApiError>)> {
    let updated_count = server_api::mark_conversation_read(
        &state.api,
        UserId(req.user_id),
        UserId(req.counterpart_id),
    )
    .await
    .map_err(error_response)?;
    info!(
        user_id = req.user_id,
        counterpart_id = req.counterpart_id,
        updated_count,
        "marked conversation read"
    );
    Ok(Json(MarkReadResponse {
        success: true,
        updated_count,
    }))
}

async fn http_unread_count(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<i64>,
) -> Result<Json<UnreadCountResponse>, (StatusCode, Json<ApiError>)> {
    let unread_count = server_api::unread_count(&state.api, UserId(user_id))
        .await
        .map_err(error_response)?;
    Ok(Json(UnreadCountResponse { unread_count }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| channels::ws_connection(state, socket, UserId(q.user_id)))
}

fn error_response(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Connection => StatusCode::BAD_GATEWAY,
        ErrorCode::Storage | ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}
