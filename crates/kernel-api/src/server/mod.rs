use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    is_supported_protocol_version, select_protocol_version, AckMsg, ActMsg, ApiError,
    BaseMessage, CursorEvent, ErrorCode, EventBatchMsg, EventBatchReq, HelloMsg,
    ServerCapabilities, WelcomeMsg, MSG_ACK, MSG_ACT, MSG_EVENT_BATCH, MSG_EVENT_BATCH_REQ,
    MSG_HELLO, MSG_WELCOME, PROTOCOL_VERSION_1_1,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;

use crate::manager::{mint_id, JoinParams, ManagerError, WorldManager};
use crate::outbound::Outbound;

const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const ACK_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(200);
const RELIABLE_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
const ACK_CACHE_CAPACITY: usize = 2048;
const DEFAULT_EVENT_BATCH_LIMIT: usize = 100;
const MAX_EVENT_BATCH_LIMIT: usize = 1000;

include!("error.rs");
include!("state.rs");
include!("routes/session.rs");
include!("routes/admin.rs");
include!("util.rs");

/// Serves until `shutdown` resolves, then stops accepting and returns.
pub async fn serve<F>(addr: SocketAddr, manager: Arc<WorldManager>, shutdown: F) -> Result<(), ServerError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let app = router(AppState::new(manager));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/admin/v1/worlds/state", get(worlds_state))
        .route("/admin/v1/worlds/{world_id}/reset", post(reset_world))
        .route("/admin/v1/agents/{agent_id}/move_world", post(move_agent_world))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests;
