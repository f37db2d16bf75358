//! axum WebSocket front end (feature `ws-server`).
//!
//! `GET /ws` upgrades to the JSON frame protocol; `GET /healthz` returns
//! session statistics. One [`SessionOrchestrator`] is built per connection;
//! when the socket closes, the receive loop ends, the dispatch future is
//! dropped — cancelling any in-flight model or tool calls — and the session
//! is removed from the table.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::chatbridge::catalog::ToolCatalog;
use crate::chatbridge::config::BridgeConfig;
use crate::chatbridge::executor::HttpToolExecutor;
use crate::chatbridge::frames::ServerFrame;
use crate::chatbridge::http_pool;
use crate::chatbridge::orchestrator::{ChannelSink, SessionOrchestrator};
use crate::chatbridge::pipeline::LlmPipeline;
use crate::chatbridge::session::SessionTable;

/// Shared state for all connections.
#[derive(Clone)]
pub struct BridgeState {
    pub config: Arc<BridgeConfig>,
    pub catalog: Arc<ToolCatalog>,
    pub pipeline: Arc<LlmPipeline>,
    pub sessions: Arc<SessionTable>,
}

impl BridgeState {
    pub fn new(
        config: Arc<BridgeConfig>,
        catalog: Arc<ToolCatalog>,
        pipeline: Arc<LlmPipeline>,
        sessions: Arc<SessionTable>,
    ) -> Self {
        Self {
            config,
            catalog,
            pipeline,
            sessions,
        }
    }
}

/// Sink pushing frames into the connection's writer task.
struct WsSink {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl ChannelSink for WsSink {
    async fn send(
        &self,
        frame: ServerFrame,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.tx
            .send(frame.to_json())
            .await
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

/// Build the router.
pub fn router(state: BridgeState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Bind and serve until the process exits.
///
/// Also starts the idle-session reaper, ticking every five minutes.
pub async fn serve(state: BridgeState, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let _reaper = crate::chatbridge::session::SessionTable::spawn_reaper(
        state.sessions.clone(),
        std::time::Duration::from_secs(300),
    );
    log::info!("chatbridge listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz(State(state): State<BridgeState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.statistics(),
        "tools": state.catalog.len(),
    }))
}

async fn ws_upgrade(State(state): State<BridgeState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: BridgeState, socket: WebSocket) {
    let session = state.sessions.create().await;
    let session_id = session.id.clone();

    let executor = Arc::new(HttpToolExecutor::new(
        state.catalog.clone(),
        session.credentials.clone(),
        http_pool::get_or_create_client(state.catalog.base_url()),
        state.config.clone(),
    ));
    let orchestrator = SessionOrchestrator::new(
        session,
        state.pipeline.clone(),
        executor,
        state.catalog.clone(),
        state.config.clone(),
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Writer task: drains the frame queue into the socket.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let sink = WsSink { tx };
    let _ = sink
        .send(ServerFrame::connection_established(&session_id))
        .await;

    // Receive loop. Dropping out of this loop (client close, socket error)
    // drops any in-flight `handle_frame` future and with it all outstanding
    // model/tool I/O for this session.
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(WsMessage::Text(text)) => {
                orchestrator.handle_frame(&text, &sink).await;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(_) => {} // binary/ping/pong handled by axum
        }
    }

    orchestrator.close().await;
    state.sessions.remove(&session_id);
    drop(sink);
    let _ = writer.await;
    log::info!("connection closed for session {}", session_id);
}
