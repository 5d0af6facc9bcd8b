//! REST + WebSocket surface (spec.md §6 / SPEC_FULL.md §6).
//!
//! Binds the first free port in `Config::port_range`, continuing the
//! teacher's `status_server.rs` "find and bind in one step" pattern so there
//! is never a window between checking and binding where another process can
//! steal the port. Unlike `status_server.rs` this isn't a side-channel for
//! MCP status reports — it's the entire client-facing surface, so it owns
//! `axum::serve` directly rather than handing a listener off to a `StatusServer`
//! wrapper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ProcessError, RegistryError};
use crate::prober;
use crate::protocol::{ClientMessage, HeartbeatResponse, ServerMessage, SystemSnapshot};
use crate::registry::Registry;

#[derive(Clone)]
struct AppState {
    registry: Arc<Registry>,
    started_at: Arc<Instant>,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/heartbeat", get(heartbeat))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", delete(remove_session))
        .route("/api/sessions/{id}/processes", get(session_processes))
        .route("/api/sessions/{id}/processes/{pid}", delete(kill_session_process))
        .route("/ws/{id}", get(ws_handler))
        .with_state(state)
}

/// Scans `range` for the first port this process can bind, returning the
/// bound listener itself to avoid a check-then-bind race (same approach as
/// `StatusServer::find_and_bind_port`).
async fn find_and_bind_port(range: (u16, u16)) -> Option<(u16, tokio::net::TcpListener)> {
    let (start, end) = range;
    for port in start..=end {
        let addr = format!("127.0.0.1:{port}");
        if let Ok(listener) = tokio::net::TcpListener::bind(&addr).await {
            return Some((port, listener));
        }
    }
    None
}

/// Binds a listener in `config.port_range` and serves the REST/WS router
/// until the process is killed. Returns the bound port so the caller can log
/// or otherwise surface it.
pub async fn serve(registry: Arc<Registry>, config: &Config) -> std::io::Result<u16> {
    let (port, listener) = find_and_bind_port(config.port_range).await.ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!("no free port in {}..={}", config.port_range.0, config.port_range.1),
        )
    })?;

    let state = AppState { registry, started_at: Arc::new(Instant::now()) };
    let app = build_router(state);

    let addr: SocketAddr = listener.local_addr()?;
    log::info!("tabminal listening on http://{addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("server error: {e}");
        }
    });

    Ok(port)
}

async fn heartbeat(State(state): State<AppState>) -> Json<HeartbeatResponse> {
    let sessions = state.registry.list().await;
    let tracked_pids = state.registry.root_pids().len();
    Json(HeartbeatResponse {
        system: SystemSnapshot {
            uptime_secs: state.started_at.elapsed().as_secs(),
            session_count: sessions.len(),
            tracked_pids,
        },
        sessions,
    })
}

async fn create_session(State(state): State<AppState>) -> Result<impl IntoResponse, RegistryError> {
    let session = state.registry.create().map_err(RegistryError::from)?;
    Ok((StatusCode::CREATED, Json(session.summary().await)))
}

async fn remove_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, RegistryError> {
    let session = state
        .registry
        .get(id)
        .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
    session.kill_pty(crate::pty::Signal::Term).await;
    state.registry.remove(id).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn session_processes(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<prober::SessionProcessTree>, RegistryError> {
    let session = state
        .registry
        .get(id)
        .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))?;
    prober::get_process_tree(id.to_string(), session.pty_pid())
        .map(Json)
        .ok_or_else(|| RegistryError::SessionNotFound(id.to_string()))
}

async fn kill_session_process(
    State(state): State<AppState>,
    Path((id, pid)): Path<(Uuid, u32)>,
) -> Result<StatusCode, KillProcessError> {
    let _session = state
        .registry
        .get(id)
        .ok_or_else(|| KillProcessError::Registry(RegistryError::SessionNotFound(id.to_string())))?;
    let roots = state.registry.root_pids();
    prober::kill_process(pid, &roots).await.map_err(KillProcessError::Process)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `session_processes`/`kill_session_process` can fail for two unrelated
/// reasons (no such session, or the process-kill itself failed/refused);
/// this just lets one handler return either `IntoResponse` without losing
/// each error's own status code.
enum KillProcessError {
    Registry(RegistryError),
    Process(ProcessError),
}

impl IntoResponse for KillProcessError {
    fn into_response(self) -> axum::response::Response {
        match self {
            KillProcessError::Registry(e) => e.into_response(),
            KillProcessError::Process(e) => e.into_response(),
        }
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.registry.get(id) {
        Some(session) => ws.on_upgrade(move |socket| handle_socket(socket, session)),
        None => (StatusCode::NOT_FOUND, "session not found").into_response(),
    }
}

/// Drives one attached client: forwards `attach()`'s greeting and every
/// subsequent broadcast out over the socket, and feeds parsed inbound frames
/// into `Session::handle_client_message`. Neither direction blocks the
/// other — a slow reader never delays delivery to other clients, since
/// `Session::broadcast` already drops on a full per-client queue rather than
/// waiting here.
async fn handle_socket(socket: WebSocket, session: Arc<crate::session::Session>) {
    let (client_id, mut rx) = session.attach().await;
    let (mut sink, mut stream) = socket.split::<Message>();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(msg) = outbound else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        log::warn!("failed to serialize {msg:?}: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(msg) => session.handle_client_message(client_id, msg).await,
                            Err(e) => log::debug!("dropping malformed client message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("websocket read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    session.detach(client_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.port_range = (0, 0);
        cfg
    }

    async fn spawn_test_server() -> (SocketAddr, Arc<Registry>) {
        let registry = Registry::new(test_config());
        registry.create().expect("spawn a default shell for the test");
        let state = AppState { registry: registry.clone(), started_at: Arc::new(Instant::now()) };
        let app = build_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, registry)
    }

    #[tokio::test]
    async fn heartbeat_reports_seeded_session() {
        let (addr, _registry) = spawn_test_server().await;
        let resp = reqwest::get(format!("http://{addr}/api/heartbeat")).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: HeartbeatResponse = resp.json().await.unwrap();
        assert_eq!(body.sessions.len(), 1);
        assert_eq!(body.system.session_count, 1);
    }

    #[tokio::test]
    async fn create_and_delete_session_round_trip() {
        let (addr, registry) = spawn_test_server().await;
        let before = registry.len();

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/api/sessions"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(registry.len(), before + 1);

        let created: crate::protocol::SessionSummary = resp.json().await.unwrap();
        let resp = reqwest::Client::new()
            .delete(format!("http://{addr}/api/sessions/{}", created.id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 204);
    }

    #[tokio::test]
    async fn delete_unknown_session_returns_404() {
        let (addr, _registry) = spawn_test_server().await;
        let resp = reqwest::Client::new()
            .delete(format!("http://{addr}/api/sessions/{}", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn kill_process_on_unknown_session_returns_404() {
        let (addr, _registry) = spawn_test_server().await;
        let resp = reqwest::Client::new()
            .delete(format!("http://{addr}/api/sessions/{}/processes/1", Uuid::new_v4()))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
