//! Session: owns one PTY + interpreter + client set + history buffer, and
//! enforces the client attach/message protocol of spec.md §4.4.
//!
//! State serialization follows spec.md §5's "cooperative single logical
//! actor" model realized as a mutex-guarded object (one of the two sanctioned
//! realizations) rather than a dedicated actor task: `handle_pty_data`,
//! `handle_client_message`, and `apply_probe` — the session's three event
//! sources — all take `&self` and lock the same `tokio::sync::Mutex`
//! internally, so whichever caller (the PTY reader task, a client's
//! websocket task, or the prober task) gets there first runs to completion
//! before the next. This continues the teacher's preference for
//! `DashMap`/`Mutex`-guarded shared state (`process_manager.rs`,
//! `session_manager.rs`) over a hand-rolled actor/command-channel pattern.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use tokio::sync::{mpsc, Mutex, Notify};
use uuid::Uuid;

use crate::config::Config;
use crate::interpreter::{ExecutionRecord, Interpreter};
use crate::prober::ProbeResult;
use crate::protocol::{ClientMessage, ServerMessage, SessionStatusWire, SessionSummary};
use crate::pty::{Signal, SharedPty};
use crate::registry::Registry;
use crate::shell_integration::InstalledIntegration;

/// Depth of each client's outbound queue. A slow client's queue fills before
/// it backpressures anything upstream; `broadcast` drops the message and
/// logs rather than blocking the PTY reader or any other client.
const CLIENT_QUEUE_DEPTH: usize = 256;

struct SessionState {
    cols: u16,
    rows: u16,
    title: String,
    cwd: String,
    env: String,
    history: String,
    interpreter: Interpreter,
    last_execution: Option<ExecutionRecord>,
    executions: VecDeque<ExecutionRecord>,
    clients: std::collections::HashMap<Uuid, mpsc::Sender<ServerMessage>>,
    exit_code: Option<i32>,
    exit_signal: Option<i32>,
}

/// One PTY + everything that observes it. Constructed by `Registry::create`,
/// shared via `Arc` with the PTY reader task and the prober task.
pub struct Session {
    id: Uuid,
    created_at: SystemTime,
    shell: PathBuf,
    initial_cwd: PathBuf,
    pty: SharedPty,
    integration: Option<InstalledIntegration>,
    config: Config,
    registry: Weak<Registry>,
    state: Mutex<SessionState>,
    /// Monotonic: once true, `closed`, PTY writes are refused. Outside the
    /// state mutex since `closed()` is read from hot paths (every client
    /// `input` message) without needing the full lock.
    closed: AtomicBool,
    pub(crate) prober_shutdown: Arc<Notify>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        shell: PathBuf,
        initial_cwd: PathBuf,
        cols: u16,
        rows: u16,
        pty: SharedPty,
        integration: Option<InstalledIntegration>,
        config: Config,
        registry: Weak<Registry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: SystemTime::now(),
            shell,
            initial_cwd,
            pty,
            integration,
            config,
            registry,
            state: Mutex::new(SessionState {
                cols,
                rows,
                title: String::new(),
                cwd: String::new(),
                env: String::new(),
                history: String::new(),
                interpreter: Interpreter::new(),
                last_execution: None,
                executions: VecDeque::new(),
                clients: std::collections::HashMap::new(),
                exit_code: None,
                exit_signal: None,
            }),
            closed: AtomicBool::new(false),
            prober_shutdown: Arc::new(Notify::new()),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pty_pid(&self) -> i32 {
        self.pty.pid()
    }

    pub fn shell_basename(&self) -> String {
        basename(&self.shell)
    }

    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // -- PTY-facing ------------------------------------------------------

    /// Feeds one PTY data chunk through the interpreter and broadcasts the
    /// result. Invariant (spec.md §8): the cleaned bytes are broadcast to
    /// every attached client *before* a completed execution record (if any)
    /// is appended and logged.
    pub async fn handle_pty_data(&self, bytes: Vec<u8>) {
        let now = SystemTime::now();
        let mut state = self.state.lock().await;

        let out = state.interpreter.feed(&bytes, now);
        if out.cleaned.is_empty() && out.meta.is_none() && out.executions.is_empty() {
            return;
        }

        append_history(&mut state.history, &out.cleaned, self.config.history_limit);

        if let Some(delta) = &out.meta {
            if let Some(title) = &delta.title {
                state.title = title.clone();
            }
            if let Some(cwd) = &delta.cwd {
                state.cwd = cwd.clone();
            }
        }

        if !out.cleaned.is_empty() {
            broadcast(&mut state.clients, ServerMessage::Output { data: out.cleaned });
        }
        if out.meta.is_some() {
            let meta = meta_message(&state);
            broadcast(&mut state.clients, meta);
        }

        for record in out.executions {
            log::info!(
                "session {} executed {:?} (exit={:?})",
                self.id,
                record.command,
                record.exit_code
            );
            state.last_execution = Some(record.clone());
            state.executions.push_back(record);
            while state.executions.len() > self.config.execution_cap {
                state.executions.pop_front();
            }
        }
    }

    /// PTY exit is terminal: broadcasts `status:terminated` once and marks
    /// the session closed. Does not remove the session from the registry —
    /// that's the caller's (the PTY event loop's) job, via `Registry::remove`.
    pub async fn handle_pty_exit(&self, code: Option<i32>, signal: Option<i32>) {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        state.exit_code = code;
        state.exit_signal = signal;
        broadcast(
            &mut state.clients,
            ServerMessage::Status { status: SessionStatusWire::Terminated, code, signal },
        );
    }

    // -- Client-facing -----------------------------------------------------

    /// Attaches a new client, performing the atomic greeting
    /// (`snapshot`, `meta`, `status`) before the client is registered to
    /// receive further broadcasts — guaranteeing every client sees its
    /// greeting before any `output`/`meta` generated after attach.
    pub async fn attach(&self) -> (Uuid, mpsc::Receiver<ServerMessage>) {
        let client_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let mut state = self.state.lock().await;

        let _ = tx.try_send(ServerMessage::Snapshot { data: state.history.clone() });
        let _ = tx.try_send(meta_message(&state));
        let status = if self.closed() {
            ServerMessage::Status {
                status: SessionStatusWire::Terminated,
                code: state.exit_code,
                signal: state.exit_signal,
            }
        } else {
            ServerMessage::Status { status: SessionStatusWire::Ready, code: None, signal: None }
        };
        let _ = tx.try_send(status);

        state.clients.insert(client_id, tx);
        (client_id, rx)
    }

    pub async fn detach(&self, client_id: Uuid) {
        let mut state = self.state.lock().await;
        state.clients.remove(&client_id);
    }

    /// Dispatches one client message. Input/resize/ping per spec.md §4.4;
    /// anything else (there is nothing else once `ClientMessage` parsed)
    /// would already have been filtered out by the caller's JSON parse.
    pub async fn handle_client_message(&self, client_id: Uuid, msg: ClientMessage) {
        match msg {
            ClientMessage::Input { data } => {
                if self.closed() {
                    return;
                }
                if let Err(e) = self.pty.write(data.as_bytes()) {
                    log::warn!("session {} write failed: {e}", self.id);
                }
            }
            ClientMessage::Resize { cols, rows } => {
                let max = self.config.max_geometry;
                let (Some(cols), Some(rows)) = (
                    crate::protocol::validate_geometry(&cols, max),
                    crate::protocol::validate_geometry(&rows, max),
                ) else {
                    return;
                };
                if let Some(registry) = self.registry.upgrade() {
                    registry.resize_all(cols, rows).await;
                }
            }
            ClientMessage::Ping => {
                let state = self.state.lock().await;
                if let Some(tx) = state.clients.get(&client_id) {
                    let _ = tx.try_send(ServerMessage::Pong);
                }
            }
        }
    }

    /// Applies this session's PTY resize directly (called by
    /// `Registry::resize_all`, which has already validated and stored the
    /// new default geometry). Broadcasts `meta` if geometry actually changed.
    pub async fn apply_resize(&self, cols: u16, rows: u16) {
        let mut state = self.state.lock().await;
        if state.cols == cols && state.rows == rows {
            return;
        }
        if let Err(e) = self.pty.resize(cols, rows) {
            log::warn!("session {} resize failed: {e}", self.id);
            return;
        }
        state.cols = cols;
        state.rows = rows;
        let meta = meta_message(&state);
        broadcast(&mut state.clients, meta);
    }

    /// Merges a prober tick's findings into `title`/`cwd`/`env`, broadcasting
    /// `meta` only if something actually changed (spec.md §4.6).
    pub async fn apply_probe(&self, probe: ProbeResult) {
        let mut state = self.state.lock().await;
        let mut changed = false;

        if state.title != probe.title {
            state.title = probe.title;
            changed = true;
        }
        if let Some(cwd) = probe.cwd {
            if state.cwd != cwd {
                state.cwd = cwd;
                changed = true;
            }
        }
        if let Some(env) = probe.env {
            if state.env != env {
                state.env = env;
                changed = true;
            }
        }

        if changed {
            let meta = meta_message(&state);
            broadcast(&mut state.clients, meta);
        }
    }

    pub async fn summary(&self) -> SessionSummary {
        let state = self.state.lock().await;
        SessionSummary {
            id: self.id,
            created_at: self.created_at.duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0),
            shell: self.shell.to_string_lossy().into_owned(),
            cwd: if state.cwd.is_empty() { self.initial_cwd.to_string_lossy().into_owned() } else { state.cwd.clone() },
            title: state.title.clone(),
            env: state.env.clone(),
            cols: state.cols,
            rows: state.rows,
            executions: state.executions.iter().map(Into::into).collect(),
        }
    }

    /// Tears down everything this session owns except the PTY itself (the
    /// caller, `Registry::remove`, kills the PTY separately): stops the
    /// prober, drops all client handles without closing their transports
    /// (the transport owner notices the closed channel and tears down), and
    /// removes the shell-integration rc file.
    pub async fn dispose(&self) {
        self.prober_shutdown.notify_waiters();
        let mut state = self.state.lock().await;
        state.clients.clear();
        drop(state);
        if let Some(integration) = &self.integration {
            integration.cleanup();
        }
    }

    /// Terminates the underlying PTY's process group. Used by
    /// `Registry::remove`/`Registry::dispose`.
    pub async fn kill_pty(&self, signal: Signal) {
        if let Err(e) = self.pty.kill(signal).await {
            log::warn!("session {} kill failed: {e}", self.id);
        }
    }
}

fn meta_message(state: &SessionState) -> ServerMessage {
    ServerMessage::Meta {
        title: state.title.clone(),
        cwd: state.cwd.clone(),
        env: state.env.clone(),
        cols: state.cols,
        rows: state.rows,
    }
}

/// Best-effort fan-out: a full client queue means that client is falling
/// behind, so the message is dropped for it (never blocking the caller,
/// never reordering what *does* get delivered to other clients).
fn broadcast(clients: &mut std::collections::HashMap<Uuid, mpsc::Sender<ServerMessage>>, msg: ServerMessage) {
    for (id, tx) in clients.iter() {
        if tx.try_send(msg.clone()).is_err() {
            log::debug!("client {id} queue full or closed, dropping message");
        }
    }
}

/// Appends `text` to `history`, truncating from the head so the result never
/// exceeds `limit` bytes (spec.md §4.4: "last-write wins on overflow,
/// truncation happens only at the head").
fn append_history(history: &mut String, text: &str, limit: usize) {
    history.push_str(text);
    if history.len() > limit {
        let excess = history.len() - limit;
        let mut cut = excess;
        while cut < history.len() && !history.is_char_boundary(cut) {
            cut += 1;
        }
        history.drain(..cut);
    }
}

fn basename(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_truncates_from_head_at_exact_overflow() {
        let mut history = "a".repeat(10);
        append_history(&mut history, "b", 10);
        assert_eq!(history.len(), 10);
        assert_eq!(history, format!("{}b", "a".repeat(9)));
    }

    #[test]
    fn history_within_limit_is_unchanged() {
        let mut history = String::from("hello");
        append_history(&mut history, " world", 100);
        assert_eq!(history, "hello world");
    }

    #[test]
    fn basename_strips_path() {
        assert_eq!(basename(Path::new("/bin/bash")), "bash");
    }

    #[tokio::test]
    async fn attach_greeting_precedes_later_broadcasts() {
        let registry = Registry::new(Config::default());
        let session = registry.create().expect("spawn a session");

        let (_client_id, mut rx) = session.attach().await;

        let first = rx.recv().await.expect("snapshot");
        assert!(matches!(first, ServerMessage::Snapshot { .. }));
        let second = rx.recv().await.expect("meta");
        assert!(matches!(second, ServerMessage::Meta { .. }));
        let third = rx.recv().await.expect("status");
        assert!(matches!(
            third,
            ServerMessage::Status { status: SessionStatusWire::Ready, .. }
        ));

        // Anything broadcast after attach arrives strictly after the greeting.
        session.handle_pty_data(b"hello\n".to_vec()).await;
        let fourth = rx.recv().await.expect("output");
        assert!(matches!(fourth, ServerMessage::Output { .. }));

        session.kill_pty(crate::pty::Signal::Term).await;
    }

    #[tokio::test]
    async fn closed_session_refuses_further_input() {
        let registry = Registry::new(Config::default());
        let session = registry.create().expect("spawn a session");

        session.handle_pty_exit(Some(0), None).await;
        assert!(session.closed());

        // Writing after close must be a silent no-op, never a panic or an
        // attempted PTY write (spec.md §7: "write to disposed/closed session:
        // silently dropped").
        session
            .handle_client_message(Uuid::new_v4(), ClientMessage::Input { data: "ls\n".into() })
            .await;
    }

    #[tokio::test]
    async fn executions_fifo_evict_at_cap() {
        use base64::Engine;

        let mut config = Config::default();
        config.execution_cap = 3;
        let registry = Registry::new(config);
        let session = registry.create().expect("spawn a session");

        for i in 0..5 {
            let cmd = format!("cmd{i}");
            let b64 = base64::engine::general_purpose::STANDARD.encode(&cmd);
            session.handle_pty_data(format!("{cmd}\n").into_bytes()).await;
            session
                .handle_pty_data(crate::markers::exit_marker(0, &b64).into_bytes())
                .await;
        }

        let summary = session.summary().await;
        assert_eq!(summary.executions.len(), 3);
        // Oldest (cmd0, cmd1) evicted; newest three survive in order.
        let commands: Vec<_> = summary.executions.iter().map(|e| e.command.clone()).collect();
        assert_eq!(
            commands,
            vec![Some("cmd2".to_string()), Some("cmd3".to_string()), Some("cmd4".to_string())]
        );

        session.kill_pty(crate::pty::Signal::Term).await;
    }
}
