//! Session Registry.
//!
//! Owns every live PTY via the `Session`s wrapping them; mints and reaps
//! sessions, propagates geometry changes to all of them at once, and
//! enforces the auto-respawn invariant (spec.md §3/§8: "if the registry
//! becomes empty outside `Dispose`, it becomes size 1 before observers can
//! see it empty").
//!
//! `DashMap`-backed exactly like the teacher's `core/session_manager.rs`,
//! but folding in PTY ownership too — the teacher splits that across
//! `ProcessManager` + `SessionManager` because Tauri's `State<T>` injection
//! wants small independent types; this crate has no such constraint.
//!
//! Cyclic ownership (spec.md §9): `Session` holds only a `Weak<Registry>`
//! (wired up via `Arc::new_cyclic` so the cycle never needs a second pass),
//! and routes every registry-level mutation — resize-all, removal on PTY
//! exit — back through `Registry`'s own methods rather than mutating its
//! own bookkeeping of other sessions directly.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::Config;
use crate::error::PtyError;
use crate::prober::{self, ProcessIntrospection, SysinfoIntrospection};
use crate::protocol::SessionSummary;
use crate::pty::{Pty, PtyEvent, Signal};
use crate::session::Session;
use crate::shell_integration::ShellIntegration;

pub struct Registry {
    sessions: DashMap<Uuid, Arc<Session>>,
    last_cols: AtomicU16,
    last_rows: AtomicU16,
    disposing: AtomicBool,
    config: Config,
    introspection: Arc<dyn ProcessIntrospection>,
    self_weak: Weak<Registry>,
}

impl Registry {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            sessions: DashMap::new(),
            last_cols: AtomicU16::new(config.default_cols),
            last_rows: AtomicU16::new(config.default_rows),
            disposing: AtomicBool::new(false),
            config,
            introspection: Arc::new(SysinfoIntrospection),
            self_weak: weak.clone(),
        })
    }

    /// Mints a new session: spawns a shell (with shell-integration rc, if
    /// recognized) inside a fresh PTY at the registry's current default
    /// geometry, wires up its PTY-event and prober background tasks, and
    /// inserts it into the map. On spawn failure the registry is left
    /// unchanged (spec.md §7: "PTY spawn failure: propagated to the caller
    /// of `Create`; registry unchanged").
    pub fn create(&self) -> Result<Arc<Session>, PtyError> {
        let id = Uuid::new_v4();
        let shell = default_shell();
        let cwd = std::env::current_dir().ok();
        let cols = self.last_cols.load(Ordering::SeqCst);
        let rows = self.last_rows.load(Ordering::SeqCst);

        let integration = ShellIntegration::detect(&shell)
            .install(id)
            .map_err(|e| PtyError::SpawnFailed(format!("shell integration install failed: {e}")))?;

        let argv = integration.as_ref().map(|i| i.argv()).unwrap_or_default();
        let env = integration.as_ref().map(|i| i.env()).unwrap_or_default();

        let (pty, pty_rx) = Pty::spawn(&shell, &argv, cols, rows, cwd.as_deref().and_then(|p| p.to_str()), &env)?;

        let session = Session::new(
            id,
            PathBuf::from(&shell),
            cwd.unwrap_or_else(|| PathBuf::from("/")),
            cols,
            rows,
            Arc::new(pty),
            integration,
            self.config.clone(),
            self.self_weak.clone(),
        );

        self.sessions.insert(id, session.clone());

        tokio::spawn(pty_event_loop(session.clone(), pty_rx, self.self_weak.clone()));
        tokio::spawn(prober::run(
            session.clone(),
            self.introspection.clone(),
            self.config.probe_interval,
            session.prober_shutdown.clone(),
        ));

        log::info!("session {id} created (shell={shell}, pid={})", session.pty_pid());
        Ok(session)
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    /// Removes and disposes a session. If this empties the registry and it
    /// isn't mid-`dispose`, immediately creates a replacement — the
    /// auto-respawn invariant.
    pub async fn remove(&self, id: Uuid) {
        let removed = self.sessions.remove(&id).map(|(_, s)| s);
        if let Some(session) = removed {
            session.dispose().await;
            log::info!("session {id} removed");
        }

        if self.sessions.is_empty() && !self.disposing.load(Ordering::SeqCst) {
            match self.create() {
                Ok(replacement) => {
                    log::info!("auto-respawned session {} after registry went empty", replacement.id());
                }
                Err(e) => log::error!("auto-respawn failed: {e}"),
            }
        }
    }

    /// Validates and applies a new default geometry to every live session.
    /// Called both from a client's `resize` message (via the originating
    /// session) and, in principle, from any future REST equivalent.
    pub async fn resize_all(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 || cols > self.config.max_geometry || rows > self.config.max_geometry {
            return;
        }
        self.last_cols.store(cols, Ordering::SeqCst);
        self.last_rows.store(rows, Ordering::SeqCst);

        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in sessions {
            session.apply_resize(cols, rows).await;
        }
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All currently-live PTY-leader PIDs, for the process-kill endpoint's
    /// "never kill a session root" guard.
    pub fn root_pids(&self) -> Vec<i32> {
        self.sessions.iter().map(|e| e.value().pty_pid()).collect()
    }

    /// Shuts every session down and suppresses auto-respawn. Irreversible —
    /// intended for process shutdown only.
    pub async fn dispose(&self) {
        self.disposing.store(true, Ordering::SeqCst);
        let sessions: Vec<_> = self.sessions.iter().map(|e| e.value().clone()).collect();
        for session in &sessions {
            session.kill_pty(Signal::Hup).await;
            session.dispose().await;
        }
        self.sessions.clear();
        log::info!("registry disposed ({} sessions torn down)", sessions.len());
    }
}

/// Drains one session's PTY event stream until exit, feeding `Data` chunks
/// to the session and triggering `Registry::remove` on `Exit`.
async fn pty_event_loop(session: Arc<Session>, mut rx: tokio::sync::mpsc::Receiver<PtyEvent>, registry: Weak<Registry>) {
    let id = session.id();
    while let Some(event) = rx.recv().await {
        match event {
            PtyEvent::Data(bytes) => session.handle_pty_data(bytes).await,
            PtyEvent::Exit { code, signal } => {
                session.handle_pty_exit(code, signal).await;
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id).await;
                }
                break;
            }
        }
    }
}

fn default_shell() -> String {
    #[cfg(unix)]
    {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_falls_back_when_unset() {
        // Just exercises the fallback path without requiring a real shell
        // binary to exist in the test sandbox.
        let shell = default_shell();
        assert!(!shell.is_empty());
    }

    #[tokio::test]
    async fn auto_respawn_replaces_last_removed_session() {
        let registry = Registry::new(Config::default());
        let session = registry.create().expect("spawn a session");
        let old_id = session.id();

        session.kill_pty(Signal::Term).await;
        registry.remove(old_id).await;

        // spec.md §8: "if the registry becomes empty outside Dispose, it
        // becomes size 1 before observers can see it empty" — by the time
        // `remove` returns, the replacement already exists.
        assert_eq!(registry.len(), 1);
        let summaries = registry.list().await;
        assert_eq!(summaries.len(), 1);
        assert_ne!(summaries[0].id, old_id);
    }

    #[tokio::test]
    async fn resize_all_applies_to_every_live_session() {
        let registry = Registry::new(Config::default());
        registry.create().expect("spawn s1");
        registry.create().expect("spawn s2");

        registry.resize_all(100, 40).await;

        let summaries = registry.list().await;
        assert_eq!(summaries.len(), 2);
        for s in &summaries {
            assert_eq!((s.cols, s.rows), (100, 40));
        }
    }

    #[tokio::test]
    async fn resize_all_rejects_out_of_range_geometry() {
        let registry = Registry::new(Config::default());
        registry.create().expect("spawn a session");

        registry.resize_all(0, 40).await;
        registry.resize_all(40, 501).await;

        let summaries = registry.list().await;
        assert_eq!((summaries[0].cols, summaries[0].rows), (80, 24));
    }
}
