//! PTY Adapter.
//!
//! The sole permitted owner of OS pseudo-terminal resources. Every other
//! component manipulates a spawned shell only through `Pty`'s `write`,
//! `resize`, and `kill`, and only observes its output/exit through the
//! `PtyEvent` stream returned by `spawn`.
//!
//! A dedicated OS thread blocks on `reader.read()` (PTYs don't support
//! non-blocking reads portably), and a bounded `tokio::mpsc` channel hands
//! chunks to the async side. The channel's `Receiver` *is* the
//! subscription: dropping it silences further consumption, and the
//! producer thread notices the closed channel and exits.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use crate::error::PtyError;

/// Bytes read from the PTY in one `read()` call.
const READ_CHUNK: usize = 4096;

/// Depth of the data channel. At 4 KiB per message this bounds in-flight
/// unconsumed output to roughly 1 MiB before the reader thread starts
/// blocking on `send`, which in turn blocks further PTY reads — the
/// intentional backpressure point between the OS pipe and the Session actor.
const CHANNEL_DEPTH: usize = 256;

/// Events produced by a spawned PTY, in emission order.
#[derive(Debug)]
pub enum PtyEvent {
    /// A chunk of raw output. Order is preserved; content is not UTF-8
    /// validated here — that's the Stream Interpreter's job.
    Data(Vec<u8>),
    /// The child process exited. Always the last event.
    Exit { code: Option<i32>, signal: Option<i32> },
}

/// A live PTY + child shell process.
pub struct Pty {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    pid: i32,
    #[cfg(unix)]
    pgid: i32,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Pty {
    /// Spawns `shell` with `args` inside a new PTY of `cols`x`rows`, in
    /// `cwd` with `env` applied on top of the inherited environment.
    /// Returns the handle and a receiver for its event stream.
    pub fn spawn(
        shell: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>), PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(format!("openpty: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        for arg in args {
            cmd.arg(arg);
        }
        for (k, v) in env {
            cmd.env(k, v);
        }
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(format!("spawn: {e}")))?;

        let pid = child
            .process_id()
            .map(|p| p as i32)
            .ok_or_else(|| PtyError::SpawnFailed("could not obtain child PID".into()))?;

        #[cfg(unix)]
        let pgid = pair.master.process_group_leader().unwrap_or(pid);

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(format!("take_writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(format!("clone_reader: {e}")))?;

        let (tx, rx) = mpsc::channel::<PtyEvent>(CHANNEL_DEPTH);

        let reader_handle = std::thread::Builder::new()
            .name(format!("pty-reader-{pid}"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            #[cfg(unix)]
                            {
                                let raw = e.raw_os_error().unwrap_or(0);
                                if raw == libc::EAGAIN || raw == libc::EINTR {
                                    continue;
                                }
                            }
                            log::debug!("pty {pid} reader error: {e}");
                            break;
                        }
                    }
                }
                let exit = child.wait().ok();
                let (code, signal) = exit_parts(exit);
                let _ = tx.blocking_send(PtyEvent::Exit { code, signal });
                log::debug!("pty {pid} reader exited");
            })
            .map_err(|e| PtyError::SpawnFailed(format!("spawn reader thread: {e}")))?;

        drop(pair.slave);

        Ok((
            Self {
                writer: Mutex::new(writer),
                master: Mutex::new(pair.master),
                pid,
                #[cfg(unix)]
                pgid,
                reader_handle: Mutex::new(Some(reader_handle)),
            },
            rx,
        ))
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Writes raw bytes to the PTY and flushes immediately.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut w = self
            .writer
            .lock()
            .map_err(|e| PtyError::WriteFailed(format!("writer lock poisoned: {e}")))?;
        w.write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        w.flush().map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    /// Resizes the PTY, propagating SIGWINCH to the child on Unix.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let m = self
            .master
            .lock()
            .map_err(|e| PtyError::ResizeFailed(format!("master lock poisoned: {e}")))?;
        m.resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Terminates the PTY's process group: SIGTERM, then SIGKILL after a
    /// grace period if still alive. Joins the reader thread off the async
    /// runtime so the caller never blocks tokio on thread teardown.
    pub async fn kill(&self, signal: Signal) -> Result<(), PtyError> {
        #[cfg(unix)]
        {
            let pgid = self.pgid;
            let sig = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Hup => libc::SIGHUP,
                Signal::Kill => libc::SIGKILL,
            };
            let res = unsafe { libc::kill(-pgid, sig) };
            if res != 0 {
                log::warn!(
                    "failed to signal pty {} (pgid={pgid}): {}",
                    self.pid,
                    std::io::Error::last_os_error()
                );
            }

            if !matches!(signal, Signal::Kill) {
                let exited = tokio::time::timeout(Duration::from_secs(3), async {
                    loop {
                        if unsafe { libc::kill(self.pid, 0) } != 0 {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                })
                .await;

                if exited.is_err() {
                    let kill_res = unsafe { libc::kill(-pgid, libc::SIGKILL) };
                    if kill_res != 0 {
                        log::warn!(
                            "failed to SIGKILL pty {} (pgid={pgid}): {}",
                            self.pid,
                            std::io::Error::last_os_error()
                        );
                    }
                }
            }
        }
        #[cfg(windows)]
        {
            let _ = signal;
            let _ = std::process::Command::new("taskkill")
                .args(["/PID", &self.pid.to_string(), "/T", "/F"])
                .output();
        }

        let handle = self
            .reader_handle
            .lock()
            .map_err(|e| PtyError::KillFailed(format!("reader handle lock poisoned: {e}")))?
            .take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        Ok(())
    }
}

/// Signal to send when tearing down a PTY's process group.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Term,
    Hup,
    Kill,
}

fn exit_parts(status: Option<portable_pty::ExitStatus>) -> (Option<i32>, Option<i32>) {
    match status {
        Some(s) => (Some(s.exit_code() as i32), None),
        None => (None, None),
    }
}

/// Shared handle to a spawned PTY, cheaply cloneable into the owning
/// Session's actor task and any prober task that needs the PID.
pub type SharedPty = Arc<Pty>;
