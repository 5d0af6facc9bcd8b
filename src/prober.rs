//! Foreground Prober.
//!
//! A periodic per-session task that walks the PTY leader's descendant tree
//! to the deepest child (repeated child enumeration, picking the largest PID
//! at each step — an approximation of "most recently forked", since PIDs
//! monotonically increase on Linux) and reads its command line, environment,
//! and cwd. Only *changes* trigger a `meta` broadcast; probe failures are
//! swallowed (`log::debug!` at most) since a prober hiccup must never bring
//! down the session it watches.
//!
//! `ProcessIntrospection` is the platform-introspection capability named in
//! spec.md §9's design notes: one trait, implementations can vary per OS,
//! callers never match on platform themselves. `SysinfoIntrospection` is the
//! one implementation this crate ships, continuing
//! `core/process_tree.rs`'s DFS-over-sysinfo approach for enumeration, with
//! `/proc` reads for the Linux-specific cwd/environ detail `sysinfo` itself
//! doesn't expose.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::sync::Notify;

use crate::error::ProcessError;
use crate::session::Session;

/// Per-session snapshot the prober hands to `Session::apply_probe`.
#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub title: String,
    pub cwd: Option<String>,
    pub env: Option<String>,
}

/// Platform process-introspection capability: deepest descendant, and that
/// descendant's argv/environ/cwd. One implementation ships in this crate;
/// the trait boundary exists so a future platform-specific implementation
/// (spec.md mentions `lsof`/`ps` on macOS) doesn't have to thread `cfg`
/// blocks through `Prober` itself.
pub trait ProcessIntrospection: Send + Sync {
    fn deepest_descendant(&self, root_pid: i32) -> Option<i32>;
    fn args(&self, pid: i32) -> Option<Vec<String>>;
    fn env(&self, pid: i32) -> Option<Vec<(String, String)>>;
    fn cwd(&self, pid: i32) -> Option<String>;
}

/// `sysinfo`-backed introspection, with `/proc` reads on Linux for the
/// details `sysinfo` doesn't carry (environ, cwd).
pub struct SysinfoIntrospection;

impl ProcessIntrospection for SysinfoIntrospection {
    fn deepest_descendant(&self, root_pid: i32) -> Option<i32> {
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let root = Pid::from_u32(root_pid as u32);
        sys.process(root)?;

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut current = root;
        let mut found_any = false;
        loop {
            let Some(kids) = children.get(&current) else { break };
            let Some(&largest) = kids.iter().max() else { break };
            current = largest;
            found_any = true;
        }

        found_any.then_some(current.as_u32() as i32)
    }

    fn args(&self, pid: i32) -> Option<Vec<String>> {
        let mut sys = System::new();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::All, false);
        sys.process(Pid::from_u32(pid as u32)).map(|p| {
            p.cmd().iter().map(|s| s.to_string_lossy().into_owned()).collect()
        })
    }

    fn env(&self, pid: i32) -> Option<Vec<(String, String)>> {
        #[cfg(target_os = "linux")]
        {
            let raw = std::fs::read(format!("/proc/{pid}/environ")).ok()?;
            let pairs = raw
                .split(|&b| b == 0)
                .filter(|s| !s.is_empty())
                .filter_map(|s| {
                    let s = String::from_utf8_lossy(s);
                    s.split_once('=').map(|(k, v)| (k.to_string(), v.to_string()))
                })
                .collect();
            Some(pairs)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            None
        }
    }

    fn cwd(&self, pid: i32) -> Option<String> {
        #[cfg(target_os = "linux")]
        {
            std::fs::read_link(format!("/proc/{pid}/cwd"))
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = pid;
            None
        }
    }
}

/// Runs the prober loop for one session until `shutdown` is notified.
/// Spawned by `Registry::create` alongside the session's PTY event loop.
pub async fn run(
    session: Arc<Session>,
    introspection: Arc<dyn ProcessIntrospection>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.notified() => break,
        }

        let root_pid = session.pty_pid();
        let shell_basename = session.shell_basename();

        let result = match introspection.deepest_descendant(root_pid) {
            Some(pid) => {
                let args = introspection.args(pid);
                let title = args
                    .as_ref()
                    .and_then(|a| a.first())
                    .map(|first| {
                        let base = basename(first);
                        match args.as_ref().map(|a| &a[1..]) {
                            Some(rest) if !rest.is_empty() => format!("{base} {}", rest.join(" ")),
                            _ => base,
                        }
                    })
                    .unwrap_or_else(|| shell_basename.clone());

                ProbeResult {
                    title,
                    cwd: introspection.cwd(pid),
                    env: introspection.env(pid).map(join_env),
                }
            }
            None => ProbeResult {
                title: shell_basename,
                cwd: None,
                env: None,
            },
        };

        session.apply_probe(result).await;
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

fn join_env(pairs: Vec<(String, String)>) -> String {
    pairs.into_iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("\n")
}

// ---------------------------------------------------------------------
// REST process-tree introspection (SPEC_FULL.md §6), grounded on
// core/process_tree.rs almost verbatim.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub command: Vec<String>,
    pub parent_pid: Option<u32>,
    pub cpu_usage: f32,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProcessTree {
    pub session_id: String,
    pub root_pid: i32,
    pub processes: Vec<ProcessInfo>,
}

/// Builds the flat process tree rooted at a session's PTY leader.
pub fn get_process_tree(session_id: String, root_pid: i32) -> Option<SessionProcessTree> {
    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

    let root = Pid::from_u32(root_pid as u32);
    sys.process(root)?;

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut processes = Vec::new();
    let mut stack = vec![root];
    while let Some(pid) = stack.pop() {
        if let Some(process) = sys.process(pid) {
            processes.push(ProcessInfo {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
                command: process.cmd().iter().map(|s| s.to_string_lossy().into_owned()).collect(),
                parent_pid: process.parent().map(|p| p.as_u32()),
                cpu_usage: process.cpu_usage(),
                memory_bytes: process.memory(),
            });
            if let Some(kids) = children.get(&pid) {
                stack.extend(kids);
            }
        }
    }

    Some(SessionProcessTree { session_id, root_pid, processes })
}

/// Kills a non-root descendant process: SIGTERM, then SIGKILL after a grace
/// period if still alive. Refuses to kill any session's own PTY leader.
pub async fn kill_process(pid: u32, session_root_pids: &[i32]) -> Result<(), ProcessError> {
    if session_root_pids.contains(&(pid as i32)) {
        return Err(ProcessError::CannotKillRoot);
    }

    let mut sys = System::new();
    sys.refresh_processes(sysinfo::ProcessesToUpdate::All, false);
    if sys.process(Pid::from_u32(pid)).is_none() {
        return Err(ProcessError::NotFound(pid));
    }

    #[cfg(unix)]
    {
        let term = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if term != 0 {
            return Err(ProcessError::KillFailed {
                pid,
                reason: std::io::Error::last_os_error().to_string(),
            });
        }

        let exited = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if unsafe { libc::kill(pid as i32, 0) } != 0 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if exited.is_err() {
            let kill = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
            if kill != 0 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    return Err(ProcessError::KillFailed { pid, reason: err.to_string() });
                }
            }
        }
    }

    #[cfg(windows)]
    {
        let output = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/F"])
            .output();
        if let Ok(output) = output {
            if !output.status.success() {
                return Err(ProcessError::KillFailed {
                    pid,
                    reason: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
        }
    }

    log::info!("killed process {pid}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeIntrospection;
    impl ProcessIntrospection for FakeIntrospection {
        fn deepest_descendant(&self, _root_pid: i32) -> Option<i32> {
            None
        }
        fn args(&self, _pid: i32) -> Option<Vec<String>> {
            None
        }
        fn env(&self, _pid: i32) -> Option<Vec<(String, String)>> {
            None
        }
        fn cwd(&self, _pid: i32) -> Option<String> {
            None
        }
    }

    #[test]
    fn basename_strips_directories() {
        assert_eq!(basename("/usr/bin/vim"), "vim");
        assert_eq!(basename("vim"), "vim");
    }

    #[test]
    fn join_env_formats_key_value_pairs() {
        let s = join_env(vec![("A".into(), "1".into()), ("B".into(), "2".into())]);
        assert_eq!(s, "A=1\nB=2");
    }

    #[tokio::test]
    async fn kill_process_refuses_root() {
        let result = kill_process(123, &[123]).await;
        assert!(matches!(result, Err(ProcessError::CannotKillRoot)));
    }

    #[test]
    fn fake_introspection_reports_no_descendant() {
        let introspection = FakeIntrospection;
        assert_eq!(introspection.deepest_descendant(1), None);
    }
}
