//! Wire types for the client⇄session duplex channel and the REST surface.
//!
//! One JSON object per frame, tagged by `type`, per spec.md §6. Deserializing
//! `ClientMessage` never fails on a message with an unrecognized `type` or
//! malformed field — per §7 ("Malformed client message: ignored; connection
//! kept"), those cases fall out as `serde_json::from_str` errors that the
//! caller (the websocket read loop in `server`) swallows and logs rather
//! than propagates.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::interpreter::ExecutionRecord;
use crate::prober::{ProcessInfo, SessionProcessTree};

/// Server → client frames, per spec.md §6.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after attach: the entire current history buffer.
    Snapshot { data: String },
    /// Sent after `Snapshot`, and again whenever title/cwd/env/geometry change.
    Meta {
        title: String,
        cwd: String,
        env: String,
        cols: u16,
        rows: u16,
    },
    /// Every cleaned PTY chunk, post-greeting.
    Output { data: String },
    /// Sent after the greeting, and once on PTY exit.
    Status {
        status: SessionStatusWire,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// Reply to a client's `ping`, addressed to that client only.
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatusWire {
    Ready,
    Terminated,
}

/// Client → server frames, per spec.md §6. Fields that must pass validation
/// (`resize`'s `cols`/`rows`) are deserialized as loosely-typed
/// [`serde_json::Value`]s rather than `u16`, so a message with `"rows":"bad"`
/// still deserializes successfully as a `Resize` and is rejected by
/// `validate_geometry` instead of failing to parse at all (both paths end in
/// "ignored", but this keeps validation logic in one place).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize {
        #[serde(default)]
        cols: serde_json::Value,
        #[serde(default)]
        rows: serde_json::Value,
    },
    Ping,
}

/// Validates a `resize` field against spec.md §4.4: must be a positive
/// integer, clamped to `<= max`. Returns `None` for anything else (negative,
/// zero, non-integer, float, string, or over the ceiling).
pub fn validate_geometry(value: &serde_json::Value, max: u16) -> Option<u16> {
    let n = value.as_u64()?;
    if n == 0 || n > max as u64 {
        return None;
    }
    Some(n as u16)
}

/// REST summary of one session, returned by `GET /api/sessions` (via
/// `GET /api/heartbeat`) and `POST /api/sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: Uuid,
    pub created_at: u64,
    pub shell: String,
    pub cwd: String,
    pub title: String,
    pub env: String,
    pub cols: u16,
    pub rows: u16,
    pub executions: Vec<ExecutionSummary>,
}

/// A trimmed, JSON-friendly view of [`ExecutionRecord`] for the REST surface
/// (timestamps rendered as Unix millis instead of `SystemTime`).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    pub input: String,
    pub output: String,
    pub started_at: u64,
    pub completed_at: u64,
    pub duration_ms: u64,
}

impl From<&ExecutionRecord> for ExecutionSummary {
    fn from(rec: &ExecutionRecord) -> Self {
        let started = to_millis(rec.started_at);
        let completed = to_millis(rec.completed_at);
        Self {
            command: rec.command.clone(),
            exit_code: rec.exit_code,
            input: rec.input.clone(),
            output: rec.output.clone(),
            started_at: started,
            completed_at: completed,
            duration_ms: completed.saturating_sub(started),
        }
    }
}

fn to_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// `{ sessions, system }` returned by `GET /api/heartbeat`. `system` is an
/// opaque-to-the-contract process-wide snapshot (spec.md §6 leaves its shape
/// unspecified; SPEC_FULL.md §6 fills it with a minimal summary rather than
/// nothing, since *some* concrete shape has to back it).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub sessions: Vec<SessionSummary>,
    pub system: SystemSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSnapshot {
    pub uptime_secs: u64,
    pub session_count: usize,
    pub tracked_pids: usize,
}

/// `GET /api/sessions/:id/processes` response body — re-exported for
/// convenience so `server` doesn't need to import `prober` directly.
pub type ProcessTreeResponse = SessionProcessTree;
pub type ProcessInfoDto = ProcessInfo;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resize_rejects_non_integer_and_out_of_range() {
        assert_eq!(validate_geometry(&json!(80), 500), Some(80));
        assert_eq!(validate_geometry(&json!(500), 500), Some(500));
        assert_eq!(validate_geometry(&json!(501), 500), None);
        assert_eq!(validate_geometry(&json!(0), 500), None);
        assert_eq!(validate_geometry(&json!(-5), 500), None);
        assert_eq!(validate_geometry(&json!("bad"), 500), None);
        assert_eq!(validate_geometry(&json!(40.5), 500), None);
    }

    #[test]
    fn client_message_parses_by_tag() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        matches!(msg, ClientMessage::Input { .. });

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"resize","cols":-5,"rows":"bad"}"#).unwrap();
        if let ClientMessage::Resize { cols, rows } = msg {
            assert!(validate_geometry(&cols, 500).is_none());
            assert!(validate_geometry(&rows, 500).is_none());
        } else {
            panic!("expected Resize variant");
        }
    }

    #[test]
    fn server_message_snapshot_serializes_with_tag() {
        let msg = ServerMessage::Snapshot { data: "hi".into() };
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "snapshot");
        assert_eq!(v["data"], "hi");
    }
}
