//! Tabminal-private OSC marker bodies, shared between the Shell-Integration
//! Installer (which emits them) and the Stream Interpreter (which
//! recognizes them).

pub const OSC_PREFIX: &str = "\x1b]1337;";
pub const BEL: u8 = 0x07;

/// Body of the prompt marker: `ESC ] 1337 ; TabminalPrompt BEL`.
pub const PROMPT_BODY: &str = "TabminalPrompt";

/// Prefix of the exit-marker body: `ExitCode=<digits>;CommandB64=<base64>`.
pub const EXIT_PREFIX: &str = "ExitCode=";
pub const COMMAND_B64_MARKER: &str = ";CommandB64=";

/// Renders a full prompt marker sequence.
pub fn prompt_marker() -> String {
    format!("{OSC_PREFIX}{PROMPT_BODY}\x07")
}

/// Renders a full exit marker sequence for shell-side emission (used by the
/// rc templates, and by tests constructing synthetic PTY output).
pub fn exit_marker(exit_code: i32, command_b64: &str) -> String {
    format!("{OSC_PREFIX}{EXIT_PREFIX}{exit_code}{COMMAND_B64_MARKER}{command_b64}\x07")
}
