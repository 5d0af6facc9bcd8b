//! Shell-Integration Installer.
//!
//! For a recognized shell, writes a temporary rc file that sources the
//! user's own rc first, then injects a pre-exec hook, a post-exec/pre-prompt
//! hook that emits the exit marker, and an idempotent prompt-marker append
//! to `PS1`/`PROMPT`. Unknown shells get no rc and no execution records: we
//! never synthesize markers from heuristics for a shell we don't recognize.
//!
//! Modeled as a small closed capability enum rather than per-shell string
//! dispatch, so adding a shell means adding a variant and a template, not
//! another string match scattered across call sites.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::markers;

/// Which shell-integration template to materialize for a given shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellIntegration {
    Bash,
    Zsh,
    /// Unrecognized shell: spawned plainly, no execution records.
    None,
}

impl ShellIntegration {
    /// Classifies a shell by the basename of its executable path.
    pub fn detect(shell_path: &str) -> Self {
        let basename = Path::new(shell_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("");
        match basename {
            "bash" => ShellIntegration::Bash,
            "zsh" => ShellIntegration::Zsh,
            _ => ShellIntegration::None,
        }
    }

    /// Writes the rc file for this session into the OS temp dir, returning
    /// its path and the extra argv this shell needs to source it. Returns
    /// `None` for `ShellIntegration::None`: the caller spawns the shell
    /// plainly with no extra args.
    pub fn install(&self, session_id: Uuid) -> std::io::Result<Option<InstalledIntegration>> {
        self.install_in(session_id, &std::env::temp_dir())
    }

    /// Same as [`ShellIntegration::install`], but rooted at `base_dir`
    /// instead of the OS temp dir — the seam tests use to write into a
    /// `tempfile::TempDir` rather than the real system temp directory.
    pub fn install_in(&self, session_id: Uuid, base_dir: &Path) -> std::io::Result<Option<InstalledIntegration>> {
        match self {
            ShellIntegration::Bash => {
                let path = rc_path(base_dir, session_id, "bash");
                std::fs::write(&path, bash_rc())?;
                Ok(Some(InstalledIntegration {
                    rc_path: path,
                    extra_args: vec!["--rcfile".to_string()],
                    rc_path_is_arg: true,
                }))
            }
            ShellIntegration::Zsh => {
                let path = rc_path(base_dir, session_id, "zsh");
                std::fs::write(&path, zsh_rc())?;
                Ok(Some(InstalledIntegration {
                    rc_path: path,
                    extra_args: Vec::new(),
                    rc_path_is_arg: false,
                }))
            }
            ShellIntegration::None => Ok(None),
        }
    }
}

/// Result of installing shell integration: where the rc file lives, and how
/// the caller must arrange for the shell to source it.
pub struct InstalledIntegration {
    pub rc_path: PathBuf,
    /// Argv fragments to append before `rc_path` (e.g. `--rcfile` for bash).
    /// Empty for zsh, which is steered via `ZDOTDIR` instead (see `spawn_env`).
    pub extra_args: Vec<String>,
    /// Whether `rc_path` itself must be appended to argv (bash) or passed
    /// via environment (zsh, using `ZDOTDIR`).
    pub rc_path_is_arg: bool,
}

impl InstalledIntegration {
    /// Extra argv entries the caller should pass to `CommandBuilder`.
    pub fn argv(&self) -> Vec<String> {
        if self.rc_path_is_arg {
            let mut v = self.extra_args.clone();
            v.push(self.rc_path.to_string_lossy().into_owned());
            v
        } else {
            self.extra_args.clone()
        }
    }

    /// Extra environment variables the caller should set (zsh's `ZDOTDIR`
    /// trick: zsh sources `$ZDOTDIR/.zshrc` instead of `~/.zshrc`, so we
    /// point `ZDOTDIR` at a directory containing only our generated file,
    /// which itself sources the user's real `~/.zshrc` first).
    pub fn env(&self) -> Vec<(String, String)> {
        if self.rc_path_is_arg {
            Vec::new()
        } else {
            let dir = self
                .rc_path
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            vec![("ZDOTDIR".to_string(), dir)]
        }
    }

    /// Removes the rc file (and, for zsh, its containing directory). Called
    /// on PTY exit; never fatal if it fails (file may already be gone).
    pub fn cleanup(&self) {
        if self.rc_path_is_arg {
            let _ = std::fs::remove_file(&self.rc_path);
        } else if let Some(dir) = self.rc_path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}

fn rc_path(base_dir: &Path, session_id: Uuid, shell: &str) -> PathBuf {
    match shell {
        "zsh" => {
            // zsh requires the file to be literally named `.zshrc` inside
            // the directory pointed to by `ZDOTDIR`.
            let dir = base_dir.join(format!("tabminal-{}-zdotdir", session_id.simple()));
            let _ = std::fs::create_dir_all(&dir);
            dir.join(".zshrc")
        }
        _ => base_dir.join(format!("tabminal-{}.bashrc", session_id.simple())),
    }
}

fn bash_rc() -> String {
    let prompt = markers::prompt_marker();
    format!(
        r#"# Generated by tabminal; sources the user's own bashrc first.
[ -f ~/.bashrc ] && source ~/.bashrc

__tabminal_precmd() {{
  local ec=$?
  if [ -n "${{__tabminal_cmd:-}}" ]; then
    local b64
    b64=$(printf '%s' "$__tabminal_cmd" | base64 | tr -d '\n')
    printf '\033]1337;ExitCode=%s;CommandB64=%s\007' "$ec" "$b64"
    unset __tabminal_cmd
  fi
}}

__tabminal_preexec() {{
  case "$BASH_COMMAND" in
    __tabminal_precmd*|__tabminal_preexec*) return ;;
  esac
  __tabminal_cmd="$BASH_COMMAND"
}}

trap '__tabminal_preexec' DEBUG
PROMPT_COMMAND="__tabminal_precmd${{PROMPT_COMMAND:+; $PROMPT_COMMAND}}"

case "$PS1" in
  *'{prompt}'*) ;;
  *) PS1="${{PS1}}{prompt}" ;;
esac
"#
    )
}

fn zsh_rc() -> String {
    let prompt = markers::prompt_marker();
    format!(
        r#"# Generated by tabminal; sources the user's own zshrc first.
[ -f ~/.zshrc ] && source ~/.zshrc

__tabminal_preexec() {{
  __tabminal_cmd="$1"
}}

__tabminal_precmd() {{
  local ec=$?
  if [ -n "${{__tabminal_cmd:-}}" ]; then
    local b64
    b64=$(printf '%s' "$__tabminal_cmd" | base64 | tr -d '\n')
    printf '\033]1337;ExitCode=%s;CommandB64=%s\007' "$ec" "$b64"
    unset __tabminal_cmd
  fi
}}

preexec_functions+=(__tabminal_preexec)
precmd_functions+=(__tabminal_precmd)

case "$PROMPT" in
  *'{prompt}'*) ;;
  *) PROMPT="${{PROMPT}}{prompt}" ;;
esac
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_known_shells() {
        assert_eq!(ShellIntegration::detect("/bin/bash"), ShellIntegration::Bash);
        assert_eq!(ShellIntegration::detect("/usr/bin/zsh"), ShellIntegration::Zsh);
        assert_eq!(ShellIntegration::detect("/bin/fish"), ShellIntegration::None);
        assert_eq!(ShellIntegration::detect(""), ShellIntegration::None);
    }

    #[test]
    fn bash_install_writes_rc_with_marker_and_cleans_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let installed = ShellIntegration::Bash.install_in(id, tmp.path()).unwrap().unwrap();
        assert!(installed.rc_path.starts_with(tmp.path()));
        assert!(installed.rc_path.exists());
        let contents = std::fs::read_to_string(&installed.rc_path).unwrap();
        assert!(contents.contains("TabminalPrompt"));
        assert!(contents.contains("source ~/.bashrc"));
        let argv = installed.argv();
        assert_eq!(argv[0], "--rcfile");
        installed.cleanup();
        assert!(!installed.rc_path.exists());
    }

    #[test]
    fn zsh_install_uses_zdotdir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let installed = ShellIntegration::Zsh.install_in(id, tmp.path()).unwrap().unwrap();
        assert!(installed.rc_path.starts_with(tmp.path()));
        assert!(installed.rc_path.file_name().unwrap() == ".zshrc");
        let env = installed.env();
        assert_eq!(env[0].0, "ZDOTDIR");
        installed.cleanup();
        assert!(!installed.rc_path.parent().unwrap().exists());
    }

    #[test]
    fn unknown_shell_installs_nothing() {
        let tmp = tempfile::TempDir::new().unwrap();
        let id = Uuid::new_v4();
        assert!(ShellIntegration::None.install_in(id, tmp.path()).unwrap().is_none());
    }

    #[test]
    fn prompt_marker_inserted_idempotently() {
        let rc = bash_rc();
        assert_eq!(rc.matches("TabminalPrompt").count(), 2); // guard check + assignment
    }
}
