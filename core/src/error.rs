use std::io;
use std::path::PathBuf;
use std::time::Duration;

use codex_protocol::ConversationId;
use thiserror::Error;

use crate::exec::ExecToolCallOutput;

pub type Result<T> = std::result::Result<T, CodexErr>;

#[derive(Error, Debug)]
pub enum SandboxErr {
    /// Error from sandbox execution
    #[error("sandbox denied exec error, exit code: {}", .output.exit_code)]
    Denied { output: Box<ExecToolCallOutput> },

    /// Command timed out
    #[error("command timed out")]
    Timeout { output: Box<ExecToolCallOutput> },

    /// Command was killed by a signal
    #[error("command was killed by a signal: {0}")]
    Signal(i32),

    /// Error from linux landlock
    #[error("Landlock was not able to fully enforce all sandbox rules")]
    LandlockRestrict,

    /// Error from linux seccomp filter setup
    #[cfg(target_os = "linux")]
    #[error("seccomp setup error")]
    SeccompInstall(#[from] seccompiler::Error),

    /// Error from linux seccomp backend
    #[cfg(target_os = "linux")]
    #[error("seccomp backend error")]
    SeccompBackend(#[from] seccompiler::BackendError),

    /// The private mount namespace used to protect read-only subpaths could
    /// not be set up, typically because unprivileged user namespaces are off.
    #[error("failed to enter a private mount namespace: {0}")]
    MountNamespace(#[source] io::Error),

    /// A read-only subpath of a writable root could not be remounted.
    #[error("failed to keep {} read-only: {source}", .path.display())]
    ReadOnlySubpath {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The Linux helper binary was not configured, so a Linux sandbox cannot
    /// be applied. Never silently downgraded to unsandboxed execution.
    #[error("codex-linux-sandbox executable not provided")]
    MissingLinuxSandboxExecutable,

    /// No isolation backend exists for this host.
    #[error("no sandbox backend is available on this platform")]
    UnsupportedPlatform,
}

#[derive(Error, Debug)]
pub enum CodexErr {
    /// Turn configuration failed validation before any model call was made.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned by the model stream when it fails mid-turn. The optional
    /// duration is a server-suggested delay before retrying.
    #[error("stream error: {0}")]
    Stream(String, Option<Duration>),

    #[error("exceeded retry limit, last error: {0}")]
    RetryLimit(String),

    /// The active turn was cancelled, either by `Op::Interrupt` or because a
    /// newer turn replaced it.
    #[error("turn aborted")]
    TurnAborted,

    /// The child's stdout/stderr pipes could not be captured.
    #[error("spawn failed: child stdout/stderr not captured")]
    Spawn,

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxErr),

    /// A tool failed in a way the model cannot work around, such as a
    /// sandbox backend that is missing on this host.
    #[error("{0}")]
    Fatal(String),

    /// Returned by ConversationManager when the session did not announce
    /// itself first.
    #[error("expected SessionConfigured as the first event")]
    SessionConfiguredNotFirstEvent,

    #[error("no conversation with id: {0}")]
    ConversationNotFound(ConversationId),

    #[error("internal error; agent loop died unexpectedly")]
    InternalAgentDied,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    LandlockRuleset(#[from] landlock::RulesetError),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    LandlockPathFd(#[from] landlock::PathFdError),

    #[error(transparent)]
    TokioJoin(#[from] tokio::task::JoinError),
}

impl CodexErr {
    /// Errors a retry cannot fix end the turn immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CodexErr::Stream(..) | CodexErr::Io(_))
    }
}

/// Message surfaced to the caller in an `Error` event.
pub fn get_error_message_ui(e: &CodexErr) -> String {
    match e {
        CodexErr::Sandbox(SandboxErr::Denied { output }) => {
            let aggregated = output.aggregated_output.text.trim();
            if aggregated.is_empty() {
                let stderr = output.stderr.text.trim();
                if stderr.is_empty() {
                    format!("command failed inside sandbox with exit code {}", output.exit_code)
                } else {
                    stderr.to_string()
                }
            } else {
                aggregated.to_string()
            }
        }
        CodexErr::Sandbox(SandboxErr::Timeout { output }) => format!(
            "error: command timed out after {} ms",
            output.duration.as_millis()
        ),
        _ => e.to_string(),
    }
}
