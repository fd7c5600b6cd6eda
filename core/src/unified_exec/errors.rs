use thiserror::Error;

/// Failures of the PTY session registry. Rendered into the tool output, so
/// the model sees these messages verbatim.
#[derive(Debug, Error)]
pub(crate) enum UnifiedExecError {
    #[error("failed to open PTY session: {pty_error}")]
    CreateSession {
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("unknown PTY session id {session_id}")]
    UnknownSessionId { session_id: u32 },
    #[error("failed to write to PTY session stdin")]
    WriteToStdin,
    #[error("exec_command requires a non-empty command line")]
    MissingCommandLine,
    #[error("codex-linux-sandbox executable not provided")]
    MissingLinuxSandboxExecutable,
}

impl UnifiedExecError {
    pub(crate) fn create_session(error: impl Into<anyhow::Error>) -> Self {
        Self::CreateSession {
            pty_error: error.into(),
        }
    }
}
