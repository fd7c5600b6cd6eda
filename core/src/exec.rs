#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use async_channel::Sender;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::CodexErr;
use crate::error::Result;
use crate::error::SandboxErr;
use crate::landlock::spawn_command_under_linux_sandbox;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::ExecCommandOutputDeltaEvent;
use crate::protocol::ExecOutputStream;
use crate::protocol::SandboxPolicy;
use crate::seatbelt::spawn_command_under_seatbelt;
use crate::spawn::StdioPolicy;
use crate::spawn::spawn_child_async;

pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 10_000;

/// Exit code reported for a command killed at its deadline, matching
/// coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code a shell uses for "command not found". Never read as a sandbox
/// denial.
const COMMAND_NOT_FOUND_EXIT_CODE: i32 = 127;

// I/O buffer sizing
const READ_CHUNK_SIZE: usize = 8192; // bytes per read

/// Live output deltas are capped per invocation. The full output is still
/// captured.
pub(crate) const MAX_EXEC_OUTPUT_DELTAS_PER_CALL: usize = 10_000;

/// How long to keep reading pipes after the child was killed. Grandchildren
/// that inherited the pipes can otherwise hold them open indefinitely.
const IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub timeout_ms: Option<u64>,
    pub env: HashMap<String, String>,
    pub with_escalated_permissions: Option<bool>,
    pub justification: Option<String>,
}

impl ExecParams {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_EXEC_TIMEOUT_MS))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxType {
    None,

    /// Only available on macOS.
    MacosSeatbelt,

    /// Only available on Linux.
    LinuxSeccomp,
}

/// Where live output deltas for one invocation are sent.
#[derive(Clone)]
pub struct StdoutStream {
    pub sub_id: String,
    pub call_id: String,
    pub tx_event: Sender<Event>,
}

pub async fn process_exec_tool_call(
    params: ExecParams,
    sandbox_type: SandboxType,
    sandbox_policy: &SandboxPolicy,
    sandbox_cwd: &Path,
    codex_linux_sandbox_exe: &Option<PathBuf>,
    stdout_stream: Option<StdoutStream>,
    cancellation_token: &CancellationToken,
) -> Result<ExecToolCallOutput> {
    let start = Instant::now();

    let timeout_duration = params.timeout_duration();
    let ExecParams {
        command, cwd, env, ..
    } = params;

    let child = match sandbox_type {
        SandboxType::None => {
            let (program, args) = command.split_first().ok_or_else(|| {
                CodexErr::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "command args are empty",
                ))
            })?;
            let arg0 = None;
            spawn_child_async(
                PathBuf::from(program),
                args.into(),
                arg0,
                cwd,
                sandbox_policy,
                StdioPolicy::RedirectForShellTool,
                env,
            )
            .await?
        }
        SandboxType::MacosSeatbelt => {
            if !cfg!(target_os = "macos") {
                return Err(CodexErr::Sandbox(SandboxErr::UnsupportedPlatform));
            }
            spawn_command_under_seatbelt(
                command,
                sandbox_policy,
                cwd,
                StdioPolicy::RedirectForShellTool,
                env,
            )
            .await?
        }
        SandboxType::LinuxSeccomp => {
            let codex_linux_sandbox_exe = codex_linux_sandbox_exe
                .as_ref()
                .ok_or(CodexErr::Sandbox(SandboxErr::MissingLinuxSandboxExecutable))?;
            spawn_command_under_linux_sandbox(
                codex_linux_sandbox_exe,
                command,
                sandbox_policy,
                cwd,
                StdioPolicy::RedirectForShellTool,
                env,
            )
            .await?
        }
    };
    debug!(?sandbox_type, cwd = %sandbox_cwd.display(), "spawned tool command");

    let raw_output = consume_truncated_output(
        child,
        timeout_duration,
        stdout_stream,
        cancellation_token,
    )
    .await?;
    let duration = start.elapsed();

    #[cfg(unix)]
    if !raw_output.timed_out
        && let Some(signal) = raw_output.exit_status.signal()
    {
        return Err(CodexErr::Sandbox(SandboxErr::Signal(signal)));
    }

    let exit_code = if raw_output.timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        raw_output.exit_status.code().unwrap_or(-1)
    };
    let output = ExecToolCallOutput {
        exit_code,
        stdout: raw_output.stdout.from_utf8_lossy(),
        stderr: raw_output.stderr.from_utf8_lossy(),
        aggregated_output: raw_output.aggregated_output.from_utf8_lossy(),
        duration,
        timed_out: raw_output.timed_out,
    };

    if output.timed_out {
        return Err(CodexErr::Sandbox(SandboxErr::Timeout {
            output: Box::new(output),
        }));
    }

    if is_likely_sandbox_denied(sandbox_type, &output) {
        return Err(CodexErr::Sandbox(SandboxErr::Denied {
            output: Box::new(output),
        }));
    }

    Ok(output)
}

/// We don't have a fully deterministic way to tell if our command failed
/// because of the sandbox - a command in the user's zshrc file might hit an
/// error, but the command itself might fail or succeed for other reasons.
/// Under a restricting backend every non-zero exit other than "command not
/// found" is treated as a denial. This is best effort: an unrelated failure
/// inside the sandbox is misattributed, which at worst offers the user an
/// unsandboxed retry they did not need.
pub(crate) fn is_likely_sandbox_denied(
    sandbox_type: SandboxType,
    output: &ExecToolCallOutput,
) -> bool {
    if sandbox_type == SandboxType::None || output.timed_out {
        return false;
    }
    output.exit_code != 0 && output.exit_code != COMMAND_NOT_FOUND_EXIT_CODE
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutput<T> {
    pub text: T,
}

impl<T> StreamOutput<T> {
    pub fn new(text: T) -> Self {
        Self { text }
    }
}

impl StreamOutput<Vec<u8>> {
    pub fn from_utf8_lossy(&self) -> StreamOutput<String> {
        StreamOutput {
            text: String::from_utf8_lossy(&self.text).to_string(),
        }
    }
}

#[derive(Debug)]
struct RawExecToolCallOutput {
    pub exit_status: std::process::ExitStatus,
    pub stdout: StreamOutput<Vec<u8>>,
    pub stderr: StreamOutput<Vec<u8>>,
    pub aggregated_output: StreamOutput<Vec<u8>>,
    pub timed_out: bool,
}

/// Everything a finished command produced. Nothing here is truncated; the
/// model sees a projection built by [`crate::truncate`].
#[derive(Debug, Clone)]
pub struct ExecToolCallOutput {
    pub exit_code: i32,
    pub stdout: StreamOutput<String>,
    pub stderr: StreamOutput<String>,
    pub aggregated_output: StreamOutput<String>,
    pub duration: Duration,
    pub timed_out: bool,
}

async fn consume_truncated_output(
    mut child: Child,
    timeout: Duration,
    stdout_stream: Option<StdoutStream>,
    cancellation_token: &CancellationToken,
) -> Result<RawExecToolCallOutput> {
    // Both stdout and stderr were configured with `Stdio::piped()`
    // above, therefore `take()` should normally return `Some`.  If it doesn't
    // we treat it as an exceptional I/O error
    let stdout_reader = child.stdout.take().ok_or(CodexErr::Spawn)?;
    let stderr_reader = child.stderr.take().ok_or(CodexErr::Spawn)?;

    let (agg_tx, agg_rx) = async_channel::unbounded::<Vec<u8>>();
    let emitted_deltas = Arc::new(AtomicUsize::new(0));

    let stdout_handle = tokio::spawn(read_capped(
        BufReader::new(stdout_reader),
        stdout_stream.clone(),
        ExecOutputStream::Stdout,
        agg_tx.clone(),
        Arc::clone(&emitted_deltas),
    ));
    let stderr_handle = tokio::spawn(read_capped(
        BufReader::new(stderr_reader),
        stdout_stream,
        ExecOutputStream::Stderr,
        agg_tx,
        emitted_deltas,
    ));

    let (exit_status, timed_out) = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => {
            match result {
                Ok(status_result) => (status_result?, false),
                Err(_) => {
                    // timeout
                    let status = kill_and_reap(&mut child).await?;
                    (status, true)
                }
            }
        }
        _ = cancellation_token.cancelled() => {
            kill_and_reap(&mut child).await?;
            stdout_handle.abort();
            stderr_handle.abort();
            return Err(CodexErr::TurnAborted);
        }
    };

    let stdout = await_reader(stdout_handle).await?;
    let stderr = await_reader(stderr_handle).await?;

    let mut combined_buf = Vec::with_capacity(stdout.text.len() + stderr.text.len());
    while let Ok(chunk) = agg_rx.try_recv() {
        combined_buf.extend_from_slice(&chunk);
    }

    Ok(RawExecToolCallOutput {
        exit_status,
        stdout,
        stderr,
        aggregated_output: StreamOutput::new(combined_buf),
        timed_out,
    })
}

async fn kill_and_reap(child: &mut Child) -> io::Result<std::process::ExitStatus> {
    child.start_kill()?;
    child.wait().await
}

async fn await_reader(
    handle: tokio::task::JoinHandle<io::Result<StreamOutput<Vec<u8>>>>,
) -> Result<StreamOutput<Vec<u8>>> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(IO_DRAIN_TIMEOUT, handle).await {
        Ok(joined) => Ok(joined??),
        Err(_) => {
            warn!("output pipe still open after the command exited; dropping remaining output");
            abort.abort();
            Ok(StreamOutput::new(Vec::new()))
        }
    }
}

async fn read_capped<R: AsyncRead + Unpin + Send + 'static>(
    mut reader: R,
    stream: Option<StdoutStream>,
    which: ExecOutputStream,
    aggregate_tx: Sender<Vec<u8>>,
    emitted_deltas: Arc<AtomicUsize>,
) -> io::Result<StreamOutput<Vec<u8>>> {
    let mut buf = Vec::with_capacity(READ_CHUNK_SIZE);
    let mut tmp = [0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        let chunk = &tmp[..n];

        if let Some(stream) = &stream
            && emitted_deltas.fetch_add(1, Ordering::Relaxed) < MAX_EXEC_OUTPUT_DELTAS_PER_CALL
        {
            let msg = EventMsg::ExecCommandOutputDelta(ExecCommandOutputDeltaEvent {
                call_id: stream.call_id.clone(),
                stream: which,
                chunk: chunk.to_vec(),
            });
            let event = Event {
                id: stream.sub_id.clone(),
                msg,
            };
            #[allow(clippy::let_unit_value)]
            let _ = stream.tx_event.send(event).await;
        }

        let _ = aggregate_tx.send(chunk.to_vec()).await;
        buf.extend_from_slice(chunk);
    }

    Ok(StreamOutput::new(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(command: &[&str], timeout_ms: Option<u64>) -> ExecParams {
        ExecParams {
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: std::env::temp_dir(),
            timeout_ms,
            env: std::env::vars().collect(),
            with_escalated_permissions: None,
            justification: None,
        }
    }

    fn output_with_exit(exit_code: i32) -> ExecToolCallOutput {
        ExecToolCallOutput {
            exit_code,
            stdout: StreamOutput::new(String::new()),
            stderr: StreamOutput::new(String::new()),
            aggregated_output: StreamOutput::new(String::new()),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    #[test]
    fn denial_heuristic_only_applies_to_restricting_backends() {
        assert!(!is_likely_sandbox_denied(SandboxType::None, &output_with_exit(1)));
        assert!(is_likely_sandbox_denied(
            SandboxType::LinuxSeccomp,
            &output_with_exit(1)
        ));
        assert!(!is_likely_sandbox_denied(
            SandboxType::MacosSeatbelt,
            &output_with_exit(0)
        ));
        assert!(!is_likely_sandbox_denied(
            SandboxType::MacosSeatbelt,
            &output_with_exit(127)
        ));
        let mut timed_out = output_with_exit(TIMEOUT_EXIT_CODE);
        timed_out.timed_out = true;
        assert!(!is_likely_sandbox_denied(SandboxType::LinuxSeccomp, &timed_out));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_stdout_stderr_and_aggregate() -> anyhow::Result<()> {
        let output = process_exec_tool_call(
            params(&["/bin/sh", "-c", "echo out; echo err 1>&2"], None),
            SandboxType::None,
            &SandboxPolicy::NoRestriction,
            &std::env::temp_dir(),
            &None,
            None,
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!(0, output.exit_code);
        assert_eq!("out\n", output.stdout.text);
        assert_eq!("err\n", output.stderr.text);
        assert!(output.aggregated_output.text.contains("out\n"));
        assert!(output.aggregated_output.text.contains("err\n"));
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let start = Instant::now();
        let err = process_exec_tool_call(
            params(&["/bin/sh", "-c", "sleep 30"], Some(200)),
            SandboxType::None,
            &SandboxPolicy::NoRestriction,
            &std::env::temp_dir(),
            &None,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("command should time out");
        match err {
            CodexErr::Sandbox(SandboxErr::Timeout { output }) => {
                assert_eq!(TIMEOUT_EXIT_CODE, output.exit_code);
                assert!(output.timed_out);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_aborts_and_reaps() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = process_exec_tool_call(
            params(&["/bin/sh", "-c", "sleep 30"], Some(60_000)),
            SandboxType::None,
            &SandboxPolicy::NoRestriction,
            &std::env::temp_dir(),
            &None,
            None,
            &token,
        )
        .await
        .expect_err("command should be aborted");
        assert!(matches!(err, CodexErr::TurnAborted));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deltas_are_streamed_and_network_marker_is_set() -> anyhow::Result<()> {
        let (tx_event, rx_event) = async_channel::unbounded();
        let stream = StdoutStream {
            sub_id: "sub".to_string(),
            call_id: "call".to_string(),
            tx_event,
        };
        let output = process_exec_tool_call(
            params(
                &["/bin/sh", "-c", "printf %s \"$CODEX_SANDBOX_NETWORK_DISABLED\""],
                None,
            ),
            SandboxType::None,
            &SandboxPolicy::ReadOnly,
            &std::env::temp_dir(),
            &None,
            Some(stream),
            &CancellationToken::new(),
        )
        .await?;
        assert_eq!("1", output.stdout.text);

        let event = rx_event.recv().await?;
        match event.msg {
            EventMsg::ExecCommandOutputDelta(delta) => {
                assert_eq!("call", delta.call_id);
                assert_eq!(b"1".to_vec(), delta.chunk);
            }
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn linux_backend_without_helper_is_an_error() {
        let err = process_exec_tool_call(
            params(&["true"], None),
            SandboxType::LinuxSeccomp,
            &SandboxPolicy::ReadOnly,
            &std::env::temp_dir(),
            &None,
            None,
            &CancellationToken::new(),
        )
        .await
        .expect_err("helper is required");
        assert!(matches!(
            err,
            CodexErr::Sandbox(SandboxErr::MissingLinuxSandboxExecutable)
        ));
    }
}
