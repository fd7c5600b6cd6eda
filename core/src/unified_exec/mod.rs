//! Long-lived commands running in a pseudo-terminal.
//!
//! Unlike one-shot shell calls, these processes outlive the tool call that
//! started them. They are kept in a registry indexed by a numeric session id
//! and driven through explicit open / write / close operations. Only opening
//! goes through the approval pipeline; later writes address a process that
//! was already allowed to run.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use portable_pty::ChildKiller;
use portable_pty::CommandBuilder;
use portable_pty::PtySize;
use portable_pty::native_pty_system;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::exec::SandboxType;
use crate::landlock::create_linux_sandbox_command_args;
use crate::protocol::ExecExitStatus;
use crate::protocol::SandboxPolicy;
use crate::seatbelt::MACOS_PATH_TO_SEATBELT_EXECUTABLE;
use crate::seatbelt::create_seatbelt_command_args;
use crate::spawn::CODEX_SANDBOX_ENV_VAR;
use crate::spawn::CODEX_SANDBOX_NETWORK_DISABLED_ENV_VAR;
use crate::truncate::truncate_for_model;

mod errors;

pub(crate) use errors::UnifiedExecError;

const DEFAULT_YIELD_MS: u64 = 1_000;
const MAX_YIELD_MS: u64 = 60_000;
const UNIFIED_EXEC_OUTPUT_MAX_BYTES: usize = 128 * 1024; // 128 KiB

/// Program, arguments and environment for one PTY process, already wrapped
/// in the sandbox chosen for it.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PtyLaunch {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
}

pub(crate) fn build_pty_launch(
    sandbox: SandboxType,
    command: Vec<String>,
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
    mut env: HashMap<String, String>,
    codex_linux_sandbox_exe: Option<&PathBuf>,
) -> Result<PtyLaunch, UnifiedExecError> {
    if command.is_empty() {
        return Err(UnifiedExecError::MissingCommandLine);
    }
    if !sandbox_policy.has_full_network_access() {
        env.insert(
            CODEX_SANDBOX_NETWORK_DISABLED_ENV_VAR.to_string(),
            "1".to_string(),
        );
    }

    let (program, args) = match sandbox {
        SandboxType::None => {
            let mut command = command.into_iter();
            let program = command.next().unwrap_or_default();
            (program, command.collect())
        }
        SandboxType::MacosSeatbelt => {
            env.insert(CODEX_SANDBOX_ENV_VAR.to_string(), "seatbelt".to_string());
            (
                MACOS_PATH_TO_SEATBELT_EXECUTABLE.to_string(),
                create_seatbelt_command_args(command, sandbox_policy, cwd),
            )
        }
        SandboxType::LinuxSeccomp => {
            let exe = codex_linux_sandbox_exe
                .ok_or(UnifiedExecError::MissingLinuxSandboxExecutable)?;
            let args = create_linux_sandbox_command_args(command, sandbox_policy, cwd)
                .map_err(UnifiedExecError::create_session)?;
            (exe.to_string_lossy().to_string(), args)
        }
    };

    Ok(PtyLaunch {
        program,
        args,
        cwd: cwd.to_path_buf(),
        env,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UnifiedExecResult {
    pub output: String,
    /// `Ongoing` while the process keeps running, `Exited` once it is gone
    /// and removed from the registry.
    pub status: ExecExitStatus,
    /// Set when the requested wait exceeded the maximum and was clamped.
    pub yield_warning: Option<String>,
}

impl UnifiedExecResult {
    pub(crate) fn to_model_payload(&self) -> String {
        #[derive(serde::Serialize)]
        struct Payload<'a> {
            #[serde(skip_serializing_if = "Option::is_none")]
            session_id: Option<u32>,
            #[serde(skip_serializing_if = "Option::is_none")]
            exit_code: Option<i32>,
            output: &'a str,
        }
        let (session_id, exit_code) = match self.status {
            ExecExitStatus::Ongoing { session_id } => (Some(session_id), None),
            ExecExitStatus::Exited { code } => (None, Some(code)),
            ExecExitStatus::TimedOut => (None, None),
        };
        let output = match &self.yield_warning {
            Some(warning) => format!("{warning}{}", truncate_for_model(&self.output)),
            None => truncate_for_model(&self.output),
        };
        let payload = Payload {
            session_id,
            exit_code,
            output: &output,
        };
        match serde_json::to_string(&payload) {
            Ok(json) => json,
            Err(_) => output,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct UnifiedExecSessionManager {
    next_session_id: AtomicU32,
    sessions: Mutex<HashMap<u32, ManagedSession>>,
}

#[derive(Debug, Default)]
struct OutputBufferState {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    /// The PTY reached end of file; nothing more will be appended.
    closed: bool,
}

impl OutputBufferState {
    fn push_chunk(&mut self, chunk: Vec<u8>) {
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        self.chunks.push_back(chunk);

        let mut excess = self
            .total_bytes
            .saturating_sub(UNIFIED_EXEC_OUTPUT_MAX_BYTES);

        while excess > 0 {
            match self.chunks.front_mut() {
                Some(front) if excess >= front.len() => {
                    excess -= front.len();
                    self.total_bytes = self.total_bytes.saturating_sub(front.len());
                    self.chunks.pop_front();
                }
                Some(front) => {
                    front.drain(..excess);
                    self.total_bytes = self.total_bytes.saturating_sub(excess);
                    break;
                }
                None => break,
            }
        }
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.total_bytes = 0;
        self.chunks.drain(..).collect()
    }
}

#[derive(Debug, Default)]
struct SharedOutput {
    buffer: StdMutex<OutputBufferState>,
    notify: Notify,
}

/// One PTY process. Dropping it kills the process.
struct ManagedSession {
    writer_tx: mpsc::Sender<Vec<u8>>,
    output: Arc<SharedOutput>,
    exit_code: Arc<OnceLock<i32>>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    writer_task: JoinHandle<()>,
}

impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSession")
            .field("exit_code", &self.exit_code.get())
            .finish_non_exhaustive()
    }
}

impl ManagedSession {
    fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }
}

impl Drop for ManagedSession {
    fn drop(&mut self) {
        if self.exit_code().is_none()
            && let Err(err) = self.killer.kill()
        {
            debug!("failed to kill pty process: {err}");
        }
        self.writer_task.abort();
    }
}

fn clamp_yield(requested: Option<u64>) -> (Duration, Option<String>) {
    match requested {
        Some(requested) if requested > MAX_YIELD_MS => (
            Duration::from_millis(MAX_YIELD_MS),
            Some(format!(
                "Warning: requested yield time {requested}ms exceeds maximum of {MAX_YIELD_MS}ms; clamping to {MAX_YIELD_MS}ms.\n"
            )),
        ),
        Some(requested) => (Duration::from_millis(requested), None),
        None => (Duration::from_millis(DEFAULT_YIELD_MS), None),
    }
}

impl UnifiedExecSessionManager {
    /// Starts `launch` in a new PTY and waits up to the yield time for its
    /// first output. The session stays registered while the process runs.
    pub(crate) async fn open_session(
        &self,
        launch: PtyLaunch,
        yield_time_ms: Option<u64>,
    ) -> Result<UnifiedExecResult, UnifiedExecError> {
        let (yield_time, yield_warning) = clamp_yield(yield_time_ms);
        let session = spawn_pty_session(launch)?;
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let output = Arc::clone(&session.output);
        let exit_code = Arc::clone(&session.exit_code);
        self.sessions.lock().await.insert(session_id, session);
        debug!(session_id, "opened pty session");

        let collected = collect_output(&output, yield_time).await;
        let status = self.settle(session_id, &exit_code).await;
        Ok(UnifiedExecResult {
            output: collected,
            status,
            yield_warning,
        })
    }

    /// Writes `chars` to the session (an empty string only reads) and returns
    /// the output produced within the yield time.
    pub(crate) async fn write_stdin(
        &self,
        session_id: u32,
        chars: &str,
        yield_time_ms: Option<u64>,
    ) -> Result<UnifiedExecResult, UnifiedExecError> {
        let (yield_time, yield_warning) = clamp_yield(yield_time_ms);
        let (writer_tx, output, exit_code) = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(&session_id)
                .ok_or(UnifiedExecError::UnknownSessionId { session_id })?;
            (
                session.writer_tx.clone(),
                Arc::clone(&session.output),
                Arc::clone(&session.exit_code),
            )
        };

        if !chars.is_empty() && writer_tx.send(chars.as_bytes().to_vec()).await.is_err() {
            return Err(UnifiedExecError::WriteToStdin);
        }

        let collected = collect_output(&output, yield_time).await;
        let status = self.settle(session_id, &exit_code).await;
        Ok(UnifiedExecResult {
            output: collected,
            status,
            yield_warning,
        })
    }

    /// Kills the session's process and returns whatever output was still
    /// buffered.
    pub(crate) async fn close_session(
        &self,
        session_id: u32,
    ) -> Result<UnifiedExecResult, UnifiedExecError> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(&session_id)
            .ok_or(UnifiedExecError::UnknownSessionId { session_id })?;
        let remaining = {
            let mut guard = match session.output.buffer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.drain().concat()
        };
        let code = session.exit_code().unwrap_or(-1);
        drop(session);
        debug!(session_id, "closed pty session");
        Ok(UnifiedExecResult {
            output: String::from_utf8_lossy(&remaining).into_owned(),
            status: ExecExitStatus::Exited { code },
            yield_warning: None,
        })
    }

    /// Drops exited sessions from the registry and reports the status the
    /// caller should see.
    async fn settle(&self, session_id: u32, exit_code: &OnceLock<i32>) -> ExecExitStatus {
        match exit_code.get() {
            Some(code) => {
                self.sessions.lock().await.remove(&session_id);
                ExecExitStatus::Exited { code: *code }
            }
            None => ExecExitStatus::Ongoing { session_id },
        }
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

/// Drains output until the deadline passes or the PTY reaches end of file.
async fn collect_output(output: &SharedOutput, yield_time: Duration) -> String {
    let mut collected: Vec<u8> = Vec::with_capacity(4096);
    let deadline = Instant::now() + yield_time;

    loop {
        let notified = output.notify.notified();
        tokio::pin!(notified);
        // Register interest before looking at the buffer so a push between
        // the check and the wait is not missed.
        notified.as_mut().enable();

        let (drained, closed) = {
            let mut guard = match output.buffer.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (guard.drain(), guard.closed)
        };

        if !drained.is_empty() {
            for chunk in drained {
                collected.extend_from_slice(&chunk);
            }
            if Instant::now() >= deadline {
                break;
            }
            continue;
        }
        if closed {
            break;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining == Duration::ZERO {
            break;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(remaining) => break,
        }
    }

    String::from_utf8_lossy(&collected).into_owned()
}

fn spawn_pty_session(launch: PtyLaunch) -> Result<ManagedSession, UnifiedExecError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(UnifiedExecError::create_session)?;

    let mut command_builder = CommandBuilder::new(&launch.program);
    command_builder.args(&launch.args);
    command_builder.cwd(&launch.cwd);
    command_builder.env_clear();
    for (key, value) in &launch.env {
        command_builder.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(command_builder)
        .map_err(UnifiedExecError::create_session)?;
    // Keeping the slave open would stop the reader from ever seeing EOF.
    drop(pair.slave);
    let killer = child.clone_killer();

    let output = Arc::new(SharedOutput::default());
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(UnifiedExecError::create_session)?;
    let reader_output = Arc::clone(&output);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Ok(mut guard) = reader_output.buffer.lock() {
                        guard.push_chunk(buf[..n].to_vec());
                    }
                    reader_output.notify.notify_waiters();
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                // Linux reports EIO once the child side is gone.
                Err(_) => break,
            }
        }
        if let Ok(mut guard) = reader_output.buffer.lock() {
            guard.closed = true;
        }
        reader_output.notify.notify_waiters();
    });

    let writer = pair
        .master
        .take_writer()
        .map_err(UnifiedExecError::create_session)?;
    let writer = Arc::new(StdMutex::new(writer));
    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(128);
    // The master must stay alive for as long as the session can be written.
    let master = pair.master;
    let writer_task = tokio::spawn(async move {
        let _master = master;
        while let Some(bytes) = writer_rx.recv().await {
            let writer = Arc::clone(&writer);
            let written = tokio::task::spawn_blocking(move || match writer.lock() {
                Ok(mut guard) => guard.write_all(&bytes).and_then(|()| guard.flush()),
                Err(_) => Err(std::io::Error::other("pty writer poisoned")),
            })
            .await;
            if !matches!(written, Ok(Ok(()))) {
                warn!("failed to write to pty");
            }
        }
    });

    let exit_code = Arc::new(OnceLock::new());
    let wait_exit_code = Arc::clone(&exit_code);
    let wait_output = Arc::clone(&output);
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
            Err(_) => -1,
        };
        let _ = wait_exit_code.set(code);
        wait_output.notify.notify_waiters();
    });

    Ok(ManagedSession {
        writer_tx,
        output,
        exit_code,
        killer,
        writer_task,
    })
}
