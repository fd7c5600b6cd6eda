//! Runs one shell command for a tool call: gate it, pick a sandbox, spawn
//! it, and offer an unsandboxed retry when a sandboxed run looks denied.

mod cache;
mod sandbox;

use std::path::PathBuf;
use std::time::Duration;

use codex_protocol::protocol::AskForApproval;
use codex_protocol::protocol::ReviewDecision;
use codex_protocol::protocol::SandboxPolicy;
use codex_protocol::protocol::TurnAbortReason;
use tracing::debug;
use tracing::warn;

pub(crate) use cache::ApprovalCache;
pub(crate) use sandbox::select_sandbox;

use crate::approval_fingerprint::command_fingerprint;
use crate::codex::Session;
use crate::error::CodexErr;
use crate::error::SandboxErr;
use crate::exec::ExecParams;
use crate::exec::ExecToolCallOutput;
use crate::exec::SandboxType;
use crate::exec::StdoutStream;
use crate::exec::StreamOutput;
use crate::exec::process_exec_tool_call;
use crate::function_tool::FunctionCallError;
use crate::state::TurnCancellation;
use crate::state::TurnContext;

const RETRY_WITHOUT_SANDBOX_REASON: &str = "command failed; retry without sandbox?";

/// Sandbox settings of the turn the executor serves.
#[derive(Clone, Debug)]
pub(crate) struct ExecutorConfig {
    pub(crate) approval_policy: AskForApproval,
    pub(crate) sandbox_policy: SandboxPolicy,
    pub(crate) sandbox_cwd: PathBuf,
    pub(crate) codex_linux_sandbox_exe: Option<PathBuf>,
}

impl ExecutorConfig {
    pub(crate) fn from_turn(turn: &TurnContext) -> Self {
        Self {
            approval_policy: turn.approval_policy,
            sandbox_policy: turn.sandbox_policy.clone(),
            sandbox_cwd: turn.cwd.clone(),
            codex_linux_sandbox_exe: turn.codex_linux_sandbox_exe.clone(),
        }
    }
}

pub(crate) struct ExecutionRequest {
    pub(crate) params: ExecParams,
    /// Command shown to the user and fingerprinted for the approval cache.
    pub(crate) approval_command: Vec<String>,
    pub(crate) stdout_stream: Option<StdoutStream>,
}

#[derive(Debug)]
pub(crate) enum ExecError {
    /// Reported back to the model, or fatal for the turn.
    Function(FunctionCallError),
    Codex(CodexErr),
}

impl ExecError {
    pub(crate) fn rejection(message: impl Into<String>) -> Self {
        ExecError::Function(FunctionCallError::RespondToModel(message.into()))
    }
}

impl From<CodexErr> for ExecError {
    fn from(err: CodexErr) -> Self {
        ExecError::Codex(err)
    }
}

pub(crate) struct Executor {
    config: ExecutorConfig,
}

impl Executor {
    pub(crate) fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Runs the request with `ExecCommandBegin`/`ExecCommandEnd` around every
    /// spawn, including the retry.
    pub(crate) async fn run(
        &self,
        request: ExecutionRequest,
        session: &Session,
        cancellation: &TurnCancellation,
        sub_id: &str,
        call_id: &str,
    ) -> Result<ExecToolCallOutput, ExecError> {
        let approved = session.approved_fingerprints().await;
        let decision = select_sandbox(
            &request,
            &approved,
            &self.config,
            session,
            cancellation,
            sub_id,
            call_id,
        )
        .await?;

        let first = self
            .spawn_with_events(&request, decision.initial_sandbox, session, cancellation, sub_id, call_id)
            .await;

        let output = match first {
            Err(CodexErr::Sandbox(SandboxErr::Denied { output })) if decision.escalate_on_failure => {
                debug!(exit_code = output.exit_code, "sandboxed command looks denied; asking to retry");
                output
            }
            other => return other.map_err(ExecError::Codex),
        };

        let decision = session
            .request_command_approval(
                sub_id,
                call_id,
                request.approval_command.clone(),
                request.params.cwd.clone(),
                Some(RETRY_WITHOUT_SANDBOX_REASON.to_string()),
                cancellation,
            )
            .await;
        match decision {
            ReviewDecision::Approved => {
                session
                    .remember_approval(command_fingerprint(&request.approval_command))
                    .await;
                self.spawn_with_events(&request, SandboxType::None, session, cancellation, sub_id, call_id)
                    .await
                    .map_err(ExecError::Codex)
            }
            ReviewDecision::Denied => Err(ExecError::Codex(CodexErr::Sandbox(SandboxErr::Denied {
                output,
            }))),
            ReviewDecision::Abort => {
                cancellation.abort(TurnAbortReason::Interrupted);
                Err(ExecError::Codex(CodexErr::TurnAborted))
            }
        }
    }

    async fn spawn_with_events(
        &self,
        request: &ExecutionRequest,
        sandbox_type: SandboxType,
        session: &Session,
        cancellation: &TurnCancellation,
        sub_id: &str,
        call_id: &str,
    ) -> crate::error::Result<ExecToolCallOutput> {
        session
            .on_exec_command_begin(sub_id, call_id, &request.approval_command, &request.params.cwd)
            .await;

        let result = process_exec_tool_call(
            request.params.clone(),
            sandbox_type,
            &self.config.sandbox_policy,
            &self.config.sandbox_cwd,
            &self.config.codex_linux_sandbox_exe,
            request.stdout_stream.clone(),
            cancellation.token(),
        )
        .await;

        match &result {
            Ok(output) => session.on_exec_command_end(sub_id, call_id, output, false).await,
            Err(CodexErr::Sandbox(SandboxErr::Timeout { output })) => {
                session.on_exec_command_end(sub_id, call_id, output, false).await
            }
            Err(CodexErr::Sandbox(SandboxErr::Denied { output })) => {
                session.on_exec_command_end(sub_id, call_id, output, true).await
            }
            Err(err) => {
                warn!(%call_id, "command did not produce an exit status: {err}");
                let output = output_for_error(err);
                session.on_exec_command_end(sub_id, call_id, &output, false).await
            }
        }
        result
    }
}

/// Stand-in output for an `ExecCommandEnd` whose command never produced an
/// exit status.
fn output_for_error(err: &CodexErr) -> ExecToolCallOutput {
    let message = match err {
        CodexErr::TurnAborted => "command aborted".to_string(),
        other => other.to_string(),
    };
    ExecToolCallOutput {
        exit_code: -1,
        stdout: StreamOutput::new(String::new()),
        stderr: StreamOutput::new(message.clone()),
        aggregated_output: StreamOutput::new(message),
        duration: Duration::ZERO,
        timed_out: false,
    }
}
