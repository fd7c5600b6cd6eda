pub mod context;
pub(crate) mod handlers;
pub mod registry;
pub mod router;
pub mod spec;

use codex_apply_patch::MaybeApplyPatchVerified;
use codex_apply_patch::maybe_parse_apply_patch_verified;
use codex_protocol::protocol::AskForApproval;
pub use router::ToolRouter;
use tracing::trace;

use crate::apply_patch;
use crate::codex::Session;
use crate::error::CodexErr;
use crate::error::SandboxErr;
use crate::exec::ExecParams;
use crate::exec::StdoutStream;
use crate::executor::ExecError;
use crate::executor::ExecutionRequest;
use crate::executor::Executor;
use crate::executor::ExecutorConfig;
use crate::function_tool::FunctionCallError;
use crate::state::TurnCancellation;
use crate::state::TurnContext;
use crate::truncate::format_exec_output_for_model;
use crate::turn_diff_tracker::TurnDiffTracker;

/// Runs a shell-family call end to end. Commands that are really an
/// `apply_patch` invocation are applied in-process instead of spawned.
pub(crate) async fn handle_container_exec_with_params(
    params: ExecParams,
    session: &Session,
    turn: &TurnContext,
    tracker: &mut TurnDiffTracker,
    cancellation: &TurnCancellation,
    sub_id: &str,
    call_id: &str,
) -> Result<String, FunctionCallError> {
    if params.with_escalated_permissions.unwrap_or(false)
        && !matches!(turn.approval_policy, AskForApproval::OnRequest)
    {
        return Err(FunctionCallError::RespondToModel(format!(
            "approval policy is {policy}; reject command. You should not ask for escalated permissions if the approval policy is {policy}",
            policy = turn.approval_policy
        )));
    }

    match maybe_parse_apply_patch_verified(&params.command, &params.cwd) {
        MaybeApplyPatchVerified::Body(action) => {
            return apply_patch::apply_patch(
                session,
                turn,
                tracker,
                cancellation,
                sub_id,
                call_id,
                action,
            )
            .await;
        }
        MaybeApplyPatchVerified::CorrectnessError(parse_error) => {
            // It looks like an invocation of `apply_patch`, but it would not
            // apply cleanly. Return to model for resample.
            return Err(FunctionCallError::RespondToModel(format!(
                "apply_patch verification failed: {parse_error}"
            )));
        }
        MaybeApplyPatchVerified::ShellParseError(error) => {
            trace!("Failed to parse shell command, {error:?}");
        }
        MaybeApplyPatchVerified::NotApplyPatch => {}
    }

    let request = ExecutionRequest {
        approval_command: params.command.clone(),
        params,
        stdout_stream: Some(StdoutStream {
            sub_id: sub_id.to_string(),
            call_id: call_id.to_string(),
            tx_event: session.tx_event(),
        }),
    };
    let executor = Executor::new(ExecutorConfig::from_turn(turn));
    let result = executor
        .run(request, session, cancellation, sub_id, call_id)
        .await;
    exec_result_to_model(result)
}

fn exec_result_to_model(
    result: Result<crate::exec::ExecToolCallOutput, ExecError>,
) -> Result<String, FunctionCallError> {
    match result {
        Ok(output) => {
            let content = format_exec_output_for_model(&output);
            if output.exit_code == 0 {
                Ok(content)
            } else {
                Err(FunctionCallError::RespondToModel(content))
            }
        }
        Err(ExecError::Function(err)) => Err(err),
        Err(ExecError::Codex(CodexErr::Sandbox(
            SandboxErr::Timeout { output } | SandboxErr::Denied { output },
        ))) => Err(FunctionCallError::RespondToModel(
            format_exec_output_for_model(&output),
        )),
        // No backend to confine the command with: never fall back to running
        // it unconfined.
        Err(ExecError::Codex(
            err @ CodexErr::Sandbox(
                SandboxErr::MissingLinuxSandboxExecutable | SandboxErr::UnsupportedPlatform,
            ),
        )) => Err(FunctionCallError::Fatal(err.to_string())),
        Err(ExecError::Codex(CodexErr::TurnAborted)) => Err(FunctionCallError::RespondToModel(
            "command aborted".to_string(),
        )),
        Err(ExecError::Codex(err)) => Err(FunctionCallError::RespondToModel(format!(
            "execution error: {err}"
        ))),
    }
}
