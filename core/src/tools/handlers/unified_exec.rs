use std::time::Instant;

use codex_protocol::protocol::AskForApproval;
use serde::Deserialize;

use crate::error::CodexErr;
use crate::exec::ExecParams;
use crate::exec_env::create_env;
use crate::executor::ExecError;
use crate::executor::ExecutionRequest;
use crate::executor::ExecutorConfig;
use crate::executor::select_sandbox;
use crate::function_tool::FunctionCallError;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::ExecCommandBeginEvent;
use crate::protocol::ExecCommandEndEvent;
use crate::protocol::ExecExitStatus;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::context::ToolPayload;
use crate::tools::handlers::parse_arguments;
use crate::unified_exec::UnifiedExecError;
use crate::unified_exec::UnifiedExecResult;
use crate::unified_exec::build_pty_launch;

#[derive(Debug, Deserialize)]
struct ExecCommandArgs {
    cmd: Vec<String>,
    #[serde(default)]
    yield_time_ms: Option<u64>,
    #[serde(default)]
    with_escalated_permissions: Option<bool>,
    #[serde(default)]
    justification: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteStdinArgs {
    session_id: u32,
    #[serde(default)]
    chars: String,
    #[serde(default)]
    yield_time_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CloseSessionArgs {
    session_id: u32,
}

fn function_arguments(payload: ToolPayload, tool: &str) -> Result<String, FunctionCallError> {
    match payload {
        ToolPayload::Function { arguments } => Ok(arguments),
        _ => Err(FunctionCallError::RespondToModel(format!(
            "{tool} handler received unsupported payload"
        ))),
    }
}

fn pty_error(err: UnifiedExecError) -> FunctionCallError {
    match err {
        UnifiedExecError::MissingLinuxSandboxExecutable => FunctionCallError::Fatal(err.to_string()),
        other => FunctionCallError::RespondToModel(format!("exec_command failed: {other}")),
    }
}

fn output_for(result: &UnifiedExecResult) -> ToolOutput {
    ToolOutput::Function {
        content: result.to_model_payload(),
        success: Some(true),
    }
}

/// Opens a PTY session. This is the only PTY operation that is classified
/// and, when needed, put to the user.
pub(crate) async fn handle_exec_command(
    invocation: ToolInvocation<'_>,
) -> Result<ToolOutput, FunctionCallError> {
    let ToolInvocation {
        session,
        turn,
        cancellation,
        sub_id,
        call_id,
        payload,
        ..
    } = invocation;
    let args: ExecCommandArgs = parse_arguments(&function_arguments(payload, "exec_command")?)?;
    if args.cmd.is_empty() {
        return Err(FunctionCallError::RespondToModel(
            "cmd must not be empty".to_string(),
        ));
    }
    if args.with_escalated_permissions.unwrap_or(false)
        && !matches!(turn.approval_policy, AskForApproval::OnRequest)
    {
        return Err(FunctionCallError::RespondToModel(format!(
            "approval policy is {policy}; reject command. You should not ask for escalated permissions if the approval policy is {policy}",
            policy = turn.approval_policy
        )));
    }

    let request = ExecutionRequest {
        approval_command: args.cmd.clone(),
        params: ExecParams {
            command: args.cmd.clone(),
            cwd: turn.cwd.clone(),
            timeout_ms: None,
            env: create_env(&turn.shell_environment_policy),
            with_escalated_permissions: args.with_escalated_permissions,
            justification: args.justification,
        },
        stdout_stream: None,
    };
    let config = ExecutorConfig::from_turn(turn);
    let approved = session.approved_fingerprints().await;
    let decision = select_sandbox(
        &request,
        &approved,
        &config,
        session,
        cancellation,
        sub_id,
        &call_id,
    )
    .await
    .map_err(|err| match err {
        ExecError::Function(err) => err,
        ExecError::Codex(CodexErr::TurnAborted) => {
            FunctionCallError::RespondToModel("command aborted".to_string())
        }
        ExecError::Codex(err) => FunctionCallError::RespondToModel(format!("execution error: {err}")),
    })?;

    let ExecutionRequest { params, .. } = request;
    let launch = build_pty_launch(
        decision.initial_sandbox,
        params.command,
        &turn.sandbox_policy,
        &turn.cwd,
        params.env,
        turn.codex_linux_sandbox_exe.as_ref(),
    )
    .map_err(pty_error)?;

    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::ExecCommandBegin(ExecCommandBeginEvent {
                call_id: call_id.clone(),
                command: args.cmd,
                cwd: turn.cwd.clone(),
            }),
        })
        .await;
    let start = Instant::now();
    let result = session
        .unified_exec_manager()
        .open_session(launch, args.yield_time_ms)
        .await;

    let (exit_code, status, output) = match &result {
        Ok(result) => (
            match result.status {
                ExecExitStatus::Exited { code } => code,
                _ => 0,
            },
            result.status,
            result.output.clone(),
        ),
        Err(err) => (-1, ExecExitStatus::Exited { code: -1 }, err.to_string()),
    };
    let formatted_output = match &result {
        Ok(result) => result.to_model_payload(),
        Err(_) => output.clone(),
    };
    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::ExecCommandEnd(ExecCommandEndEvent {
                call_id,
                stdout: output.clone(),
                stderr: String::new(),
                aggregated_output: output,
                exit_code,
                status,
                sandbox_denied: false,
                duration: start.elapsed(),
                formatted_output,
            }),
        })
        .await;

    result.map(|result| output_for(&result)).map_err(pty_error)
}

/// Writes to (or, with empty `chars`, only reads from) an open session.
pub(crate) async fn handle_write_stdin(
    invocation: ToolInvocation<'_>,
) -> Result<ToolOutput, FunctionCallError> {
    let args: WriteStdinArgs =
        parse_arguments(&function_arguments(invocation.payload, "write_stdin")?)?;
    let result = invocation
        .session
        .unified_exec_manager()
        .write_stdin(args.session_id, &args.chars, args.yield_time_ms)
        .await
        .map_err(|err| FunctionCallError::RespondToModel(format!("write_stdin failed: {err}")))?;
    Ok(output_for(&result))
}

pub(crate) async fn handle_close_session(
    invocation: ToolInvocation<'_>,
) -> Result<ToolOutput, FunctionCallError> {
    let args: CloseSessionArgs =
        parse_arguments(&function_arguments(invocation.payload, "close_session")?)?;
    let result = invocation
        .session
        .unified_exec_manager()
        .close_session(args.session_id)
        .await
        .map_err(|err| FunctionCallError::RespondToModel(format!("close_session failed: {err}")))?;
    Ok(output_for(&result))
}
