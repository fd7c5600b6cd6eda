use codex_protocol::models::ShellToolCallParams;

use crate::exec::ExecParams;
use crate::exec_env::create_env;
use crate::function_tool::FunctionCallError;
use crate::state::TurnContext;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::context::ToolPayload;
use crate::tools::handle_container_exec_with_params;
use crate::tools::handlers::parse_arguments;

fn to_exec_params(params: ShellToolCallParams, turn: &TurnContext) -> ExecParams {
    ExecParams {
        command: params.command,
        cwd: turn.resolve_path(params.workdir),
        timeout_ms: params.timeout_ms.or(Some(turn.default_exec_timeout_ms)),
        env: create_env(&turn.shell_environment_policy),
        with_escalated_permissions: params.with_escalated_permissions,
        justification: params.justification,
    }
}

pub(crate) async fn handle(invocation: ToolInvocation<'_>) -> Result<ToolOutput, FunctionCallError> {
    let ToolInvocation {
        session,
        turn,
        tracker,
        cancellation,
        sub_id,
        call_id,
        payload,
        ..
    } = invocation;

    let params = match payload {
        ToolPayload::Function { arguments } => {
            parse_arguments::<ShellToolCallParams>(&arguments)?
        }
        ToolPayload::LocalShell { params } => params,
        _ => {
            return Err(FunctionCallError::RespondToModel(
                "shell handler received unsupported payload".to_string(),
            ));
        }
    };
    if params.command.is_empty() {
        return Err(FunctionCallError::RespondToModel(
            "command must not be empty".to_string(),
        ));
    }

    let content = handle_container_exec_with_params(
        to_exec_params(params, turn),
        session,
        turn,
        tracker,
        cancellation,
        sub_id,
        &call_id,
    )
    .await?;

    Ok(ToolOutput::Function {
        content,
        success: Some(true),
    })
}
