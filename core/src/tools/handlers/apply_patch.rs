use std::collections::HashMap;

use crate::exec::ExecParams;
use crate::function_tool::FunctionCallError;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::context::ToolPayload;
use crate::tools::handle_container_exec_with_params;
use crate::tools::handlers::parse_arguments;
use crate::tools::spec::ApplyPatchToolArgs;

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

    let patch_input = match payload {
        ToolPayload::Function { arguments } => parse_arguments::<ApplyPatchToolArgs>(&arguments)?.input,
        ToolPayload::Custom { input } => input,
        _ => {
            return Err(FunctionCallError::RespondToModel(
                "apply_patch handler received unsupported payload".to_string(),
            ));
        }
    };

    // Routed through the shell path so a patch given to either tool takes
    // the same verification and approval steps.
    let exec_params = ExecParams {
        command: vec!["apply_patch".to_string(), patch_input],
        cwd: turn.cwd.clone(),
        timeout_ms: None,
        env: HashMap::new(),
        with_escalated_permissions: None,
        justification: None,
    };

    let content = handle_container_exec_with_params(
        exec_params,
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
