use std::time::Instant;

use tracing::debug;

use crate::function_tool::FunctionCallError;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::McpInvocation;
use crate::protocol::McpToolCallBeginEvent;
use crate::protocol::McpToolCallEndEvent;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolOutput;
use crate::tools::context::ToolPayload;

/// Proxies a call to an external tool server. Whatever the server returns,
/// including an error or a timeout, is handed back to the model as the
/// call's output.
pub(crate) async fn handle(invocation: ToolInvocation<'_>) -> Result<ToolOutput, FunctionCallError> {
    let ToolInvocation {
        session,
        cancellation,
        sub_id,
        call_id,
        tool_name,
        payload,
        ..
    } = invocation;

    let ToolPayload::Mcp {
        server,
        tool,
        raw_arguments,
    } = payload
    else {
        return Err(FunctionCallError::RespondToModel(
            "mcp handler received unsupported payload".to_string(),
        ));
    };

    // Hash-shortened names cannot be split textually.
    let (server, tool) = session
        .mcp_connection_manager()
        .parse_tool_name(&tool_name)
        .unwrap_or((server, tool));

    let arguments = if raw_arguments.trim().is_empty() {
        None
    } else {
        match serde_json::from_str::<serde_json::Value>(&raw_arguments) {
            Ok(value) => Some(value),
            Err(e) => {
                return Err(FunctionCallError::RespondToModel(format!(
                    "err: {e}"
                )));
            }
        }
    };

    let invocation = McpInvocation {
        server: server.clone(),
        tool: tool.clone(),
        arguments: arguments.clone(),
    };
    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::McpToolCallBegin(McpToolCallBeginEvent {
                call_id: call_id.clone(),
                invocation: invocation.clone(),
            }),
        })
        .await;

    let start = Instant::now();
    // The server cannot be told to stop; an aborted turn just stops waiting.
    let result = tokio::select! {
        result = session.mcp_connection_manager().call_tool(&server, &tool, arguments) => {
            result.map_err(|e| format!("tool call error: {e:#}"))
        }
        _ = cancellation.cancelled() => Err("tool call aborted".to_string()),
    };
    debug!(%server, %tool, ok = result.is_ok(), "external tool call finished");

    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::McpToolCallEnd(McpToolCallEndEvent {
                call_id,
                invocation,
                duration: start.elapsed(),
                result: result.clone(),
            }),
        })
        .await;

    Ok(ToolOutput::Mcp { result })
}
