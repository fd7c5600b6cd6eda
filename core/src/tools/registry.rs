use std::collections::HashMap;

use codex_protocol::models::ResponseInputItem;
use tracing::debug;
use tracing::warn;

use crate::function_tool::FunctionCallError;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolPayload;
use crate::tools::handlers;

/// Closed set of handlers. External tools share one variant and are told
/// apart by the payload's server and tool names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolHandler {
    Shell,
    ApplyPatch,
    UpdatePlan,
    ExecCommand,
    WriteStdin,
    CloseSession,
    External,
}

impl ToolHandler {
    fn matches_kind(self, payload: &ToolPayload) -> bool {
        match self {
            ToolHandler::Shell => matches!(
                payload,
                ToolPayload::Function { .. } | ToolPayload::LocalShell { .. }
            ),
            ToolHandler::ApplyPatch => matches!(
                payload,
                ToolPayload::Function { .. } | ToolPayload::Custom { .. }
            ),
            ToolHandler::UpdatePlan
            | ToolHandler::ExecCommand
            | ToolHandler::WriteStdin
            | ToolHandler::CloseSession => matches!(payload, ToolPayload::Function { .. }),
            ToolHandler::External => matches!(payload, ToolPayload::Mcp { .. }),
        }
    }
}

/// Lookup table from the name the model uses to the handler serving it.
#[derive(Clone, Debug, Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, ToolHandler>,
}

impl ToolRegistry {
    pub fn register(&mut self, name: impl Into<String>, handler: ToolHandler) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            warn!("overwriting handler for tool {name}");
        }
    }

    pub fn handler(&self, name: &str) -> Option<ToolHandler> {
        self.handlers.get(name).copied()
    }

    pub(crate) async fn dispatch(
        &self,
        invocation: ToolInvocation<'_>,
    ) -> Result<ResponseInputItem, FunctionCallError> {
        let tool_name = invocation.tool_name.clone();
        let handler = self.handler(&tool_name).ok_or_else(|| {
            FunctionCallError::RespondToModel(format!("unsupported call: {tool_name}"))
        })?;

        if !handler.matches_kind(&invocation.payload) {
            return Err(FunctionCallError::RespondToModel(format!(
                "tool {tool_name} invoked with incompatible payload"
            )));
        }

        let call_id = invocation.call_id.clone();
        let payload = invocation.payload.clone();
        debug!(%tool_name, %call_id, payload = %payload.log_payload(), "dispatching tool call");

        let output = match handler {
            ToolHandler::Shell => handlers::shell::handle(invocation).await,
            ToolHandler::ApplyPatch => handlers::apply_patch::handle(invocation).await,
            ToolHandler::UpdatePlan => handlers::plan::handle(invocation).await,
            ToolHandler::ExecCommand => handlers::unified_exec::handle_exec_command(invocation).await,
            ToolHandler::WriteStdin => handlers::unified_exec::handle_write_stdin(invocation).await,
            ToolHandler::CloseSession => {
                handlers::unified_exec::handle_close_session(invocation).await
            }
            ToolHandler::External => handlers::mcp::handle(invocation).await,
        }?;

        debug!(%tool_name, %call_id, success = output.success_for_logging(), "tool call finished");
        Ok(output.into_response(&call_id, &payload))
    }
}
