use std::collections::HashMap;

use codex_protocol::mcp::Tool;
use codex_protocol::models::FunctionCallOutputPayload;
use codex_protocol::models::LocalShellAction;
use codex_protocol::models::ResponseInputItem;
use codex_protocol::models::ResponseItem;
use codex_protocol::models::ShellToolCallParams;

use crate::codex::Session;
use crate::function_tool::FunctionCallError;
use crate::mcp_connection_manager::parse_tool_name;
use crate::protocol::ListedTool;
use crate::state::TurnCancellation;
use crate::state::TurnContext;
use crate::tools::context::ToolInvocation;
use crate::tools::context::ToolPayload;
use crate::tools::registry::ToolHandler;
use crate::tools::registry::ToolRegistry;
use crate::tools::spec::ToolSpec;
use crate::tools::spec::ToolsConfig;
use crate::tools::spec::build_specs;
use crate::turn_diff_tracker::TurnDiffTracker;

#[derive(Clone, Debug)]
pub struct ToolCall {
    pub tool_name: String,
    pub call_id: String,
    pub payload: ToolPayload,
}

/// Tools offered to one turn and the handlers behind them.
#[derive(Clone, Debug)]
pub struct ToolRouter {
    registry: ToolRegistry,
    specs: Vec<ToolSpec>,
}

impl ToolRouter {
    pub fn from_config(config: &ToolsConfig, mcp_tools: Option<&HashMap<String, Tool>>) -> Self {
        let specs = build_specs(config, mcp_tools);
        let mut registry = ToolRegistry::default();
        for spec in &specs {
            let handler = match spec.name() {
                "shell" => ToolHandler::Shell,
                "apply_patch" => ToolHandler::ApplyPatch,
                "update_plan" => ToolHandler::UpdatePlan,
                "exec_command" => ToolHandler::ExecCommand,
                "write_stdin" => ToolHandler::WriteStdin,
                "close_session" => ToolHandler::CloseSession,
                _ => ToolHandler::External,
            };
            registry.register(spec.name(), handler);
        }
        if config.shell {
            // Models with a native local shell item address the same handler.
            registry.register("local_shell", ToolHandler::Shell);
        }
        Self { registry, specs }
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn listed_tools(&self) -> Vec<ListedTool> {
        self.specs
            .iter()
            .map(|spec| ListedTool {
                name: spec.name().to_string(),
                description: spec.description().to_string(),
                server: match self.registry.handler(spec.name()) {
                    Some(ToolHandler::External) => {
                        parse_tool_name(spec.name()).map(|(server, _)| server)
                    }
                    _ => None,
                },
            })
            .collect()
    }

    /// Turns a model output item into a tool call. Items that are not tool
    /// calls yield `None`.
    pub fn build_tool_call(&self, item: ResponseItem) -> Result<Option<ToolCall>, FunctionCallError> {
        match item {
            ResponseItem::FunctionCall {
                name,
                arguments,
                call_id,
                ..
            } => {
                let payload = match self.registry.handler(&name) {
                    Some(ToolHandler::External) => match parse_tool_name(&name) {
                        Some((server, tool)) => ToolPayload::Mcp {
                            server,
                            tool,
                            raw_arguments: arguments,
                        },
                        None => ToolPayload::Function { arguments },
                    },
                    _ => ToolPayload::Function { arguments },
                };
                Ok(Some(ToolCall {
                    tool_name: name,
                    call_id,
                    payload,
                }))
            }
            ResponseItem::CustomToolCall {
                name,
                input,
                call_id,
                ..
            } => Ok(Some(ToolCall {
                tool_name: name,
                call_id,
                payload: ToolPayload::Custom { input },
            })),
            ResponseItem::LocalShellCall {
                id,
                call_id,
                action,
                ..
            } => {
                let call_id = call_id
                    .or(id)
                    .ok_or(FunctionCallError::MissingLocalShellCallId)?;

                match action {
                    LocalShellAction::Exec(exec) => {
                        let params = ShellToolCallParams {
                            command: exec.command,
                            workdir: exec.working_directory,
                            timeout_ms: exec.timeout_ms,
                            with_escalated_permissions: None,
                            justification: None,
                        };
                        Ok(Some(ToolCall {
                            tool_name: "local_shell".to_string(),
                            call_id,
                            payload: ToolPayload::LocalShell { params },
                        }))
                    }
                }
            }
            _ => Ok(None),
        }
    }

    /// Produces exactly one output item for the call. Only `Fatal` errors
    /// escape; everything else becomes a failed output the model can read.
    pub(crate) async fn dispatch_tool_call(
        &self,
        session: &Session,
        turn: &TurnContext,
        tracker: &mut TurnDiffTracker,
        cancellation: &TurnCancellation,
        sub_id: &str,
        call: ToolCall,
    ) -> Result<ResponseInputItem, FunctionCallError> {
        let ToolCall {
            tool_name,
            call_id,
            payload,
        } = call;
        let payload_outputs_custom = matches!(payload, ToolPayload::Custom { .. });
        let failure_call_id = call_id.clone();

        let invocation = ToolInvocation {
            session,
            turn,
            tracker,
            cancellation,
            sub_id,
            call_id,
            tool_name,
            payload,
        };

        match self.registry.dispatch(invocation).await {
            Ok(response) => Ok(response),
            Err(FunctionCallError::Fatal(message)) => Err(FunctionCallError::Fatal(message)),
            Err(err) => Ok(Self::failure_response(
                failure_call_id,
                payload_outputs_custom,
                err,
            )),
        }
    }

    pub(crate) fn failure_response(
        call_id: String,
        payload_outputs_custom: bool,
        err: FunctionCallError,
    ) -> ResponseInputItem {
        let message = err.to_string();
        if payload_outputs_custom {
            ResponseInputItem::CustomToolCallOutput {
                call_id,
                output: message,
            }
        } else {
            ResponseInputItem::FunctionCallOutput {
                call_id,
                output: FunctionCallOutputPayload::failure(message),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codex_protocol::config_types::ToolToggles;
    use codex_protocol::models::LocalShellExecAction;
    use codex_protocol::models::LocalShellStatus;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn router_with_external_tool() -> ToolRouter {
        let mut tools = HashMap::new();
        tools.insert(
            "docs__search".to_string(),
            Tool {
                name: "search".to_string(),
                description: Some("Search docs".to_string()),
                input_schema: json!({"type": "object", "properties": {}}),
            },
        );
        ToolRouter::from_config(&ToolsConfig::from(&ToolToggles::default()), Some(&tools))
    }

    #[test]
    fn external_calls_are_routed_with_server_and_tool() {
        let router = router_with_external_tool();
        let call = router
            .build_tool_call(ResponseItem::FunctionCall {
                id: None,
                name: "docs__search".to_string(),
                arguments: "{\"q\":1}".to_string(),
                call_id: "c1".to_string(),
            })
            .unwrap()
            .unwrap();
        match call.payload {
            ToolPayload::Mcp {
                server,
                tool,
                raw_arguments,
            } => {
                assert_eq!("docs", server);
                assert_eq!("search", tool);
                assert_eq!("{\"q\":1}", raw_arguments);
            }
            other => panic!("expected mcp payload, got {other:?}"),
        }
    }

    #[test]
    fn local_shell_calls_need_an_id() {
        let router = router_with_external_tool();
        let item = ResponseItem::LocalShellCall {
            id: None,
            call_id: None,
            status: LocalShellStatus::Completed,
            action: LocalShellAction::Exec(LocalShellExecAction {
                command: vec!["ls".to_string()],
                timeout_ms: None,
                working_directory: None,
                env: None,
                user: None,
            }),
        };
        assert_eq!(
            Err(FunctionCallError::MissingLocalShellCallId),
            router.build_tool_call(item).map(|call| call.map(|c| c.call_id))
        );
    }

    #[test]
    fn listed_tools_mark_external_servers() {
        let listed = router_with_external_tool().listed_tools();
        let names: Vec<_> = listed.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(vec!["shell", "apply_patch", "update_plan", "docs__search"], names);
        assert_eq!(Some("docs".to_string()), listed[3].server);
        assert_eq!(None, listed[0].server);
    }

    #[test]
    fn failures_match_the_call_kind() {
        let err = FunctionCallError::RespondToModel("nope".to_string());
        assert_eq!(
            ResponseInputItem::CustomToolCallOutput {
                call_id: "c".to_string(),
                output: "nope".to_string(),
            },
            ToolRouter::failure_response("c".to_string(), true, err)
        );
    }
}
