use std::collections::BTreeMap;
use std::collections::HashMap;

use codex_protocol::config_types::ToolToggles;
use codex_protocol::mcp::Tool;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResponsesApiTool {
    pub name: String,
    pub description: String,
    /// When strict is set, every property must be listed in `required` and
    /// `additionalProperties` must be false.
    pub strict: bool,
    pub parameters: JsonSchema,
}

/// Generic JSON-Schema subset needed for our tool definitions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum JsonSchema {
    Boolean {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    String {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    /// Tool servers may say "number" or "integer".
    #[serde(alias = "integer")]
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Array {
        items: Box<JsonSchema>,

        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Object {
        #[serde(default)]
        properties: BTreeMap<String, JsonSchema>,
        #[serde(skip_serializing_if = "Option::is_none")]
        required: Option<Vec<String>>,
        #[serde(
            rename = "additionalProperties",
            skip_serializing_if = "Option::is_none"
        )]
        additional_properties: Option<bool>,
    },
}

/// When serialized as JSON, this produces a valid function tool definition.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ToolSpec {
    #[serde(rename = "function")]
    Function(ResponsesApiTool),
}

impl ToolSpec {
    pub fn name(&self) -> &str {
        match self {
            ToolSpec::Function(tool) => &tool.name,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            ToolSpec::Function(tool) => &tool.description,
        }
    }
}

/// Which built-in tools a turn offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsConfig {
    pub shell: bool,
    pub apply_patch: bool,
    pub plan_tool: bool,
    pub unified_exec: bool,
    pub external_tools: bool,
}

impl From<&ToolToggles> for ToolsConfig {
    fn from(toggles: &ToolToggles) -> Self {
        Self {
            shell: toggles.shell,
            apply_patch: toggles.apply_patch,
            plan_tool: toggles.update_plan,
            unified_exec: toggles.unified_exec,
            external_tools: toggles.external,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApplyPatchToolArgs {
    pub(crate) input: String,
}

fn string(description: &str) -> JsonSchema {
    JsonSchema::String {
        description: Some(description.to_string()),
    }
}

fn number(description: &str) -> JsonSchema {
    JsonSchema::Number {
        description: Some(description.to_string()),
    }
}

fn object(properties: BTreeMap<String, JsonSchema>, required: &[&str]) -> JsonSchema {
    JsonSchema::Object {
        properties,
        required: Some(required.iter().map(|s| (*s).to_string()).collect()),
        additional_properties: Some(false),
    }
}

fn function(name: &str, description: &str, parameters: JsonSchema) -> ToolSpec {
    ToolSpec::Function(ResponsesApiTool {
        name: name.to_string(),
        description: description.to_string(),
        strict: false,
        parameters,
    })
}

fn create_shell_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert(
        "command".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String { description: None }),
            description: Some("The command to execute".to_string()),
        },
    );
    properties.insert(
        "workdir".to_string(),
        string("The working directory to execute the command in"),
    );
    properties.insert(
        "timeout_ms".to_string(),
        number("The timeout for the command in milliseconds"),
    );
    properties.insert(
        "with_escalated_permissions".to_string(),
        JsonSchema::Boolean {
            description: Some(
                "Whether to request escalated permissions. Set to true if the command needs to run without sandbox restrictions".to_string(),
            ),
        },
    );
    properties.insert(
        "justification".to_string(),
        string("Only set if with_escalated_permissions is true. One sentence explaining why this action needs to run without the sandbox."),
    );
    function(
        "shell",
        "Runs a shell command and returns its output.",
        object(properties, &["command"]),
    )
}

fn create_apply_patch_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert(
        "input".to_string(),
        string("The entire contents of the apply_patch command"),
    );
    function(
        "apply_patch",
        "Use the `apply_patch` tool to edit files. The input is a patch envelope starting with `*** Begin Patch` and ending with `*** End Patch`.",
        object(properties, &["input"]),
    )
}

fn create_update_plan_tool() -> ToolSpec {
    let mut plan_item = BTreeMap::new();
    plan_item.insert("step".to_string(), JsonSchema::String { description: None });
    plan_item.insert(
        "status".to_string(),
        string("One of: pending, in_progress, completed"),
    );

    let mut properties = BTreeMap::new();
    properties.insert("explanation".to_string(), JsonSchema::String { description: None });
    properties.insert(
        "plan".to_string(),
        JsonSchema::Array {
            items: Box::new(object(plan_item, &["step", "status"])),
            description: Some("The list of steps".to_string()),
        },
    );
    function(
        "update_plan",
        "Updates the task plan.\nProvide an optional explanation and a list of plan items, each with a step and status.\nAt most one step can be in_progress at a time.",
        object(properties, &["plan"]),
    )
}

fn create_exec_command_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert(
        "cmd".to_string(),
        JsonSchema::Array {
            items: Box::new(JsonSchema::String { description: None }),
            description: Some("The command line to start in a new PTY session".to_string()),
        },
    );
    properties.insert(
        "yield_time_ms".to_string(),
        number("How long to wait for output before returning, in milliseconds"),
    );
    properties.insert(
        "with_escalated_permissions".to_string(),
        JsonSchema::Boolean { description: None },
    );
    properties.insert("justification".to_string(), JsonSchema::String { description: None });
    function(
        "exec_command",
        "Starts a long-running command in a pseudo-terminal. Returns the output produced so far and a session_id while the process keeps running.",
        object(properties, &["cmd"]),
    )
}

fn create_write_stdin_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert("session_id".to_string(), number("Session id from exec_command"));
    properties.insert(
        "chars".to_string(),
        string("Characters to write. Leave empty to only read new output."),
    );
    properties.insert(
        "yield_time_ms".to_string(),
        number("How long to wait for output before returning, in milliseconds"),
    );
    function(
        "write_stdin",
        "Writes characters to a running PTY session and returns new output.",
        object(properties, &["session_id"]),
    )
}

fn create_close_session_tool() -> ToolSpec {
    let mut properties = BTreeMap::new();
    properties.insert("session_id".to_string(), number("Session id from exec_command"));
    function(
        "close_session",
        "Terminates a PTY session.",
        object(properties, &["session_id"]),
    )
}

/// Converts a tool advertised by an external server into a function tool
/// under its qualified name.
pub(crate) fn mcp_tool_to_openai_tool(qualified_name: &str, tool: &Tool) -> ToolSpec {
    let parameters = match serde_json::from_value::<JsonSchema>(tool.input_schema.clone()) {
        Ok(schema @ JsonSchema::Object { .. }) => schema,
        Ok(_) | Err(_) => {
            warn!(
                "tool {qualified_name} has an unsupported input schema; offering it without parameters"
            );
            JsonSchema::Object {
                properties: BTreeMap::new(),
                required: None,
                additional_properties: None,
            }
        }
    };
    function(
        qualified_name,
        tool.description.as_deref().unwrap_or_default(),
        parameters,
    )
}

/// Ordered tool list for one turn: built-ins in a fixed order, then
/// external tools sorted by qualified name.
pub(crate) fn build_specs(
    config: &ToolsConfig,
    mcp_tools: Option<&HashMap<String, Tool>>,
) -> Vec<ToolSpec> {
    let mut specs = Vec::new();
    if config.shell {
        specs.push(create_shell_tool());
    }
    if config.apply_patch {
        specs.push(create_apply_patch_tool());
    }
    if config.plan_tool {
        specs.push(create_update_plan_tool());
    }
    if config.unified_exec {
        specs.push(create_exec_command_tool());
        specs.push(create_write_stdin_tool());
        specs.push(create_close_session_tool());
    }
    if config.external_tools
        && let Some(tools) = mcp_tools
    {
        let mut entries: Vec<_> = tools.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (name, tool) in entries {
            specs.push(mcp_tool_to_openai_tool(name, tool));
        }
    }
    specs
}
