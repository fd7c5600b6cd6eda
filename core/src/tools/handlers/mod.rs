pub(crate) mod apply_patch;
pub(crate) mod mcp;
pub(crate) mod plan;
pub(crate) mod shell;
pub(crate) mod unified_exec;

use serde::de::DeserializeOwned;

use crate::function_tool::FunctionCallError;

fn parse_arguments<T: DeserializeOwned>(arguments: &str) -> Result<T, FunctionCallError> {
    serde_json::from_str(arguments).map_err(|err| {
        FunctionCallError::RespondToModel(format!("failed to parse function arguments: {err}"))
    })
}
