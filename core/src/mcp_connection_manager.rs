//! Registry of external tool servers.
//!
//! The [`McpConnectionManager`] holds one [`McpClient`] per configured server
//! (keyed by the *server name*) and exposes the tools of *all* servers as a
//! single map keyed by the fully-qualified name
//! `"<server><MCP_TOOL_NAME_DELIMITER><tool>"`. How a client reaches its server
//! is up to the embedder; the engine only needs the list/call contract below.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use codex_protocol::mcp::CallToolResult;
use codex_protocol::mcp::Tool;
use sha1::Digest;
use sha1::Sha1;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

use crate::config_types::DEFAULT_TOOL_TIMEOUT;
use crate::config_types::McpServerConfig;

/// Delimiter used to separate the server name from the tool name in a fully
/// qualified tool name.
///
/// Model APIs require tool names to conform to `^[a-zA-Z0-9_-]+$`, so the
/// delimiter has to come from this character set.
const MCP_TOOL_NAME_DELIMITER: &str = "__";
const MAX_TOOL_NAME_LENGTH: usize = 64;

/// Timeout for the `tools/list` request.
const LIST_TOOLS_TIMEOUT: Duration = Duration::from_secs(10);

/// Map that holds a startup error for every server whose tools could **not**
/// be listed.
pub type ClientStartErrors = HashMap<String, anyhow::Error>;

/// Connection to one external tool server.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<Tool>>;

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult>;
}

fn qualify_tools(tools: Vec<ToolInfo>) -> HashMap<String, ToolInfo> {
    let mut used_names = HashSet::new();
    let mut qualified_tools = HashMap::new();
    for tool in tools {
        let mut qualified_name = format!(
            "{}{}{}",
            tool.server_name, MCP_TOOL_NAME_DELIMITER, tool.tool_name
        );
        if qualified_name.len() > MAX_TOOL_NAME_LENGTH {
            let mut hasher = Sha1::new();
            hasher.update(qualified_name.as_bytes());
            let sha1_str = format!("{:x}", hasher.finalize());

            let prefix_len = MAX_TOOL_NAME_LENGTH - sha1_str.len();
            qualified_name = format!("{}{}", &qualified_name[..prefix_len], sha1_str);
        }

        if !used_names.insert(qualified_name.clone()) {
            warn!("skipping duplicated tool {qualified_name}");
            continue;
        }
        qualified_tools.insert(qualified_name, tool);
    }

    qualified_tools
}

/// Splits a qualified name on the first delimiter. Names shortened with a
/// hash suffix only resolve through [`McpConnectionManager::parse_tool_name`].
pub(crate) fn parse_tool_name(qualified: &str) -> Option<(String, String)> {
    let (server, tool) = qualified.split_once(MCP_TOOL_NAME_DELIMITER)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server.to_string(), tool.to_string()))
}

#[derive(Clone, Debug)]
struct ToolInfo {
    server_name: String,
    tool_name: String,
    tool: Tool,
}

struct ServerHandle {
    client: Arc<dyn McpClient>,
    tool_timeout: Duration,
}

#[derive(Default)]
pub struct McpConnectionManager {
    /// Server-name -> client and its per-call bound.
    servers: HashMap<String, ServerHandle>,

    /// Fully qualified tool name -> tool. Fixed once listing completes.
    tools: HashMap<String, ToolInfo>,
}

impl std::fmt::Debug for McpConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnectionManager")
            .field("servers", &self.servers.keys().collect::<Vec<_>>())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl McpConnectionManager {
    /// Lists the tools of every client concurrently. A server whose name is
    /// invalid or whose listing fails is left out and reported in the
    /// returned error map; the others stay usable.
    pub async fn new(
        clients: HashMap<String, Arc<dyn McpClient>>,
        server_configs: &HashMap<String, McpServerConfig>,
    ) -> (Self, ClientStartErrors) {
        let mut errors = ClientStartErrors::new();
        let mut servers = HashMap::new();
        for (server_name, client) in clients {
            if !is_valid_mcp_server_name(&server_name) {
                let error = anyhow!(
                    "invalid server name '{server_name}': must match pattern ^[a-zA-Z0-9_-]+$"
                );
                errors.insert(server_name, error);
                continue;
            }
            let tool_timeout = server_configs
                .get(&server_name)
                .map(McpServerConfig::tool_timeout)
                .unwrap_or(DEFAULT_TOOL_TIMEOUT);
            servers.insert(
                server_name,
                ServerHandle {
                    client,
                    tool_timeout,
                },
            );
        }

        let (all_tools, list_errors) = list_all_tools(&servers).await;
        for (server_name, error) in list_errors {
            servers.remove(&server_name);
            errors.insert(server_name, error);
        }

        let tools = qualify_tools(all_tools);
        (Self { servers, tools }, errors)
    }

    /// Returns a single map that contains **all** tools. Each key is the
    /// fully-qualified name for the tool.
    pub fn list_all_tools(&self) -> HashMap<String, Tool> {
        self.tools
            .iter()
            .map(|(name, info)| (name.clone(), info.tool.clone()))
            .collect()
    }

    pub fn parse_tool_name(&self, qualified: &str) -> Option<(String, String)> {
        self.tools
            .get(qualified)
            .map(|info| (info.server_name.clone(), info.tool_name.clone()))
    }

    /// Invoke the tool indicated by the (server, tool) pair. The call is
    /// bounded by the server's configured tool timeout.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<CallToolResult> {
        let handle = self
            .servers
            .get(server)
            .ok_or_else(|| anyhow!("unknown MCP server '{server}'"))?;
        match tokio::time::timeout(
            handle.tool_timeout,
            handle.client.call_tool(tool, arguments),
        )
        .await
        {
            Ok(result) => result.with_context(|| format!("tool call failed for `{server}/{tool}`")),
            Err(_) => Err(anyhow!(
                "tool call `{server}/{tool}` timed out after {}s",
                handle.tool_timeout.as_secs_f32()
            )),
        }
    }
}

/// Query every server for its available tools. Servers are queried
/// concurrently so startup latency tracks the slowest one.
async fn list_all_tools(
    servers: &HashMap<String, ServerHandle>,
) -> (Vec<ToolInfo>, Vec<(String, anyhow::Error)>) {
    let mut join_set = JoinSet::new();
    for (server_name, handle) in servers {
        let server_name = server_name.clone();
        let client = handle.client.clone();
        join_set.spawn(async move {
            let res = match tokio::time::timeout(LIST_TOOLS_TIMEOUT, client.list_tools()).await {
                Ok(res) => res,
                Err(_) => Err(anyhow!("listing tools timed out")),
            };
            (server_name, res)
        });
    }

    let mut aggregated = Vec::new();
    let mut errors = Vec::new();
    while let Some(join_res) = join_set.join_next().await {
        let (server_name, list_result) = match join_res {
            Ok(pair) => pair,
            Err(e) => {
                warn!("tool listing task failed: {e}");
                continue;
            }
        };
        match list_result {
            Ok(tools) => {
                for tool in tools {
                    aggregated.push(ToolInfo {
                        server_name: server_name.clone(),
                        tool_name: tool.name.clone(),
                        tool,
                    });
                }
            }
            Err(e) => {
                warn!("failed to list tools for server {server_name}: {e:#}");
                errors.push((server_name, e));
            }
        }
    }

    // JoinSet completion order is arbitrary; keep qualification stable.
    aggregated.sort_by(|a, b| {
        (a.server_name.as_str(), a.tool_name.as_str())
            .cmp(&(b.server_name.as_str(), b.tool_name.as_str()))
    });

    info!(
        "aggregated {} tools from {} servers",
        aggregated.len(),
        servers.len()
    );

    (aggregated, errors)
}

fn is_valid_mcp_server_name(server_name: &str) -> bool {
    !server_name.is_empty()
        && server_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
