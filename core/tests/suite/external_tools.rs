use std::collections::HashMap;
use std::sync::Arc;

use codex_core::ConversationManager;
use codex_core::mcp::CallToolResult;
use codex_core::mcp::ContentBlock;
use codex_core::mcp::Tool;
use codex_core::mcp_connection_manager::McpClient;
use codex_core::protocol::EventMsg;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use core_test_support::ScriptedModelClient;
use core_test_support::StaticMcpClient;
use core_test_support::assistant_reply;
use core_test_support::ev_completed;
use core_test_support::ev_created;
use core_test_support::ev_function_call;
use core_test_support::function_output;
use core_test_support::load_default_config_for_test;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn docs_server() -> HashMap<String, Arc<dyn McpClient>> {
    let client: Arc<dyn McpClient> = Arc::new(StaticMcpClient {
        tools: vec![Tool {
            name: "search".to_string(),
            description: Some("Search the docs".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        }],
    });
    HashMap::from([("docs".to_string(), client)])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_tools_includes_external_server_tools() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![]);
    let codex = ConversationManager::new(client)
        .with_mcp_clients(docs_server())
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex.submit(Op::ListTools).await.unwrap();
    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::ListToolsResponse(_))).await;
    let EventMsg::ListToolsResponse(response) = ev else {
        unreachable!();
    };

    let shell = response
        .tools
        .iter()
        .find(|tool| tool.name == "shell")
        .expect("shell tool listed");
    assert_eq!(None, shell.server);
    let search = response
        .tools
        .iter()
        .find(|tool| tool.name == "docs__search")
        .expect("external tool listed");
    assert_eq!(Some("docs".to_string()), search.server);
    assert_eq!("Search the docs", search.description);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn external_tool_call_is_proxied_and_returned_to_the_model() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        vec![
            ev_created(),
            ev_function_call("call-1", "docs__search", json!({ "query": "sandbox" })),
            ev_completed("r1"),
        ],
        assistant_reply("r2", "found it"),
    ]);
    let codex = ConversationManager::new(client.clone())
        .with_mcp_clients(docs_server())
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: "look it up".to_string(),
            }],
        })
        .await
        .unwrap();

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::McpToolCallBegin(_))).await;
    let EventMsg::McpToolCallBegin(begin) = ev else {
        unreachable!();
    };
    assert_eq!("docs", begin.invocation.server);
    assert_eq!("search", begin.invocation.tool);

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::McpToolCallEnd(_))).await;
    let EventMsg::McpToolCallEnd(end) = ev else {
        unreachable!();
    };
    let expected = CallToolResult {
        content: vec![ContentBlock::Text {
            text: r#"search: {"query":"sandbox"}"#.to_string(),
        }],
        is_error: None,
        structured_content: None,
    };
    assert_eq!(Ok(expected), end.result);

    wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;
    let prompts = client.prompts();
    let output = function_output(&prompts[1], "call-1").unwrap();
    assert!(output.contains("search:"), "{output}");
    assert!(
        prompts[0]
            .tools
            .iter()
            .any(|tool| tool.name() == "docs__search")
    );
}
