#![expect(clippy::expect_used, clippy::unwrap_used)]

//! Shared helpers for the `codex-core` integration suite: a scripted model
//! client standing in for a provider, a static external tool server, config
//! builders and event waiters.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use codex_core::CodexConversation;
use codex_core::ModelClient;
use codex_core::Prompt;
use codex_core::ResponseEvent;
use codex_core::ResponseStream;
use codex_core::config::Config;
use codex_core::config::ConfigOverrides;
use codex_core::config::ConfigToml;
use codex_core::error::CodexErr;
use codex_core::error::Result as CodexResult;
use codex_core::mcp_connection_manager::McpClient;
use codex_core::protocol::EventMsg;
use codex_protocol::mcp::CallToolResult;
use codex_protocol::mcp::ContentBlock;
use codex_protocol::mcp::Tool;
use codex_protocol::models::ContentItem;
use codex_protocol::models::ResponseItem;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Returns a default `Config` whose `codex_home` and `cwd` are the given
/// temporary directory, so rollouts and commands stay inside it.
pub fn load_default_config_for_test(codex_home: &TempDir) -> Config {
    load_config_with_overrides(codex_home, ConfigOverrides::default())
}

pub fn load_config_with_overrides(codex_home: &TempDir, overrides: ConfigOverrides) -> Config {
    let overrides = ConfigOverrides {
        cwd: overrides.cwd.or_else(|| Some(codex_home.path().to_path_buf())),
        ..overrides
    };
    Config::load_from_base_config_with_overrides(
        ConfigToml::default(),
        overrides,
        codex_home.path().to_path_buf(),
    )
    .expect("defaults for test should always succeed")
}

/// One step of a scripted model response.
pub enum ScriptStep {
    Event(ResponseEvent),
    /// The transport fails; retryable.
    StreamError(String),
    Delay(Duration),
    /// Stop sending without completing, as a stalled connection would.
    Hang,
}

/// A [`ModelClient`] that replays canned responses, one per `stream` call,
/// and records every prompt it was given.
#[derive(Default)]
pub struct ScriptedModelClient {
    responses: Mutex<VecDeque<Vec<ScriptStep>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedModelClient {
    pub fn new(responses: Vec<Vec<ScriptStep>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn push_response(&self, steps: Vec<ScriptStep>) {
        self.responses.lock().unwrap().push_back(steps);
    }

    /// Prompts received so far, oldest first.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn stream(&self, prompt: &Prompt) -> CodexResult<ResponseStream> {
        self.prompts.lock().unwrap().push(prompt.clone());
        let Some(steps) = self.responses.lock().unwrap().pop_front() else {
            return Err(CodexErr::RetryLimit(
                "scripted model client has no more responses".to_string(),
            ));
        };

        let (tx, rx_event) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in steps {
                match step {
                    ScriptStep::Event(event) => {
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    ScriptStep::StreamError(message) => {
                        let _ = tx.send(Err(CodexErr::Stream(message, None))).await;
                        return;
                    }
                    ScriptStep::Delay(delay) => tokio::time::sleep(delay).await,
                    ScriptStep::Hang => {
                        tx.closed().await;
                        return;
                    }
                }
            }
        });
        Ok(ResponseStream { rx_event })
    }
}

pub fn ev_created() -> ScriptStep {
    ScriptStep::Event(ResponseEvent::Created)
}

pub fn ev_completed(id: &str) -> ScriptStep {
    ScriptStep::Event(ResponseEvent::Completed {
        response_id: id.to_string(),
        token_usage: None,
    })
}

pub fn ev_text_delta(delta: &str) -> ScriptStep {
    ScriptStep::Event(ResponseEvent::OutputTextDelta(delta.to_string()))
}

pub fn ev_assistant_message(text: &str) -> ScriptStep {
    ScriptStep::Event(ResponseEvent::OutputItemDone(ResponseItem::Message {
        id: None,
        role: "assistant".to_string(),
        content: vec![ContentItem::OutputText {
            text: text.to_string(),
        }],
    }))
}

pub fn ev_function_call(call_id: &str, name: &str, arguments: serde_json::Value) -> ScriptStep {
    ScriptStep::Event(ResponseEvent::OutputItemDone(ResponseItem::FunctionCall {
        id: None,
        name: name.to_string(),
        arguments: arguments.to_string(),
        call_id: call_id.to_string(),
    }))
}

/// A complete response that only says `text`.
pub fn assistant_reply(id: &str, text: &str) -> Vec<ScriptStep> {
    vec![ev_created(), ev_assistant_message(text), ev_completed(id)]
}

/// A complete response consisting of one `shell` call.
pub fn shell_call(id: &str, call_id: &str, command: &[&str], timeout_ms: Option<u64>) -> Vec<ScriptStep> {
    let mut arguments = serde_json::json!({ "command": command });
    if let Some(timeout_ms) = timeout_ms {
        arguments["timeout_ms"] = serde_json::json!(timeout_ms);
    }
    vec![
        ev_created(),
        ev_function_call(call_id, "shell", arguments),
        ev_completed(id),
    ]
}

/// External tool server with a fixed tool list that echoes its arguments.
pub struct StaticMcpClient {
    pub tools: Vec<Tool>,
}

#[async_trait]
impl McpClient for StaticMcpClient {
    async fn list_tools(&self) -> anyhow::Result<Vec<Tool>> {
        Ok(self.tools.clone())
    }

    async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<serde_json::Value>,
    ) -> anyhow::Result<CallToolResult> {
        Ok(CallToolResult {
            content: vec![ContentBlock::Text {
                text: format!("{tool}: {}", arguments.unwrap_or_default()),
            }],
            is_error: None,
            structured_content: None,
        })
    }
}

/// Text of the output the model was given for `call_id` in `prompt`.
pub fn function_output<'a>(prompt: &'a Prompt, call_id: &str) -> Option<&'a str> {
    prompt.input.iter().find_map(|item| match item {
        ResponseItem::FunctionCallOutput { call_id: id, output } if id == call_id => {
            Some(output.content.as_str())
        }
        _ => None,
    })
}

pub async fn wait_for_event<F>(codex: &CodexConversation, predicate: F) -> EventMsg
where
    F: FnMut(&EventMsg) -> bool,
{
    wait_for_event_with_timeout(codex, predicate, Duration::from_secs(5)).await
}

/// Drains events until one matches. Each individual wait is bounded by
/// `wait_time`.
pub async fn wait_for_event_with_timeout<F>(
    codex: &CodexConversation,
    mut predicate: F,
    wait_time: Duration,
) -> EventMsg
where
    F: FnMut(&EventMsg) -> bool,
{
    loop {
        let ev = tokio::time::timeout(wait_time, codex.next_event())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended unexpectedly");
        if predicate(&ev.msg) {
            return ev.msg;
        }
    }
}

/// Every event up to and including the first that matches.
pub async fn collect_events_until<F>(codex: &CodexConversation, mut predicate: F) -> Vec<EventMsg>
where
    F: FnMut(&EventMsg) -> bool,
{
    let mut events = Vec::new();
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), codex.next_event())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended unexpectedly");
        let done = predicate(&ev.msg);
        events.push(ev.msg);
        if done {
            return events;
        }
    }
}

/// Parsed lines of a rollout file.
pub fn read_rollout_lines(rollout_path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(rollout_path)
        .expect("read rollout")
        .lines()
        .map(|line| serde_json::from_str(line).expect("rollout line is JSON"))
        .collect()
}
