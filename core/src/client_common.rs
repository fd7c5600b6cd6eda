use std::borrow::Cow;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use async_trait::async_trait;
use codex_apply_patch::APPLY_PATCH_TOOL_INSTRUCTIONS;
use codex_protocol::config_types::ReasoningEffort as ReasoningEffortConfig;
use codex_protocol::config_types::ReasoningSummary as ReasoningSummaryConfig;
use codex_protocol::models::ResponseItem;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::TokenUsage;
use crate::tools::spec::ToolSpec;

/// Base instructions sent with every request unless overridden in config.
pub const BASE_INSTRUCTIONS: &str = include_str!("../prompt.md");

/// API request payload for a single model turn
#[derive(Default, Debug, Clone)]
pub struct Prompt {
    /// Conversation context input items.
    pub input: Vec<ResponseItem>,

    /// Tools available to the model, including additional tools sourced from
    /// external tool servers.
    pub tools: Vec<ToolSpec>,

    /// Optional override for the built-in BASE_INSTRUCTIONS.
    pub base_instructions_override: Option<String>,

    pub model: String,
    pub effort: Option<ReasoningEffortConfig>,
    pub summary: ReasoningSummaryConfig,
}

impl Prompt {
    pub fn get_full_instructions(&self) -> Cow<'_, str> {
        let base = self
            .base_instructions_override
            .as_deref()
            .unwrap_or(BASE_INSTRUCTIONS);
        // Without a dedicated apply_patch tool the model still needs to know
        // the patch grammar to use it through the shell.
        let is_apply_patch_tool_present = self
            .tools
            .iter()
            .any(|tool| tool.name() == "apply_patch");
        if self.base_instructions_override.is_none() && !is_apply_patch_tool_present {
            Cow::Owned(format!("{base}\n{APPLY_PATCH_TOOL_INSTRUCTIONS}"))
        } else {
            Cow::Borrowed(base)
        }
    }

    pub fn get_formatted_input(&self) -> Vec<ResponseItem> {
        self.input.clone()
    }
}

#[derive(Debug)]
pub enum ResponseEvent {
    Created,
    OutputItemDone(ResponseItem),
    Completed {
        response_id: String,
        token_usage: Option<TokenUsage>,
    },
    OutputTextDelta(String),
    ReasoningSummaryDelta(String),
    ReasoningContentDelta(String),
}

pub struct ResponseStream {
    pub rx_event: mpsc::Receiver<Result<ResponseEvent>>,
}

impl Stream for ResponseStream {
    type Item = Result<ResponseEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

/// Transport to a language model. Implementations own the wire protocol,
/// authentication and connection handling; the engine only sees the event
/// stream of one sampling request.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, prompt: &Prompt) -> Result<ResponseStream>;
}
