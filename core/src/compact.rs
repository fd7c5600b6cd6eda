//! History compaction. The model is asked to summarize the conversation so
//! far; the transcript then restarts from the user's own messages followed
//! by that summary.

use std::sync::Arc;

use codex_protocol::models::ContentItem;
use codex_protocol::models::ResponseInputItem;
use codex_protocol::models::ResponseItem;
use futures::StreamExt;
use tracing::debug;
use tracing::warn;

use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::codex::Session;
use crate::codex::wait_before_retry;
use crate::conversation_history::ConversationHistory;
use crate::error::CodexErr;
use crate::error::Result as CodexResult;
use crate::protocol::AgentMessageEvent;
use crate::protocol::CompactedItem;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::InputItem;
use crate::protocol::RolloutItem;
use crate::protocol::TaskCompleteEvent;
use crate::protocol::TaskStartedEvent;
use crate::state::TurnCancellation;
use crate::state::TurnContext;
use crate::util::content_text;

pub(crate) const SUMMARIZATION_PROMPT: &str = "You have exceeded the maximum number of tokens, please stop coding and instead write a short memento message for the next agent. Your note should:
- Summarize what you finished and what still needs work. If there was a recent update_plan call, repeat its steps verbatim.
- List outstanding TODOs with file paths / line numbers so they're easy to find.
- Flag code that needs more tests (e.g. edge cases, performance, integration, etc.).
- Record any open bugs, quirks, or setup steps that will make it easier for the next agent to pick up where you left off.";

pub(crate) async fn run_compact_task(
    sess: Arc<Session>,
    turn: TurnContext,
    sub_id: String,
    cancellation: TurnCancellation,
) {
    sess.send_event(Event {
        id: sub_id.clone(),
        msg: EventMsg::TaskStarted(TaskStartedEvent {
            model: turn.model.clone(),
        }),
    })
    .await;

    let mut input = sess.history_snapshot();
    input.push(
        ResponseInputItem::from(vec![InputItem::Text {
            text: SUMMARIZATION_PROMPT.to_string(),
        }])
        .into(),
    );
    let prompt = Prompt {
        input,
        tools: Vec::new(),
        base_instructions_override: turn.base_instructions.clone(),
        model: turn.model.clone(),
        effort: turn.effort,
        summary: turn.summary,
    };

    let mut retries = 0;
    let result = loop {
        match drain_summary(&sess, &prompt, &sub_id, &cancellation).await {
            Err(e) if e.is_retryable() => {
                retries += 1;
                if let Err(e) = wait_before_retry(&sess, &sub_id, &cancellation, retries, e).await {
                    break Err(e);
                }
            }
            other => break other,
        }
    };

    let result = match result {
        Ok(summary) => {
            let compacted = build_compacted_history(&sess.user_messages(), &summary);
            sess.replace_history(compacted, CompactedItem {
                message: summary.clone(),
            })
            .await
            .map(|()| summary)
        }
        Err(e) => Err(e),
    };

    sess.remove_task(&sub_id);
    match result {
        Ok(summary) => {
            debug!(%sub_id, "history compacted");
            sess.send_event(Event {
                id: sub_id.clone(),
                msg: EventMsg::AgentMessage(AgentMessageEvent {
                    message: "Compact task completed".to_string(),
                }),
            })
            .await;
            sess.send_event(Event {
                id: sub_id,
                msg: EventMsg::TaskComplete(TaskCompleteEvent {
                    last_agent_message: Some(summary),
                }),
            })
            .await;
        }
        Err(CodexErr::TurnAborted) => {
            sess.send_turn_aborted(&sub_id, cancellation.reason()).await;
        }
        Err(e) => {
            warn!(%sub_id, "compaction failed: {e:#}");
            sess.notify_error(&sub_id, &e).await;
            sess.send_event(Event {
                id: sub_id,
                msg: EventMsg::TaskComplete(TaskCompleteEvent {
                    last_agent_message: None,
                }),
            })
            .await;
        }
    }
}

/// Streams one summarization response and returns the last assistant
/// message in it.
async fn drain_summary(
    sess: &Session,
    prompt: &Prompt,
    sub_id: &str,
    cancellation: &TurnCancellation,
) -> CodexResult<String> {
    let mut stream = tokio::select! {
        stream = sess.client().stream(prompt) => stream?,
        _ = cancellation.cancelled() => return Err(CodexErr::TurnAborted),
    };
    let mut summary = String::new();
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = cancellation.cancelled() => return Err(CodexErr::TurnAborted),
        };
        match event {
            None => {
                return Err(CodexErr::Stream(
                    "stream closed before response.completed".to_string(),
                    None,
                ));
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(ResponseEvent::OutputItemDone(ResponseItem::Message {
                role, content, ..
            }))) if role == "assistant" => {
                summary = content_text(&content);
            }
            Some(Ok(ResponseEvent::Completed { token_usage, .. })) => {
                sess.update_token_usage(sub_id, &token_usage).await;
                return Ok(summary);
            }
            Some(Ok(_)) => {}
        }
    }
}

/// Transcript that replaces everything before a compaction.
pub(crate) fn build_compacted_history(
    user_messages: &[String],
    summary: &str,
) -> Vec<ResponseItem> {
    let mut history: Vec<ResponseItem> = user_messages
        .iter()
        .map(|text| ResponseItem::Message {
            id: None,
            role: "user".to_string(),
            content: vec![ContentItem::InputText { text: text.clone() }],
        })
        .collect();
    history.push(
        CompactedItem {
            message: summary.to_string(),
        }
        .into(),
    );
    history
}

/// Rebuilds a transcript from rollout items, replaying compactions in the
/// order they happened.
pub(crate) fn reconstruct_history(items: &[RolloutItem]) -> Vec<ResponseItem> {
    let mut history = ConversationHistory::new();
    for item in items {
        match item {
            RolloutItem::ResponseItem(item) => history.record_items(std::iter::once(item)),
            RolloutItem::Compacted(compacted) => {
                let rebuilt = build_compacted_history(&history.user_messages(), &compacted.message);
                history.replace(rebuilt);
            }
            RolloutItem::SessionMeta(_) | RolloutItem::TurnContext(_) | RolloutItem::EventMsg(_) => {}
        }
    }
    history.contents()
}
