use crate::protocol::EventMsg;
use crate::protocol::RolloutItem;
use codex_protocol::models::ResponseItem;

/// Whether a rollout item should be written to the log at all.
#[inline]
pub(crate) fn is_persisted_rollout_item(item: &RolloutItem) -> bool {
    match item {
        RolloutItem::ResponseItem(item) => is_persisted_response_item(item),
        RolloutItem::EventMsg(ev) => is_persisted_event_msg(ev),
        RolloutItem::SessionMeta(_) | RolloutItem::Compacted(_) | RolloutItem::TurnContext(_) => {
            true
        }
    }
}

/// Whether a `ResponseItem` should be persisted in rollout files.
#[inline]
pub(crate) fn is_persisted_response_item(item: &ResponseItem) -> bool {
    match item {
        ResponseItem::Message { .. }
        | ResponseItem::Reasoning { .. }
        | ResponseItem::LocalShellCall { .. }
        | ResponseItem::FunctionCall { .. }
        | ResponseItem::FunctionCallOutput { .. }
        | ResponseItem::CustomToolCall { .. }
        | ResponseItem::CustomToolCallOutput { .. } => true,
        ResponseItem::Other => false,
    }
}

/// Whether an `EventMsg` should be persisted in rollout files.
///
/// Keep only high-signal, compact items. Avoid deltas and verbose streams.
#[inline]
pub(crate) fn is_persisted_event_msg(event: &EventMsg) -> bool {
    matches!(
        event,
        EventMsg::UserMessage(_)
            | EventMsg::AgentMessage(_)
            | EventMsg::TokenCount(_)
            | EventMsg::TurnAborted(_)
    )
}
