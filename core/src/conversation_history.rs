use std::collections::HashSet;

use codex_protocol::models::FunctionCallOutputPayload;
use codex_protocol::models::ResponseItem;

/// Transcript of conversation history
#[derive(Debug, Clone, Default)]
pub(crate) struct ConversationHistory {
    /// The oldest items are at the beginning of the vector.
    items: Vec<ResponseItem>,
}

impl ConversationHistory {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Returns a clone of the contents in the transcript.
    pub(crate) fn contents(&self) -> Vec<ResponseItem> {
        self.items.clone()
    }

    /// `items` is ordered from oldest to newest.
    pub(crate) fn record_items<'a, I>(&mut self, items: I)
    where
        I: IntoIterator<Item = &'a ResponseItem>,
    {
        for item in items {
            if is_api_message(item) {
                self.items.push(item.clone());
            }
        }
    }

    pub(crate) fn replace(&mut self, items: Vec<ResponseItem>) {
        self.items = items;
    }

    /// Text of every user message, oldest first. Used to seed a compacted
    /// transcript.
    pub(crate) fn user_messages(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| match item {
                ResponseItem::Message { role, content, .. } if role == "user" => {
                    Some(crate::util::content_text(content))
                }
                _ => None,
            })
            .filter(|text| !text.is_empty())
            .collect()
    }
}

/// Anything that is not a system message or an unrecognised item is sent
/// back to the model.
fn is_api_message(message: &ResponseItem) -> bool {
    match message {
        ResponseItem::Message { role, .. } => role.as_str() != "system",
        ResponseItem::FunctionCallOutput { .. }
        | ResponseItem::FunctionCall { .. }
        | ResponseItem::CustomToolCall { .. }
        | ResponseItem::CustomToolCallOutput { .. }
        | ResponseItem::LocalShellCall { .. }
        | ResponseItem::Reasoning { .. } => true,
        ResponseItem::Other => false,
    }
}

/// Appends an `aborted` output for every tool call in `items` that has no
/// output, so a partially recorded turn still pairs each call with a result.
pub(crate) fn pair_unanswered_calls(items: &mut Vec<ResponseItem>) {
    let answered: HashSet<String> = items
        .iter()
        .filter_map(|item| item.tool_output_call_id().map(str::to_string))
        .collect();
    let missing: Vec<ResponseItem> = items
        .iter()
        .filter_map(|item| {
            let call_id = item.tool_call_id()?;
            if answered.contains(call_id) {
                return None;
            }
            Some(match item {
                ResponseItem::CustomToolCall { .. } => ResponseItem::CustomToolCallOutput {
                    call_id: call_id.to_string(),
                    output: "aborted".to_string(),
                },
                _ => ResponseItem::FunctionCallOutput {
                    call_id: call_id.to_string(),
                    output: FunctionCallOutputPayload::failure("aborted"),
                },
            })
        })
        .collect();
    items.extend(missing);
}
