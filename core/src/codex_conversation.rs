use std::path::Path;
use std::path::PathBuf;

use codex_protocol::ConversationId;

use crate::codex::Codex;
use crate::error::Result as CodexResult;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::Op;
use crate::protocol::Submission;

/// Handle on one running session. Submissions go in through [`submit`],
/// events come out of [`next_event`] in emission order.
///
/// [`submit`]: CodexConversation::submit
/// [`next_event`]: CodexConversation::next_event
pub struct CodexConversation {
    codex: Codex,
    conversation_id: ConversationId,
    rollout_path: PathBuf,
}

impl CodexConversation {
    pub(crate) fn new(codex: Codex, conversation_id: ConversationId, rollout_path: PathBuf) -> Self {
        Self {
            codex,
            conversation_id,
            rollout_path,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// File this session's rollout is appended to.
    pub fn rollout_path(&self) -> &Path {
        &self.rollout_path
    }

    pub async fn submit(&self, op: Op) -> CodexResult<String> {
        self.codex.submit(op).await
    }

    /// Use sparingly: prefer `submit()` so ids stay unique.
    pub async fn submit_with_id(&self, sub: Submission) -> CodexResult<()> {
        self.codex.submit_with_id(sub).await
    }

    pub async fn next_event(&self) -> CodexResult<Event> {
        self.codex.next_event().await
    }

    /// Submits `op` and drains events until one tagged with its id matches
    /// `done`. Events belonging to other submissions are dropped.
    pub async fn submit_and_wait<F>(&self, op: Op, done: F) -> CodexResult<Vec<EventMsg>>
    where
        F: Fn(&EventMsg) -> bool,
    {
        let id = self.submit(op).await?;
        let mut seen = Vec::new();
        loop {
            let Event { id: event_id, msg } = self.next_event().await?;
            if event_id != id {
                continue;
            }
            let finished = done(&msg);
            seen.push(msg);
            if finished {
                return Ok(seen);
            }
        }
    }
}
