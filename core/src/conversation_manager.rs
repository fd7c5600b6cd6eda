use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use codex_protocol::ConversationId;
use codex_protocol::models::ResponseItem;
use tokio::sync::RwLock;

use crate::client_common::ModelClient;
use crate::codex::Codex;
use crate::codex::CodexSpawnOk;
use crate::codex::INITIAL_SUBMIT_ID;
use crate::codex_conversation::CodexConversation;
use crate::config::Config;
use crate::error::CodexErr;
use crate::error::Result as CodexResult;
use crate::mcp_connection_manager::McpClient;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::InitialHistory;
use crate::protocol::RolloutItem;
use crate::protocol::SessionConfiguredEvent;
use crate::rollout::RolloutRecorder;

/// Represents a newly created Codex conversation, including the first event
/// (which is [`EventMsg::SessionConfigured`]).
pub struct NewConversation {
    pub conversation_id: ConversationId,
    pub conversation: Arc<CodexConversation>,
    pub session_configured: SessionConfiguredEvent,
}

/// [`ConversationManager`] is responsible for creating conversations and
/// maintaining them in memory.
pub struct ConversationManager {
    conversations: Arc<RwLock<HashMap<ConversationId, Arc<CodexConversation>>>>,
    client: Arc<dyn ModelClient>,
    mcp_clients: HashMap<String, Arc<dyn McpClient>>,
}

impl ConversationManager {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            conversations: Arc::new(RwLock::new(HashMap::new())),
            client,
            mcp_clients: HashMap::new(),
        }
    }

    /// External tool servers shared by every conversation this manager
    /// starts, keyed by the server names used in config.
    pub fn with_mcp_clients(mut self, mcp_clients: HashMap<String, Arc<dyn McpClient>>) -> Self {
        self.mcp_clients = mcp_clients;
        self
    }

    pub async fn new_conversation(&self, config: Config) -> CodexResult<NewConversation> {
        self.spawn_conversation(config, InitialHistory::New).await
    }

    /// Continues the conversation recorded at `rollout_path`, appending to
    /// the same file.
    pub async fn resume_conversation_from_rollout(
        &self,
        config: Config,
        rollout_path: PathBuf,
    ) -> CodexResult<NewConversation> {
        let initial_history = RolloutRecorder::get_rollout_history(&rollout_path).await?;
        self.spawn_conversation(config, initial_history).await
    }

    /// Starts a new conversation, in a new rollout file, from the history
    /// recorded at `path` up to but excluding its `nth_user_message`
    /// (0-based) user message.
    pub async fn fork_conversation(
        &self,
        nth_user_message: usize,
        config: Config,
        path: PathBuf,
    ) -> CodexResult<NewConversation> {
        let history = RolloutRecorder::get_rollout_history(&path).await?;
        let history = truncate_before_nth_user_message(history, nth_user_message);
        self.spawn_conversation(config, history).await
    }

    pub async fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> CodexResult<Arc<CodexConversation>> {
        let conversations = self.conversations.read().await;
        conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(CodexErr::ConversationNotFound(conversation_id))
    }

    /// Forgets the conversation. It keeps running for anyone still holding
    /// it until they submit `Op::Shutdown`.
    pub async fn remove_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<Arc<CodexConversation>> {
        self.conversations.write().await.remove(conversation_id)
    }

    async fn spawn_conversation(
        &self,
        config: Config,
        initial_history: InitialHistory,
    ) -> CodexResult<NewConversation> {
        let CodexSpawnOk {
            codex,
            conversation_id,
        } = Codex::spawn(
            config,
            Arc::clone(&self.client),
            self.mcp_clients.clone(),
            initial_history,
        )
        .await?;
        self.finalize_spawn(codex, conversation_id).await
    }

    async fn finalize_spawn(
        &self,
        codex: Codex,
        conversation_id: ConversationId,
    ) -> CodexResult<NewConversation> {
        // The first event must be `SessionConfigured`. Hand it to the caller
        // rather than leaving it on the queue.
        let event = codex.next_event().await?;
        let session_configured = match event {
            Event {
                id,
                msg: EventMsg::SessionConfigured(session_configured),
            } if id == INITIAL_SUBMIT_ID => session_configured,
            _ => return Err(CodexErr::SessionConfiguredNotFirstEvent),
        };

        let conversation = Arc::new(CodexConversation::new(
            codex,
            conversation_id,
            session_configured.rollout_path.clone(),
        ));
        self.conversations
            .write()
            .await
            .insert(conversation_id, Arc::clone(&conversation));

        Ok(NewConversation {
            conversation_id,
            conversation,
            session_configured,
        })
    }
}

/// Keeps the rollout items that precede the `n`-th user message. The source
/// file's session header is dropped; the fork writes its own. A history with
/// `n` or fewer user messages is kept whole.
fn truncate_before_nth_user_message(history: InitialHistory, n: usize) -> InitialHistory {
    let items: Vec<RolloutItem> = history.get_rollout_items();
    let cut = items
        .iter()
        .enumerate()
        .filter(|(_, item)| {
            matches!(
                item,
                RolloutItem::ResponseItem(ResponseItem::Message { role, .. }) if role == "user"
            )
        })
        .nth(n)
        .map_or(items.len(), |(idx, _)| idx);

    let kept: Vec<RolloutItem> = items
        .into_iter()
        .take(cut)
        .filter(|item| !matches!(item, RolloutItem::SessionMeta(_)))
        .collect();
    if kept.is_empty() {
        InitialHistory::New
    } else {
        InitialHistory::Forked(kept)
    }
}
