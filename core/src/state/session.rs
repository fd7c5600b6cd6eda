//! Session-wide mutable state.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::conversation_history::ConversationHistory;
use crate::executor::ApprovalCache;
use crate::protocol::ReviewDecision;
use crate::protocol::TokenUsageInfo;
use crate::state::TurnCancellation;
use crate::state::TurnContext;

/// The one turn a session may be running.
pub(crate) struct ActiveTurn {
    pub(crate) sub_id: String,
    pub(crate) cancellation: TurnCancellation,
    pub(crate) handle: JoinHandle<()>,
}

/// Everything the session mutates between submissions. Only the submission
/// loop and the active turn touch it, always under the session's lock.
pub(crate) struct SessionState {
    pub(crate) history: ConversationHistory,
    pub(crate) approvals: ApprovalCache,
    pub(crate) active_turn: Option<ActiveTurn>,
    pub(crate) pending_approvals: HashMap<String, oneshot::Sender<ReviewDecision>>,
    pub(crate) token_info: Option<TokenUsageInfo>,
    /// Defaults for the next turn; `UserTurn` and `OverrideTurnContext`
    /// replace them.
    pub(crate) turn_defaults: TurnContext,
}

impl SessionState {
    pub(crate) fn new(turn_defaults: TurnContext) -> Self {
        Self {
            history: ConversationHistory::new(),
            approvals: ApprovalCache::default(),
            active_turn: None,
            pending_approvals: HashMap::new(),
            token_info: None,
            turn_defaults,
        }
    }

    pub(crate) fn take_active_turn(&mut self) -> Option<ActiveTurn> {
        let turn = self.active_turn.take();
        if turn.is_some() {
            // Approvals belong to the turn; nobody will answer them now.
            self.pending_approvals.clear();
        }
        turn
    }
}
