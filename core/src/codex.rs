use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use async_channel::Receiver;
use async_channel::Sender;
use codex_protocol::ConversationId;
use codex_protocol::models::ContentItem;
use codex_protocol::models::FunctionCallOutputPayload;
use codex_protocol::models::ReasoningItemReasoningSummary;
use codex_protocol::models::ResponseInputItem;
use codex_protocol::models::ResponseItem;
use futures::StreamExt;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::client_common::ModelClient;
use crate::client_common::Prompt;
use crate::client_common::ResponseEvent;
use crate::compact;
use crate::config::Config;
use crate::conversation_history::pair_unanswered_calls;
use crate::error::CodexErr;
use crate::error::Result as CodexResult;
use crate::error::get_error_message_ui;
use crate::exec::ExecToolCallOutput;
use crate::function_tool::FunctionCallError;
use crate::mcp_connection_manager::McpClient;
use crate::mcp_connection_manager::McpConnectionManager;
use crate::protocol::AgentMessageDeltaEvent;
use crate::protocol::AgentMessageEvent;
use crate::protocol::AgentReasoningDeltaEvent;
use crate::protocol::AgentReasoningEvent;
use crate::protocol::AgentReasoningRawContentDeltaEvent;
use crate::protocol::ApplyPatchApprovalRequestEvent;
use crate::protocol::CompactedItem;
use crate::protocol::ErrorEvent;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::ExecApprovalRequestEvent;
use crate::protocol::ExecCommandBeginEvent;
use crate::protocol::ExecCommandEndEvent;
use crate::protocol::ExecExitStatus;
use crate::protocol::FileChange;
use crate::protocol::InitialHistory;
use crate::protocol::InputItem;
use crate::protocol::ListToolsResponseEvent;
use crate::protocol::Op;
use crate::protocol::ReviewDecision;
use crate::protocol::RolloutItem;
use crate::protocol::SessionConfiguredEvent;
use crate::protocol::StreamErrorEvent;
use crate::protocol::Submission;
use crate::protocol::TaskCompleteEvent;
use crate::protocol::TaskStartedEvent;
use crate::protocol::TokenCountEvent;
use crate::protocol::TokenUsage;
use crate::protocol::TokenUsageInfo;
use crate::protocol::TurnAbortReason;
use crate::protocol::TurnAbortedEvent;
use crate::protocol::TurnOverrides;
use crate::protocol::UserMessageEvent;
use crate::rollout::RolloutRecorder;
use crate::rollout::RolloutRecorderParams;
use crate::rollout::policy::is_persisted_event_msg;
use crate::state::ActiveTurn;
use crate::state::SessionState;
use crate::state::TurnCancellation;
use crate::state::TurnContext;
use crate::state::TurnState;
use crate::tools::router::ToolRouter;
use crate::truncate::format_exec_output_str;
use crate::turn_diff_tracker::TurnDiffTracker;
use crate::unified_exec::UnifiedExecSessionManager;
use crate::util::backoff;
use crate::util::content_text;

/// The high-level interface to the engine. It operates as a queue pair:
/// callers send submissions and receive events.
pub struct Codex {
    next_id: AtomicU64,
    tx_sub: Sender<Submission>,
    rx_event: Receiver<Event>,
}

/// Wrapper returned by [`Codex::spawn`] containing the spawned [`Codex`]
/// and the id of the conversation it drives.
pub struct CodexSpawnOk {
    pub codex: Codex,
    pub conversation_id: ConversationId,
}

/// Id of events that do not answer a particular submission, such as
/// `SessionConfigured`.
pub(crate) const INITIAL_SUBMIT_ID: &str = "";
pub(crate) const SUBMISSION_CHANNEL_CAPACITY: usize = 64;

/// How long an aborted turn gets to record its partial output and emit
/// `TurnAborted` before it is torn down.
const TURN_ABORT_GRACE: Duration = Duration::from_secs(10);

impl Codex {
    /// Spawn a new [`Codex`] and initialize the session. The first event on
    /// the returned queue is always `SessionConfigured`.
    pub async fn spawn(
        config: Config,
        client: Arc<dyn ModelClient>,
        mcp_clients: HashMap<String, Arc<dyn McpClient>>,
        initial_history: InitialHistory,
    ) -> CodexResult<CodexSpawnOk> {
        let (tx_sub, rx_sub) = async_channel::bounded(SUBMISSION_CHANNEL_CAPACITY);
        let (tx_event, rx_event) = async_channel::unbounded();

        let session = Session::new(&config, client, mcp_clients, tx_event, initial_history)
            .await
            .inspect_err(|e| error!("Failed to create session: {e:#}"))?;
        let conversation_id = session.conversation_id;

        // This task will run until Op::Shutdown is received.
        tokio::spawn(submission_loop(session, rx_sub));

        let codex = Codex {
            next_id: AtomicU64::new(0),
            tx_sub,
            rx_event,
        };
        Ok(CodexSpawnOk {
            codex,
            conversation_id,
        })
    }

    /// Submit the `op` wrapped in a `Submission` with a unique ID.
    pub async fn submit(&self, op: Op) -> CodexResult<String> {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            .to_string();
        let sub = Submission { id: id.clone(), op };
        self.submit_with_id(sub).await?;
        Ok(id)
    }

    /// Use sparingly: prefer `submit()` so Codex is responsible for generating
    /// unique IDs for each submission.
    pub async fn submit_with_id(&self, sub: Submission) -> CodexResult<()> {
        self.tx_sub
            .send(sub)
            .await
            .map_err(|_| CodexErr::InternalAgentDied)?;
        Ok(())
    }

    pub async fn next_event(&self) -> CodexResult<Event> {
        let event = self
            .rx_event
            .recv()
            .await
            .map_err(|_| CodexErr::InternalAgentDied)?;
        Ok(event)
    }
}

/// Long-lived state of one conversation. Only the submission loop and the
/// single active turn touch it.
pub(crate) struct Session {
    conversation_id: ConversationId,
    tx_event: Sender<Event>,
    client: Arc<dyn ModelClient>,
    mcp_connection_manager: McpConnectionManager,
    unified_exec_manager: UnifiedExecSessionManager,
    rollout: Mutex<Option<RolloutRecorder>>,
    stream_max_retries: u64,
    /// Never held across an await point.
    state: Mutex<SessionState>,
}

enum TaskKind {
    Regular(Vec<InputItem>),
    Compact,
}

impl Session {
    async fn new(
        config: &Config,
        client: Arc<dyn ModelClient>,
        mcp_clients: HashMap<String, Arc<dyn McpClient>>,
        tx_event: Sender<Event>,
        initial_history: InitialHistory,
    ) -> CodexResult<Arc<Self>> {
        let (conversation_id, rollout_params) = match &initial_history {
            InitialHistory::New | InitialHistory::Forked(_) => {
                let conversation_id = ConversationId::new();
                (
                    conversation_id,
                    RolloutRecorderParams::new(conversation_id, config.base_instructions.clone()),
                )
            }
            InitialHistory::Resumed(resumed) => (
                resumed.conversation_id,
                RolloutRecorderParams::resume(resumed.rollout_path.clone()),
            ),
        };

        let (rollout, (mcp_connection_manager, mcp_start_errors)) = tokio::join!(
            RolloutRecorder::new(config, rollout_params),
            McpConnectionManager::new(mcp_clients, &config.mcp_servers),
        );
        let rollout = rollout.inspect_err(|e| error!("failed to initialize rollout recorder: {e:#}"))?;
        let rollout_path = rollout.rollout_path().to_path_buf();

        let rollout_items = initial_history.get_rollout_items();
        let mut state = SessionState::new(TurnContext::from_config(config));
        state
            .history
            .replace(compact::reconstruct_history(&rollout_items));

        if let InitialHistory::Forked(items) = &initial_history {
            rollout.record_items(items).await?;
        }

        let session = Arc::new(Self {
            conversation_id,
            tx_event,
            client,
            mcp_connection_manager,
            unified_exec_manager: UnifiedExecSessionManager::default(),
            rollout: Mutex::new(Some(rollout)),
            stream_max_retries: config.stream_max_retries,
            state: Mutex::new(state),
        });

        session
            .send_event(Event {
                id: INITIAL_SUBMIT_ID.to_string(),
                msg: EventMsg::SessionConfigured(SessionConfiguredEvent {
                    session_id: conversation_id,
                    model: config.model.clone(),
                    reasoning_effort: config.model_reasoning_effort,
                    initial_messages: initial_history.get_event_msgs(),
                    rollout_path,
                }),
            })
            .await;
        for (server_name, err) in mcp_start_errors {
            session
                .send_event(Event {
                    id: INITIAL_SUBMIT_ID.to_string(),
                    msg: EventMsg::Error(ErrorEvent {
                        message: format!("MCP client for `{server_name}` failed to start: {err:#}"),
                    }),
                })
                .await;
        }
        info!(%conversation_id, "session configured");
        Ok(session)
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn rollout(&self) -> Option<RolloutRecorder> {
        self.rollout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn client(&self) -> &Arc<dyn ModelClient> {
        &self.client
    }

    pub(crate) fn stream_max_retries(&self) -> u64 {
        self.stream_max_retries
    }

    pub(crate) fn tx_event(&self) -> Sender<Event> {
        self.tx_event.clone()
    }

    pub(crate) fn mcp_connection_manager(&self) -> &McpConnectionManager {
        &self.mcp_connection_manager
    }

    pub(crate) fn unified_exec_manager(&self) -> &UnifiedExecSessionManager {
        &self.unified_exec_manager
    }

    /// Persists the event when its kind belongs in the rollout, then
    /// delivers it.
    pub(crate) async fn send_event(&self, event: Event) {
        if is_persisted_event_msg(&event.msg) {
            self.persist_rollout_items(&[RolloutItem::EventMsg(event.msg.clone())])
                .await;
        }
        if let Err(e) = self.tx_event.send(event).await {
            error!("failed to send event: {e}");
        }
    }

    async fn send_msg(&self, sub_id: &str, msg: EventMsg) {
        self.send_event(Event {
            id: sub_id.to_string(),
            msg,
        })
        .await;
    }

    /// Best-effort append for items whose loss does not invalidate a turn.
    async fn persist_rollout_items(&self, items: &[RolloutItem]) {
        if let Some(rollout) = self.rollout()
            && let Err(e) = rollout.record_items(items).await
        {
            warn!("failed to record rollout items: {e:#}");
        }
    }

    /// Appends a finished turn's items to the log and then to the in-memory
    /// transcript. If the log write fails the transcript is left alone.
    async fn commit_turn_items(&self, items: &[ResponseItem]) -> CodexResult<()> {
        if let Some(rollout) = self.rollout() {
            let rollout_items: Vec<RolloutItem> = items
                .iter()
                .cloned()
                .map(RolloutItem::ResponseItem)
                .collect();
            rollout.record_items(&rollout_items).await?;
        }
        self.state().history.record_items(items);
        Ok(())
    }

    pub(crate) fn history_snapshot(&self) -> Vec<ResponseItem> {
        self.state().history.contents()
    }

    pub(crate) fn user_messages(&self) -> Vec<String> {
        self.state().history.user_messages()
    }

    /// Swaps the transcript for a compacted one, logging the compaction
    /// first.
    pub(crate) async fn replace_history(
        &self,
        items: Vec<ResponseItem>,
        compacted: CompactedItem,
    ) -> CodexResult<()> {
        if let Some(rollout) = self.rollout() {
            rollout
                .record_items(&[RolloutItem::Compacted(compacted)])
                .await?;
        }
        self.state().history.replace(items);
        Ok(())
    }

    pub(crate) async fn approved_fingerprints(&self) -> HashSet<String> {
        self.state().approvals.snapshot()
    }

    pub(crate) async fn remember_approval(&self, fingerprint: String) {
        debug!(%fingerprint, "caching approval");
        self.state().approvals.insert(fingerprint);
    }

    fn turn_defaults(&self) -> TurnContext {
        self.state().turn_defaults.clone()
    }

    fn override_turn_defaults(&self, overrides: &TurnOverrides) -> TurnContext {
        let mut state = self.state();
        let next = state.turn_defaults.with_overrides(overrides);
        state.turn_defaults = next.clone();
        next
    }

    /// Emits an approval request for a command and waits for the caller's
    /// decision. Cancelling the turn resolves the wait with `Abort`.
    pub(crate) async fn request_command_approval(
        &self,
        sub_id: &str,
        call_id: &str,
        command: Vec<String>,
        cwd: PathBuf,
        reason: Option<String>,
        cancellation: &TurnCancellation,
    ) -> ReviewDecision {
        let (request_id, rx) = self.register_pending_approval(call_id);
        self.send_msg(
            sub_id,
            EventMsg::ExecApprovalRequest(ExecApprovalRequestEvent {
                request_id: request_id.clone(),
                call_id: call_id.to_string(),
                command,
                cwd,
                reason,
            }),
        )
        .await;
        self.await_decision(&request_id, rx, cancellation).await
    }

    pub(crate) async fn request_patch_approval(
        &self,
        sub_id: &str,
        call_id: &str,
        changes: HashMap<PathBuf, FileChange>,
        reason: Option<String>,
        cancellation: &TurnCancellation,
    ) -> ReviewDecision {
        let (request_id, rx) = self.register_pending_approval(call_id);
        self.send_msg(
            sub_id,
            EventMsg::ApplyPatchApprovalRequest(ApplyPatchApprovalRequestEvent {
                request_id: request_id.clone(),
                call_id: call_id.to_string(),
                changes,
                reason,
            }),
        )
        .await;
        self.await_decision(&request_id, rx, cancellation).await
    }

    fn register_pending_approval(
        &self,
        call_id: &str,
    ) -> (String, oneshot::Receiver<ReviewDecision>) {
        let (tx, rx) = oneshot::channel();
        let request_id = call_id.to_string();
        let prev = self
            .state()
            .pending_approvals
            .insert(request_id.clone(), tx);
        if prev.is_some() {
            warn!("Overwriting existing pending approval for request_id: {request_id}");
        }
        (request_id, rx)
    }

    async fn await_decision(
        &self,
        request_id: &str,
        rx: oneshot::Receiver<ReviewDecision>,
        cancellation: &TurnCancellation,
    ) -> ReviewDecision {
        tokio::select! {
            decision = rx => decision.unwrap_or(ReviewDecision::Abort),
            _ = cancellation.cancelled() => {
                self.state().pending_approvals.remove(request_id);
                ReviewDecision::Abort
            }
        }
    }

    fn notify_approval(&self, request_id: &str, decision: ReviewDecision) {
        let tx = self.state().pending_approvals.remove(request_id);
        match tx {
            Some(tx) => {
                debug!(%request_id, %decision, "approval decision received");
                if tx.send(decision).is_err() {
                    warn!("approval for {request_id} arrived after its action finished");
                }
            }
            None => warn!("No pending approval found for request_id: {request_id}"),
        }
    }

    pub(crate) async fn on_exec_command_begin(
        &self,
        sub_id: &str,
        call_id: &str,
        command: &[String],
        cwd: &Path,
    ) {
        self.send_msg(
            sub_id,
            EventMsg::ExecCommandBegin(ExecCommandBeginEvent {
                call_id: call_id.to_string(),
                command: command.to_vec(),
                cwd: cwd.to_path_buf(),
            }),
        )
        .await;
    }

    pub(crate) async fn on_exec_command_end(
        &self,
        sub_id: &str,
        call_id: &str,
        output: &ExecToolCallOutput,
        sandbox_denied: bool,
    ) {
        let status = if output.timed_out {
            ExecExitStatus::TimedOut
        } else {
            ExecExitStatus::Exited {
                code: output.exit_code,
            }
        };
        self.send_msg(
            sub_id,
            EventMsg::ExecCommandEnd(ExecCommandEndEvent {
                call_id: call_id.to_string(),
                stdout: output.stdout.text.clone(),
                stderr: output.stderr.text.clone(),
                aggregated_output: output.aggregated_output.text.clone(),
                exit_code: output.exit_code,
                status,
                sandbox_denied,
                duration: output.duration,
                formatted_output: format_exec_output_str(output),
            }),
        )
        .await;
    }

    pub(crate) async fn update_token_usage(&self, sub_id: &str, usage: &Option<TokenUsage>) {
        let info = {
            let mut state = self.state();
            state.token_info = TokenUsageInfo::new_or_append(&state.token_info, usage);
            state.token_info.clone()
        };
        self.send_msg(sub_id, EventMsg::TokenCount(TokenCountEvent { info }))
            .await;
    }

    pub(crate) async fn notify_stream_error(&self, sub_id: &str, message: String) {
        self.send_msg(sub_id, EventMsg::StreamError(StreamErrorEvent { message }))
            .await;
    }

    pub(crate) async fn notify_error(&self, sub_id: &str, err: &CodexErr) {
        self.send_msg(
            sub_id,
            EventMsg::Error(ErrorEvent {
                message: get_error_message_ui(err),
            }),
        )
        .await;
    }

    /// Replaces any active turn with a new task. The task is registered
    /// before it can observe the state, so it always finds itself there.
    async fn spawn_task(self: &Arc<Self>, sub_id: String, turn: TurnContext, kind: TaskKind) {
        self.abort_active_turn(TurnAbortReason::Replaced).await;

        let cancellation = TurnCancellation::new();
        let mut state = self.state();
        let handle = tokio::spawn({
            let sess = Arc::clone(self);
            let sub_id = sub_id.clone();
            let cancellation = cancellation.clone();
            async move {
                match kind {
                    TaskKind::Regular(input) => {
                        run_task(sess, turn, sub_id, input, cancellation).await
                    }
                    TaskKind::Compact => {
                        compact::run_compact_task(sess, turn, sub_id, cancellation).await
                    }
                }
            }
        });
        state.active_turn = Some(ActiveTurn {
            sub_id,
            cancellation,
            handle,
        });
    }

    /// Called by a task as it finishes, before its final event goes out.
    pub(crate) fn remove_task(&self, sub_id: &str) {
        let mut state = self.state();
        if state
            .active_turn
            .as_ref()
            .is_some_and(|turn| turn.sub_id == sub_id)
        {
            state.take_active_turn();
        }
    }

    /// Cancels the active turn and waits for it to emit `TurnAborted`. A
    /// turn that does not wind down within the grace period is torn down
    /// and the event is emitted on its behalf.
    async fn abort_active_turn(&self, reason: TurnAbortReason) {
        let Some(ActiveTurn {
            sub_id,
            cancellation,
            mut handle,
        }) = self.state().take_active_turn()
        else {
            return;
        };
        debug!(%sub_id, ?reason, "aborting active turn");
        cancellation.abort(reason);

        match tokio::time::timeout(TURN_ABORT_GRACE, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%sub_id, "turn task failed: {err}");
                self.send_turn_aborted(&sub_id, cancellation.reason()).await;
            }
            Err(_) => {
                warn!(%sub_id, "turn did not stop within {TURN_ABORT_GRACE:?}; tearing it down");
                handle.abort();
                self.send_turn_aborted(&sub_id, cancellation.reason()).await;
            }
        }
    }

    pub(crate) async fn send_turn_aborted(&self, sub_id: &str, reason: TurnAbortReason) {
        self.send_msg(sub_id, EventMsg::TurnAborted(TurnAbortedEvent { reason }))
            .await;
    }

    async fn shutdown(&self) {
        self.abort_active_turn(TurnAbortReason::Interrupted).await;
        let rollout = self
            .rollout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(rollout) = rollout
            && let Err(e) = rollout.shutdown().await
        {
            warn!("failed to shut down rollout recorder: {e}");
            self.send_msg(
                INITIAL_SUBMIT_ID,
                EventMsg::Error(ErrorEvent {
                    message: "Failed to shutdown rollout recorder".to_string(),
                }),
            )
            .await;
        }
    }
}

async fn submission_loop(sess: Arc<Session>, rx_sub: Receiver<Submission>) {
    while let Ok(sub) = rx_sub.recv().await {
        debug!(?sub, "Submission");
        match sub.op {
            Op::Interrupt => {
                sess.abort_active_turn(TurnAbortReason::Interrupted).await;
            }
            Op::UserInput { items } => {
                let turn = sess.turn_defaults();
                sess.spawn_task(sub.id, turn, TaskKind::Regular(items)).await;
            }
            Op::UserTurn { items, overrides } => {
                let turn = sess.override_turn_defaults(&overrides);
                sess.spawn_task(sub.id, turn, TaskKind::Regular(items)).await;
            }
            Op::OverrideTurnContext { overrides } => {
                sess.override_turn_defaults(&overrides);
            }
            Op::ApprovalDecision {
                request_id,
                decision,
            } => {
                sess.notify_approval(&request_id, decision);
            }
            Op::ListTools => {
                let turn = sess.turn_defaults();
                let mcp_tools = sess.mcp_connection_manager.list_all_tools();
                let router = ToolRouter::from_config(&turn.tools_config, Some(&mcp_tools));
                sess.send_msg(
                    &sub.id,
                    EventMsg::ListToolsResponse(ListToolsResponseEvent {
                        tools: router.listed_tools(),
                    }),
                )
                .await;
            }
            Op::Compact => {
                let turn = sess.turn_defaults();
                sess.spawn_task(sub.id, turn, TaskKind::Compact).await;
            }
            Op::Shutdown => {
                info!("Shutting down Codex instance");
                sess.shutdown().await;
                sess.send_msg(&sub.id, EventMsg::ShutdownComplete).await;
                break;
            }
        }
    }
    debug!("Agent loop exited");
}

/// Runs one user turn: sample the model, run the tools it asks for, and
/// sample again until it answers without tool calls.
async fn run_task(
    sess: Arc<Session>,
    turn: TurnContext,
    sub_id: String,
    input: Vec<InputItem>,
    cancellation: TurnCancellation,
) {
    sess.send_msg(
        &sub_id,
        EventMsg::TaskStarted(TaskStartedEvent {
            model: turn.model.clone(),
        }),
    )
    .await;

    if let Err(e) = turn.validate() {
        warn!(%sub_id, "rejecting turn: {e}");
        sess.remove_task(&sub_id);
        sess.notify_error(&sub_id, &e).await;
        sess.send_msg(
            &sub_id,
            EventMsg::TaskComplete(TaskCompleteEvent {
                last_agent_message: None,
            }),
        )
        .await;
        return;
    }

    let initial_input: ResponseItem = ResponseInputItem::from(input).into();
    if let ResponseItem::Message { content, .. } = &initial_input {
        sess.send_msg(
            &sub_id,
            EventMsg::UserMessage(UserMessageEvent {
                message: content_text(content),
            }),
        )
        .await;
    }
    sess.persist_rollout_items(&[RolloutItem::TurnContext(turn.to_turn_context_item())])
        .await;

    let mcp_tools = sess.mcp_connection_manager.list_all_tools();
    let router = ToolRouter::from_config(&turn.tools_config, Some(&mcp_tools));
    let mut tracker = TurnDiffTracker::new();
    let mut turn_state = TurnState::default();
    turn_state.push(initial_input);

    let result = loop {
        let mut prompt_input = sess.history_snapshot();
        prompt_input.extend(turn_state.items().iter().cloned());
        trace!(%sub_id, items = prompt_input.len(), "sampling");

        match run_turn(
            &sess,
            &turn,
            &router,
            &mut tracker,
            &mut turn_state,
            &sub_id,
            &cancellation,
            prompt_input,
        )
        .await
        {
            Ok(true) => continue,
            Ok(false) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    match result {
        Ok(()) => {
            let items = turn_state.take();
            let last_agent_message = last_assistant_message(&items);
            if let Err(e) = sess.commit_turn_items(&items).await {
                error!(%sub_id, "failed to record turn: {e:#}");
                sess.remove_task(&sub_id);
                sess.notify_error(&sub_id, &e).await;
                sess.send_msg(
                    &sub_id,
                    EventMsg::TaskComplete(TaskCompleteEvent {
                        last_agent_message: None,
                    }),
                )
                .await;
                return;
            }
            sess.remove_task(&sub_id);
            sess.send_msg(
                &sub_id,
                EventMsg::TaskComplete(TaskCompleteEvent { last_agent_message }),
            )
            .await;
        }
        Err(CodexErr::TurnAborted) => {
            let items = take_partial_items(&mut turn_state);
            if let Err(e) = sess.commit_turn_items(&items).await {
                warn!(%sub_id, "failed to record aborted turn: {e:#}");
            }
            sess.remove_task(&sub_id);
            sess.send_turn_aborted(&sub_id, cancellation.reason()).await;
        }
        Err(e) => {
            info!(%sub_id, "turn failed: {e:#}");
            let items = take_partial_items(&mut turn_state);
            if let Err(e) = sess.commit_turn_items(&items).await {
                warn!(%sub_id, "failed to record failed turn: {e:#}");
            }
            sess.remove_task(&sub_id);
            sess.notify_error(&sub_id, &e).await;
            sess.send_msg(
                &sub_id,
                EventMsg::TaskComplete(TaskCompleteEvent {
                    last_agent_message: None,
                }),
            )
            .await;
        }
    }
}

/// Samples the model once, retrying transport failures. Returns whether the
/// model issued tool calls and so needs another round.
#[allow(clippy::too_many_arguments)]
async fn run_turn(
    sess: &Session,
    turn: &TurnContext,
    router: &ToolRouter,
    tracker: &mut TurnDiffTracker,
    turn_state: &mut TurnState,
    sub_id: &str,
    cancellation: &TurnCancellation,
    input: Vec<ResponseItem>,
) -> CodexResult<bool> {
    let prompt = Prompt {
        input,
        tools: router.specs().to_vec(),
        base_instructions_override: turn.base_instructions.clone(),
        model: turn.model.clone(),
        effort: turn.effort,
        summary: turn.summary,
    };

    let mut retries = 0;
    loop {
        let checkpoint = turn_state.len();
        match try_run_turn(
            sess,
            turn,
            router,
            tracker,
            turn_state,
            sub_id,
            cancellation,
            &prompt,
        )
        .await
        {
            Ok(needs_follow_up) => return Ok(needs_follow_up),
            Err(e) if e.is_retryable() => {
                turn_state.truncate(checkpoint);
                retries += 1;
                wait_before_retry(sess, sub_id, cancellation, retries, e).await?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleeps before retry number `retries`, telling the caller why. Fails with
/// `RetryLimit` once the budget is spent, or `TurnAborted` if the turn is
/// cancelled while waiting.
pub(crate) async fn wait_before_retry(
    sess: &Session,
    sub_id: &str,
    cancellation: &TurnCancellation,
    retries: u64,
    err: CodexErr,
) -> CodexResult<()> {
    let max_retries = sess.stream_max_retries();
    if retries > max_retries {
        return Err(CodexErr::RetryLimit(err.to_string()));
    }
    let delay = match err {
        CodexErr::Stream(_, Some(delay)) => delay,
        _ => backoff(retries),
    };
    warn!("stream disconnected - retrying turn ({retries}/{max_retries} in {delay:?})...");
    sess.notify_stream_error(
        sub_id,
        format!("stream error: {err}; retrying {retries}/{max_retries} in {delay:?}"),
    )
    .await;
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancellation.cancelled() => Err(CodexErr::TurnAborted),
    }
}

#[allow(clippy::too_many_arguments)]
async fn try_run_turn(
    sess: &Session,
    turn: &TurnContext,
    router: &ToolRouter,
    tracker: &mut TurnDiffTracker,
    turn_state: &mut TurnState,
    sub_id: &str,
    cancellation: &TurnCancellation,
    prompt: &Prompt,
) -> CodexResult<bool> {
    let mut stream = tokio::select! {
        stream = sess.client.stream(prompt) => stream?,
        _ = cancellation.cancelled() => return Err(CodexErr::TurnAborted),
    };

    let mut needs_follow_up = false;
    loop {
        let event = tokio::select! {
            event = stream.next() => event,
            _ = cancellation.cancelled() => return Err(CodexErr::TurnAborted),
        };
        let Some(event) = event else {
            return Err(CodexErr::Stream(
                "stream closed before response.completed".to_string(),
                None,
            ));
        };

        match event? {
            ResponseEvent::Created => {}
            ResponseEvent::OutputItemDone(item) => {
                match router.build_tool_call(item.clone()) {
                    Ok(Some(call)) => {
                        debug!(%sub_id, tool = %call.tool_name, call_id = %call.call_id, "tool call");
                        turn_state.push(item);
                        let response = router
                            .dispatch_tool_call(sess, turn, tracker, cancellation, sub_id, call)
                            .await
                            .map_err(|err| match err {
                                FunctionCallError::Fatal(message) => CodexErr::Fatal(message),
                                other => CodexErr::Fatal(other.to_string()),
                            })?;
                        turn_state.push(ResponseItem::from(response));
                        needs_follow_up = true;
                        if cancellation.is_cancelled() {
                            return Err(CodexErr::TurnAborted);
                        }
                    }
                    Ok(None) => {
                        for msg in item_events(&item) {
                            sess.send_msg(sub_id, msg).await;
                        }
                        if is_assistant_message(&item) {
                            turn_state.clear_partial();
                        }
                        turn_state.push(item);
                    }
                    Err(err) => {
                        // The call cannot be answered by id; tell the model
                        // so it can reissue it.
                        warn!(%sub_id, "malformed tool call: {err}");
                        turn_state.push(item);
                        turn_state.push(ResponseItem::FunctionCallOutput {
                            call_id: String::new(),
                            output: FunctionCallOutputPayload::failure(err.to_string()),
                        });
                        needs_follow_up = true;
                    }
                }
            }
            ResponseEvent::Completed {
                response_id,
                token_usage,
            } => {
                trace!(%sub_id, %response_id, "response completed");
                sess.update_token_usage(sub_id, &token_usage).await;
                return Ok(needs_follow_up);
            }
            ResponseEvent::OutputTextDelta(delta) => {
                turn_state.push_delta(&delta);
                sess.send_msg(
                    sub_id,
                    EventMsg::AgentMessageDelta(AgentMessageDeltaEvent { delta }),
                )
                .await;
            }
            ResponseEvent::ReasoningSummaryDelta(delta) => {
                sess.send_msg(
                    sub_id,
                    EventMsg::AgentReasoningDelta(AgentReasoningDeltaEvent { delta }),
                )
                .await;
            }
            ResponseEvent::ReasoningContentDelta(delta) => {
                sess.send_msg(
                    sub_id,
                    EventMsg::AgentReasoningRawContentDelta(AgentReasoningRawContentDeltaEvent {
                        delta,
                    }),
                )
                .await;
            }
        }
    }
}

fn is_assistant_message(item: &ResponseItem) -> bool {
    matches!(item, ResponseItem::Message { role, .. } if role == "assistant")
}

/// Events announcing a completed, non-tool output item.
fn item_events(item: &ResponseItem) -> Vec<EventMsg> {
    match item {
        ResponseItem::Message { role, content, .. } if role == "assistant" => {
            vec![EventMsg::AgentMessage(AgentMessageEvent {
                message: content_text(content),
            })]
        }
        ResponseItem::Reasoning { summary, .. } => summary
            .iter()
            .map(|ReasoningItemReasoningSummary::SummaryText { text }| {
                EventMsg::AgentReasoning(AgentReasoningEvent { text: text.clone() })
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// What an interrupted or failed turn leaves behind: everything it
/// produced, the streamed text of an unfinished answer, and a synthetic
/// output for each call that never got one.
fn take_partial_items(turn_state: &mut TurnState) -> Vec<ResponseItem> {
    let partial = turn_state.take_partial_message();
    let mut items = turn_state.take();
    pair_unanswered_calls(&mut items);
    if let Some(text) = partial {
        items.push(ResponseItem::Message {
            id: None,
            role: "assistant".to_string(),
            content: vec![ContentItem::OutputText { text }],
        });
    }
    items
}

pub(crate) fn last_assistant_message(items: &[ResponseItem]) -> Option<String> {
    items.iter().rev().find_map(|item| match item {
        ResponseItem::Message { role, content, .. } if role == "assistant" => {
            Some(content_text(content))
        }
        _ => None,
    })
}
