//! Defines the protocol between a front-end and the agent engine.
//!
//! Uses a SQ (Submission Queue) / EQ (Event Queue) pattern to asynchronously
//! communicate between user and agent.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde_with::serde_as;
use strum_macros::Display;

use crate::ConversationId;
use crate::config_types::ReasoningEffort as ReasoningEffortConfig;
use crate::config_types::ReasoningSummary as ReasoningSummaryConfig;
use crate::config_types::ToolToggles;
use crate::mcp::CallToolResult;
use crate::models::ContentItem;
use crate::models::ResponseItem;
use crate::plan_tool::UpdatePlanArgs;

pub const ENVIRONMENT_CONTEXT_OPEN_TAG: &str = "<environment_context>";
pub const ENVIRONMENT_CONTEXT_CLOSE_TAG: &str = "</environment_context>";
pub const USER_INSTRUCTIONS_OPEN_TAG: &str = "<user_instructions>";

/// Submission Queue Entry - requests from user
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Submission {
    /// Unique id for this Submission to correlate with Events
    pub id: String,
    /// Payload
    pub op: Op,
}

/// Submission operation
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(clippy::large_enum_variant)]
pub enum Op {
    /// Abort the active turn. Answered with [`EventMsg::TurnAborted`].
    Interrupt,

    /// Start a turn with the session's current turn defaults.
    UserInput { items: Vec<InputItem> },

    /// Start a turn after applying `overrides` to the session defaults. The
    /// overrides persist for later turns.
    UserTurn {
        items: Vec<InputItem>,
        #[serde(default)]
        overrides: TurnOverrides,
    },

    /// Update the session's turn defaults without starting a turn.
    OverrideTurnContext {
        #[serde(default)]
        overrides: TurnOverrides,
    },

    /// Answer a pending [`EventMsg::ExecApprovalRequest`] or
    /// [`EventMsg::ApplyPatchApprovalRequest`].
    ApprovalDecision {
        request_id: String,
        #[serde(alias = "approved")]
        decision: ReviewDecision,
    },

    /// Reply is delivered via [`EventMsg::ListToolsResponse`].
    ListTools,

    /// Summarize the conversation so far and replace the transcript with the
    /// summary.
    Compact,

    /// Request to shut down the engine.
    Shutdown,
}

/// Partial turn configuration. `None` leaves the current value unchanged.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct TurnOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<AskForApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_policy: Option<SandboxPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffortConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ReasoningSummaryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolToggles>,
    /// Default per-command timeout for shell-family tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_timeout_ms: Option<u64>,
}

impl TurnOverrides {
    pub fn is_empty(&self) -> bool {
        self == &TurnOverrides::default()
    }
}

/// Determines the conditions under which the user is consulted to approve
/// running the command proposed by the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum AskForApproval {
    /// Only known-safe, read-only commands are auto-approved. Everything else
    /// asks the user.
    #[serde(alias = "untrusted")]
    UnlessTrusted,

    /// Commands run inside the sandbox without asking. If a sandboxed run
    /// fails, the user is asked whether to retry without the sandbox.
    OnFailure,

    /// The model decides when to ask the user for approval.
    #[default]
    OnRequest,

    /// Never ask the user. Anything that is not auto-approved is rejected
    /// and the rejection is returned to the model.
    Never,
}

/// Determines execution restrictions for model shell commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "kebab-case")]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum SandboxPolicy {
    /// No restrictions whatsoever. Use with caution.
    #[serde(alias = "danger-full-access")]
    NoRestriction,

    /// Read-only access to the entire file-system.
    ReadOnly,

    /// Same as `ReadOnly` but additionally grants write access to the current
    /// working directory ("workspace").
    WorkspaceWrite {
        /// Additional folders (beyond cwd and possibly TMPDIR) that should be
        /// writable from within the sandbox.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        writable_roots: Vec<PathBuf>,

        /// When set to `true`, outbound network access is allowed.
        #[serde(default, alias = "allow_network")]
        network_access: bool,

        /// When set to `true`, `$TMPDIR` is not a writable root.
        #[serde(default)]
        exclude_tmpdir_env_var: bool,

        /// When set to `true`, `/tmp` is not a writable root.
        #[serde(default)]
        exclude_slash_tmp: bool,
    },
}

/// A writable root path accompanied by a list of subpaths that should remain
/// read-only even when the root is writable. Top-level VCS metadata
/// directories (e.g. `.git`) under a writable root land here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritableRoot {
    /// Absolute path, by construction.
    pub root: PathBuf,

    /// Also absolute paths, by construction.
    pub read_only_subpaths: Vec<PathBuf>,
}

impl WritableRoot {
    pub fn is_path_writable(&self, path: &Path) -> bool {
        if !path.starts_with(&self.root) {
            return false;
        }

        !self
            .read_only_subpaths
            .iter()
            .any(|subpath| path.starts_with(subpath))
    }
}

impl FromStr for SandboxPolicy {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

/// VCS metadata entries forced read-only under each writable root, whether
/// or not they exist yet.
const PROTECTED_METADATA_DIRS: &[&str] = &[".git"];

impl SandboxPolicy {
    /// Returns a policy with read-only disk access and no network.
    pub fn new_read_only_policy() -> Self {
        SandboxPolicy::ReadOnly
    }

    /// Returns a policy that can read the entire disk, but can only write to
    /// the current working directory and the temp dirs. It does not allow
    /// network access.
    pub fn new_workspace_write_policy() -> Self {
        SandboxPolicy::WorkspaceWrite {
            writable_roots: vec![],
            network_access: false,
            exclude_tmpdir_env_var: false,
            exclude_slash_tmp: false,
        }
    }

    /// Always returns `true`; restricting read access is not supported.
    pub fn has_full_disk_read_access(&self) -> bool {
        true
    }

    pub fn has_full_disk_write_access(&self) -> bool {
        match self {
            SandboxPolicy::NoRestriction => true,
            SandboxPolicy::ReadOnly => false,
            SandboxPolicy::WorkspaceWrite { .. } => false,
        }
    }

    pub fn has_full_network_access(&self) -> bool {
        match self {
            SandboxPolicy::NoRestriction => true,
            SandboxPolicy::ReadOnly => false,
            SandboxPolicy::WorkspaceWrite { network_access, .. } => *network_access,
        }
    }

    /// Configured roots that must be absolute. Used for turn validation.
    pub fn configured_writable_roots(&self) -> &[PathBuf] {
        match self {
            SandboxPolicy::WorkspaceWrite { writable_roots, .. } => writable_roots,
            _ => &[],
        }
    }

    /// Returns the list of writable roots (tailored to the current working
    /// directory) together with subpaths that should remain read-only under
    /// each writable root.
    pub fn get_writable_roots_with_cwd(&self, cwd: &Path) -> Vec<WritableRoot> {
        match self {
            SandboxPolicy::NoRestriction => Vec::new(),
            SandboxPolicy::ReadOnly => Vec::new(),
            SandboxPolicy::WorkspaceWrite {
                writable_roots,
                exclude_tmpdir_env_var,
                exclude_slash_tmp,
                network_access: _,
            } => {
                let mut roots: Vec<PathBuf> = writable_roots.clone();
                roots.push(cwd.to_path_buf());

                if cfg!(unix) && !exclude_slash_tmp {
                    let slash_tmp = PathBuf::from("/tmp");
                    if slash_tmp.is_dir() {
                        roots.push(slash_tmp);
                    }
                }

                // TMPDIR is per-user on macOS; on Linux it is an opt-in way to
                // hand the model a scratch directory.
                if !exclude_tmpdir_env_var
                    && let Some(tmpdir) = std::env::var_os("TMPDIR")
                    && !tmpdir.is_empty()
                {
                    roots.push(PathBuf::from(tmpdir));
                }

                roots.dedup();
                roots
                    .into_iter()
                    .map(|writable_root| {
                        let read_only_subpaths = PROTECTED_METADATA_DIRS
                            .iter()
                            .map(|name| writable_root.join(name))
                            .collect();
                        WritableRoot {
                            root: writable_root,
                            read_only_subpaths,
                        }
                    })
                    .collect()
            }
        }
    }

    /// True when `path` may be written under this policy.
    pub fn is_path_writable(&self, path: &Path, cwd: &Path) -> bool {
        if self.has_full_disk_write_access() {
            return true;
        }
        self.get_writable_roots_with_cwd(cwd)
            .iter()
            .any(|root| root.is_path_writable(path))
    }
}

/// User input
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputItem {
    Text {
        text: String,
    },
    /// Pre-encoded data: URI image.
    Image {
        image_url: String,
    },
}

/// Event Queue Entry - events from agent
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Event {
    /// Submission `id` that this event is correlated with.
    pub id: String,
    /// Payload
    pub msg: EventMsg,
}

/// Response event from the agent
#[derive(Debug, Clone, Deserialize, Serialize, Display)]
#[serde(tag = "type", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventMsg {
    /// Error while executing a submission. Terminal for the turn it belongs to.
    Error(ErrorEvent),

    /// Agent has started a turn.
    TaskStarted(TaskStartedEvent),

    /// Agent has completed all actions of a turn.
    TaskComplete(TaskCompleteEvent),

    /// Usage update for the current session, including totals and last turn.
    TokenCount(TokenCountEvent),

    /// Agent text output message
    AgentMessage(AgentMessageEvent),

    /// User input as sent to the model.
    UserMessage(UserMessageEvent),

    /// Agent text output delta message
    AgentMessageDelta(AgentMessageDeltaEvent),

    /// Reasoning summary from agent.
    AgentReasoning(AgentReasoningEvent),

    /// Reasoning summary delta.
    AgentReasoningDelta(AgentReasoningDeltaEvent),

    /// Raw reasoning content delta.
    AgentReasoningRawContentDelta(AgentReasoningRawContentDeltaEvent),

    /// First event of every conversation.
    SessionConfigured(SessionConfiguredEvent),

    McpToolCallBegin(McpToolCallBeginEvent),

    McpToolCallEnd(McpToolCallEndEvent),

    /// Notification that the server is about to execute a command.
    ExecCommandBegin(ExecCommandBeginEvent),

    /// Incremental chunk of output from a running command.
    ExecCommandOutputDelta(ExecCommandOutputDeltaEvent),

    ExecCommandEnd(ExecCommandEndEvent),

    ExecApprovalRequest(ExecApprovalRequestEvent),

    ApplyPatchApprovalRequest(ApplyPatchApprovalRequestEvent),

    BackgroundEvent(BackgroundEventEvent),

    /// A model stream failed and is being retried with backoff.
    StreamError(StreamErrorEvent),

    /// Notification that the agent is about to apply a patch.
    PatchApplyBegin(PatchApplyBeginEvent),

    /// Notification that a patch application has finished.
    PatchApplyEnd(PatchApplyEndEvent),

    TurnDiff(TurnDiffEvent),

    /// Response to [`Op::ListTools`].
    ListToolsResponse(ListToolsResponseEvent),

    PlanUpdate(UpdatePlanArgs),

    TurnAborted(TurnAbortedEvent),

    /// Notification that the agent is shutting down.
    ShutdownComplete,
}

// Individual event payload types matching each `EventMsg` variant.

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskCompleteEvent {
    pub last_agent_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TaskStartedEvent {
    pub model: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }

    /// In-place element-wise sum of token counts.
    pub fn add_assign(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.cached_input_tokens += other.cached_input_tokens;
        self.output_tokens += other.output_tokens;
        self.reasoning_output_tokens += other.reasoning_output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct TokenUsageInfo {
    pub total_token_usage: TokenUsage,
    pub last_token_usage: TokenUsage,
}

impl TokenUsageInfo {
    pub fn new_or_append(info: &Option<TokenUsageInfo>, last: &Option<TokenUsage>) -> Option<Self> {
        if info.is_none() && last.is_none() {
            return None;
        }

        let mut info = info.clone().unwrap_or(Self {
            total_token_usage: TokenUsage::default(),
            last_token_usage: TokenUsage::default(),
        });
        if let Some(last) = last {
            info.total_token_usage.add_assign(last);
            info.last_token_usage = last.clone();
        }
        Some(info)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenCountEvent {
    pub info: Option<TokenUsageInfo>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentMessageEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessageEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentMessageDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentReasoningEvent {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentReasoningDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentReasoningRawContentDeltaEvent {
    pub delta: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct McpInvocation {
    /// Name of the external tool server.
    pub server: String,
    /// Name of the tool as given by the server.
    pub tool: String,
    /// Arguments to the tool call.
    pub arguments: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolCallBeginEvent {
    pub call_id: String,
    pub invocation: McpInvocation,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpToolCallEndEvent {
    pub call_id: String,
    pub invocation: McpInvocation,
    pub duration: Duration,
    /// Result of the tool call. Note this could be an error.
    pub result: Result<CallToolResult, String>,
}

impl McpToolCallEndEvent {
    pub fn is_success(&self) -> bool {
        match &self.result {
            Ok(result) => result.is_success(),
            Err(_) => false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResumedHistory {
    pub conversation_id: ConversationId,
    pub history: Vec<RolloutItem>,
    pub rollout_path: PathBuf,
}

/// Where a new session's history comes from.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub enum InitialHistory {
    New,
    Resumed(ResumedHistory),
    Forked(Vec<RolloutItem>),
}

impl InitialHistory {
    pub fn get_rollout_items(&self) -> Vec<RolloutItem> {
        match self {
            InitialHistory::New => Vec::new(),
            InitialHistory::Resumed(resumed) => resumed.history.clone(),
            InitialHistory::Forked(items) => items.clone(),
        }
    }

    pub fn get_event_msgs(&self) -> Option<Vec<EventMsg>> {
        let items = match self {
            InitialHistory::New => return None,
            InitialHistory::Resumed(resumed) => &resumed.history,
            InitialHistory::Forked(items) => items,
        };
        Some(
            items
                .iter()
                .filter_map(|ri| match ri {
                    RolloutItem::EventMsg(ev) => Some(ev.clone()),
                    _ => None,
                })
                .collect(),
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct SessionMeta {
    pub id: ConversationId,
    pub timestamp: String,
    pub cwd: PathBuf,
    pub originator: String,
    pub cli_version: String,
    pub instructions: Option<String>,
}

/// One entry of the rollout log.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RolloutItem {
    SessionMeta(SessionMeta),
    ResponseItem(ResponseItem),
    Compacted(CompactedItem),
    TurnContext(TurnContextItem),
    EventMsg(EventMsg),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CompactedItem {
    pub message: String,
}

impl From<CompactedItem> for ResponseItem {
    fn from(value: CompactedItem) -> Self {
        ResponseItem::Message {
            id: None,
            role: "assistant".to_string(),
            content: vec![ContentItem::OutputText {
                text: value.message,
            }],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TurnContextItem {
    pub cwd: PathBuf,
    pub approval_policy: AskForApproval,
    pub sandbox_policy: SandboxPolicy,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effort: Option<ReasoningEffortConfig>,
    pub summary: ReasoningSummaryConfig,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RolloutLine {
    pub timestamp: String,
    #[serde(flatten)]
    pub item: RolloutItem,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecCommandBeginEvent {
    /// Identifier so this can be paired with the ExecCommandEnd event.
    pub call_id: String,
    /// The command to be executed.
    pub command: Vec<String>,
    pub cwd: PathBuf,
}

/// How a command invocation ended, or that it is still running in a PTY
/// session.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecExitStatus {
    Exited { code: i32 },
    TimedOut,
    Ongoing { session_id: u32 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecCommandEndEvent {
    /// Identifier for the ExecCommandBegin that finished.
    pub call_id: String,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Captured aggregated output
    #[serde(default)]
    pub aggregated_output: String,
    /// The command's exit code.
    pub exit_code: i32,
    pub status: ExecExitStatus,
    /// Set when the failure was attributed to the sandbox. Best effort.
    #[serde(default)]
    pub sandbox_denied: bool,
    /// The duration of the command execution.
    pub duration: Duration,
    /// Formatted output from the command, as seen by the model.
    pub formatted_output: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecOutputStream {
    Stdout,
    Stderr,
}

#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ExecCommandOutputDeltaEvent {
    /// Identifier for the ExecCommandBegin that produced this chunk.
    pub call_id: String,
    /// Which stream produced this chunk.
    pub stream: ExecOutputStream,
    /// Raw bytes from the stream (may not be valid UTF-8).
    #[serde_as(as = "serde_with::base64::Base64")]
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecApprovalRequestEvent {
    /// Echo this back in [`Op::ApprovalDecision`].
    pub request_id: String,
    pub call_id: String,
    /// The command to be executed.
    pub command: Vec<String>,
    /// The command's working directory.
    pub cwd: PathBuf,
    /// Optional human-readable reason for the approval (e.g. retry without sandbox).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApplyPatchApprovalRequestEvent {
    /// Echo this back in [`Op::ApprovalDecision`].
    pub request_id: String,
    pub call_id: String,
    pub changes: HashMap<PathBuf, FileChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackgroundEventEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamErrorEvent {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatchApplyBeginEvent {
    /// Identifier so this can be paired with the PatchApplyEnd event.
    pub call_id: String,
    /// If true, there was no ApplyPatchApprovalRequest for this patch.
    pub auto_approved: bool,
    /// The changes to be applied.
    pub changes: HashMap<PathBuf, FileChange>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatchApplyEndEvent {
    /// Identifier for the PatchApplyBegin that finished.
    pub call_id: String,
    /// Summary of the applied changes.
    pub stdout: String,
    /// Parser errors, IO failures, etc.
    pub stderr: String,
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TurnDiffEvent {
    pub unified_diff: String,
}

/// A tool the next turn would offer to the model.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ListedTool {
    pub name: String,
    pub description: String,
    /// Set for tools served by an external tool server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListToolsResponseEvent {
    pub tools: Vec<ListedTool>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct SessionConfiguredEvent {
    pub session_id: ConversationId,

    /// Tell the client what model is being queried.
    pub model: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffortConfig>,

    /// Events replayed from a resumed or forked rollout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_messages: Option<Vec<EventMsg>>,

    pub rollout_path: PathBuf,
}

/// User's decision in response to an approval request.
///
/// Accepts either the named form or a bare boolean on the wire, so
/// `{"approved": true}` and `{"decision": "approved"}` are equivalent.
#[derive(Debug, Default, Clone, Copy, Serialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReviewDecision {
    /// Run the action. Its fingerprint is remembered for the rest of the
    /// session so materially identical actions are not asked about again.
    Approved,

    /// Do not run the action; the model is told and the turn continues.
    #[default]
    Denied,

    /// Do not run the action and abort the turn.
    Abort,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReviewDecisionRepr {
    Flag(bool),
    Named(NamedReviewDecision),
}

#[derive(Deserialize)]
#[serde(rename_all = "snake_case")]
enum NamedReviewDecision {
    Approved,
    Denied,
    Abort,
}

impl<'de> Deserialize<'de> for ReviewDecision {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match ReviewDecisionRepr::deserialize(deserializer)? {
            ReviewDecisionRepr::Flag(true) => ReviewDecision::Approved,
            ReviewDecisionRepr::Flag(false) => ReviewDecision::Denied,
            ReviewDecisionRepr::Named(NamedReviewDecision::Approved) => ReviewDecision::Approved,
            ReviewDecisionRepr::Named(NamedReviewDecision::Denied) => ReviewDecision::Denied,
            ReviewDecisionRepr::Named(NamedReviewDecision::Abort) => ReviewDecision::Abort,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FileChange {
    Add {
        content: String,
    },
    Delete {
        content: String,
    },
    Update {
        unified_diff: String,
        move_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TurnAbortedEvent {
    pub reason: TurnAbortReason,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnAbortReason {
    /// The caller sent [`Op::Interrupt`] or aborted an approval.
    Interrupted,
    /// A newer turn preempted this one.
    Replaced,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::NamedTempFile;
    use tempfile::TempDir;

    /// Serialize Event to verify that its JSON representation has the expected
    /// amount of nesting.
    #[test]
    fn serialize_event() {
        let conversation_id =
            ConversationId::from_string("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let rollout_file = NamedTempFile::new().unwrap();
        let event = Event {
            id: "1234".to_string(),
            msg: EventMsg::SessionConfigured(SessionConfiguredEvent {
                session_id: conversation_id,
                model: "codex-mini-latest".to_string(),
                reasoning_effort: Some(ReasoningEffortConfig::default()),
                initial_messages: None,
                rollout_path: rollout_file.path().to_path_buf(),
            }),
        };

        let expected = json!({
            "id": "1234",
            "msg": {
                "type": "session_configured",
                "session_id": "67e55044-10b1-426f-9247-bb680e5fe0c8",
                "model": "codex-mini-latest",
                "reasoning_effort": "medium",
                "rollout_path": format!("{}", rollout_file.path().display()),
            }
        });
        assert_eq!(expected, serde_json::to_value(&event).unwrap());
    }

    #[test]
    fn vec_u8_as_base64_serialization_and_deserialization() {
        let event = ExecCommandOutputDeltaEvent {
            call_id: "call21".to_string(),
            stream: ExecOutputStream::Stdout,
            chunk: vec![1, 2, 3, 4, 5],
        };
        let serialized = serde_json::to_string(&event).unwrap();
        assert_eq!(
            r#"{"call_id":"call21","stream":"stdout","chunk":"AQIDBAU="}"#,
            serialized,
        );

        let deserialized: ExecCommandOutputDeltaEvent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized, event);
    }

    #[test]
    fn approval_decision_accepts_boolean_and_named_forms() {
        let from_bool: Submission = serde_json::from_value(json!({
            "id": "s1",
            "op": {"type": "approval_decision", "request_id": "call-1", "approved": true}
        }))
        .unwrap();
        assert_eq!(
            Op::ApprovalDecision {
                request_id: "call-1".to_string(),
                decision: ReviewDecision::Approved,
            },
            from_bool.op
        );

        let named: Op = serde_json::from_value(json!({
            "type": "approval_decision", "request_id": "call-1", "decision": "abort"
        }))
        .unwrap();
        assert_eq!(
            Op::ApprovalDecision {
                request_id: "call-1".to_string(),
                decision: ReviewDecision::Abort,
            },
            named
        );

        let denied: ReviewDecision = serde_json::from_value(json!(false)).unwrap();
        assert_eq!(ReviewDecision::Denied, denied);
    }

    #[test]
    fn user_turn_overrides_are_optional() {
        let op: Op = serde_json::from_value(json!({
            "type": "user_turn",
            "items": [{"type": "text", "text": "hi"}],
            "overrides": {"approval_policy": "unless-trusted", "exec_timeout_ms": 500}
        }))
        .unwrap();
        let Op::UserTurn { overrides, .. } = op else {
            panic!("expected user_turn");
        };
        assert_eq!(Some(AskForApproval::UnlessTrusted), overrides.approval_policy);
        assert_eq!(Some(500), overrides.exec_timeout_ms);
        assert_eq!(None, overrides.sandbox_policy);
    }

    #[test]
    fn sandbox_policy_parses_both_network_field_names() {
        let a: SandboxPolicy =
            serde_json::from_str(r#"{"mode":"workspace-write","allow_network":true}"#).unwrap();
        let b: SandboxPolicy =
            serde_json::from_str(r#"{"mode":"workspace-write","network_access":true}"#).unwrap();
        assert_eq!(a, b);
        assert!(a.has_full_network_access());

        let legacy: SandboxPolicy = serde_json::from_str(r#"{"mode":"danger-full-access"}"#).unwrap();
        assert_eq!(SandboxPolicy::NoRestriction, legacy);
    }

    #[test]
    fn git_dir_under_writable_root_stays_read_only() {
        let cwd = TempDir::new().unwrap();
        std::fs::create_dir(cwd.path().join(".git")).unwrap();
        let policy = SandboxPolicy::WorkspaceWrite {
            writable_roots: vec![],
            network_access: false,
            exclude_tmpdir_env_var: true,
            exclude_slash_tmp: true,
        };

        let roots = policy.get_writable_roots_with_cwd(cwd.path());
        assert_eq!(
            vec![WritableRoot {
                root: cwd.path().to_path_buf(),
                read_only_subpaths: vec![cwd.path().join(".git")],
            }],
            roots
        );
        assert!(policy.is_path_writable(&cwd.path().join("src/main.rs"), cwd.path()));
        assert!(!policy.is_path_writable(&cwd.path().join(".git/config"), cwd.path()));
        assert!(!policy.is_path_writable(Path::new("/etc/passwd"), cwd.path()));
        assert!(!SandboxPolicy::ReadOnly.is_path_writable(&cwd.path().join("a"), cwd.path()));
    }

    #[test]
    fn rollout_line_round_trips_with_flattened_item() {
        let line = RolloutLine {
            timestamp: "2025-01-01T00:00:00.000Z".to_string(),
            item: RolloutItem::Compacted(CompactedItem {
                message: "summary".to_string(),
            }),
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(
            json!({
                "timestamp": "2025-01-01T00:00:00.000Z",
                "type": "compacted",
                "payload": {"message": "summary"}
            }),
            value
        );
        let parsed: RolloutLine = serde_json::from_value(value).unwrap();
        assert!(matches!(parsed.item, RolloutItem::Compacted(c) if c.message == "summary"));
    }

    #[test]
    fn token_usage_info_accumulates_totals() {
        let last = TokenUsage {
            input_tokens: 10,
            cached_input_tokens: 0,
            output_tokens: 5,
            reasoning_output_tokens: 0,
            total_tokens: 15,
        };
        let first = TokenUsageInfo::new_or_append(&None, &Some(last.clone()));
        let second = TokenUsageInfo::new_or_append(&first, &Some(last.clone())).unwrap();
        assert_eq!(30, second.total_token_usage.total_tokens);
        assert_eq!(last, second.last_token_usage);
        assert_eq!(None, TokenUsageInfo::new_or_append(&None, &None));
    }
}
