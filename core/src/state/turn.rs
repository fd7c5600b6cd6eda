use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use codex_protocol::config_types::ReasoningEffort as ReasoningEffortConfig;
use codex_protocol::config_types::ReasoningSummary as ReasoningSummaryConfig;
use codex_protocol::models::ResponseItem;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::config_types::ShellEnvironmentPolicy;
use crate::error::CodexErr;
use crate::error::Result;
use crate::protocol::AskForApproval;
use crate::protocol::SandboxPolicy;
use crate::protocol::TurnAbortReason;
use crate::protocol::TurnContextItem;
use crate::protocol::TurnOverrides;
use crate::tools::spec::ToolsConfig;

/// Snapshot of everything a turn needs from the session configuration. A
/// turn never mutates its context; overrides produce a new one.
#[derive(Debug, Clone)]
pub(crate) struct TurnContext {
    pub(crate) model: String,
    pub(crate) effort: Option<ReasoningEffortConfig>,
    pub(crate) summary: ReasoningSummaryConfig,
    /// The session's current working directory. All relative paths provided by
    /// the model as well as sandbox policies are resolved against this path
    /// instead of `std::env::current_dir()`.
    pub(crate) cwd: PathBuf,
    pub(crate) base_instructions: Option<String>,
    pub(crate) approval_policy: AskForApproval,
    pub(crate) sandbox_policy: SandboxPolicy,
    pub(crate) shell_environment_policy: ShellEnvironmentPolicy,
    pub(crate) tools_config: ToolsConfig,
    pub(crate) default_exec_timeout_ms: u64,
    pub(crate) codex_linux_sandbox_exe: Option<PathBuf>,
}

impl TurnContext {
    pub(crate) fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            effort: config.model_reasoning_effort,
            summary: config.model_reasoning_summary,
            cwd: config.cwd.clone(),
            base_instructions: config.base_instructions.clone(),
            approval_policy: config.approval_policy,
            sandbox_policy: config.sandbox_policy.clone(),
            shell_environment_policy: config.shell_environment_policy.clone(),
            tools_config: ToolsConfig::from(&config.tools),
            default_exec_timeout_ms: config.default_exec_timeout_ms,
            codex_linux_sandbox_exe: config.codex_linux_sandbox_exe.clone(),
        }
    }

    pub(crate) fn resolve_path(&self, path: Option<String>) -> PathBuf {
        path.as_ref()
            .map(PathBuf::from)
            .map_or_else(|| self.cwd.clone(), |p| self.cwd.join(p))
    }

    /// Copy of this context with `overrides` applied. Relative override
    /// directories resolve against the current cwd.
    pub(crate) fn with_overrides(&self, overrides: &TurnOverrides) -> Self {
        let TurnOverrides {
            cwd,
            approval_policy,
            sandbox_policy,
            model,
            effort,
            summary,
            tools,
            exec_timeout_ms,
        } = overrides;

        let mut next = self.clone();
        if let Some(cwd) = cwd {
            next.cwd = self.cwd.join(cwd);
        }
        if let Some(policy) = approval_policy {
            next.approval_policy = *policy;
        }
        if let Some(policy) = sandbox_policy {
            next.sandbox_policy = policy.clone();
        }
        if let Some(model) = model {
            next.model = model.clone();
        }
        if let Some(effort) = effort {
            next.effort = Some(*effort);
        }
        if let Some(summary) = summary {
            next.summary = *summary;
        }
        if let Some(tools) = tools {
            next.tools_config = ToolsConfig::from(tools);
        }
        if let Some(timeout) = exec_timeout_ms {
            next.default_exec_timeout_ms = *timeout;
        }
        next
    }

    /// Rejects combinations that cannot be enforced. Runs before the first
    /// model request of a turn.
    pub(crate) fn validate(&self) -> Result<()> {
        if !self.cwd.is_absolute() {
            return Err(CodexErr::InvalidConfig(format!(
                "working directory must be absolute: {}",
                self.cwd.display()
            )));
        }
        if let Some(root) = self
            .sandbox_policy
            .configured_writable_roots()
            .iter()
            .find(|root| !root.is_absolute())
        {
            return Err(CodexErr::InvalidConfig(format!(
                "writable root must be absolute: {}",
                root.display()
            )));
        }
        if self.default_exec_timeout_ms == 0 {
            return Err(CodexErr::InvalidConfig(
                "default command timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn to_turn_context_item(&self) -> TurnContextItem {
        TurnContextItem {
            cwd: self.cwd.clone(),
            approval_policy: self.approval_policy,
            sandbox_policy: self.sandbox_policy.clone(),
            model: self.model.clone(),
            effort: self.effort,
            summary: self.summary,
        }
    }
}

/// Cancellation handle shared by a running turn and the session. The first
/// recorded reason wins.
#[derive(Clone, Default)]
pub(crate) struct TurnCancellation {
    token: CancellationToken,
    reason: Arc<StdMutex<Option<TurnAbortReason>>>,
}

impl TurnCancellation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn abort(&self, reason: TurnAbortReason) {
        {
            let mut guard = self
                .reason
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_none() {
                *guard = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn reason(&self) -> TurnAbortReason {
        self.reason
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .unwrap_or(TurnAbortReason::Interrupted)
    }
}

/// Items produced by the running turn that are not yet part of the
/// session history.
#[derive(Default)]
pub(crate) struct TurnState {
    pending: Vec<ResponseItem>,
    partial_message: String,
}

impl TurnState {
    pub(crate) fn push(&mut self, item: ResponseItem) {
        self.pending.push(item);
    }

    pub(crate) fn push_delta(&mut self, delta: &str) {
        self.partial_message.push_str(delta);
    }

    pub(crate) fn clear_partial(&mut self) {
        self.partial_message.clear();
    }

    pub(crate) fn items(&self) -> &[ResponseItem] {
        &self.pending
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drops items recorded after `len`, used when a sampling request is
    /// retried from scratch.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.pending.truncate(len);
        self.partial_message.clear();
    }

    pub(crate) fn take(&mut self) -> Vec<ResponseItem> {
        self.partial_message.clear();
        std::mem::take(&mut self.pending)
    }

    /// Text streamed for an assistant message that never completed.
    pub(crate) fn take_partial_message(&mut self) -> Option<String> {
        if self.partial_message.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial_message))
        }
    }
}
