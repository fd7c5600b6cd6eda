use std::collections::HashSet;

use codex_protocol::protocol::AskForApproval;
use codex_protocol::protocol::ReviewDecision;
use codex_protocol::protocol::TurnAbortReason;
use tracing::debug;

use crate::codex::Session;
use crate::error::CodexErr;
use crate::exec::SandboxType;
use crate::executor::ExecError;
use crate::executor::ExecutionRequest;
use crate::executor::ExecutorConfig;
use crate::safety::ActionRequest;
use crate::safety::SafetyCheck;
use crate::safety::assess_action;
use crate::safety::should_escalate_on_failure;
use crate::state::TurnCancellation;

/// Sandbox placement for one execution, and whether a sandboxed failure is
/// followed by an offer to retry without it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SandboxDecision {
    pub(crate) initial_sandbox: SandboxType,
    pub(crate) escalate_on_failure: bool,
}

impl SandboxDecision {
    fn auto(sandbox: SandboxType, approval_policy: AskForApproval) -> Self {
        Self {
            initial_sandbox: sandbox,
            escalate_on_failure: should_escalate_on_failure(approval_policy, sandbox),
        }
    }

    fn user_override() -> Self {
        Self {
            initial_sandbox: SandboxType::None,
            escalate_on_failure: false,
        }
    }
}

/// Classifies the request and, when the classifier asks for it, puts the
/// command to the user. Every command passes through here exactly once
/// before it is spawned.
pub(crate) async fn select_sandbox(
    request: &ExecutionRequest,
    approved: &HashSet<String>,
    config: &ExecutorConfig,
    session: &Session,
    cancellation: &TurnCancellation,
    sub_id: &str,
    call_id: &str,
) -> Result<SandboxDecision, ExecError> {
    let action = ActionRequest::Shell {
        command: &request.approval_command,
        cwd: &request.params.cwd,
        with_escalated_permissions: request.params.with_escalated_permissions.unwrap_or(false),
    };
    let approval_policy = config.approval_policy;

    match assess_action(&action, approval_policy, &config.sandbox_policy, approved) {
        SafetyCheck::AutoApprove { sandbox_type } => {
            let decision = SandboxDecision::auto(sandbox_type, approval_policy);
            debug!(?decision, "command auto-approved");
            Ok(decision)
        }
        SafetyCheck::AskUser { reason } => {
            let reason = reason.or_else(|| request.params.justification.clone());
            let decision = session
                .request_command_approval(
                    sub_id,
                    call_id,
                    request.approval_command.clone(),
                    request.params.cwd.clone(),
                    reason,
                    cancellation,
                )
                .await;
            match decision {
                ReviewDecision::Approved => {
                    if let Some(fingerprint) = action.fingerprint() {
                        session.remember_approval(fingerprint).await;
                    }
                    Ok(SandboxDecision::user_override())
                }
                ReviewDecision::Denied => Err(ExecError::rejection("exec command rejected by user")),
                ReviewDecision::Abort => {
                    cancellation.abort(TurnAbortReason::Interrupted);
                    Err(ExecError::Codex(CodexErr::TurnAborted))
                }
            }
        }
        SafetyCheck::Reject { reason } => Err(ExecError::rejection(format!(
            "exec command rejected: {reason}"
        ))),
    }
}
