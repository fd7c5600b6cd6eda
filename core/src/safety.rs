//! Decides, without side effects, whether a proposed action may run, must be
//! put to the user, or is refused outright.

use std::collections::HashSet;
use std::path::Path;

use codex_apply_patch::ApplyPatchAction;
use serde::Serialize;

use crate::approval_fingerprint::command_fingerprint;
use crate::approval_fingerprint::patch_fingerprint;
use crate::command_safety::command_might_be_dangerous;
use crate::command_safety::is_known_safe_command;
use crate::exec::SandboxType;
use crate::protocol::AskForApproval;
use crate::protocol::SandboxPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum SafetyCheck {
    AutoApprove { sandbox_type: SandboxType },
    AskUser { reason: Option<String> },
    Reject { reason: String },
}

/// An action proposed by the model, as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub enum ActionRequest<'a> {
    Shell {
        command: &'a [String],
        cwd: &'a Path,
        /// The model asked to run outside the sandbox.
        with_escalated_permissions: bool,
    },
    Patch {
        action: &'a ApplyPatchAction,
        cwd: &'a Path,
    },
    /// Input to an already-open PTY session. Opening it was gated.
    SessionWrite { session_id: u32 },
    /// A call to a configured external tool server.
    ToolCall { server: &'a str, tool: &'a str },
}

impl ActionRequest<'_> {
    /// Key under which an approval of this action is remembered.
    pub fn fingerprint(&self) -> Option<String> {
        match self {
            ActionRequest::Shell { command, .. } => Some(command_fingerprint(command)),
            ActionRequest::Patch { action, .. } => Some(patch_fingerprint(&action.touched_paths())),
            ActionRequest::SessionWrite { .. } | ActionRequest::ToolCall { .. } => None,
        }
    }
}

pub fn assess_action(
    request: &ActionRequest<'_>,
    approval_policy: AskForApproval,
    sandbox_policy: &SandboxPolicy,
    approved: &HashSet<String>,
) -> SafetyCheck {
    let check = match request {
        ActionRequest::Shell {
            command,
            with_escalated_permissions,
            ..
        } => assess_command_safety(
            command,
            approval_policy,
            sandbox_policy,
            approved,
            *with_escalated_permissions,
        ),
        ActionRequest::Patch { action, cwd } => {
            assess_patch_safety(action, approval_policy, sandbox_policy, cwd, approved)
        }
        ActionRequest::SessionWrite { .. } | ActionRequest::ToolCall { .. } => {
            SafetyCheck::AutoApprove {
                sandbox_type: SandboxType::None,
            }
        }
    };
    tracing::debug!(?request, %approval_policy, ?check, "classified action");
    check
}

pub fn assess_patch_safety(
    action: &ApplyPatchAction,
    policy: AskForApproval,
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
    approved: &HashSet<String>,
) -> SafetyCheck {
    if action.is_empty() {
        return SafetyCheck::Reject {
            reason: "empty patch".to_string(),
        };
    }

    if policy == AskForApproval::UnlessTrusted {
        return SafetyCheck::AskUser { reason: None };
    }

    // Patches are applied in-process, so the writable-roots check below is
    // the only confinement they get.
    if is_write_patch_constrained_to_writable_paths(action, sandbox_policy, cwd)
        || (policy != AskForApproval::Never
            && approved.contains(&patch_fingerprint(&action.touched_paths())))
    {
        return SafetyCheck::AutoApprove {
            sandbox_type: SandboxType::None,
        };
    }

    if policy == AskForApproval::Never {
        SafetyCheck::Reject {
            reason: "writing outside of the project; rejected by user approval settings"
                .to_string(),
        }
    } else {
        SafetyCheck::AskUser {
            reason: Some("patch writes outside the writable roots".to_string()),
        }
    }
}

/// For a command to be run _without_ a sandbox, one of the following must be
/// true:
///
/// - the user has explicitly approved the command
/// - the command is on the "known safe" list
/// - `NoRestriction` was specified and neither `UnlessTrusted` nor `Never`
///   was
pub fn assess_command_safety(
    command: &[String],
    approval_policy: AskForApproval,
    sandbox_policy: &SandboxPolicy,
    approved: &HashSet<String>,
    with_escalated_permissions: bool,
) -> SafetyCheck {
    let fingerprint = command_fingerprint(command);
    let is_approved = approval_policy != AskForApproval::Never && approved.contains(&fingerprint);

    // Some commands look dangerous. Even if they are run inside a sandbox,
    // unless the user has explicitly approved them, we should ask,
    // regardless of the approval policy and sandbox policy.
    if command_might_be_dangerous(command) && !is_approved {
        return match approval_policy {
            AskForApproval::Never => SafetyCheck::Reject {
                reason: "dangerous command rejected by user approval settings".to_string(),
            },
            _ => SafetyCheck::AskUser {
                reason: Some("command may destroy data".to_string()),
            },
        };
    }

    if is_known_safe_command(command) || is_approved {
        return SafetyCheck::AutoApprove {
            sandbox_type: SandboxType::None,
        };
    }

    assess_safety_for_untrusted_command(approval_policy, sandbox_policy, with_escalated_permissions)
}

pub(crate) fn assess_safety_for_untrusted_command(
    approval_policy: AskForApproval,
    sandbox_policy: &SandboxPolicy,
    with_escalated_permissions: bool,
) -> SafetyCheck {
    use AskForApproval::*;
    use SandboxPolicy::*;

    match (approval_policy, sandbox_policy) {
        (UnlessTrusted, _) => SafetyCheck::AskUser { reason: None },
        // Without a human to ask, only the pre-approved sets above may run.
        (Never, _) => SafetyCheck::Reject {
            reason: "auto-rejected because command is not on trusted list".to_string(),
        },
        (OnRequest, _) if with_escalated_permissions => SafetyCheck::AskUser {
            reason: Some("command requested to run without the sandbox".to_string()),
        },
        (OnRequest, NoRestriction) | (OnFailure, NoRestriction) => SafetyCheck::AutoApprove {
            sandbox_type: SandboxType::None,
        },
        (OnRequest, ReadOnly)
        | (OnRequest, WorkspaceWrite { .. })
        | (OnFailure, ReadOnly)
        | (OnFailure, WorkspaceWrite { .. }) => match get_platform_sandbox() {
            Some(sandbox_type) => SafetyCheck::AutoApprove { sandbox_type },
            // Fall back to asking since the command is untrusted and there is
            // nothing to confine it with.
            None => SafetyCheck::AskUser {
                reason: Some("no sandbox is available on this platform".to_string()),
            },
        },
    }
}

pub fn get_platform_sandbox() -> Option<SandboxType> {
    if cfg!(target_os = "macos") {
        Some(SandboxType::MacosSeatbelt)
    } else if cfg!(target_os = "linux") {
        Some(SandboxType::LinuxSeccomp)
    } else {
        None
    }
}

/// Whether a sandboxed failure under this policy is followed by an offer to
/// rerun without the sandbox.
pub fn should_escalate_on_failure(approval_policy: AskForApproval, sandbox: SandboxType) -> bool {
    matches!(
        (approval_policy, sandbox),
        (
            AskForApproval::OnFailure,
            SandboxType::MacosSeatbelt | SandboxType::LinuxSeccomp
        )
    )
}

fn is_write_patch_constrained_to_writable_paths(
    action: &ApplyPatchAction,
    sandbox_policy: &SandboxPolicy,
    cwd: &Path,
) -> bool {
    action
        .touched_paths()
        .iter()
        .all(|path| sandbox_policy.is_path_writable(&normalize_lexically(path), cwd))
}

/// Resolves `.` and `..` without touching the filesystem, so a patch path
/// like `src/../../etc/passwd` is judged by where it actually lands.
fn normalize_lexically(path: &Path) -> std::path::PathBuf {
    use std::path::Component;
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
