//! In-process patch application: classification, the approval gate, the
//! begin/end events and the turn diff.

use std::collections::HashMap;
use std::path::PathBuf;

use codex_apply_patch::ApplyPatchAction;
use codex_apply_patch::ApplyPatchFileChange;
use codex_apply_patch::apply_action;
use codex_apply_patch::print_summary;
use tracing::debug;

use crate::codex::Session;
use crate::function_tool::FunctionCallError;
use crate::protocol::Event;
use crate::protocol::EventMsg;
use crate::protocol::FileChange;
use crate::protocol::PatchApplyBeginEvent;
use crate::protocol::PatchApplyEndEvent;
use crate::protocol::ReviewDecision;
use crate::protocol::TurnAbortReason;
use crate::protocol::TurnDiffEvent;
use crate::safety::ActionRequest;
use crate::safety::SafetyCheck;
use crate::safety::assess_action;
use crate::state::TurnCancellation;
use crate::state::TurnContext;
use crate::turn_diff_tracker::TurnDiffTracker;

pub(crate) async fn apply_patch(
    session: &Session,
    turn: &TurnContext,
    tracker: &mut TurnDiffTracker,
    cancellation: &TurnCancellation,
    sub_id: &str,
    call_id: &str,
    action: ApplyPatchAction,
) -> Result<String, FunctionCallError> {
    let request = ActionRequest::Patch {
        action: &action,
        cwd: &turn.cwd,
    };
    let approved = session.approved_fingerprints().await;
    let auto_approved = match assess_action(
        &request,
        turn.approval_policy,
        &turn.sandbox_policy,
        &approved,
    ) {
        SafetyCheck::AutoApprove { .. } => true,
        SafetyCheck::AskUser { reason } => {
            let decision = session
                .request_patch_approval(
                    sub_id,
                    call_id,
                    convert_apply_patch_to_protocol(&action),
                    reason,
                    cancellation,
                )
                .await;
            match decision {
                ReviewDecision::Approved => {
                    if let Some(fingerprint) = request.fingerprint() {
                        session.remember_approval(fingerprint).await;
                    }
                    false
                }
                ReviewDecision::Denied => {
                    return Err(FunctionCallError::RespondToModel(
                        "patch rejected by user".to_string(),
                    ));
                }
                ReviewDecision::Abort => {
                    cancellation.abort(TurnAbortReason::Interrupted);
                    return Err(FunctionCallError::RespondToModel(
                        "patch aborted by user".to_string(),
                    ));
                }
            }
        }
        SafetyCheck::Reject { reason } => {
            return Err(FunctionCallError::RespondToModel(format!(
                "patch rejected: {reason}"
            )));
        }
    };

    tracker.on_patch_begin(action.changes());
    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::PatchApplyBegin(PatchApplyBeginEvent {
                call_id: call_id.to_string(),
                auto_approved,
                changes: convert_apply_patch_to_protocol(&action),
            }),
        })
        .await;

    let (success, stdout, stderr) = match apply_action(&action) {
        Ok(affected) => {
            let mut summary = Vec::new();
            match print_summary(&affected, &mut summary) {
                Ok(()) => (true, String::from_utf8_lossy(&summary).into_owned(), String::new()),
                Err(err) => (true, String::new(), err.to_string()),
            }
        }
        Err(err) => (false, String::new(), err.to_string()),
    };
    debug!(%call_id, success, "patch applied");

    session
        .send_event(Event {
            id: sub_id.to_string(),
            msg: EventMsg::PatchApplyEnd(PatchApplyEndEvent {
                call_id: call_id.to_string(),
                stdout: stdout.clone(),
                stderr: stderr.clone(),
                success,
            }),
        })
        .await;

    // Even a failed patch may have written some files before stopping.
    if let Some(unified_diff) = tracker.get_unified_diff(&turn.cwd) {
        session
            .send_event(Event {
                id: sub_id.to_string(),
                msg: EventMsg::TurnDiff(TurnDiffEvent { unified_diff }),
            })
            .await;
    }

    if success {
        Ok(stdout)
    } else {
        Err(FunctionCallError::RespondToModel(format!(
            "apply_patch failed: {stderr}"
        )))
    }
}

pub(crate) fn convert_apply_patch_to_protocol(
    action: &ApplyPatchAction,
) -> HashMap<PathBuf, FileChange> {
    action
        .changes()
        .iter()
        .map(|(path, change)| {
            let change = match change {
                ApplyPatchFileChange::Add { content } => FileChange::Add {
                    content: content.clone(),
                },
                ApplyPatchFileChange::Delete { content } => FileChange::Delete {
                    content: content.clone(),
                },
                ApplyPatchFileChange::Update {
                    unified_diff,
                    move_path,
                    ..
                } => FileChange::Update {
                    unified_diff: unified_diff.clone(),
                    move_path: move_path.clone(),
                },
            };
            (path.clone(), change)
        })
        .collect()
}
