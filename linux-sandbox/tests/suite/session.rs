#![expect(clippy::unwrap_used)]

//! Sandboxed shell calls driven through a whole session, with the helper
//! binary as the Linux backend.

use std::path::PathBuf;
use std::sync::Arc;

use codex_core::CodexConversation;
use codex_core::ConversationManager;
use codex_core::config::ConfigOverrides;
use codex_core::protocol::AskForApproval;
use codex_core::protocol::EventMsg;
use codex_core::protocol::ExecExitStatus;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_core::protocol::ReviewDecision;
use codex_core::protocol_config_types::SandboxMode;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::collect_events_until;
use core_test_support::load_config_with_overrides;
use core_test_support::shell_call;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn start(
    home: &TempDir,
    client: Arc<ScriptedModelClient>,
    sandbox_mode: SandboxMode,
    approval_policy: AskForApproval,
) -> Arc<CodexConversation> {
    let config = load_config_with_overrides(
        home,
        ConfigOverrides {
            approval_policy: Some(approval_policy),
            sandbox_mode: Some(sandbox_mode),
            codex_linux_sandbox_exe: Some(PathBuf::from(env!(
                "CARGO_BIN_EXE_codex-linux-sandbox"
            ))),
            ..Default::default()
        },
    );
    ConversationManager::new(client)
        .new_conversation(config)
        .await
        .unwrap()
        .conversation
}

async fn send_text(codex: &CodexConversation, text: &str) {
    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: text.to_string(),
            }],
        })
        .await
        .unwrap();
}

/// Short labels for the command lifecycle events, in emission order.
fn exec_trace(events: &[EventMsg]) -> Vec<String> {
    events
        .iter()
        .filter_map(|ev| match ev {
            EventMsg::ExecCommandBegin(begin) => Some(format!("begin {}", begin.call_id)),
            EventMsg::ExecCommandEnd(end) => Some(format!(
                "end {} exit={} denied={}",
                end.call_id, end.exit_code, end.sandbox_denied
            )),
            EventMsg::ExecApprovalRequest(request) => Some(format!(
                "approval {} reason={}",
                request.call_id,
                request.reason.as_deref().unwrap_or("-")
            )),
            _ => None,
        })
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_only_denial_offers_unsandboxed_retry() {
    let home = TempDir::new().unwrap();
    let target = home.path().join("created.txt");
    let target_arg = target.to_string_lossy().to_string();
    let client = ScriptedModelClient::new(vec![
        shell_call("r1", "call-1", &["touch", &target_arg], None),
        assistant_reply("r2", "created"),
    ]);
    let codex = start(
        &home,
        client.clone(),
        SandboxMode::ReadOnly,
        AskForApproval::OnFailure,
    )
    .await;

    send_text(&codex, "create the file").await;
    let events = collect_events_until(&codex, |ev| {
        matches!(ev, EventMsg::ExecApprovalRequest(_))
    })
    .await;
    let trace = exec_trace(&events);
    assert_eq!(3, trace.len(), "{trace:?}");
    assert_eq!(
        vec![
            "begin call-1".to_string(),
            trace[1].clone(),
            "approval call-1 reason=command failed; retry without sandbox?".to_string(),
        ],
        trace
    );
    assert!(
        trace[1].starts_with("end call-1 exit=") && trace[1].ends_with("denied=true"),
        "{trace:?}"
    );
    assert!(!target.exists());

    let Some(EventMsg::ExecApprovalRequest(request)) = events.last() else {
        unreachable!();
    };
    codex
        .submit(Op::ApprovalDecision {
            request_id: request.request_id.clone(),
            decision: ReviewDecision::Approved,
        })
        .await
        .unwrap();
    let events =
        collect_events_until(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    assert_eq!(
        vec![
            "begin call-1".to_string(),
            "end call-1 exit=0 denied=false".to_string(),
        ],
        exec_trace(&events)
    );
    assert!(target.exists());
    assert_eq!(2, client.request_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workspace_write_runs_sandboxed_without_network() {
    let home = TempDir::new().unwrap();
    std::fs::write(home.path().join("marker.txt"), "").unwrap();
    let client = ScriptedModelClient::new(vec![
        shell_call(
            "r1",
            "call-1",
            &[
                "bash",
                "-lc",
                r#"ls; printf %s "$CODEX_SANDBOX_NETWORK_DISABLED""#,
            ],
            None,
        ),
        assistant_reply("r2", "listed"),
    ]);
    let codex = start(
        &home,
        client.clone(),
        SandboxMode::WorkspaceWrite,
        AskForApproval::OnRequest,
    )
    .await;

    send_text(&codex, "list the workspace").await;
    let events =
        collect_events_until(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    assert!(
        !events
            .iter()
            .any(|ev| matches!(ev, EventMsg::ExecApprovalRequest(_))),
        "events: {events:?}"
    );
    let end = events
        .iter()
        .find_map(|ev| match ev {
            EventMsg::ExecCommandEnd(end) => Some(end),
            _ => None,
        })
        .unwrap();
    if end.stderr.contains("error applying sandbox policy") {
        // Landlock is missing on some CI kernels.
        return;
    }
    assert_eq!(ExecExitStatus::Exited { code: 0 }, end.status);
    assert!(!end.sandbox_denied);
    assert!(end.stdout.contains("marker.txt"), "{}", end.stdout);
    assert!(end.stdout.ends_with('1'), "{}", end.stdout);
}
