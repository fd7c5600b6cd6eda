use std::sync::Arc;

use codex_core::CodexConversation;
use codex_core::ConversationManager;
use codex_core::config::ConfigOverrides;
use codex_core::protocol::AskForApproval;
use codex_core::protocol::EventMsg;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_core::protocol::ReviewDecision;
use codex_core::protocol::TurnAbortReason;
use codex_core::protocol::TurnAbortedEvent;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::collect_events_until;
use core_test_support::function_output;
use core_test_support::load_config_with_overrides;
use core_test_support::shell_call;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn start(
    home: &TempDir,
    client: Arc<ScriptedModelClient>,
    approval_policy: AskForApproval,
) -> Arc<CodexConversation> {
    let config = load_config_with_overrides(
        home,
        ConfigOverrides {
            approval_policy: Some(approval_policy),
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

/// Waits for the approval request and returns its id.
async fn expect_exec_approval(codex: &CodexConversation) -> String {
    let ev = wait_for_event(codex, |ev| matches!(ev, EventMsg::ExecApprovalRequest(_))).await;
    let EventMsg::ExecApprovalRequest(request) = ev else {
        unreachable!();
    };
    request.request_id
}

fn rm(file: &str) -> [&str; 3] {
    ["rm", "-f", file]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approval_is_remembered_for_the_same_command() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        shell_call("r1", "call-1", &rm("a.txt"), None),
        assistant_reply("r2", "removed"),
        shell_call("r3", "call-2", &rm("a.txt"), None),
        assistant_reply("r4", "removed again"),
    ]);
    let codex = start(&home, client.clone(), AskForApproval::OnRequest).await;

    send_text(&codex, "clean up").await;
    let request_id = expect_exec_approval(&codex).await;
    assert_eq!("call-1", request_id);
    codex
        .submit(Op::ApprovalDecision {
            request_id,
            decision: ReviewDecision::Approved,
        })
        .await
        .unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    send_text(&codex, "once more").await;
    let events =
        collect_events_until(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;
    assert!(
        !events
            .iter()
            .any(|ev| matches!(ev, EventMsg::ExecApprovalRequest(_))),
        "events: {events:?}"
    );
    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, EventMsg::ExecCommandEnd(end) if end.call_id == "call-2" && end.exit_code == 0))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn never_policy_rejects_dangerous_command_without_asking() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        shell_call("r1", "call-1", &rm("a.txt"), None),
        assistant_reply("r2", "could not remove"),
    ]);
    let codex = start(&home, client.clone(), AskForApproval::Never).await;

    send_text(&codex, "clean up").await;
    let events =
        collect_events_until(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    assert!(!events.iter().any(|ev| matches!(
        ev,
        EventMsg::ExecApprovalRequest(_) | EventMsg::ExecCommandBegin(_)
    )));
    let output = function_output(&client.prompts()[1], "call-1")
        .unwrap()
        .to_string();
    assert!(output.starts_with("exec command rejected"), "{output}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_command_is_reported_to_the_model() {
    let home = TempDir::new().unwrap();
    let file = home.path().join("keep.txt");
    std::fs::write(&file, "precious").unwrap();
    let client = ScriptedModelClient::new(vec![
        shell_call("r1", "call-1", &rm("keep.txt"), None),
        assistant_reply("r2", "ok, leaving it"),
    ]);
    let codex = start(&home, client.clone(), AskForApproval::OnRequest).await;

    send_text(&codex, "clean up").await;
    let request_id = expect_exec_approval(&codex).await;
    codex
        .submit(Op::ApprovalDecision {
            request_id,
            decision: ReviewDecision::Denied,
        })
        .await
        .unwrap();
    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    assert!(matches!(
        ev,
        EventMsg::TaskComplete(done) if done.last_agent_message.as_deref() == Some("ok, leaving it")
    ));
    assert_eq!(
        Some("exec command rejected by user"),
        function_output(&client.prompts()[1], "call-1")
    );
    assert!(file.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_decision_interrupts_the_turn() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![shell_call("r1", "call-1", &rm("a.txt"), None)]);
    let codex = start(&home, client.clone(), AskForApproval::OnRequest).await;

    send_text(&codex, "clean up").await;
    let request_id = expect_exec_approval(&codex).await;
    codex
        .submit(Op::ApprovalDecision {
            request_id,
            decision: ReviewDecision::Abort,
        })
        .await
        .unwrap();

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::TurnAborted(_))).await;
    assert!(matches!(
        ev,
        EventMsg::TurnAborted(TurnAbortedEvent {
            reason: TurnAbortReason::Interrupted
        })
    ));
    assert_eq!(1, client.request_count());
}
