use codex_core::ConversationManager;
use codex_core::config::ConfigOverrides;
use codex_core::exec::TIMEOUT_EXIT_CODE;
use codex_core::protocol::AskForApproval;
use codex_core::protocol::EventMsg;
use codex_core::protocol::ExecExitStatus;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_core::protocol_config_types::SandboxMode;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::function_output;
use core_test_support::load_config_with_overrides;
use core_test_support::shell_call;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn command_past_its_timeout_is_killed_and_reported() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        shell_call("r1", "call-1", &["sleep", "5"], Some(200)),
        assistant_reply("r2", "that took too long"),
    ]);
    let config = load_config_with_overrides(
        &home,
        ConfigOverrides {
            approval_policy: Some(AskForApproval::OnRequest),
            sandbox_mode: Some(SandboxMode::NoRestriction),
            ..Default::default()
        },
    );
    let codex = ConversationManager::new(client.clone())
        .new_conversation(config)
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: "wait a bit".to_string(),
            }],
        })
        .await
        .unwrap();

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::ExecCommandEnd(_))).await;
    let EventMsg::ExecCommandEnd(end) = ev else {
        unreachable!();
    };
    assert_eq!(ExecExitStatus::TimedOut, end.status);
    assert_eq!(TIMEOUT_EXIT_CODE, end.exit_code);
    assert!(end.duration.as_secs() < 5, "{:?}", end.duration);

    wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;
    let prompts = client.prompts();
    let output = function_output(&prompts[1], "call-1").unwrap();
    assert!(output.contains("\"exit_code\":124"), "{output}");
}

#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_sandbox_helper_fails_the_turn_instead_of_running_unconfined() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![shell_call(
        "r1",
        "call-1",
        &["touch", "x.txt"],
        None,
    )]);
    let config = load_config_with_overrides(
        &home,
        ConfigOverrides {
            approval_policy: Some(AskForApproval::OnRequest),
            sandbox_mode: Some(SandboxMode::WorkspaceWrite),
            ..Default::default()
        },
    );
    let codex = ConversationManager::new(client.clone())
        .new_conversation(config)
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: "make a file".to_string(),
            }],
        })
        .await
        .unwrap();

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::Error(_))).await;
    let EventMsg::Error(error) = ev else {
        unreachable!();
    };
    assert!(error.message.contains("codex-linux-sandbox"), "{}", error.message);
    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;
    assert!(matches!(
        ev,
        EventMsg::TaskComplete(done) if done.last_agent_message.is_none()
    ));
    assert!(!home.path().join("x.txt").exists());
    assert_eq!(1, client.request_count());
}
