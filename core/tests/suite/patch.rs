use codex_core::ConversationManager;
use codex_core::config::ConfigOverrides;
use codex_core::protocol::AskForApproval;
use codex_core::protocol::EventMsg;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_core::protocol_config_types::SandboxMode;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::collect_events_until;
use core_test_support::ev_completed;
use core_test_support::ev_created;
use core_test_support::ev_function_call;
use core_test_support::load_config_with_overrides;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn patch_inside_workspace_is_applied_without_asking() {
    let home = TempDir::new().unwrap();
    let target = home.path().join("hello.txt");
    std::fs::write(&target, "hello\n").unwrap();

    let patch = "*** Begin Patch\n*** Update File: hello.txt\n@@\n-hello\n+hello world\n*** End Patch";
    let client = ScriptedModelClient::new(vec![
        vec![
            ev_created(),
            ev_function_call("patch-1", "apply_patch", json!({ "input": patch })),
            ev_completed("r1"),
        ],
        assistant_reply("r2", "updated"),
    ]);
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
                text: "say hello world".to_string(),
            }],
        })
        .await
        .unwrap();
    let events =
        collect_events_until(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    assert!(
        !events
            .iter()
            .any(|ev| matches!(ev, EventMsg::ApplyPatchApprovalRequest(_)))
    );
    let begin = events
        .iter()
        .find_map(|ev| match ev {
            EventMsg::PatchApplyBegin(begin) => Some(begin),
            _ => None,
        })
        .expect("patch begin");
    assert!(begin.auto_approved);
    assert_eq!(1, begin.changes.len());
    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, EventMsg::PatchApplyEnd(end) if end.success))
    );
    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, EventMsg::TurnDiff(diff) if diff.unified_diff.contains("hello world")))
    );
    assert_eq!("hello world\n", std::fs::read_to_string(&target).unwrap());
}
