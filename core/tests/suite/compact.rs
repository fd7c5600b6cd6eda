use codex_core::ConversationManager;
use codex_core::NewConversation;
use codex_core::protocol::EventMsg;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_protocol::models::ContentItem;
use codex_protocol::models::ResponseItem;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::load_default_config_for_test;
use core_test_support::read_rollout_lines;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const SUMMARY: &str = "Renamed the module; tests still pending.";

fn text_of(item: &ResponseItem) -> Option<(&str, String)> {
    let ResponseItem::Message { role, content, .. } = item else {
        return None;
    };
    let text = content
        .iter()
        .filter_map(|c| match c {
            ContentItem::InputText { text } | ContentItem::OutputText { text } => {
                Some(text.as_str())
            }
            ContentItem::InputImage { .. } => None,
        })
        .collect::<String>();
    Some((role.as_str(), text))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn compaction_replaces_history_with_user_messages_and_summary() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        assistant_reply("r1", "renamed it"),
        assistant_reply("r2", SUMMARY),
        assistant_reply("r3", "tests added"),
    ]);
    let NewConversation {
        conversation: codex,
        session_configured,
        ..
    } = ConversationManager::new(client.clone())
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap();

    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: "rename the module".to_string(),
            }],
        })
        .await
        .unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    codex.submit(Op::Compact).await.unwrap();
    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;
    assert!(matches!(
        ev,
        EventMsg::TaskComplete(done) if done.last_agent_message.as_deref() == Some(SUMMARY)
    ));

    codex
        .submit(Op::UserInput {
            items: vec![InputItem::Text {
                text: "now add tests".to_string(),
            }],
        })
        .await
        .unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::TaskComplete(_))).await;

    let prompts = client.prompts();
    assert_eq!(3, prompts.len());
    // The summarization request carries no tools.
    assert!(prompts[1].tools.is_empty());
    let after: Vec<(&str, String)> = prompts[2].input.iter().filter_map(text_of).collect();
    assert_eq!(
        vec![
            ("user", "rename the module".to_string()),
            ("assistant", SUMMARY.to_string()),
            ("user", "now add tests".to_string()),
        ],
        after
    );

    codex.submit(Op::Shutdown).await.unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::ShutdownComplete)).await;
    let lines = read_rollout_lines(&session_configured.rollout_path);
    let compacted = lines
        .iter()
        .find(|line| line["type"] == "compacted")
        .expect("compacted rollout line");
    assert_eq!(SUMMARY, compacted["payload"]["message"]);
}
