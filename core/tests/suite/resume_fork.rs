use std::path::PathBuf;
use std::sync::Arc;

use codex_core::CodexConversation;
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
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

async fn turn(codex: &CodexConversation, text: &str) {
    let events = codex
        .submit_and_wait(
            Op::UserInput {
                items: vec![InputItem::Text {
                    text: text.to_string(),
                }],
            },
            |ev| matches!(ev, EventMsg::TaskComplete(_)),
        )
        .await
        .unwrap();
    assert!(matches!(events.first(), Some(EventMsg::TaskStarted(_))));
}

async fn shutdown(codex: &CodexConversation) {
    codex.submit(Op::Shutdown).await.unwrap();
    wait_for_event(codex, |ev| matches!(ev, EventMsg::ShutdownComplete)).await;
}

fn message_texts(input: &[ResponseItem]) -> Vec<String> {
    input
        .iter()
        .filter_map(|item| match item {
            ResponseItem::Message { content, .. } => Some(
                content
                    .iter()
                    .filter_map(|c| match c {
                        ContentItem::InputText { text } | ContentItem::OutputText { text } => {
                            Some(text.as_str())
                        }
                        ContentItem::InputImage { .. } => None,
                    })
                    .collect::<String>(),
            ),
            _ => None,
        })
        .collect()
}

/// Runs two turns ("one", "two") and shuts down, returning the rollout path.
async fn record_two_turns(home: &TempDir, client: Arc<ScriptedModelClient>) -> PathBuf {
    let NewConversation {
        conversation,
        session_configured,
        ..
    } = ConversationManager::new(client)
        .new_conversation(load_default_config_for_test(home))
        .await
        .unwrap();
    turn(&conversation, "one").await;
    turn(&conversation, "two").await;
    shutdown(&conversation).await;
    session_configured.rollout_path
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_conversation_replays_history_and_events() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        assistant_reply("r1", "a1"),
        assistant_reply("r2", "a2"),
        assistant_reply("r3", "a3"),
    ]);
    let rollout_path = record_two_turns(&home, client.clone()).await;

    let manager = ConversationManager::new(client.clone());
    let NewConversation {
        conversation,
        session_configured,
        ..
    } = manager
        .resume_conversation_from_rollout(load_default_config_for_test(&home), rollout_path.clone())
        .await
        .unwrap();
    assert_eq!(rollout_path, session_configured.rollout_path);

    let initial = session_configured
        .initial_messages
        .expect("resumed sessions replay their events");
    let users: Vec<&str> = initial
        .iter()
        .filter_map(|ev| match ev {
            EventMsg::UserMessage(ev) => Some(ev.message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(vec!["one", "two"], users);

    turn(&conversation, "three").await;
    assert_eq!(
        vec!["one", "a1", "two", "a2", "three"],
        message_texts(&client.prompts()[2].input)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fork_keeps_history_before_the_chosen_user_message() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        assistant_reply("r1", "a1"),
        assistant_reply("r2", "a2"),
        assistant_reply("r3", "a-forked"),
    ]);
    let rollout_path = record_two_turns(&home, client.clone()).await;

    let manager = ConversationManager::new(client.clone());
    let NewConversation {
        conversation,
        session_configured,
        ..
    } = manager
        .fork_conversation(1, load_default_config_for_test(&home), rollout_path.clone())
        .await
        .unwrap();
    assert_ne!(rollout_path, session_configured.rollout_path);
    assert_eq!(session_configured.rollout_path, conversation.rollout_path());
    assert_eq!(session_configured.session_id, conversation.conversation_id());

    turn(&conversation, "two, differently").await;
    assert_eq!(
        vec!["one", "a1", "two, differently"],
        message_texts(&client.prompts()[2].input)
    );
}
