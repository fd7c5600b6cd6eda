use codex_core::ConversationManager;
use codex_core::NewConversation;
use codex_core::protocol::EventMsg;
use codex_core::protocol::InputItem;
use codex_core::protocol::Op;
use codex_core::protocol::TaskCompleteEvent;
use codex_core::protocol::TurnAbortReason;
use codex_core::protocol::TurnAbortedEvent;
use codex_core::protocol::TurnOverrides;
use codex_protocol::models::ContentItem;
use codex_protocol::models::ResponseItem;
use codex_protocol::plan_tool::StepStatus;
use core_test_support::ScriptStep;
use core_test_support::ScriptedModelClient;
use core_test_support::assistant_reply;
use core_test_support::collect_events_until;
use core_test_support::ev_completed;
use core_test_support::ev_created;
use core_test_support::ev_function_call;
use core_test_support::ev_text_delta;
use core_test_support::function_output;
use core_test_support::load_default_config_for_test;
use core_test_support::wait_for_event;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn text(text: &str) -> Vec<InputItem> {
    vec![InputItem::Text {
        text: text.to_string(),
    }]
}

/// (role, text) of every message in a prompt, in order.
fn messages(input: &[ResponseItem]) -> Vec<(String, String)> {
    input
        .iter()
        .filter_map(|item| match item {
            ResponseItem::Message { role, content, .. } => {
                let text = content
                    .iter()
                    .map(|c| match c {
                        ContentItem::InputText { text } | ContentItem::OutputText { text } => {
                            text.as_str()
                        }
                        ContentItem::InputImage { .. } => "",
                    })
                    .collect::<String>();
                Some((role.clone(), text))
            }
            _ => None,
        })
        .collect()
}

fn is_task_complete(ev: &EventMsg) -> bool {
    matches!(ev, EventMsg::TaskComplete(_))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn simple_turn_emits_events_in_order() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![assistant_reply("r1", "hello there")]);
    let manager = ConversationManager::new(client.clone());
    let NewConversation {
        conversation: codex,
        session_configured,
        ..
    } = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap();
    assert!(session_configured.rollout_path.exists());

    codex
        .submit(Op::UserInput { items: text("hi") })
        .await
        .unwrap();
    let events = collect_events_until(&codex, is_task_complete).await;

    assert!(matches!(events[0], EventMsg::TaskStarted(_)));
    assert!(matches!(&events[1], EventMsg::UserMessage(ev) if ev.message == "hi"));
    assert!(matches!(&events[2], EventMsg::AgentMessage(ev) if ev.message == "hello there"));
    assert!(matches!(events[3], EventMsg::TokenCount(_)));
    assert!(matches!(
        &events[4],
        EventMsg::TaskComplete(TaskCompleteEvent { last_agent_message: Some(m) }) if m == "hello there"
    ));
    assert_eq!(5, events.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_input_aborts_active_turn_before_starting() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        vec![ev_created(), ev_text_delta("partial answer"), ScriptStep::Hang],
        assistant_reply("r2", "second answer"),
    ]);
    let manager = ConversationManager::new(client.clone());
    let codex = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput {
            items: text("first"),
        })
        .await
        .unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::AgentMessageDelta(_))).await;

    codex
        .submit(Op::UserInput {
            items: text("second"),
        })
        .await
        .unwrap();
    let events = collect_events_until(&codex, is_task_complete).await;

    let aborted = events
        .iter()
        .position(|ev| {
            matches!(
                ev,
                EventMsg::TurnAborted(TurnAbortedEvent {
                    reason: TurnAbortReason::Replaced
                })
            )
        })
        .expect("first turn should be aborted");
    let started = events
        .iter()
        .position(|ev| matches!(ev, EventMsg::TaskStarted(_)))
        .expect("second turn should start");
    assert!(aborted < started, "events: {events:?}");

    // The second turn sees what the first one streamed before it was cut off.
    let prompts = client.prompts();
    assert_eq!(2, prompts.len());
    assert_eq!(
        vec![
            ("user".to_string(), "first".to_string()),
            ("assistant".to_string(), "partial answer".to_string()),
            ("user".to_string(), "second".to_string()),
        ],
        messages(&prompts[1].input)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_aborts_with_interrupted_reason() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![vec![
        ev_created(),
        ev_text_delta("thinking"),
        ScriptStep::Hang,
    ]]);
    let manager = ConversationManager::new(client.clone());
    let codex = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput { items: text("go") })
        .await
        .unwrap();
    wait_for_event(&codex, |ev| matches!(ev, EventMsg::AgentMessageDelta(_))).await;
    codex.submit(Op::Interrupt).await.unwrap();

    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::TurnAborted(_))).await;
    assert!(matches!(
        ev,
        EventMsg::TurnAborted(TurnAbortedEvent {
            reason: TurnAbortReason::Interrupted
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stream_errors_are_retried_then_succeed() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        vec![ev_created(), ScriptStep::StreamError("connection reset".to_string())],
        assistant_reply("r2", "recovered"),
    ]);
    let manager = ConversationManager::new(client.clone());
    let codex = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput { items: text("hi") })
        .await
        .unwrap();
    let events = collect_events_until(&codex, is_task_complete).await;

    assert!(
        events
            .iter()
            .any(|ev| matches!(ev, EventMsg::StreamError(e) if e.message.contains("connection reset")))
    );
    assert!(matches!(
        events.last(),
        Some(EventMsg::TaskComplete(TaskCompleteEvent { last_agent_message: Some(m) })) if m == "recovered"
    ));
    assert_eq!(2, client.request_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_turn_config_fails_before_any_model_call() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![]);
    let manager = ConversationManager::new(client.clone());
    let codex = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserTurn {
            items: text("hi"),
            overrides: TurnOverrides {
                exec_timeout_ms: Some(0),
                ..Default::default()
            },
        })
        .await
        .unwrap();
    let events = collect_events_until(&codex, is_task_complete).await;

    assert!(matches!(events[0], EventMsg::TaskStarted(_)));
    assert!(matches!(&events[1], EventMsg::Error(e) if e.message.contains("timeout")));
    assert_eq!(0, client.request_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plan_updates_are_forwarded() {
    let home = TempDir::new().unwrap();
    let client = ScriptedModelClient::new(vec![
        vec![
            ev_created(),
            ev_function_call(
                "plan-1",
                "update_plan",
                json!({
                    "explanation": "two steps",
                    "plan": [
                        {"step": "read code", "status": "completed"},
                        {"step": "write fix", "status": "in_progress"}
                    ]
                }),
            ),
            ev_completed("r1"),
        ],
        assistant_reply("r2", "done"),
    ]);
    let manager = ConversationManager::new(client.clone());
    let codex = manager
        .new_conversation(load_default_config_for_test(&home))
        .await
        .unwrap()
        .conversation;

    codex
        .submit(Op::UserInput { items: text("fix") })
        .await
        .unwrap();
    let ev = wait_for_event(&codex, |ev| matches!(ev, EventMsg::PlanUpdate(_))).await;
    let EventMsg::PlanUpdate(update) = ev else {
        unreachable!();
    };
    assert_eq!(2, update.plan.len());
    assert_eq!(StepStatus::InProgress, update.plan[1].status);
    wait_for_event(&codex, is_task_complete).await;

    assert_eq!(
        Some("Plan updated"),
        function_output(&client.prompts()[1], "plan-1")
    );
}
