//! Agent network router behavior: the termination rule, the iteration
//! bound, and how tool outcomes feed back into the loop.

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use relay::retry::RetryPolicy;
use relay::router::FORCED_STOP_FALLBACK;
use relay::workflows::process_message::{DEFINITION_ID, FAILURE_NOTICE};
use relay_llm::ContentBlock;
use relay_sdk::{FileKind, MessageStatus, ProjectFile, TerminalOutcome};

#[tokio::test]
async fn text_only_turn_stops_the_loop() {
    let store = seeded_store("Project chat");
    let model = Arc::new(ScriptedModel::new(vec![text_turn("done")]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    assert_eq!(model.call_count(), 1);
    assert_eq!(
        store.stored_message(TARGET_MESSAGE).expect("message").content,
        "done"
    );
}

#[tokio::test]
async fn end_to_end_tool_then_text() {
    // messageId M1; iteration 1 returns a tool call, the tool executes and
    // returns a listing, iteration 2 returns text -> final content "done".
    let store = seeded_store("Project chat");
    store.insert_file(ProjectFile {
        id: "f1".to_string(),
        project_id: PROJECT.to_string(),
        parent_id: None,
        name: "main.rs".to_string(),
        kind: FileKind::File,
        content: Some("fn main() {}".to_string()),
        updated_at: 0,
    });

    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("t1", "list_folder", json!({ "projectId": PROJECT })),
        text_turn("done"),
    ]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    assert_eq!(model.call_count(), 2);

    let message = store.stored_message(TARGET_MESSAGE).expect("message");
    assert_eq!(message.content, "done");
    assert_eq!(message.status, Some(MessageStatus::Completed));

    // The second request carried the tool result back to the model.
    let requests = model.recorded_requests();
    let last_message = requests[1].messages.last().expect("tool result message");
    match &last_message.content[0] {
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            assert_eq!(tool_use_id, "t1");
            assert!(!is_error);
            assert!(content.contains("main.rs"));
        }
        other => panic!("expected a tool result block, got {other:?}"),
    }
}

#[tokio::test]
async fn text_with_tool_call_continues() {
    let store = seeded_store("Project chat");
    let model = Arc::new(ScriptedModel::new(vec![
        mixed_turn(
            "let me check the project first",
            "t1",
            "list_folder",
            json!({ "projectId": PROJECT }),
        ),
        text_turn("nothing to do"),
    ]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    // The mixed turn did not terminate the loop.
    assert_eq!(model.call_count(), 2);
    assert_eq!(
        store.stored_message(TARGET_MESSAGE).expect("message").content,
        "nothing to do"
    );
}

#[tokio::test]
async fn iteration_bound_forces_a_stop() {
    let store = seeded_store("Project chat");
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("t1", "list_folder", json!({ "projectId": PROJECT })),
        tool_turn("t2", "list_folder", json!({ "projectId": PROJECT })),
        tool_turn("t3", "list_folder", json!({ "projectId": PROJECT })),
    ]));
    let mut bounded = settings();
    bounded.max_iterations = 3;
    let engine = build_engine(
        store.clone(),
        model.clone(),
        bounded,
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    // Exactly three invocations, then the forced stop.
    assert_eq!(model.call_count(), 3);
    assert_eq!(
        store.stored_message(TARGET_MESSAGE).expect("message").content,
        FORCED_STOP_FALLBACK
    );
}

#[tokio::test]
async fn forced_stop_prefers_the_best_available_text() {
    let store = seeded_store("Project chat");
    let model = Arc::new(ScriptedModel::new(vec![
        mixed_turn(
            "working on it",
            "t1",
            "list_folder",
            json!({ "projectId": PROJECT }),
        ),
        tool_turn("t2", "list_folder", json!({ "projectId": PROJECT })),
    ]));
    let mut bounded = settings();
    bounded.max_iterations = 2;
    let engine = build_engine(
        store.clone(),
        model.clone(),
        bounded,
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    assert_eq!(
        store.stored_message(TARGET_MESSAGE).expect("message").content,
        "working on it"
    );
}

#[tokio::test]
async fn tool_domain_errors_are_surfaced_not_fatal() {
    let store = seeded_store("Project chat");
    store.insert_file(ProjectFile {
        id: "f1".to_string(),
        project_id: PROJECT.to_string(),
        parent_id: None,
        name: "main.rs".to_string(),
        kind: FileKind::File,
        content: Some("fn main() {}".to_string()),
        updated_at: 0,
    });

    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn(
            "t1",
            "create_file",
            json!({ "projectId": PROJECT, "name": "main.rs", "content": "" }),
        ),
        text_turn("main.rs already exists, left it alone"),
    ]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    // The duplicate name was the agent's problem, not the instance's.
    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    assert_eq!(model.call_count(), 2);

    let requests = model.recorded_requests();
    let last_message = requests[1].messages.last().expect("tool result message");
    match &last_message.content[0] {
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            assert!(*is_error);
            assert!(content.contains("already exists"));
        }
        other => panic!("expected a tool result block, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_tool_is_surfaced_to_the_agent() {
    let store = seeded_store("Project chat");
    let model = Arc::new(ScriptedModel::new(vec![
        tool_turn("t1", "launch_rockets", json!({})),
        text_turn("that tool does not exist"),
    ]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Completed(_)));
    assert_eq!(model.call_count(), 2);
}

#[tokio::test]
async fn unauthorized_tool_call_fails_the_instance() {
    let store = seeded_store("Project chat");
    store
        .files_unauthorized
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let model = Arc::new(ScriptedModel::new(vec![tool_turn(
        "t1",
        "read_file",
        json!({ "fileId": "f1" }),
    )]));
    let engine = build_engine(
        store.clone(),
        model.clone(),
        settings(),
        RetryPolicy::no_retry(),
    );

    let outcome = engine
        .execute(DEFINITION_ID, sent_trigger())
        .await
        .expect("execute");

    assert!(matches!(outcome, TerminalOutcome::Failed(_)));

    // The failure handler kicked in: placeholder content, terminal status.
    let patches = store.content_patches();
    assert_eq!(patches.len(), 1);
    assert_eq!(
        patches[0],
        PatchRecord::Content {
            message_id: TARGET_MESSAGE.to_string(),
            content: FAILURE_NOTICE.to_string(),
            status: MessageStatus::Completed,
        }
    );
}
