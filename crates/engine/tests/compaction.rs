//! Compaction behavior: budget-triggered summarization into shadow
//! threads, splice semantics, and idempotence of the effective prompt
//! shape.

mod common;

use common::*;

use weft_domain::{CancelToken, EventPayload, StopReason, StreamEvent, ThreadEvent, Usage};
use weft_engine::TurnConfig;

fn long_text(label: &str) -> String {
    format!("{label}: {}", "x".repeat(200))
}

fn stream_of(text: &str) -> Scripted {
    Scripted::Stream(vec![
        StreamEvent::Token { text: text.into() },
        StreamEvent::Done {
            usage: Some(Usage::new(30, 10)),
            stop_reason: StopReason::Stop,
        },
    ])
}

fn seed_conversation(store: &weft_store::EventStore, thread: &weft_domain::ThreadId) {
    for i in 0..3 {
        store
            .append(ThreadEvent::new(
                thread.clone(),
                EventPayload::UserMessage {
                    text: long_text(&format!("question {i}")),
                },
            ))
            .unwrap();
        store
            .append(ThreadEvent::new(
                thread.clone(),
                EventPayload::AgentMessage {
                    text: long_text(&format!("answer {i}")),
                    usage: None,
                },
            ))
            .unwrap();
    }
}

#[tokio::test]
async fn over_budget_turn_compacts_before_the_model_call() {
    let provider = MockProvider::with_small_window(
        vec![
            // Summarization call, then the actual turn.
            stream_of(&long_text("summary of earlier work")),
            stream_of("ok"),
        ],
        60,
        10,
    );
    let (store, threads, session) =
        session_with(provider.clone(), vec![], TurnConfig::default());

    let coordinator = session.coordinator_id();
    seed_conversation(&store, &coordinator);

    let outcome = session
        .send_message(&coordinator, "new question", CancelToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.text, "ok");

    // The raw thread carries a compaction marker referencing a shadow.
    let raw: Vec<ThreadEvent> = store
        .events_for_thread(&coordinator, None)
        .unwrap()
        .into_iter()
        .map(|s| s.event)
        .collect();
    let shadow_id = raw
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::Compaction { shadow_thread_id } => Some(shadow_thread_id.clone()),
            _ => None,
        })
        .expect("compaction marker");
    assert!(store.get_thread(&shadow_id).unwrap().unwrap().is_shadow);

    // The shadow records the whole summarization exchange for audit:
    // prompt, the packed conversation it covered, the summary, then the
    // kept tail.
    let shadow_events: Vec<ThreadEvent> = store
        .events_for_thread(&shadow_id, None)
        .unwrap()
        .into_iter()
        .map(|s| s.event)
        .collect();
    assert_eq!(
        kinds(&shadow_events),
        [
            "system_prompt",
            "local_system_message",
            "agent_message",
            "user_message",
        ]
    );
    let packed = text_of(&shadow_events[1]).unwrap();
    assert!(packed.contains("question 0"));
    assert!(packed.contains("answer 2"));

    // The effective view splices the shadow as a prefix: the summary and
    // the kept tail, then everything after the marker. The recorded
    // prompt and packed conversation ride along but are never replayed.
    let effective = threads.effective_events(&coordinator).unwrap();
    assert_eq!(
        kinds(&effective),
        [
            "system_prompt",
            "local_system_message",
            "agent_message",
            "user_message",
            "agent_message",
        ]
    );
    assert!(text_of(&effective[2]).unwrap().contains("summary"));
    assert_eq!(text_of(&effective[3]), Some("new question"));
    assert_eq!(text_of(&effective[4]), Some("ok"));

    // The summarization request went out before the turn's model call.
    let requests = provider.requests.lock();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].messages[0]
        .content
        .extract_all_text()
        .contains("question 0"));
}

#[tokio::test]
async fn recompaction_preserves_effective_prompt_shape() {
    let provider = MockProvider::with_small_window(
        vec![
            stream_of(&long_text("first summary")),
            stream_of("ok"),
            stream_of(&long_text("second summary")),
            stream_of("ok again"),
        ],
        60,
        10,
    );
    let (store, threads, session) = session_with(provider, vec![], TurnConfig::default());

    let coordinator = session.coordinator_id();
    seed_conversation(&store, &coordinator);

    session
        .send_message(&coordinator, "first question", CancelToken::new())
        .await
        .unwrap();
    let first_shape = kinds(&threads.effective_events(&coordinator).unwrap());

    session
        .send_message(&coordinator, "second question", CancelToken::new())
        .await
        .unwrap();
    let second_shape = kinds(&threads.effective_events(&coordinator).unwrap());

    // Semantically a no-op: the same prompt shape either way.
    assert_eq!(first_shape, second_shape);

    // Both markers remain in the raw log; the last one wins on read.
    let raw: Vec<ThreadEvent> = store
        .events_for_thread(&coordinator, None)
        .unwrap()
        .into_iter()
        .map(|s| s.event)
        .collect();
    let markers = raw
        .iter()
        .filter(|e| matches!(e.payload, EventPayload::Compaction { .. }))
        .count();
    assert_eq!(markers, 2);

    let effective = threads.effective_events(&coordinator).unwrap();
    assert!(text_of(&effective[2]).unwrap().contains("second summary"));
    assert_eq!(text_of(&effective[3]), Some("second question"));
}

#[tokio::test]
async fn compaction_failure_fails_the_turn() {
    let provider = MockProvider::with_small_window(
        vec![Scripted::Fail(weft_domain::Error::Transient(
            "summarizer down".into(),
        ))],
        60,
        10,
    );
    let (store, _threads, session) = session_with(provider, vec![], TurnConfig::default());

    let coordinator = session.coordinator_id();
    seed_conversation(&store, &coordinator);

    let err = session
        .send_message(&coordinator, "new question", CancelToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, weft_domain::Error::CompactionFailed(_)));
}

#[tokio::test]
async fn disabled_compaction_never_triggers() {
    let provider = MockProvider::with_small_window(vec![stream_of("ok")], 60, 10);
    let config = TurnConfig {
        compaction: weft_engine::CompactionConfig {
            enabled: false,
            ..Default::default()
        },
        ..Default::default()
    };
    let (store, threads, session) = session_with(provider.clone(), vec![], config);

    let coordinator = session.coordinator_id();
    seed_conversation(&store, &coordinator);

    session
        .send_message(&coordinator, "q", CancelToken::new())
        .await
        .unwrap();
    assert_eq!(provider.call_count(), 1);
    let effective = threads.effective_events(&coordinator).unwrap();
    assert!(!kinds(&effective).contains(&"compaction"));
}
