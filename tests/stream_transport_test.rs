//! Integration tests for the text streaming transport against a local backend.

use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;

use assistline::protocol::StreamEvent;
use assistline::{
    ChatEvent, ChatRequest, StreamOutcome, StreamTransport, StreamTuning, TransportError, Visibility,
};

mod common;
use common::{MockBackend, fail, frame, pause, raw};

fn request(query: &str) -> ChatRequest {
    ChatRequest {
        user_query: query.to_string(),
        ..Default::default()
    }
}

async fn drain(handle: &mut assistline::StreamHandle) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

fn frames(events: &[ChatEvent]) -> Vec<&StreamEvent> {
    events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Frame(frame) => Some(frame),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn done_frame_completes_with_artifacts() {
    let server = MockBackend {
        stream_script: vec![
            frame("session_started", json!({"type": "session_started", "requestId": "req-1"})),
            frame("thinking", json!({"type": "thinking", "message": "Planning"})),
            frame(
                "tool_call",
                json!({"type": "tool_call", "name": "search_use_cases", "arguments": {"q": "billing"}}),
            ),
            frame("text", json!({"type": "text", "content": "Found 2"})),
            frame(
                "done",
                json!({
                    "type": "done",
                    "response": "Found 2 use cases.",
                    "skillsUsed": ["search"],
                    "sessionId": "s-1",
                    "artifacts": [{"id": "a1", "type": "report", "title": "Summary"}]
                }),
            ),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("billing use cases")).await.unwrap();
    let events = drain(&mut handle).await;
    let outcome = handle.completion().await.unwrap();

    let frames = frames(&events);
    assert_eq!(frames.len(), 5);
    assert!(matches!(frames[1], StreamEvent::Thinking { .. }));
    assert!(matches!(frames[4], StreamEvent::Done { .. }));

    let StreamOutcome::Completed(done) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(done.response, "Found 2 use cases.");
    assert_eq!(done.skills, vec!["search".to_string()]);
    assert_eq!(done.session_id.as_deref(), Some("s-1"));
    assert_eq!(done.artifacts.len(), 1);
    assert_eq!(done.artifacts[0].id, "a1");

    let sent = server.recorded.chat_requests.lock().unwrap().clone();
    assert_eq!(sent[0]["userQuery"], "billing use cases");
    assert_eq!(
        server.recorded.authorization.lock().unwrap().as_slice(),
        ["Bearer test-token"]
    );
}

#[tokio::test]
async fn rejected_request_fails_before_any_event() {
    let server = MockBackend {
        stream_status: StatusCode::UNAUTHORIZED,
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let err = transport.open(request("hi")).await.err().unwrap();
    match err {
        TransportError::Handshake { status, body } => {
            assert_eq!(status, 401);
            assert_eq!(body, "stream refused");
        }
        other => panic!("expected handshake error, got {other:?}"),
    }
}

#[tokio::test]
async fn truncated_stream_recovers_recent_artifacts() {
    let recent = (Utc::now() - chrono::Duration::seconds(10)).to_rfc3339();
    let stale = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            frame("tool_call", json!({"type": "tool_call", "name": "generate_report"})),
        ],
        artifacts: json!({"artifacts": [
            {"id": "old", "type": "report", "title": "Old report", "createdAt": stale},
            {"id": "new", "type": "report", "title": "Q3 report", "createdAt": recent}
        ]}),
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("make a report")).await.unwrap();
    let events = drain(&mut handle).await;
    let outcome = handle.completion().await.unwrap();

    assert_eq!(events.last(), Some(&ChatEvent::Recovering));
    let StreamOutcome::Recovered { message, artifacts } = outcome else {
        panic!("expected recovery, got {outcome:?}");
    };
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id, "new");
    assert!(message.contains("Q3 report"));
}

#[tokio::test]
async fn truncated_stream_without_artifacts_is_an_error() {
    let server = MockBackend {
        stream_script: vec![frame("thinking", json!({"type": "thinking"}))],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("hello")).await.unwrap();
    drain(&mut handle).await;
    let err = handle.completion().await.err().unwrap();
    assert!(matches!(err, TransportError::Truncated));
}

#[tokio::test]
async fn error_frame_surfaces_server_message() {
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            frame("error", json!({"type": "error", "message": "Rate limit exceeded"})),
            frame("text", json!({"type": "text", "content": "never delivered"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("hello")).await.unwrap();
    let events = drain(&mut handle).await;
    let err = handle.completion().await.err().unwrap();

    assert_eq!(err.to_string(), "Rate limit exceeded");
    assert!(
        !frames(&events)
            .iter()
            .any(|frame| matches!(frame, StreamEvent::Text { .. }))
    );
}

#[tokio::test]
async fn long_silence_reports_slow_connection_and_keeps_reading() {
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            pause(300),
            frame("done", json!({"type": "done", "response": "late but fine"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client()).with_tuning(StreamTuning {
        idle_threshold: Duration::from_millis(100),
        health_interval: Duration::from_millis(20),
        ..Default::default()
    });
    let mut handle = transport.open(request("hello")).await.unwrap();
    let events = drain(&mut handle).await;
    let outcome = handle.completion().await.unwrap();

    let slow = events
        .iter()
        .filter(|event| matches!(event, ChatEvent::ConnectionSlow { .. }))
        .count();
    assert_eq!(slow, 1);
    assert!(matches!(outcome, StreamOutcome::Completed(ref done) if done.response == "late but fine"));
}

#[tokio::test]
async fn cancel_stops_reading_and_sends_abort() {
    let server = MockBackend {
        stream_script: vec![
            frame("session_started", json!({"type": "session_started", "requestId": "req-42"})),
            pause(10_000),
            frame("done", json!({"type": "done", "response": "too late"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("long task")).await.unwrap();

    let first = handle.next_event().await.unwrap();
    assert!(matches!(first, ChatEvent::Frame(StreamEvent::SessionStarted { .. })));
    assert_eq!(handle.request_id().as_deref(), Some("req-42"));

    let canceller = handle.canceller();
    canceller.cancel().await;
    canceller.cancel().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), handle.completion())
        .await
        .expect("cancel should end the stream promptly")
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(
        server.recorded.aborts.lock().unwrap().as_slice(),
        ["req-42"]
    );
}

#[tokio::test]
async fn malformed_frames_and_keep_alives_are_skipped() {
    let server = MockBackend {
        stream_script: vec![
            raw(": keep-alive\n\n"),
            raw("event: text\ndata: {not json}\n\n"),
            raw("event: text\ndata: {\"type\":\"text\",\"con"),
            raw("tent\":\"hello\"}\n\n"),
            raw("event: mystery\ndata: {\"type\":\"mystery\"}\n\n"),
            frame("done", json!({"type": "done", "response": "hello"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("hello")).await.unwrap();
    let events = drain(&mut handle).await;
    handle.completion().await.unwrap();

    let frames = frames(&events);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0],
        &StreamEvent::Text {
            content: "hello".to_string()
        }
    );
}

#[tokio::test]
async fn opening_a_second_stream_cancels_the_first() {
    let server = MockBackend {
        stream_script: vec![
            frame("session_started", json!({"type": "session_started", "requestId": "req-1"})),
            pause(10_000),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut first = transport.open(request("first")).await.unwrap();
    assert!(matches!(
        first.next_event().await,
        Some(ChatEvent::Frame(StreamEvent::SessionStarted { .. }))
    ));

    let second = transport.open(request("second")).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), first.completion())
        .await
        .expect("first stream should be torn down")
        .unwrap();

    assert_eq!(outcome, StreamOutcome::Cancelled);
    assert_eq!(server.recorded.aborts.lock().unwrap().as_slice(), ["req-1"]);
    assert_eq!(server.recorded.chat_requests.lock().unwrap().len(), 2);

    second.cancel().await;
}

#[tokio::test]
async fn finished_streams_are_not_aborted_by_the_next_open() {
    let server = MockBackend {
        stream_script: vec![
            frame("session_started", json!({"type": "session_started", "requestId": "req-1"})),
            frame("done", json!({"type": "done", "response": "ok"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    for _ in 0..2 {
        let mut handle = transport.open(request("hello")).await.unwrap();
        drain(&mut handle).await;
        assert!(matches!(handle.completion().await.unwrap(), StreamOutcome::Completed(_)));
    }
    assert!(server.recorded.aborts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn returning_from_background_after_long_silence_reports_reconnecting() {
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            pause(400),
            frame("done", json!({"type": "done", "response": "back"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let (visibility, rx) = watch::channel(Visibility::Foreground);
    let transport = StreamTransport::new(server.client())
        .with_visibility(rx)
        .with_tuning(StreamTuning {
            background_threshold: Duration::from_millis(100),
            health_interval: Duration::from_millis(20),
            ..Default::default()
        });
    let mut handle = transport.open(request("hello")).await.unwrap();

    assert!(matches!(
        handle.next_event().await,
        Some(ChatEvent::Frame(StreamEvent::Thinking { .. }))
    ));
    visibility.send_replace(Visibility::Background);
    tokio::time::sleep(Duration::from_millis(200)).await;
    visibility.send_replace(Visibility::Foreground);

    let events = drain(&mut handle).await;
    let outcome = handle.completion().await.unwrap();

    let reconnecting: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Reconnecting { silent_for } => Some(*silent_for),
            _ => None,
        })
        .collect();
    assert_eq!(reconnecting.len(), 1);
    assert!(reconnecting[0] >= Duration::from_millis(100));
    assert!(matches!(outcome, StreamOutcome::Completed(_)));
}

#[tokio::test]
async fn short_background_or_foreground_only_gives_no_notice() {
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            pause(300),
            frame("done", json!({"type": "done", "response": "fine"})),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let (visibility, rx) = watch::channel(Visibility::Foreground);
    let transport = StreamTransport::new(server.client())
        .with_visibility(rx)
        .with_tuning(StreamTuning {
            background_threshold: Duration::from_secs(5),
            health_interval: Duration::from_millis(20),
            ..Default::default()
        });
    let mut handle = transport.open(request("hello")).await.unwrap();

    handle.next_event().await;
    visibility.send_replace(Visibility::Foreground);
    tokio::time::sleep(Duration::from_millis(50)).await;
    visibility.send_replace(Visibility::Background);
    tokio::time::sleep(Duration::from_millis(50)).await;
    visibility.send_replace(Visibility::Foreground);

    let events = drain(&mut handle).await;
    handle.completion().await.unwrap();
    assert!(!events.iter().any(|event| matches!(
        event,
        ChatEvent::Reconnecting { .. } | ChatEvent::ConnectionSlow { .. }
    )));
}

#[tokio::test]
async fn broken_body_recovers_recent_artifacts() {
    let recent = (Utc::now() - chrono::Duration::seconds(5)).to_rfc3339();
    let server = MockBackend {
        stream_script: vec![
            frame("thinking", json!({"type": "thinking"})),
            raw("event: text\ndata: {\"type\":\"te"),
            fail(),
        ],
        artifacts: json!([{"id": "deck", "type": "presentation", "title": "Roadmap deck", "createdAt": recent}]),
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("build a deck")).await.unwrap();
    let events = drain(&mut handle).await;
    let outcome = handle.completion().await.unwrap();

    assert_eq!(events.last(), Some(&ChatEvent::Recovering));
    let StreamOutcome::Recovered { artifacts, .. } = outcome else {
        panic!("expected recovery, got {outcome:?}");
    };
    assert_eq!(artifacts[0].id, "deck");
}

#[tokio::test]
async fn broken_body_without_artifacts_reports_stream_error() {
    let server = MockBackend {
        stream_script: vec![frame("thinking", json!({"type": "thinking"})), fail()],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("hello")).await.unwrap();
    drain(&mut handle).await;
    let err = handle.completion().await.err().unwrap();
    assert!(matches!(err, TransportError::Stream(_)), "got {err:?}");
}

#[tokio::test]
async fn interrupted_artifacts_join_the_final_response() {
    let server = MockBackend {
        stream_script: vec![
            frame(
                "interrupted",
                json!({"type": "interrupted", "reason": "timeout", "artifacts": [{"id": "draft", "title": "Draft"}]}),
            ),
            frame(
                "done",
                json!({"type": "done", "response": "Here you go", "artifacts": [{"id": "final", "title": "Final"}, {"id": "draft", "title": "Draft"}]}),
            ),
        ],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("hello")).await.unwrap();
    drain(&mut handle).await;

    let StreamOutcome::Completed(done) = handle.completion().await.unwrap() else {
        panic!("expected completion");
    };
    let ids: Vec<_> = done.artifacts.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, ["final", "draft"]);
}

#[tokio::test]
async fn interrupted_artifacts_alone_are_enough_to_recover() {
    let server = MockBackend {
        stream_script: vec![frame(
            "interrupted",
            json!({"type": "interrupted", "artifacts": [{"id": "partial", "title": "Partial export"}]}),
        )],
        ..Default::default()
    }
    .spawn()
    .await;

    let transport = StreamTransport::new(server.client());
    let mut handle = transport.open(request("export")).await.unwrap();
    drain(&mut handle).await;

    let StreamOutcome::Recovered { message, artifacts } = handle.completion().await.unwrap() else {
        panic!("expected recovery");
    };
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].id, "partial");
    assert!(message.contains("Partial export"));
}
