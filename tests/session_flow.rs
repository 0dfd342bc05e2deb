//! End-to-end session loop tests
//!
//! `live_` tests drive the real effect runner against a wiremock backend;
//! `stub_` tests use the scripted runner. No microphone is touched.

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use voxstream::session::VOICE_PLACEHOLDER;
use voxstream::store::Role;
use voxstream::streaming::{StreamEvent, StreamSignal};
use voxstream::{
    spawn_session, ChatSettings, LiveEffectRunner, Notice, RecordingState, SessionCommand,
    SessionController, SessionHandle, SessionObserver, SessionStore, StubEffectRunner,
};

/// What the observer saw after one event
#[derive(Debug, Clone)]
enum Update {
    State {
        streaming: bool,
        recording: &'static str,
        messages: Vec<(Role, String)>,
        input: String,
        sessions: usize,
    },
    Notice(Notice),
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<Update>,
}

impl SessionObserver for ChannelObserver {
    fn state_changed(&mut self, store: &SessionStore, recording: &RecordingState) {
        let _ = self.tx.send(Update::State {
            streaming: store.is_streaming,
            recording: recording.label(),
            messages: store
                .messages
                .iter()
                .map(|m| (m.role, m.content.clone()))
                .collect(),
            input: store.input_value.clone(),
            sessions: store.sessions.len(),
        });
    }

    fn notify(&mut self, notice: &Notice) {
        let _ = self.tx.send(Update::Notice(notice.clone()));
    }
}

fn observer() -> (ChannelObserver, mpsc::UnboundedReceiver<Update>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelObserver { tx }, rx)
}

async fn wait_for(
    rx: &mut mpsc::UnboundedReceiver<Update>,
    pred: impl Fn(&Update) -> bool,
) -> Update {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(update) if pred(&update) => return update,
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

async fn finish<O: SessionObserver>(
    handle: SessionHandle,
    task: tokio::task::JoinHandle<SessionController<O>>,
) -> SessionController<O> {
    handle.exit().await.expect("loop alive");
    task.await.expect("loop task")
}

fn sse(frames: &[(&str, &str)]) -> String {
    frames
        .iter()
        .map(|(event, data)| format!("event: {}\ndata: {}\n\n", event, data))
        .collect()
}

fn settings_for(server: &MockServer) -> ChatSettings {
    ChatSettings {
        base_url: server.uri(),
        ..ChatSettings::default()
    }
}

#[tokio::test]
async fn live_text_exchange_streams_and_refreshes_sessions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/unified-chat"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse(&[
                ("token", "\"Hel\""),
                ("token", "\"lo\""),
                ("log", r#"{"level": "info", "msg": "routed"}"#),
                ("done", "{}"),
            ]),
            "text/event-stream",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/sessions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([{"session_id": "abc", "title": "Greeting"}])),
        )
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let (obs, mut rx) = observer();
    let runner = LiveEffectRunner::new(&settings).expect("runner");
    let (handle, task) = spawn_session(SessionController::from_settings(&settings, obs), runner);

    handle
        .command(SessionCommand::SendText("hi".into()))
        .await
        .expect("send");
    wait_for(&mut rx, |u| {
        matches!(u, Update::State { streaming: false, sessions: 1, .. })
    })
    .await;

    let controller = finish(handle, task).await;
    let store = controller.store();
    assert_eq!(store.messages.len(), 2);
    assert_eq!(store.messages[0].content, "hi");
    assert_eq!(store.messages[1].content, "Hello");
    assert!(!store.messages[1].streaming);
    assert_eq!(store.log_entries.len(), 1);
    assert_eq!(store.sessions[0].session_id, "abc");
    assert_eq!(controller.metrics().get_summary().successful_exchanges, 1);
}

#[tokio::test]
async fn live_backend_error_rolls_back_and_restores_input() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/unified-chat"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"detail": "boom"})))
        .mount(&server)
        .await;

    let settings = settings_for(&server);
    let (obs, mut rx) = observer();
    let runner = LiveEffectRunner::new(&settings).expect("runner");
    let (handle, task) = spawn_session(SessionController::from_settings(&settings, obs), runner);

    handle
        .command(SessionCommand::SendText("hi".into()))
        .await
        .expect("send");
    let update = wait_for(&mut rx, |u| matches!(u, Update::Notice(Notice::Error(_)))).await;
    let Update::Notice(Notice::Error(message)) = update else {
        unreachable!()
    };
    assert!(message.contains("boom"), "unexpected message: {}", message);

    let controller = finish(handle, task).await;
    let store = controller.store();
    assert!(store.messages.is_empty());
    assert!(!store.is_streaming);
    assert_eq!(store.input_value, "hi");
}

#[tokio::test]
async fn stub_error_event_reports_once() {
    let runner = StubEffectRunner::with_script(vec![
        StreamSignal::Event(StreamEvent::new("token", json!("par"))),
        StreamSignal::Event(StreamEvent::new("error", json!("tool crashed"))),
        StreamSignal::Event(StreamEvent::new("error", json!("tool crashed again"))),
        StreamSignal::Closed,
    ]);
    let (obs, mut rx) = observer();
    let controller = SessionController::from_settings(&ChatSettings::default(), obs);
    let (handle, task) = spawn_session(controller, runner);

    handle
        .command(SessionCommand::SendText("hello".into()))
        .await
        .expect("send");
    wait_for(&mut rx, |u| matches!(u, Update::Notice(Notice::Error(_)))).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let controller = finish(handle, task).await;
    let mut errors = 0;
    while let Ok(update) = rx.try_recv() {
        if matches!(update, Update::Notice(Notice::Error(_))) {
            errors += 1;
        }
    }
    assert_eq!(errors, 0, "failure reported more than once");
    assert!(controller.store().messages.is_empty());
    assert_eq!(controller.store().input_value, "hello");
}

#[tokio::test]
async fn stub_second_send_while_streaming_is_busy() {
    let (obs, mut rx) = observer();
    let controller = SessionController::from_settings(&ChatSettings::default(), obs);
    let (handle, task) = spawn_session(controller, StubEffectRunner::new());

    handle
        .command(SessionCommand::SendText("one".into()))
        .await
        .expect("send");
    handle
        .command(SessionCommand::SendText("two".into()))
        .await
        .expect("send");

    wait_for(&mut rx, |u| matches!(u, Update::Notice(Notice::Busy))).await;
    wait_for(&mut rx, |u| {
        matches!(u, Update::State { streaming: false, messages, .. } if messages.len() == 2)
    })
    .await;

    let controller = finish(handle, task).await;
    let contents: Vec<_> = controller
        .store()
        .messages
        .iter()
        .map(|m| m.content.clone())
        .collect();
    assert_eq!(contents, vec!["one".to_string(), "Stub reply".to_string()]);
}

#[tokio::test]
async fn stub_voice_round_trip() {
    let (obs, mut rx) = observer();
    let controller = SessionController::from_settings(&ChatSettings::default(), obs);
    let (handle, task) = spawn_session(controller, StubEffectRunner::new());

    handle
        .command(SessionCommand::StartRecording)
        .await
        .expect("start");
    wait_for(&mut rx, |u| {
        matches!(u, Update::State { recording: "recording", .. })
    })
    .await;

    handle
        .command(SessionCommand::StopRecording)
        .await
        .expect("stop");
    let update = wait_for(&mut rx, |u| {
        matches!(u, Update::State { streaming: false, messages, .. } if messages.len() == 2)
    })
    .await;

    let Update::State {
        messages,
        recording,
        input,
        ..
    } = update
    else {
        unreachable!()
    };
    assert_eq!(recording, "idle");
    assert_eq!(input, "");
    assert_eq!(messages[0], (Role::User, VOICE_PLACEHOLDER.to_string()));
    assert_eq!(messages[1], (Role::Assistant, "Stub reply".to_string()));

    finish(handle, task).await;
}

#[tokio::test]
async fn stub_stop_streaming_keeps_partial_reply() {
    let runner = StubEffectRunner::with_script(vec![
        StreamSignal::Event(StreamEvent::new("token", json!("partial"))),
        StreamSignal::Event(StreamEvent::new("token", json!(" more"))),
        StreamSignal::Event(StreamEvent::new("token", json!(" text"))),
        StreamSignal::Event(StreamEvent::new("done", json!({}))),
        StreamSignal::Closed,
    ]);
    let (obs, mut rx) = observer();
    let controller = SessionController::from_settings(&ChatSettings::default(), obs);
    let (handle, task) = spawn_session(controller, runner);

    handle
        .command(SessionCommand::SendText("go".into()))
        .await
        .expect("send");
    wait_for(&mut rx, |u| {
        matches!(
            u,
            Update::State { messages, .. }
                if messages.len() == 2 && messages[1].1.starts_with("partial")
        )
    })
    .await;
    handle
        .command(SessionCommand::StopStreaming)
        .await
        .expect("stop");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let controller = finish(handle, task).await;
    let store = controller.store();
    assert!(!store.is_streaming);
    assert_eq!(store.messages.len(), 2);
    assert!(store.messages[1].content.starts_with("partial"));
    assert_eq!(store.streaming_count(), 0);
    while let Ok(update) = rx.try_recv() {
        assert!(
            !matches!(update, Update::Notice(Notice::Error(_))),
            "cancel must not report an error"
        );
    }
}
