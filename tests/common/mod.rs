//! Local stand-ins for the backend, the realtime socket and the audio devices.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::http::HeaderValue;

use assistline::audio::{AudioBackend, CaptureStream, OutputSink};
use assistline::{AudioError, BackendClient, ClientConfig};

// ============================================================================
// HTTP backend
// ============================================================================

/// One step of a scripted chat stream body.
#[derive(Debug, Clone)]
pub enum Chunk {
    Data(String),
    Pause(Duration),
    /// Breaks the body off mid-response.
    Fail,
}

/// An `event:`/`data:` frame as the backend writes it.
pub fn frame(event: &str, data: Value) -> Chunk {
    Chunk::Data(format!("event: {event}\ndata: {data}\n\n"))
}

pub fn raw(text: &str) -> Chunk {
    Chunk::Data(text.to_string())
}

pub fn pause(millis: u64) -> Chunk {
    Chunk::Pause(Duration::from_millis(millis))
}

pub fn fail() -> Chunk {
    Chunk::Fail
}

pub struct MockBackend {
    pub stream_status: StatusCode,
    pub stream_script: Vec<Chunk>,
    pub artifacts: Value,
    pub orchestrator_reply: Value,
    pub orchestrator_status: StatusCode,
    pub ephemeral_status: StatusCode,
    pub ephemeral_delay: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            stream_status: StatusCode::OK,
            stream_script: Vec::new(),
            artifacts: json!([]),
            orchestrator_reply: json!({"ok": true, "result": {"items": []}}),
            orchestrator_status: StatusCode::OK,
            ephemeral_status: StatusCode::OK,
            ephemeral_delay: Duration::ZERO,
        }
    }
}

struct BackendState {
    config: MockBackend,
    recorded: Recorded,
}

/// What the mock backend received.
#[derive(Clone, Default)]
pub struct Recorded {
    pub chat_requests: Arc<Mutex<Vec<Value>>>,
    pub aborts: Arc<Mutex<Vec<String>>>,
    pub orchestrator_requests: Arc<Mutex<Vec<Value>>>,
    pub authorization: Arc<Mutex<Vec<String>>>,
}

pub struct MockServer {
    pub base_url: String,
    pub recorded: Recorded,
}

impl MockServer {
    pub fn client(&self) -> BackendClient {
        BackendClient::new(ClientConfig {
            base_url: self.base_url.clone(),
            token: Some("test-token".to_string()),
        })
    }
}

impl MockBackend {
    pub async fn spawn(self) -> MockServer {
        let recorded = Recorded::default();
        let state = Arc::new(BackendState {
            config: self,
            recorded: recorded.clone(),
        });

        let app = axum::Router::new()
            .route("/chat/intelligent/stream", post(chat_stream))
            .route("/chat/intelligent/abort", post(abort))
            .route("/chat/orchestrator", post(orchestrator))
            .route("/artifacts", get(artifacts))
            .route("/realtime/ephemeral-key", post(ephemeral_key))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockServer {
            base_url: format!("http://{addr}/"),
            recorded,
        }
    }
}

async fn chat_stream(
    State(state): State<Arc<BackendState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.recorded.authorization.lock().unwrap().push(auth.to_string());
    }
    state.recorded.chat_requests.lock().unwrap().push(body);

    if state.config.stream_status != StatusCode::OK {
        return (state.config.stream_status, "stream refused").into_response();
    }

    let script = state.config.stream_script.clone();
    let stream = futures::stream::iter(script)
        .then(|chunk| async move {
            match chunk {
                Chunk::Data(text) => Some(Ok(Bytes::from(text))),
                Chunk::Pause(duration) => {
                    tokio::time::sleep(duration).await;
                    None
                }
                Chunk::Fail => Some(Err(std::io::Error::other("connection reset"))),
            }
        })
        .filter_map(|chunk| async move { chunk });

    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn abort(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> StatusCode {
    let request_id = body["requestId"].as_str().unwrap_or_default().to_string();
    state.recorded.aborts.lock().unwrap().push(request_id);
    StatusCode::OK
}

async fn orchestrator(State(state): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    state.recorded.orchestrator_requests.lock().unwrap().push(body);
    if state.config.orchestrator_status != StatusCode::OK {
        return (state.config.orchestrator_status, "orchestrator unavailable").into_response();
    }
    Json(state.config.orchestrator_reply.clone()).into_response()
}

async fn artifacts(State(state): State<Arc<BackendState>>) -> Json<Value> {
    Json(state.config.artifacts.clone())
}

async fn ephemeral_key(State(state): State<Arc<BackendState>>) -> Response {
    tokio::time::sleep(state.config.ephemeral_delay).await;
    if state.config.ephemeral_status != StatusCode::OK {
        return (state.config.ephemeral_status, "no key").into_response();
    }
    Json(json!({"client_secret": {"value": "ek_test", "expires_at": 0}})).into_response()
}

// ============================================================================
// Realtime socket
// ============================================================================

#[derive(Clone, Default)]
pub struct MockRealtime {
    pub url: String,
    pub received: Arc<Mutex<Vec<Value>>>,
    pub protocols: Arc<Mutex<Vec<String>>>,
    pub connections: Arc<AtomicUsize>,
    outgoing: Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>,
}

impl MockRealtime {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mock = MockRealtime {
            url: format!("ws://{addr}/v1/realtime"),
            ..Default::default()
        };

        let server = mock.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let server = server.clone();
                tokio::spawn(async move { server.serve(stream).await });
            }
        });

        mock
    }

    async fn serve(&self, stream: tokio::net::TcpStream) {
        let protocols = Arc::clone(&self.protocols);
        let callback = move |request: &Request, mut response: WsResponse| -> Result<WsResponse, ErrorResponse> {
            if let Some(value) = request
                .headers()
                .get("sec-websocket-protocol")
                .and_then(|v| v.to_str().ok())
            {
                protocols.lock().unwrap().push(value.to_string());
            }
            response
                .headers_mut()
                .insert("sec-websocket-protocol", HeaderValue::from_static("realtime"));
            Ok(response)
        };

        let Ok(socket) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };
        self.connections.fetch_add(1, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
        *self.outgoing.lock().unwrap() = Some(tx);
        let (mut write, mut read) = socket.split();

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                            self.received.lock().unwrap().push(value);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                },
                Some(event) = rx.recv() => {
                    if write.send(Message::Text(event.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Sends a server event on the most recent connection.
    pub fn push(&self, event: Value) {
        if let Some(tx) = self.outgoing.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|value| value["type"].as_str().map(str::to_string))
            .collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.types().iter().filter(|t| t.as_str() == kind).count()
    }
}

// ============================================================================
// Audio devices
// ============================================================================

/// Audio backend that logs every device step and counts live captures.
#[derive(Clone, Default)]
pub struct MemoryAudio {
    pub log: Arc<Mutex<Vec<String>>>,
    pub live_captures: Arc<AtomicUsize>,
    pub max_live_captures: Arc<AtomicUsize>,
    pub opened: Arc<AtomicUsize>,
    pub played: Arc<Mutex<Vec<Vec<f32>>>>,
    frames: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

impl MemoryAudio {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Feeds one frame into the most recently opened capture.
    pub async fn feed(&self, samples: Vec<f32>) {
        let sender = self.frames.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(samples).await;
        }
    }
}

impl AudioBackend for MemoryAudio {
    fn open_capture(
        &self,
        _sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let live = self.live_captures.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live_captures.fetch_max(live, Ordering::SeqCst);
        self.log.lock().unwrap().push(format!("open_capture#{id}"));
        *self.frames.lock().unwrap() = Some(frames);

        Ok(Box::new(MemoryCapture {
            id,
            log: Arc::clone(&self.log),
            live: Arc::clone(&self.live_captures),
            frames: Arc::clone(&self.frames),
        }))
    }

    fn open_output(&self, _sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
        self.log.lock().unwrap().push("open_output".to_string());
        Ok(Box::new(MemorySink {
            log: Arc::clone(&self.log),
            played: Arc::clone(&self.played),
        }))
    }
}

struct MemoryCapture {
    id: usize,
    log: Arc<Mutex<Vec<String>>>,
    live: Arc<AtomicUsize>,
    frames: Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>,
}

impl MemoryCapture {
    fn step(&self, name: &str) {
        self.log.lock().unwrap().push(format!("{name}#{}", self.id));
    }
}

impl CaptureStream for MemoryCapture {
    fn stop_recording(&mut self) {
        self.step("stop_recording");
        self.frames.lock().unwrap().take();
    }

    fn disconnect_graph(&mut self) {
        self.step("disconnect_graph");
    }

    fn close_context(&mut self) {
        self.step("close_context");
    }

    fn stop_tracks(&mut self) {
        self.step("stop_tracks");
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySink {
    log: Arc<Mutex<Vec<String>>>,
    played: Arc<Mutex<Vec<Vec<f32>>>>,
}

impl OutputSink for MemorySink {
    fn play(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        self.played.lock().unwrap().push(samples.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        self.log.lock().unwrap().push("close_output".to_string());
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
