//! Text conversations over the `event:`/`data:` stream.
//!
//! [`StreamTransport::open`] issues the request and fails fast if the server
//! rejects it. After that a reader task owns the response body, decodes
//! frames in arrival order and publishes them on one [`ChatEvent`] channel.
//! The final result comes from [`StreamHandle::completion`].
//!
//! A body that ends (or breaks) without `done` is ambiguous rather than
//! failed: the reader asks the artifact listing for files produced in the
//! last two minutes before it gives up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::client::BackendClient;
use crate::error::{DecodeError, TransportError};
use crate::protocol::{ArtifactReference, ChatRequest, StreamEvent};
use crate::recovery::{ArtifactRecoveryClient, DEFAULT_RECOVERY_WINDOW, recovery_message};
use crate::sse::{FrameDecoder, SseFrame, decode_event};

#[derive(Debug, Clone)]
pub struct StreamTuning {
    /// Silence after which a slow-connection notice is emitted.
    pub idle_threshold: Duration,
    /// Silence that, on return from background, is reported as reconnecting.
    pub background_threshold: Duration,
    pub recovery_window: Duration,
    pub health_interval: Duration,
}

impl Default for StreamTuning {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(60),
            background_threshold: Duration::from_secs(30),
            recovery_window: DEFAULT_RECOVERY_WINDOW,
            health_interval: Duration::from_secs(5),
        }
    }
}

/// Application visibility, as reported by the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Frame(StreamEvent),
    /// No bytes for longer than the idle threshold. The stream stays open.
    ConnectionSlow { silent_for: Duration },
    /// Came back from background after a long silence.
    Reconnecting { silent_for: Duration },
    /// The stream ended without `done`; checking for finished artifacts.
    Recovering,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedResponse {
    pub response: String,
    pub metadata: Option<Value>,
    pub skills: Vec<String>,
    pub session_id: Option<String>,
    pub artifacts: Vec<ArtifactReference>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(CompletedResponse),
    /// The stream broke, but server-side work finished anyway.
    Recovered {
        message: String,
        artifacts: Vec<ArtifactReference>,
    },
    Cancelled,
}

/// Opens text conversations, one at a time.
///
/// Opening a new stream cancels the one before it (abort included). Clones
/// share that guard.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    client: BackendClient,
    recovery: ArtifactRecoveryClient,
    tuning: StreamTuning,
    visibility: Option<watch::Receiver<Visibility>>,
    active: Arc<Mutex<Option<StreamCanceller>>>,
}

impl StreamTransport {
    pub fn new(client: BackendClient) -> Self {
        Self {
            recovery: ArtifactRecoveryClient::new(client.clone()),
            client,
            tuning: StreamTuning::default(),
            visibility: None,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_tuning(mut self, tuning: StreamTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn with_visibility(mut self, visibility: watch::Receiver<Visibility>) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub async fn open(&self, request: ChatRequest) -> Result<StreamHandle, TransportError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.is_finished() {
                tracing::info!(request_id = ?previous.request_id(), "cancelling previous chat stream");
                previous.cancel().await;
            }
        }

        let response = self
            .client
            .open_chat_stream(&request)
            .await
            .map_err(TransportError::Connect)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status, "chat stream rejected");
            return Err(TransportError::Handshake { status, body });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (request_id_tx, request_id_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let reader = StreamReader {
            events: events_tx,
            recovery: self.recovery.clone(),
            tuning: self.tuning.clone(),
            cancel: cancel.clone(),
            request_id: request_id_tx,
            visibility: self.visibility.clone(),
        };
        let finished = Arc::new(AtomicBool::new(false));
        let reader_finished = Arc::clone(&finished);
        let task = tokio::spawn(async move {
            let outcome = reader.run(response).await;
            reader_finished.store(true, Ordering::SeqCst);
            outcome
        });

        let canceller = StreamCanceller {
            client: self.client.clone(),
            token: cancel,
            request_id: request_id_rx,
            aborted: Arc::new(AtomicBool::new(false)),
            finished,
        };
        *active = Some(canceller.clone());

        Ok(StreamHandle {
            events: events_rx,
            task,
            canceller,
        })
    }
}

pub struct StreamHandle {
    events: mpsc::UnboundedReceiver<ChatEvent>,
    task: JoinHandle<Result<StreamOutcome, TransportError>>,
    canceller: StreamCanceller,
}

impl StreamHandle {
    /// Next event in arrival order; `None` once the reader has finished.
    pub async fn next_event(&mut self) -> Option<ChatEvent> {
        self.events.recv().await
    }

    pub fn canceller(&self) -> StreamCanceller {
        self.canceller.clone()
    }

    pub async fn cancel(&self) {
        self.canceller.cancel().await;
    }

    pub fn request_id(&self) -> Option<String> {
        self.canceller.request_id()
    }

    pub async fn completion(self) -> Result<StreamOutcome, TransportError> {
        self.task.await?
    }
}

/// Cancels one stream: stops the local read and asks the server to abort.
///
/// Best effort: the server may still finish work already in flight.
#[derive(Debug, Clone)]
pub struct StreamCanceller {
    client: BackendClient,
    token: CancellationToken,
    request_id: watch::Receiver<Option<String>>,
    aborted: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl StreamCanceller {
    pub fn request_id(&self) -> Option<String> {
        self.request_id.borrow().clone()
    }

    /// Whether the reader has already produced its outcome.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// No-op once the stream has finished or was already cancelled.
    pub async fn cancel(&self) {
        if self.is_finished() || self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        match self.request_id() {
            Some(request_id) => {
                if let Err(err) = self.client.abort(&request_id).await {
                    tracing::warn!(request_id = %request_id, error = %err, "abort request failed");
                } else {
                    tracing::info!(request_id = %request_id, "abort requested");
                }
            }
            None => tracing::debug!("no request id yet, cancelled locally only"),
        }
    }
}

struct StreamReader {
    events: mpsc::UnboundedSender<ChatEvent>,
    recovery: ArtifactRecoveryClient,
    tuning: StreamTuning,
    cancel: CancellationToken,
    request_id: watch::Sender<Option<String>>,
    visibility: Option<watch::Receiver<Visibility>>,
}

impl StreamReader {
    async fn run(mut self, response: reqwest::Response) -> Result<StreamOutcome, TransportError> {
        let mut body = response.bytes_stream();
        let mut decoder = FrameDecoder::new();
        let mut interrupted_artifacts = Vec::new();

        let mut last_activity = Instant::now();
        let mut slow_reported = false;
        let mut health = tokio::time::interval(self.tuning.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut visibility = self.visibility.take();
        let mut backgrounded = visibility
            .as_ref()
            .is_some_and(|rx| *rx.borrow() == Visibility::Background);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!("chat stream cancelled");
                    return Ok(StreamOutcome::Cancelled);
                }
                chunk = body.next() => match chunk {
                    Some(Ok(chunk)) => {
                        last_activity = Instant::now();
                        slow_reported = false;
                        for frame in decoder.push(&chunk) {
                            if let Some(outcome) = self.dispatch(frame, &mut interrupted_artifacts)? {
                                return Ok(outcome);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "chat stream read failed");
                        return self
                            .recover(TransportError::Stream(err), interrupted_artifacts)
                            .await;
                    }
                    None => {
                        if let Some(frame) = decoder.finish() {
                            if let Some(outcome) = self.dispatch(frame, &mut interrupted_artifacts)? {
                                return Ok(outcome);
                            }
                        }
                        tracing::warn!(
                            keep_alives = decoder.keep_alives(),
                            "chat stream ended without done"
                        );
                        return self.recover(TransportError::Truncated, interrupted_artifacts).await;
                    }
                },
                _ = health.tick() => {
                    let silent_for = last_activity.elapsed();
                    if !slow_reported && silent_for >= self.tuning.idle_threshold {
                        slow_reported = true;
                        tracing::info!(silent_secs = silent_for.as_secs(), "chat stream is slow");
                        let _ = self.events.send(ChatEvent::ConnectionSlow { silent_for });
                    }
                }
                changed = next_visibility(&mut visibility) => match changed {
                    Some(Visibility::Background) => backgrounded = true,
                    Some(Visibility::Foreground) => {
                        let silent_for = last_activity.elapsed();
                        if backgrounded && silent_for >= self.tuning.background_threshold {
                            tracing::info!(silent_secs = silent_for.as_secs(), "resumed after long silence");
                            let _ = self.events.send(ChatEvent::Reconnecting { silent_for });
                        }
                        backgrounded = false;
                    }
                    None => visibility = None,
                },
            }
        }
    }

    fn dispatch(
        &self,
        frame: SseFrame,
        interrupted_artifacts: &mut Vec<ArtifactReference>,
    ) -> Result<Option<StreamOutcome>, TransportError> {
        let event = match decode_event(&frame) {
            Ok(StreamEvent::Unknown) => {
                tracing::debug!(event = ?frame.event, "ignoring unknown frame type");
                return Ok(None);
            }
            Ok(event) => event,
            Err(DecodeError::Empty) => return Ok(None),
            Err(err) => {
                tracing::warn!(error = %err, event = ?frame.event, "skipping malformed frame");
                return Ok(None);
            }
        };

        let mut outcome = None;
        match &event {
            StreamEvent::SessionStarted { request_id, .. } => {
                tracing::debug!(request_id = %request_id, "chat stream started");
                self.request_id.send_replace(Some(request_id.clone()));
            }
            StreamEvent::Interrupted { artifacts, reason, .. } => {
                tracing::info!(reason = ?reason, artifacts = artifacts.len(), "chat stream interrupted");
                merge_artifacts(interrupted_artifacts, artifacts.iter().cloned());
            }
            StreamEvent::Done {
                response,
                metadata,
                skills,
                session_id,
                artifacts,
            } => {
                let mut all = artifacts.clone();
                merge_artifacts(&mut all, interrupted_artifacts.drain(..));
                outcome = Some(Ok(StreamOutcome::Completed(CompletedResponse {
                    response: response.clone(),
                    metadata: metadata.clone(),
                    skills: skills.clone(),
                    session_id: session_id.clone(),
                    artifacts: all,
                })));
            }
            StreamEvent::Error { message } => {
                outcome = Some(Err(TransportError::Server(message.clone())));
            }
            _ => {}
        }

        let _ = self.events.send(ChatEvent::Frame(event));
        outcome.transpose()
    }

    async fn recover(
        &self,
        failure: TransportError,
        interrupted_artifacts: Vec<ArtifactReference>,
    ) -> Result<StreamOutcome, TransportError> {
        let _ = self.events.send(ChatEvent::Recovering);

        let recovered = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(StreamOutcome::Cancelled),
            recovered = self.recovery.recover(self.tuning.recovery_window) => recovered,
        };
        let mut artifacts = match recovered {
            Ok(artifacts) => artifacts,
            Err(err) => {
                tracing::warn!(error = %err, "artifact recovery failed");
                Vec::new()
            }
        };
        merge_artifacts(&mut artifacts, interrupted_artifacts);

        if artifacts.is_empty() {
            return Err(failure);
        }

        Ok(StreamOutcome::Recovered {
            message: recovery_message(&artifacts),
            artifacts,
        })
    }
}

async fn next_visibility(visibility: &mut Option<watch::Receiver<Visibility>>) -> Option<Visibility> {
    match visibility.as_mut() {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

fn merge_artifacts(
    into: &mut Vec<ArtifactReference>,
    more: impl IntoIterator<Item = ArtifactReference>,
) {
    for artifact in more {
        if !into.iter().any(|existing| existing.id == artifact.id) {
            into.push(artifact);
        }
    }
}
