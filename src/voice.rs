//! Duplex voice conversations over the realtime socket.
//!
//! A [`VoiceSession`] owns at most one live session at a time. Starting a new
//! one first tears the old one down completely, microphone included, so two
//! captures are never held at once. The live session itself runs as a single
//! task that owns the socket, the devices and all mutable session data; the
//! public methods only send it commands.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::AudioBackend;
use crate::client::BackendClient;
use crate::error::VoiceError;

pub mod messages;
mod session;
mod turn;

pub use turn::{SILENCE_DURATION_MS, TurnMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceState {
    Idle,
    Connecting,
    Connected,
    Introducing,
    Active,
}

/// Immutable settings for one voice session.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub realtime_url: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub transcription_model: String,
    pub mode: TurnMode,
    pub domain_id: Option<String>,
    /// Send a one-time greeting shortly after connecting.
    pub introduce: bool,
    pub intro_delay: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview".to_string(),
            voice: "alloy".to_string(),
            instructions: "You are a concise voice assistant for a portfolio of AI use cases \
                           and initiatives. Use the execute_tool function whenever you need data \
                           or need to change something."
                .to_string(),
            transcription_model: "whisper-1".to_string(),
            mode: TurnMode::Auto,
            domain_id: None,
            introduce: true,
            intro_delay: Duration::from_millis(600),
        }
    }
}

/// Everything a voice session reports to its caller, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    StateChanged(VoiceState),
    SpeechStarted,
    SpeechStopped,
    UserTranscript(String),
    AssistantTranscript(String),
    ToolCallStarted {
        call_id: String,
        tool_name: String,
    },
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        succeeded: bool,
    },
    ModeChanged(TurnMode),
    /// Non-fatal problem; the session keeps running.
    Error(String),
    /// The session is gone and its devices are released.
    Ended { reason: String },
}

/// Receiving end of one session's events.
pub struct VoiceEvents {
    rx: mpsc::UnboundedReceiver<VoiceEvent>,
}

impl VoiceEvents {
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<VoiceEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Debug)]
pub(crate) enum Command {
    PushToTalk(bool),
    SwitchMode(TurnMode),
    Stop,
}

struct RunningSession {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl RunningSession {
    /// Returns once the session task has released every device.
    async fn shutdown(self) {
        let _ = self.commands.send(Command::Stop);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "voice session task failed");
        }
    }
}

pub struct VoiceSession {
    client: BackendClient,
    audio: Arc<dyn AudioBackend>,
    slot: Mutex<Option<RunningSession>>,
    state: watch::Sender<VoiceState>,
}

impl VoiceSession {
    pub fn new(client: BackendClient, audio: Arc<dyn AudioBackend>) -> Self {
        let (state, _) = watch::channel(VoiceState::Idle);
        Self {
            client,
            audio,
            slot: Mutex::new(None),
            state,
        }
    }

    pub fn state(&self) -> VoiceState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<VoiceState> {
        self.state.subscribe()
    }

    /// Starts a session, tearing down any previous one first.
    ///
    /// Returns as soon as the new session is connecting; connection failures
    /// arrive as [`VoiceEvent::Error`] followed by [`VoiceEvent::Ended`].
    pub async fn start(&self, config: VoiceConfig) -> VoiceEvents {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.take() {
            tracing::info!("stopping previous voice session before starting a new one");
            previous.shutdown().await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.state.send_replace(VoiceState::Connecting);

        let actor = session::SessionActor::new(
            Arc::new(config),
            self.client.clone(),
            Arc::clone(&self.audio),
            self.state.clone(),
            events_tx,
            commands_rx,
        );
        let task = tokio::spawn(actor.run());

        *slot = Some(RunningSession {
            commands: commands_tx,
            task,
        });

        VoiceEvents { rx: events_rx }
    }

    /// Stops the current session, if any. Safe in every state and idempotent.
    ///
    /// The slot stays locked until teardown is complete, so a concurrent
    /// [`start`](Self::start) waits for the microphone to be released.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(running) = slot.take() {
            running.shutdown().await;
        }
        self.state.send_replace(VoiceState::Idle);
    }

    pub async fn set_push_to_talk_active(&self, active: bool) -> Result<(), VoiceError> {
        self.command(Command::PushToTalk(active)).await
    }

    pub async fn switch_mode(&self, mode: TurnMode) -> Result<(), VoiceError> {
        self.command(Command::SwitchMode(mode)).await
    }

    async fn command(&self, command: Command) -> Result<(), VoiceError> {
        let slot = self.slot.lock().await;
        let running = slot.as_ref().ok_or(VoiceError::NotRunning)?;
        running
            .commands
            .send(command)
            .map_err(|_| VoiceError::NotRunning)
    }
}
