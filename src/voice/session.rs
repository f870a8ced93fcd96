use std::collections::HashMap;
use std::sync::Arc;

use chrono::Timelike;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::messages::{
    ClientEvent, ConversationItem, InputContent, ServerEvent, SessionUpdate, TranscriptionConfig,
};
use super::turn::{TalkAction, TurnDetector};
use super::{Command, TurnMode, VoiceConfig, VoiceEvent, VoiceState};
use crate::audio::{AudioBackend, CaptureStream, Playback, SAMPLE_RATE, decode_base64, encode_base64};
use crate::bridge::{BRIDGE_FUNCTION_NAME, BridgeOutcome, FunctionBridge, FunctionCall, bridge_tool_definition};
use crate::client::BackendClient;
use crate::context::{ConversationHistory, HistoryEntry, SessionContext};
use crate::error::VoiceError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CAPTURE_QUEUE: usize = 32;

/// Mutable data of one live session. Dropped with the session, so nothing
/// leaks into the next one.
struct SessionState {
    phase: VoiceState,
    turn: TurnDetector,
    context: SessionContext,
    history: ConversationHistory,
    last_user_utterance: String,
    pending_calls: HashMap<String, PendingCall>,
    intro_sent: bool,
    audio_chunks_in: u64,
    audio_chunks_out: u64,
}

#[derive(Debug, Default)]
struct PendingCall {
    name: Option<String>,
    arguments: String,
}

impl SessionState {
    fn new(mode: TurnMode) -> Self {
        Self {
            phase: VoiceState::Connected,
            turn: TurnDetector::new(mode),
            context: SessionContext::default(),
            history: ConversationHistory::default(),
            last_user_utterance: String::new(),
            pending_calls: HashMap::new(),
            intro_sent: false,
            audio_chunks_in: 0,
            audio_chunks_out: 0,
        }
    }
}

/// Devices held by a live session, released in a fixed order.
struct Devices {
    capture: Box<dyn CaptureStream>,
    playback: Playback,
}

impl Devices {
    async fn release(mut self) {
        self.capture.stop_recording();
        self.capture.disconnect_graph();
        self.capture.close_context();
        self.capture.stop_tracks();
        self.playback.close().await;
    }
}

enum Exit {
    Stopped,
    Closed,
    Failed(VoiceError),
}

pub(crate) struct SessionActor {
    config: Arc<VoiceConfig>,
    client: BackendClient,
    bridge: FunctionBridge,
    audio: Arc<dyn AudioBackend>,
    state: watch::Sender<VoiceState>,
    events: mpsc::UnboundedSender<VoiceEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl SessionActor {
    pub(crate) fn new(
        config: Arc<VoiceConfig>,
        client: BackendClient,
        audio: Arc<dyn AudioBackend>,
        state: watch::Sender<VoiceState>,
        events: mpsc::UnboundedSender<VoiceEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let bridge = FunctionBridge::new(client.clone(), config.domain_id.clone());
        Self {
            config,
            client,
            bridge,
            audio,
            state,
            events,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        self.set_phase(VoiceState::Connecting);

        let mut deferred = Vec::new();
        let connected = tokio::select! {
            connected = connect(&self.client, &self.config) => connected,
            _ = wait_for_stop(&mut self.commands, &mut deferred) => {
                tracing::info!("voice session stopped while connecting");
                self.finish("stopped");
                return;
            }
        };

        let mut socket = match connected {
            Ok(socket) => socket,
            Err(err) => {
                tracing::error!(error = %err, "voice session failed to connect");
                self.emit(VoiceEvent::Error(err.to_string()));
                self.finish("connection failed");
                return;
            }
        };

        let mut session = SessionState::new(self.config.mode);
        self.set_phase(VoiceState::Connected);

        let (frames_tx, mut frames_rx) = mpsc::channel(CAPTURE_QUEUE);
        let devices = match self.open_devices(&mut socket, &session, frames_tx).await {
            Ok(devices) => devices,
            Err(err) => {
                tracing::error!(error = %err, "voice session setup failed");
                self.emit(VoiceEvent::Error(err.to_string()));
                close_socket(&mut socket).await;
                self.finish("setup failed");
                return;
            }
        };

        if !self.config.introduce {
            session.phase = VoiceState::Active;
            self.set_phase(VoiceState::Active);
        }

        let exit = self
            .drive(&mut socket, &mut session, &devices.playback, &mut frames_rx, deferred)
            .await;

        drop(frames_rx);
        devices.release().await;
        close_socket(&mut socket).await;

        let reason = match exit {
            Exit::Stopped => "stopped".to_string(),
            Exit::Closed => "connection closed".to_string(),
            Exit::Failed(err) => {
                tracing::error!(error = %err, "voice session failed");
                self.emit(VoiceEvent::Error(err.to_string()));
                err.to_string()
            }
        };
        tracing::info!(
            reason = %reason,
            turns = session.context.turn_count(),
            audio_in = session.audio_chunks_in,
            audio_out = session.audio_chunks_out,
            "voice session ended"
        );
        self.finish(&reason);
    }

    async fn open_devices(
        &self,
        socket: &mut Socket,
        session: &SessionState,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Devices, VoiceError> {
        send(socket, &self.session_setup(session)).await?;

        let output = self.audio.open_output(SAMPLE_RATE)?;
        let capture = self.audio.open_capture(SAMPLE_RATE, frames)?;
        tracing::info!(mode = ?session.turn.mode(), "voice session capturing");

        Ok(Devices {
            capture,
            playback: Playback::start(output),
        })
    }

    async fn drive(
        &mut self,
        socket: &mut Socket,
        session: &mut SessionState,
        playback: &Playback,
        frames: &mut mpsc::Receiver<Vec<f32>>,
        deferred: Vec<Command>,
    ) -> Exit {
        for command in deferred {
            let step = match command {
                Command::PushToTalk(active) => self.handle_talk(socket, session, playback, active).await,
                Command::SwitchMode(mode) => self.handle_switch(socket, session, mode).await,
                Command::Stop => return Exit::Stopped,
            };
            if let Err(err) = step {
                return Exit::Failed(err);
            }
        }

        let mut calls: JoinSet<BridgeOutcome> = JoinSet::new();
        let intro = tokio::time::sleep(self.config.intro_delay);
        tokio::pin!(intro);

        loop {
            let step = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop) | None => return Exit::Stopped,
                    Some(Command::PushToTalk(active)) => {
                        self.handle_talk(socket, session, playback, active).await
                    }
                    Some(Command::SwitchMode(mode)) => self.handle_switch(socket, session, mode).await,
                },
                message = socket.next() => match message {
                    Some(Ok(WsMessage::Text(text))) => {
                        self.handle_server_text(session, playback, &mut calls, text.as_str());
                        Ok(())
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(close_frame = ?frame, "realtime socket closed by server");
                        return Exit::Closed;
                    }
                    Some(Ok(_)) => Ok(()),
                    Some(Err(err)) => return Exit::Failed(err.into()),
                    None => return Exit::Closed,
                },
                Some(frame) = frames.recv() => self.handle_capture(socket, session, frame).await,
                Some(joined) = calls.join_next(), if !calls.is_empty() => match joined {
                    Ok(outcome) => self.handle_bridge_outcome(socket, session, outcome).await,
                    Err(err) => {
                        tracing::warn!(error = %err, "bridge task failed");
                        Ok(())
                    }
                },
                _ = &mut intro, if self.config.introduce && !session.intro_sent => {
                    self.send_introduction(socket, session).await
                }
            };

            if let Err(err) = step {
                return Exit::Failed(err);
            }
        }
    }

    async fn handle_talk(
        &self,
        socket: &mut Socket,
        session: &mut SessionState,
        playback: &Playback,
        active: bool,
    ) -> Result<(), VoiceError> {
        match session.turn.set_pressed(active) {
            TalkAction::Begin => {
                playback.clear();
                send(socket, &ClientEvent::InputAudioBufferClear).await
            }
            TalkAction::Commit => {
                send(socket, &ClientEvent::InputAudioBufferCommit).await?;
                send(socket, &ClientEvent::ResponseCreate).await
            }
            TalkAction::None => {
                tracing::debug!(active, "talk control unchanged");
                Ok(())
            }
        }
    }

    async fn handle_switch(
        &self,
        socket: &mut Socket,
        session: &mut SessionState,
        mode: TurnMode,
    ) -> Result<(), VoiceError> {
        if !session.turn.switch(mode) {
            return Ok(());
        }

        let update = ClientEvent::SessionUpdate {
            session: SessionUpdate {
                turn_detection: Some(session.turn.config()),
                ..Default::default()
            },
        };
        send(socket, &update).await?;
        if mode == TurnMode::PushToTalk {
            send(socket, &ClientEvent::InputAudioBufferClear).await?;
        }

        tracing::info!(mode = ?mode, "turn mode switched");
        self.emit(VoiceEvent::ModeChanged(mode));
        Ok(())
    }

    async fn handle_capture(
        &self,
        socket: &mut Socket,
        session: &mut SessionState,
        frame: Vec<f32>,
    ) -> Result<(), VoiceError> {
        if let Some(threshold) = session.turn.observe_frame(&frame) {
            tracing::debug!(threshold, "vad threshold adjusted");
            let update = ClientEvent::SessionUpdate {
                session: SessionUpdate {
                    turn_detection: Some(session.turn.config()),
                    ..Default::default()
                },
            };
            send(socket, &update).await?;
        }

        if !session.turn.should_stream() {
            return Ok(());
        }

        session.audio_chunks_out += 1;
        if session.audio_chunks_out == 1 || session.audio_chunks_out.is_multiple_of(50) {
            tracing::debug!(
                chunk = session.audio_chunks_out,
                samples = frame.len(),
                "sending audio chunk"
            );
        }
        let append = ClientEvent::InputAudioBufferAppend {
            audio: encode_base64(&frame),
        };
        send(socket, &append).await
    }

    fn handle_server_text(
        &self,
        session: &mut SessionState,
        playback: &Playback,
        calls: &mut JoinSet<BridgeOutcome>,
        text: &str,
    ) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "skipping malformed realtime message");
                return;
            }
        };

        match event {
            ServerEvent::SessionCreated | ServerEvent::SessionUpdated => {
                tracing::debug!("realtime session configured");
            }
            ServerEvent::SpeechStarted => {
                session.turn.speech_started();
                playback.clear();
                self.emit(VoiceEvent::SpeechStarted);
            }
            ServerEvent::SpeechStopped => {
                session.turn.speech_stopped();
                self.emit(VoiceEvent::SpeechStopped);
            }
            ServerEvent::Committed { item_id } => {
                tracing::debug!(item_id = ?item_id, "input audio committed");
            }
            ServerEvent::UserTranscript { transcript } => {
                let transcript = transcript.trim();
                if !transcript.is_empty() {
                    session.last_user_utterance = transcript.to_string();
                    session.history.push(HistoryEntry::user(transcript));
                    session.context.next_turn();
                    self.emit(VoiceEvent::UserTranscript(transcript.to_string()));
                }
            }
            ServerEvent::AudioDelta { delta } => match decode_base64(&delta) {
                Ok(samples) => {
                    session.audio_chunks_in += 1;
                    playback.enqueue(samples);
                }
                Err(err) => tracing::warn!(error = %err, "dropping undecodable audio delta"),
            },
            ServerEvent::AudioTranscriptDelta | ServerEvent::TextDelta => {}
            ServerEvent::OutputItemAdded { item } => {
                if let (true, Some(call_id)) = (item.is_function_call(), item.call_id) {
                    session.pending_calls.entry(call_id).or_default().name = item.name;
                }
            }
            ServerEvent::OutputItemDone { item } => {
                if let Some(text) = item.assistant_text() {
                    session.history.push(HistoryEntry::assistant(text.clone()));
                    self.emit(VoiceEvent::AssistantTranscript(text));
                }
            }
            ServerEvent::FunctionCallArgumentsDelta { call_id, delta } => {
                session
                    .pending_calls
                    .entry(call_id)
                    .or_default()
                    .arguments
                    .push_str(&delta);
            }
            ServerEvent::FunctionCallArgumentsDone {
                call_id,
                name,
                arguments,
            } => {
                let pending = session.pending_calls.remove(&call_id).unwrap_or_default();
                let call = FunctionCall {
                    name: name
                        .or(pending.name)
                        .unwrap_or_else(|| BRIDGE_FUNCTION_NAME.to_string()),
                    arguments: if arguments.is_empty() {
                        pending.arguments
                    } else {
                        arguments
                    },
                    call_id,
                };
                self.dispatch_call(session, calls, call);
            }
            ServerEvent::ResponseDone => {
                if session.phase == VoiceState::Introducing {
                    session.phase = VoiceState::Active;
                    self.set_phase(VoiceState::Active);
                }
            }
            ServerEvent::Error { error } => {
                tracing::warn!(code = ?error.code, message = %error.message, "realtime error event");
                self.emit(VoiceEvent::Error(error.message));
            }
            ServerEvent::Other => {}
        }
    }

    fn dispatch_call(
        &self,
        session: &SessionState,
        calls: &mut JoinSet<BridgeOutcome>,
        call: FunctionCall,
    ) {
        let prepared = self.bridge.prepare(
            &call,
            &session.context,
            &session.last_user_utterance,
            &session.history,
        );
        tracing::info!(call_id = %call.call_id, tool = %prepared.tool_name(), "bridging function call");
        self.emit(VoiceEvent::ToolCallStarted {
            call_id: call.call_id.clone(),
            tool_name: prepared.tool_name().to_string(),
        });

        let bridge = self.bridge.clone();
        calls.spawn(async move { bridge.execute(prepared).await });
    }

    async fn handle_bridge_outcome(
        &self,
        socket: &mut Socket,
        session: &mut SessionState,
        outcome: BridgeOutcome,
    ) -> Result<(), VoiceError> {
        outcome.record_into(&mut session.context);

        // The output must reach the server before the continuation request.
        let output = ClientEvent::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: outcome.call_id.clone(),
                output: outcome.output_json(),
            },
        };
        send(socket, &output).await?;
        send(socket, &ClientEvent::ResponseCreate).await?;

        self.emit(VoiceEvent::ToolCallFinished {
            call_id: outcome.call_id.clone(),
            tool_name: outcome.tool_name.clone(),
            succeeded: outcome.succeeded(),
        });
        Ok(())
    }

    async fn send_introduction(
        &self,
        socket: &mut Socket,
        session: &mut SessionState,
    ) -> Result<(), VoiceError> {
        if session.intro_sent {
            return Ok(());
        }
        session.intro_sent = true;
        session.phase = VoiceState::Introducing;
        self.set_phase(VoiceState::Introducing);

        let hour = chrono::Local::now().hour();
        let item = ClientEvent::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "system",
                content: vec![InputContent::InputText {
                    text: introduction_prompt(hour),
                }],
            },
        };
        send(socket, &item).await?;
        send(socket, &ClientEvent::ResponseCreate).await
    }

    fn session_setup(&self, session: &SessionState) -> ClientEvent {
        ClientEvent::SessionUpdate {
            session: SessionUpdate {
                modalities: Some(vec!["text", "audio"]),
                instructions: Some(self.config.instructions.clone()),
                voice: Some(self.config.voice.clone()),
                input_audio_format: Some("pcm16"),
                output_audio_format: Some("pcm16"),
                input_audio_transcription: Some(TranscriptionConfig {
                    model: self.config.transcription_model.clone(),
                }),
                turn_detection: Some(session.turn.config()),
                tools: Some(vec![bridge_tool_definition()]),
                tool_choice: Some("auto"),
            },
        }
    }

    fn set_phase(&self, phase: VoiceState) {
        self.state.send_replace(phase);
        self.emit(VoiceEvent::StateChanged(phase));
    }

    fn emit(&self, event: VoiceEvent) {
        let _ = self.events.send(event);
    }

    fn finish(&self, reason: &str) {
        self.set_phase(VoiceState::Idle);
        self.emit(VoiceEvent::Ended {
            reason: reason.to_string(),
        });
    }
}

async fn connect(client: &BackendClient, config: &VoiceConfig) -> Result<Socket, VoiceError> {
    let credential = client.ephemeral_key().await?;

    let url = format!("{}?model={}", config.realtime_url, config.model);
    let mut request = url.into_client_request()?;
    let protocols = format!(
        "realtime, openai-insecure-api-key.{}, openai-beta.realtime-v1",
        credential.key()
    );
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_str(&protocols).map_err(|e| VoiceError::Request(e.to_string()))?,
    );

    tracing::info!(url = %config.realtime_url, model = %config.model, "connecting realtime socket");
    let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
    Ok(socket)
}

/// Resolves on `Stop`, or when every command sender is gone. Anything else
/// is held back until the session is live.
async fn wait_for_stop(commands: &mut mpsc::UnboundedReceiver<Command>, deferred: &mut Vec<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Stop => return,
            other => {
                tracing::debug!(command = ?other, "deferring command until connected");
                deferred.push(other);
            }
        }
    }
}

async fn send(socket: &mut Socket, event: &ClientEvent) -> Result<(), VoiceError> {
    let json = serde_json::to_string(event)?;
    socket.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

async fn close_socket(socket: &mut Socket) {
    if let Err(err) = socket.close(None).await {
        tracing::debug!(error = %err, "realtime socket close failed");
    }
}

fn introduction_prompt(hour: u32) -> String {
    let greeting = match hour {
        5..=11 => "Good morning",
        12..=17 => "Good afternoon",
        _ => "Good evening",
    };
    format!(
        "Introduce yourself now in one or two short sentences. Start with \"{greeting}\", \
         say you can look up and update use cases and initiatives, and ask what the user \
         wants to work on."
    )
}
