//! Error types for the backend client, both transports and the audio path.

use thiserror::Error;

/// Errors from plain request/response calls against the orchestrator backend.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Body(#[from] serde_json::Error),
}

/// A single frame that could not be turned into a [`StreamEvent`](crate::protocol::StreamEvent).
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame has no data")]
    Empty,

    #[error("malformed frame json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Terminal failures of a text streaming session.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The server rejected the initial request.
    #[error("stream handshake rejected ({status}): {body}")]
    Handshake { status: u16, body: String },

    #[error("failed to open stream: {0}")]
    Connect(#[source] reqwest::Error),

    /// The server reported failure through an `error` event.
    #[error("{0}")]
    Server(String),

    /// The byte stream failed mid-read and nothing could be recovered.
    #[error("stream interrupted: {0}")]
    Stream(#[source] reqwest::Error),

    /// The stream ended without a terminal event and nothing could be recovered.
    #[error("stream ended before the response completed")]
    Truncated,

    #[error("stream task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio device unavailable: {0}")]
    Device(String),

    #[error("audio io failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("failed to obtain realtime credential: {0}")]
    Credential(#[from] ClientError),

    #[error("websocket failed: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid websocket request: {0}")]
    Request(String),

    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("voice session is not running")]
    NotRunning,
}
