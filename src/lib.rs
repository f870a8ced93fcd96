//! Client for a conversational assistant backend.
//!
//! Two transports share one [`BackendClient`]: the text stream in [`stream`]
//! and the duplex voice session in [`voice`]. Voice tool calls are bridged to
//! the backend orchestrator through [`bridge`].

pub mod audio;
pub mod bridge;
pub mod client;
pub mod context;
pub mod error;
pub mod protocol;
pub mod recovery;
pub mod sse;
pub mod stream;
pub mod voice;

pub use client::{BackendClient, ClientConfig};
pub use error::{AudioError, ClientError, DecodeError, TransportError, VoiceError};
pub use protocol::{ArtifactReference, ChatRequest, StreamEvent};
pub use stream::{ChatEvent, StreamHandle, StreamOutcome, StreamTransport, StreamTuning, Visibility};
pub use voice::{TurnMode, VoiceConfig, VoiceEvent, VoiceSession, VoiceState};
