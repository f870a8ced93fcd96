use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::ServerVad;
use crate::audio::NoiseFloor;

pub const SILENCE_DURATION_MS: u32 = 800;
const PREFIX_PADDING_MS: u32 = 300;
/// Threshold drift that warrants re-sending the turn detection config.
const THRESHOLD_RESEND_DELTA: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMode {
    #[default]
    Auto,
    PushToTalk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TalkAction {
    None,
    /// Talk control pressed: start a fresh input buffer.
    Begin,
    /// Talk control released: commit the buffer and ask for a response.
    Commit,
}

/// Decides when a user turn starts and ends, in either mode.
#[derive(Debug, Clone)]
pub(crate) struct TurnDetector {
    mode: TurnMode,
    pressed: bool,
    speaking: bool,
    noise: NoiseFloor,
    announced_threshold: f32,
}

impl TurnDetector {
    pub(crate) fn new(mode: TurnMode) -> Self {
        let noise = NoiseFloor::default();
        Self {
            mode,
            pressed: false,
            speaking: false,
            announced_threshold: noise.threshold(),
            noise,
        }
    }

    pub(crate) fn mode(&self) -> TurnMode {
        self.mode
    }

    #[cfg(test)]
    pub(crate) fn threshold(&self) -> f32 {
        self.noise.threshold()
    }

    /// Press and release are edge-triggered: repeating either is a no-op.
    pub(crate) fn set_pressed(&mut self, pressed: bool) -> TalkAction {
        if self.mode != TurnMode::PushToTalk {
            return TalkAction::None;
        }
        match (self.pressed, pressed) {
            (false, true) => {
                self.pressed = true;
                TalkAction::Begin
            }
            (true, false) => {
                self.pressed = false;
                TalkAction::Commit
            }
            _ => TalkAction::None,
        }
    }

    /// Whether captured audio should be sent to the server right now.
    pub(crate) fn should_stream(&self) -> bool {
        match self.mode {
            TurnMode::Auto => true,
            TurnMode::PushToTalk => self.pressed,
        }
    }

    /// Feeds one capture frame. Returns a new threshold when it has drifted
    /// far enough from the one the server knows about.
    pub(crate) fn observe_frame(&mut self, samples: &[f32]) -> Option<f32> {
        if self.mode != TurnMode::Auto || self.speaking {
            return None;
        }
        self.noise.observe(samples);
        let threshold = self.noise.threshold();
        if (threshold - self.announced_threshold).abs() >= THRESHOLD_RESEND_DELTA {
            self.announced_threshold = threshold;
            return Some(threshold);
        }
        None
    }

    pub(crate) fn speech_started(&mut self) {
        self.speaking = true;
    }

    pub(crate) fn speech_stopped(&mut self) {
        self.speaking = false;
    }

    /// Returns `false` when already in `mode`.
    pub(crate) fn switch(&mut self, mode: TurnMode) -> bool {
        if self.mode == mode {
            return false;
        }
        self.mode = mode;
        self.pressed = false;
        self.speaking = false;
        self.announced_threshold = self.noise.threshold();
        true
    }

    /// The `turn_detection` value for a session update.
    pub(crate) fn config(&self) -> Value {
        match self.mode {
            TurnMode::PushToTalk => Value::Null,
            TurnMode::Auto => serde_json::to_value(ServerVad {
                kind: "server_vad",
                threshold: self.announced_threshold,
                prefix_padding_ms: PREFIX_PADDING_MS,
                silence_duration_ms: SILENCE_DURATION_MS,
            })
            .unwrap_or(Value::Null),
        }
    }
}
