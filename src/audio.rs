//! Audio device seam, PCM codec and the sequential playback queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::AudioError;

pub mod codec;
pub mod file;

pub use codec::{
    NoiseFloor, SAMPLE_RATE, decode_base64, decode_pcm16, encode_base64, encode_pcm16, frame_rms,
    vad_threshold,
};

/// Opens the microphone and speaker for one voice session.
///
/// Whatever a backend hands out is owned exclusively by that session.
pub trait AudioBackend: Send + Sync {
    /// Starts capturing mono float frames at `sample_rate` into `frames`.
    fn open_capture(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, AudioError>;

    fn open_output(&self, sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError>;
}

/// A live capture. Release happens in the order of the methods below;
/// `stop_tracks` is the step that actually frees the hardware.
pub trait CaptureStream: Send {
    fn stop_recording(&mut self);

    fn disconnect_graph(&mut self);

    fn close_context(&mut self);

    fn stop_tracks(&mut self);

    fn release(&mut self) {
        self.stop_recording();
        self.disconnect_graph();
        self.close_context();
        self.stop_tracks();
    }
}

pub trait OutputSink: Send {
    /// Plays one chunk. Must return quickly; the device buffers.
    fn play(&mut self, samples: &[f32]) -> Result<(), AudioError>;

    fn close(&mut self) {}
}

/// Single play-head over a FIFO of decoded chunks.
///
/// Chunks are played one after another in submission order, so two chunks
/// that arrive together can never overlap.
pub struct Playback {
    queue: mpsc::UnboundedSender<(u64, Vec<f32>)>,
    generation: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Playback {
    pub fn start(mut sink: Box<dyn OutputSink>) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<(u64, Vec<f32>)>();
        let generation = Arc::new(AtomicU64::new(0));
        let current = Arc::clone(&generation);

        let task = tokio::spawn(async move {
            let mut played: u64 = 0;
            while let Some((chunk_generation, samples)) = rx.recv().await {
                if chunk_generation != current.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(err) = sink.play(&samples) {
                    tracing::warn!(error = %err, "playback failed, dropping chunk");
                    continue;
                }
                played += 1;
                if played == 1 || played.is_multiple_of(50) {
                    tracing::debug!(chunks = played, samples = samples.len(), "playing audio");
                }
            }
            sink.close();
        });

        Self {
            queue,
            generation,
            task,
        }
    }

    pub fn enqueue(&self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self.queue.send((generation, samples));
    }

    /// Drops everything queued but not yet played.
    pub fn clear(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Stops playback, discarding queued audio, and closes the sink.
    pub async fn close(self) {
        self.clear();
        drop(self.queue);
        if let Err(err) = self.task.await {
            tracing::warn!(error = %err, "playback task failed");
        }
    }
}
