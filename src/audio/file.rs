//! Raw PCM16 file devices: capture replays a file at real-time pace and
//! playback appends to a file. Lets the CLI drive a voice session headless.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AudioBackend, CaptureStream, OutputSink, decode_pcm16, encode_pcm16};
use crate::error::AudioError;

const FRAME_MILLIS: u64 = 100;

#[derive(Debug, Clone)]
pub struct FileBackend {
    input: PathBuf,
    output: PathBuf,
}

impl FileBackend {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
        }
    }
}

impl AudioBackend for FileBackend {
    fn open_capture(
        &self,
        sample_rate: u32,
        frames: mpsc::Sender<Vec<f32>>,
    ) -> Result<Box<dyn CaptureStream>, AudioError> {
        let bytes = std::fs::read(&self.input)?;
        let samples = decode_pcm16(&bytes);
        let frame_len = (sample_rate as u64 * FRAME_MILLIS / 1000).max(1) as usize;
        let recording = CancellationToken::new();

        tracing::info!(
            path = %self.input.display(),
            samples = samples.len(),
            "file capture opened"
        );

        let token = recording.clone();
        let pump = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MILLIS));
            for frame in samples.chunks(frame_len) {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if frames.send(frame.to_vec()).await.is_err() {
                    return;
                }
            }
            // Keep feeding silence so the session sees a live microphone.
            let silence = vec![0.0_f32; frame_len];
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if frames.send(silence.clone()).await.is_err() {
                    return;
                }
            }
        });

        Ok(Box::new(FileCapture {
            recording,
            pump: Some(pump),
        }))
    }

    fn open_output(&self, _sample_rate: u32) -> Result<Box<dyn OutputSink>, AudioError> {
        let file = File::create(&self.output)?;
        Ok(Box::new(FileSink {
            writer: BufWriter::new(file),
        }))
    }
}

struct FileCapture {
    recording: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl CaptureStream for FileCapture {
    fn stop_recording(&mut self) {
        self.recording.cancel();
    }

    fn disconnect_graph(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }

    fn close_context(&mut self) {}

    fn stop_tracks(&mut self) {
        tracing::debug!("file capture released");
    }
}

struct FileSink {
    writer: BufWriter<File>,
}

impl OutputSink for FileSink {
    fn play(&mut self, samples: &[f32]) -> Result<(), AudioError> {
        self.writer.write_all(&encode_pcm16(samples))?;
        Ok(())
    }

    fn close(&mut self) {
        if let Err(err) = self.writer.flush() {
            tracing::warn!(error = %err, "failed to flush playback file");
        }
    }
}
