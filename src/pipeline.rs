//! # Transcription Pipeline Boundary
//!
//! The transcription engine itself lives outside this service. This module
//! defines the seam the WebSocket actor talks to, plus [`TracingPipeline`], a
//! stand-in that decodes and accounts for audio without transcribing it.
//!
//! ## Audio format:
//! - **Encoding**: 32-bit IEEE float PCM, little-endian
//! - **Sample rate**: 16kHz, mono (the pipeline owns resampling)
//! - **Frames**: handed over exactly as received

use crate::admission::{ControlMessage, SessionDescriptor};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info};

const BYTES_PER_SAMPLE: usize = 4;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// A single frame could not be used. The frame is dropped.
    #[error("malformed audio frame: {0}")]
    MalformedAudio(String),

    /// The pipeline cannot continue this session.
    #[error("transcription pipeline unavailable: {0}")]
    Unavailable(String),
}

impl PipelineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Unavailable(_))
    }
}

/// Downstream consumer of admitted sessions.
///
/// Calls are made from the connection's actor, one at a time and in frame
/// arrival order.
pub trait TranscriptionPipeline: Send + Sync {
    /// Human-readable backend name, reported to clients in `SERVER_READY`.
    fn backend(&self) -> &str;

    fn open_session(&self, descriptor: &SessionDescriptor) -> Result<(), PipelineError>;

    fn push_audio(&self, uid: &str, frame: &[u8]) -> Result<(), PipelineError>;

    fn control(&self, uid: &str, message: &ControlMessage) -> Result<(), PipelineError>;

    fn close_session(&self, uid: &str);

    /// Sessions currently open in the pipeline, for the health endpoint.
    fn open_streams(&self) -> usize;
}

/// Decode a float32 little-endian PCM frame.
pub fn decode_f32_pcm(frame: &[u8]) -> Result<Vec<f32>, PipelineError> {
    if frame.is_empty() {
        return Err(PipelineError::MalformedAudio("frame is empty".to_string()));
    }
    if frame.len() % BYTES_PER_SAMPLE != 0 {
        return Err(PipelineError::MalformedAudio(format!(
            "frame length {} is not a multiple of {}",
            frame.len(),
            BYTES_PER_SAMPLE
        )));
    }

    let mut samples = vec![0.0f32; frame.len() / BYTES_PER_SAMPLE];
    LittleEndian::read_f32_into(frame, &mut samples);

    if let Some(bad) = samples.iter().find(|s| !s.is_finite()) {
        return Err(PipelineError::MalformedAudio(format!("non-finite sample {}", bad)));
    }

    Ok(samples)
}

/// Per-session counters kept by [`TracingPipeline`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StreamStats {
    pub frames: u64,
    pub samples: u64,
    pub control_messages: u64,
    pub peak_amplitude: f32,
}

/// Pipeline stand-in: validates audio, tracks per-session stats, logs.
#[derive(Default)]
pub struct TracingPipeline {
    streams: Mutex<HashMap<String, StreamStats>>,
}

impl TracingPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn stats(&self, uid: &str) -> Option<StreamStats> {
        self.streams.lock().get(uid).cloned()
    }
}

impl TranscriptionPipeline for TracingPipeline {
    fn backend(&self) -> &str {
        "tracing"
    }

    fn open_session(&self, descriptor: &SessionDescriptor) -> Result<(), PipelineError> {
        info!(
            uid = %descriptor.uid(),
            language = ?descriptor.language(),
            task = ?descriptor.task(),
            use_vad = descriptor.use_vad(),
            "Pipeline session opened"
        );
        self.streams
            .lock()
            .insert(descriptor.uid().to_string(), StreamStats::default());
        Ok(())
    }

    fn push_audio(&self, uid: &str, frame: &[u8]) -> Result<(), PipelineError> {
        let samples = decode_f32_pcm(frame)?;
        let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));

        let mut streams = self.streams.lock();
        let stats = streams
            .get_mut(uid)
            .ok_or_else(|| PipelineError::Unavailable(format!("no open stream for {}", uid)))?;
        stats.frames += 1;
        stats.samples += samples.len() as u64;
        stats.peak_amplitude = stats.peak_amplitude.max(peak);

        debug!(uid = %uid, samples = samples.len(), "Audio frame accepted");
        Ok(())
    }

    fn control(&self, uid: &str, message: &ControlMessage) -> Result<(), PipelineError> {
        if let Some(stats) = self.streams.lock().get_mut(uid) {
            stats.control_messages += 1;
        }
        debug!(uid = %uid, kind = message.kind.as_str(), event = ?message.event(), "Control message");
        Ok(())
    }

    fn close_session(&self, uid: &str) {
        if let Some(stats) = self.streams.lock().remove(uid) {
            info!(
                uid = %uid,
                frames = stats.frames,
                samples = stats.samples,
                control_messages = stats.control_messages,
                peak_amplitude = stats.peak_amplitude,
                "Pipeline session closed"
            );
        }
    }

    fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }
}
