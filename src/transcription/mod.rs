//! # Transcription Module
//!
//! Speech-to-text on top of Whisper models run in-process with Candle.
//!
//! ## Key Components:
//! - **SpeechRecognizer / RecognizerLoader**: the engine boundary. The executor
//!   and the model registry only ever talk to these traits.
//! - **executor**: turns a request's audio bytes into a `TranscriptionResult`
//! - **whisper**: the Candle-backed engine (model download, decoding loop)
//! - **audio**: file decoding to 16 kHz mono samples and voice-activity filtering
//! - **mel**: mel filterbank used for the log-mel features
//!
//! ## Whisper Model Names:
//! Bare names such as `tiny.en`, `base`, `small`, `medium` or `large-v3` map to
//! the `openai/whisper-*` repositories; any `namespace/name` identifier is used
//! as a hub repository directly.

pub mod audio;
pub mod executor;
pub mod mel;
pub mod whisper;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use executor::{TranscriptionDefaults, TranscriptionError, TranscriptionExecutor};

/// Settings passed to the engine loader when a transcription model is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// `cpu`, `cuda`, `metal` or `auto`
    pub device: String,
    /// Numeric precision of the weights (`float32`, `float16`, `bfloat16`, `int8`)
    pub compute_type: String,
    /// Number of model instances, i.e. concurrent transcriptions per model
    pub workers: usize,
    /// Hub cache directory for downloaded weights
    pub download_root: PathBuf,
    /// Base URL of the model hub
    pub hub_endpoint: String,
    /// Transcoder used to normalise non-WAV input
    pub ffmpeg_binary: String,
    pub ffmpeg_timeout: Duration,
}

/// Decoding parameters for one transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOptions {
    pub beam_size: usize,
    pub best_of: usize,
    pub language: Option<String>,
    pub temperature: f64,
    pub vad_filter: bool,
    pub initial_prompt: Option<String>,
}

/// A timed span of recognized text as produced by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Metadata that is only final once the segment stream has been drained.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionInfo {
    pub language: Option<String>,
    pub duration: f64,
}

/// Lazy, non-restartable sequence of segments for one audio file.
pub trait SegmentStream: Iterator<Item = anyhow::Result<EngineSegment>> {
    fn info(&self) -> TranscriptionInfo;
}

/// An initialized transcription engine. Shared between requests.
pub trait SpeechRecognizer: Send + Sync {
    fn transcribe<'a>(
        &'a self,
        audio_path: &Path,
        options: &DecodeOptions,
    ) -> anyhow::Result<Box<dyn SegmentStream + 'a>>;
}

/// Builds engine instances for model identifiers.
pub trait RecognizerLoader: Send + Sync {
    fn load(
        &self,
        identifier: &str,
        settings: &EngineSettings,
    ) -> anyhow::Result<Arc<dyn SpeechRecognizer>>;
}

/// One segment of a finished transcription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "id")]
    pub index: usize,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Final transcription returned to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: String,
    #[serde(rename = "duration")]
    pub duration_seconds: f64,
    pub segments: Vec<Segment>,
}
