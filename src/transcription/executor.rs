//! # Transcription Executor
//!
//! Runs a resolved recognizer over one request's audio. The engine works on
//! files, so the bytes are written to a scratch file whose extension follows
//! the client's format hint. The engine's segment stream is drained completely
//! before the result is assembled, because language and duration are only
//! final at the end of the stream.

use super::audio::AudioDecodeError;
use super::{DecodeOptions, Segment, TranscriptionResult};
use crate::process::scratch_file;
use crate::registry::ResolvedTranscriptionModel;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

const DEFAULT_EXTENSION: &str = "wav";
const MAX_EXTENSION_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TranscriptionError {
    #[error("could not prepare scratch file: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("transcription failed: {0}")]
    Engine(String),

    #[error("transcription result empty")]
    EmptyResult,
}

impl TranscriptionError {
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionError::Scratch(_) => "scratch_io",
            TranscriptionError::Decode(_) => "audio_decode_failed",
            TranscriptionError::Engine(_) => "engine_failed",
            TranscriptionError::EmptyResult => "empty_result",
        }
    }

    fn from_engine(err: anyhow::Error) -> Self {
        if err.downcast_ref::<AudioDecodeError>().is_some() {
            TranscriptionError::Decode(format!("{:#}", err))
        } else {
            TranscriptionError::Engine(format!("{:#}", err))
        }
    }
}

/// Process-wide decoding settings. Requests may override all but the beam
/// size and best-of count.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionDefaults {
    pub beam_size: usize,
    pub best_of: usize,
    pub language: Option<String>,
    pub temperature: f64,
    pub vad_filter: bool,
    pub prompt: Option<String>,
}

/// Per-request overrides; `None` falls back to the configured default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionOptions {
    pub language: Option<String>,
    pub temperature: Option<f64>,
    pub vad_filter: Option<bool>,
    pub prompt: Option<String>,
}

pub struct TranscriptionExecutor {
    scratch_dir: PathBuf,
    defaults: TranscriptionDefaults,
}

impl TranscriptionExecutor {
    pub fn new(scratch_dir: impl Into<PathBuf>, defaults: TranscriptionDefaults) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            defaults,
        }
    }

    pub fn defaults(&self) -> &TranscriptionDefaults {
        &self.defaults
    }

    pub fn decode_options(&self, overrides: &TranscriptionOptions) -> DecodeOptions {
        DecodeOptions {
            beam_size: self.defaults.beam_size,
            best_of: self.defaults.best_of,
            language: non_empty(overrides.language.as_deref()).or_else(|| self.defaults.language.clone()),
            temperature: overrides.temperature.unwrap_or(self.defaults.temperature),
            vad_filter: overrides.vad_filter.unwrap_or(self.defaults.vad_filter),
            initial_prompt: non_empty(overrides.prompt.as_deref()).or_else(|| self.defaults.prompt.clone()),
        }
    }

    pub fn transcribe(
        &self,
        model: &ResolvedTranscriptionModel,
        audio: &[u8],
        format_hint: Option<&str>,
        overrides: &TranscriptionOptions,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let extension = scratch_extension(format_hint);
        let scratch = scratch_file(&self.scratch_dir, &format!(".{}", extension))
            .map_err(TranscriptionError::Scratch)?;
        std::fs::write(&scratch, audio).map_err(TranscriptionError::Scratch)?;

        let options = self.decode_options(overrides);
        debug!(model = %model.identifier, options = ?options, "Starting transcription");
        let started = Instant::now();

        let mut stream = model
            .engine
            .transcribe(&scratch, &options)
            .map_err(TranscriptionError::from_engine)?;

        let mut segments = Vec::new();
        for (index, item) in stream.by_ref().enumerate() {
            let segment = item.map_err(TranscriptionError::from_engine)?;
            segments.push(Segment {
                index,
                start: segment.start,
                end: segment.end,
                text: segment.text,
            });
        }
        let info = stream.info();
        drop(stream);

        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<String>()
            .trim()
            .to_string();
        if text.is_empty() {
            return Err(TranscriptionError::EmptyResult);
        }

        let language = info
            .language
            .filter(|l| !l.is_empty())
            .or(options.language)
            .unwrap_or_default();

        info!(
            model = %model.identifier,
            segments = segments.len(),
            language = %language,
            audio_s = info.duration,
            elapsed_ms = %started.elapsed().as_millis(),
            "Transcription complete"
        );

        Ok(TranscriptionResult {
            text,
            language,
            duration_seconds: info.duration,
            segments,
        })
    }
}

/// File extension for the scratch copy. Hints that are not a short
/// alphanumeric extension fall back to `wav`.
fn scratch_extension(format_hint: Option<&str>) -> &str {
    format_hint
        .map(|f| f.trim().trim_start_matches('.'))
        .filter(|f| {
            !f.is_empty() && f.len() <= MAX_EXTENSION_LEN && f.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .unwrap_or(DEFAULT_EXTENSION)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
