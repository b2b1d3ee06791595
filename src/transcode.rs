//! # Audio Transcoder
//!
//! Re-encodes the WAV produced by the synthesis engine into the format a
//! client asked for. WAV is returned untouched; every other format is a single
//! `ffmpeg` run between two scratch files.

use crate::process::{locate_binary, scratch_file, Invocation, ProcessError, ProcessRunner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Output encodings offered to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Flac,
    Pcm,
}

impl AudioFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Pcm => "audio/L16",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => ".wav",
            AudioFormat::Mp3 => ".mp3",
            AudioFormat::Flac => ".flac",
            AudioFormat::Pcm => ".pcm",
        }
    }

    /// ffmpeg output options placed between the input and the output file.
    fn encoder_args(&self) -> &'static [&'static str] {
        match self {
            AudioFormat::Wav => &[],
            AudioFormat::Mp3 => &["-ar", "22050", "-ac", "1"],
            AudioFormat::Flac => &[],
            AudioFormat::Pcm => &["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1"],
        }
    }
}

impl FromStr for AudioFormat {
    type Err = TranscodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wav" => Ok(AudioFormat::Wav),
            "mp3" => Ok(AudioFormat::Mp3),
            "flac" => Ok(AudioFormat::Flac),
            "pcm" => Ok(AudioFormat::Pcm),
            _ => Err(TranscodeError::UnsupportedFormat {
                format: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Flac => "flac",
            AudioFormat::Pcm => "pcm",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("unsupported response_format '{format}' (expected wav, mp3, flac or pcm)")]
    UnsupportedFormat { format: String },

    #[error("ffmpeg binary '{binary}' not found in PATH")]
    BinaryNotFound { binary: String },

    #[error("could not prepare scratch file: {0}")]
    Scratch(#[source] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("ffmpeg failed: {diagnostic}")]
    Engine { diagnostic: String },
}

impl TranscodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            TranscodeError::UnsupportedFormat { .. } => "unsupported_format",
            TranscodeError::BinaryNotFound { .. } => "binary_not_found",
            TranscodeError::Scratch(_) => "scratch_io",
            TranscodeError::Process(ProcessError::TimedOut { .. }) => "transcoder_timeout",
            TranscodeError::Process(_) => "transcoder_unavailable",
            TranscodeError::Engine { .. } => "transcoder_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedAudio {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
    pub format: AudioFormat,
}

pub struct Transcoder {
    runner: Arc<dyn ProcessRunner>,
    ffmpeg_binary: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        ffmpeg_binary: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            ffmpeg_binary: ffmpeg_binary.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }

    pub fn ffmpeg_binary(&self) -> &str {
        &self.ffmpeg_binary
    }

    pub fn binary_path(&self) -> Result<PathBuf, TranscodeError> {
        locate_binary(&self.ffmpeg_binary).ok_or_else(|| TranscodeError::BinaryNotFound {
            binary: self.ffmpeg_binary.clone(),
        })
    }

    /// Convert `wav_bytes` into `format`.
    pub fn transcode(&self, wav_bytes: Vec<u8>, format: AudioFormat) -> Result<EncodedAudio, TranscodeError> {
        if format == AudioFormat::Wav {
            return Ok(EncodedAudio {
                bytes: wav_bytes,
                mime_type: format.mime_type(),
                format,
            });
        }

        let binary = self.binary_path()?;
        let input = scratch_file(&self.scratch_dir, ".wav").map_err(TranscodeError::Scratch)?;
        std::fs::write(&input, &wav_bytes).map_err(TranscodeError::Scratch)?;
        let output = scratch_file(&self.scratch_dir, format.extension()).map_err(TranscodeError::Scratch)?;

        let invocation = Invocation::new(binary, self.timeout)
            .args(["-y", "-i"])
            .arg(input.as_os_str())
            .args(format.encoder_args().iter().copied())
            .arg(output.as_os_str());

        let started = Instant::now();
        let result = self.runner.run(&invocation)?;
        if !result.success {
            return Err(TranscodeError::Engine {
                diagnostic: result.diagnostic("ffmpeg failed to convert audio"),
            });
        }

        let bytes = std::fs::read(&output).map_err(TranscodeError::Scratch)?;
        debug!(
            format = %format,
            in_bytes = wav_bytes.len(),
            out_bytes = bytes.len(),
            elapsed_ms = %started.elapsed().as_millis(),
            "Audio transcoded"
        );
        Ok(EncodedAudio {
            bytes,
            mime_type: format.mime_type(),
            format,
        })
    }

    /// Parse `format` and transcode; unsupported names fail before any process runs.
    pub fn transcode_named(&self, wav_bytes: Vec<u8>, format: &str) -> Result<EncodedAudio, TranscodeError> {
        let format: AudioFormat = format.parse()?;
        self.transcode(wav_bytes, format)
    }
}
