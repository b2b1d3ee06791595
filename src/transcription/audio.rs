//! # Audio Input for Whisper
//!
//! Whisper consumes 16 kHz mono `f32` samples in `[-1.0, 1.0]`.
//!
//! ## Decoding Paths:
//! - **16 kHz WAV**: parsed in-process with the `wav` crate and downmixed
//! - **everything else**: normalised by `ffmpeg` to raw s16le 16 kHz mono on
//!   stdout, then read with `byteorder`
//!
//! ## Voice Activity Filter:
//! `drop_non_speech` runs WebRTC VAD over 30 ms frames and keeps only the
//! voiced ones, which removes long silences before decoding.

use crate::process::{locate_binary, Invocation, ProcessRunner};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const SAMPLE_RATE: u32 = 16_000;

/// 30 ms at 16 kHz.
const VAD_FRAME_SAMPLES: usize = 480;

/// Input audio could not be decoded. Distinguished from engine failures so
/// callers can report it as a client problem.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AudioDecodeError {
    message: String,
}

impl AudioDecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Turns audio files into Whisper-ready samples.
#[derive(Clone)]
pub struct AudioLoader {
    runner: Arc<dyn ProcessRunner>,
    ffmpeg_binary: String,
    timeout: Duration,
}

impl AudioLoader {
    pub fn new(runner: Arc<dyn ProcessRunner>, ffmpeg_binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            ffmpeg_binary: ffmpeg_binary.into(),
            timeout,
        }
    }

    /// Decode `path` to 16 kHz mono samples.
    pub fn load(&self, path: &Path) -> anyhow::Result<Vec<f32>> {
        match read_wav(path) {
            Ok(Some(samples)) => {
                debug!(samples = samples.len(), "Loaded 16 kHz WAV directly");
                return Ok(samples);
            }
            Ok(None) => debug!("WAV is not 16 kHz, resampling with ffmpeg"),
            Err(e) => debug!(error = %e, "Input is not a readable WAV, decoding with ffmpeg"),
        }
        self.decode_with_ffmpeg(path)
    }

    fn decode_with_ffmpeg(&self, path: &Path) -> anyhow::Result<Vec<f32>> {
        let binary = locate_binary(&self.ffmpeg_binary)
            .ok_or_else(|| anyhow::anyhow!("ffmpeg binary '{}' not found in PATH", self.ffmpeg_binary))?;

        let invocation = Invocation::new(binary, self.timeout)
            .args(["-nostdin", "-threads", "0", "-i"])
            .arg(path.as_os_str())
            .args(["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1", "-ar"])
            .arg(SAMPLE_RATE.to_string())
            .arg("-");

        let output = self.runner.run(&invocation)?;
        if !output.success {
            return Err(AudioDecodeError::new(output.diagnostic("ffmpeg could not decode the audio")).into());
        }
        if output.stdout.len() < 2 {
            return Err(AudioDecodeError::new("audio contains no samples").into());
        }
        Ok(pcm_s16le_to_f32(&output.stdout))
    }
}

/// Read a WAV file, returning `None` when its sample rate is not 16 kHz.
pub fn read_wav(path: &Path) -> anyhow::Result<Option<Vec<f32>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let (header, data) = wav::read(&mut reader)?;
    if header.sampling_rate != SAMPLE_RATE {
        return Ok(None);
    }

    let interleaved: Vec<f32> = match data {
        wav::BitDepth::Eight(samples) => samples
            .into_iter()
            .map(|s| (s as f32 - 128.0) / 128.0)
            .collect(),
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 32768.0)
            .collect(),
        wav::BitDepth::TwentyFour(samples) => samples
            .into_iter()
            .map(|s| s as f32 / 8_388_608.0)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        wav::BitDepth::Empty => Vec::new(),
    };

    Ok(Some(downmix(&interleaved, header.channel_count as usize)))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

pub fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    let mut samples = vec![0i16; bytes.len() / 2];
    LittleEndian::read_i16_into(&bytes[..samples.len() * 2], &mut samples);
    samples.into_iter().map(|s| s as f32 / 32768.0).collect()
}

/// Keep only frames WebRTC VAD classifies as speech.
///
/// A trailing partial frame is kept as-is.
pub fn drop_non_speech(samples: &[f32]) -> Vec<f32> {
    use webrtc_vad::{SampleRate, Vad, VadMode};

    let mut vad = Vad::new();
    vad.set_mode(VadMode::Aggressive);
    let _ = vad.set_sample_rate(SampleRate::Rate16kHz);

    let mut voiced = Vec::with_capacity(samples.len());
    let mut frame = [0i16; VAD_FRAME_SAMPLES];
    let mut chunks = samples.chunks_exact(VAD_FRAME_SAMPLES);
    for chunk in &mut chunks {
        for (dst, &s) in frame.iter_mut().zip(chunk) {
            *dst = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
        }
        match vad.is_voice_segment(&frame) {
            Ok(true) => voiced.extend_from_slice(chunk),
            Ok(false) => {}
            Err(e) => {
                warn!("VAD error: {:?}", e);
                voiced.extend_from_slice(chunk);
            }
        }
    }
    voiced.extend_from_slice(chunks.remainder());

    debug!(
        kept = voiced.len(),
        total = samples.len(),
        "Voice activity filter applied"
    );
    voiced
}
