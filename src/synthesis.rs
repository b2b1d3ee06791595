//! # Synthesis Executor
//!
//! Runs the external `piper` engine for a resolved voice. The text goes in on
//! stdin, the engine writes a WAV file to a per-request scratch path, and the
//! bytes of that file are the result.
//!
//! ## Acoustic Parameters:
//! - **length_scale**: phoneme duration multiplier, lower is faster speech.
//!   Clients usually send `speed` instead, which maps to `1 / speed`.
//! - **noise_scale / noise_w**: generator and phoneme-width noise
//! - **speaker**: speaker index for multi-speaker voices

use crate::process::{locate_binary, scratch_file, Invocation, ProcessError, ProcessRunner};
use crate::registry::ResolvedSynthesisModel;
use crate::service::SpeechRequest;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

const MIN_SPEED: f64 = 0.25;
const MAX_SPEED: f64 = 4.0;
const SPEED_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("piper binary '{binary}' not found in PATH")]
    BinaryNotFound { binary: String },

    #[error("could not prepare scratch file: {0}")]
    Scratch(#[source] std::io::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("piper failed: {diagnostic}")]
    Engine { diagnostic: String },
}

impl SynthesisError {
    pub fn kind(&self) -> &'static str {
        match self {
            SynthesisError::BinaryNotFound { .. } => "binary_not_found",
            SynthesisError::Scratch(_) => "scratch_io",
            SynthesisError::Process(ProcessError::TimedOut { .. }) => "engine_timeout",
            SynthesisError::Process(_) => "engine_unavailable",
            SynthesisError::Engine { .. } => "engine_failed",
        }
    }
}

/// Map a client speed factor to piper's `length_scale`.
///
/// Speeds are clamped to `[0.25, 4.0]`. Anything within 0.1% of 1.0 is normal
/// speed and maps to `None`, leaving piper at its default, exactly as when no
/// speed is given.
pub fn speed_to_length_scale(speed: Option<f64>) -> Option<f64> {
    let clamped = speed?.clamp(MIN_SPEED, MAX_SPEED);
    if is_close(clamped, 1.0, SPEED_TOLERANCE) {
        None
    } else {
        Some(1.0 / clamped)
    }
}

fn is_close(a: f64, b: f64, rel_tol: f64) -> bool {
    (a - b).abs() <= rel_tol * a.abs().max(b.abs())
}

/// Engine options for one synthesis call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisParams {
    pub length_scale: Option<f64>,
    pub noise_scale: Option<f64>,
    pub noise_w: Option<f64>,
    pub speaker_id: Option<i64>,
}

impl SynthesisParams {
    /// An explicit `length_scale` takes precedence over `speed`.
    pub fn from_request(request: &SpeechRequest) -> Self {
        Self {
            length_scale: request
                .length_scale
                .or_else(|| speed_to_length_scale(request.speed)),
            noise_scale: request.noise_scale,
            noise_w: request.noise_w,
            speaker_id: request.speaker_id,
        }
    }

    fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (flag, value) in [
            ("--length_scale", self.length_scale),
            ("--noise_scale", self.noise_scale),
            ("--noise_w", self.noise_w),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(format!("{:.4}", value));
            }
        }
        if let Some(speaker) = self.speaker_id {
            args.push("--speaker".to_string());
            args.push(speaker.to_string());
        }
        args
    }
}

pub struct SynthesisExecutor {
    runner: Arc<dyn ProcessRunner>,
    piper_binary: String,
    scratch_dir: PathBuf,
    timeout: Duration,
}

impl SynthesisExecutor {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        piper_binary: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            piper_binary: piper_binary.into(),
            scratch_dir: scratch_dir.into(),
            timeout,
        }
    }

    pub fn piper_binary(&self) -> &str {
        &self.piper_binary
    }

    /// Locate the configured piper executable.
    pub fn binary_path(&self) -> Result<PathBuf, SynthesisError> {
        locate_binary(&self.piper_binary).ok_or_else(|| SynthesisError::BinaryNotFound {
            binary: self.piper_binary.clone(),
        })
    }

    /// Synthesize `text` with `model`, returning the engine's WAV output.
    pub fn synthesize(
        &self,
        model: &ResolvedSynthesisModel,
        text: &str,
        params: &SynthesisParams,
    ) -> Result<Vec<u8>, SynthesisError> {
        let binary = self.binary_path()?;
        let output_path = scratch_file(&self.scratch_dir, ".wav").map_err(SynthesisError::Scratch)?;

        let invocation = Invocation::new(binary, self.timeout)
            .arg("--model")
            .arg(model.model_path.as_os_str())
            .arg("--config")
            .arg(model.config_path.as_os_str())
            .arg("--output_file")
            .arg(output_path.as_os_str())
            .args(params.to_args())
            .stdin(text.as_bytes().to_vec());

        debug!(args = ?invocation.args_lossy(), "Running piper");
        let started = Instant::now();
        let output = self.runner.run(&invocation)?;

        if !output.success {
            return Err(SynthesisError::Engine {
                diagnostic: output.diagnostic("piper exited with a non-zero status"),
            });
        }

        let audio = std::fs::read(&output_path).map_err(SynthesisError::Scratch)?;
        info!(
            model = %model.identifier,
            chars = text.chars().count(),
            bytes = audio.len(),
            elapsed_ms = %started.elapsed().as_millis(),
            "Speech synthesized"
        );
        Ok(audio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{MockProcessRunner, ProcessOutput};
    use std::path::Path;

    fn request(speed: Option<f64>, length_scale: Option<f64>) -> SpeechRequest {
        SpeechRequest {
            input: "hello".into(),
            speed,
            length_scale,
            ..Default::default()
        }
    }

    fn voice(dir: &Path) -> ResolvedSynthesisModel {
        ResolvedSynthesisModel {
            identifier: "speaches-ai/piper-en_US-ryan-low".into(),
            model_path: dir.join("ryan.onnx"),
            config_path: dir.join("ryan.onnx.json"),
            voice_name: "piper-en_US-ryan-low".into(),
        }
    }

    /// The test binary itself stands in for piper so the PATH lookup succeeds.
    fn fake_piper() -> String {
        std::env::current_exe().unwrap().to_string_lossy().into_owned()
    }

    fn executor(runner: MockProcessRunner, scratch: &Path) -> SynthesisExecutor {
        SynthesisExecutor::new(Arc::new(runner), fake_piper(), scratch, Duration::from_secs(5))
    }

    fn dir_entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_speed_mapping() {
        assert_eq!(speed_to_length_scale(None), None);
        assert_eq!(speed_to_length_scale(Some(1.0)), None);
        assert_eq!(speed_to_length_scale(Some(1.0005)), None);
        assert_eq!(speed_to_length_scale(Some(2.0)), Some(0.5));
        assert_eq!(speed_to_length_scale(Some(0.1)), Some(4.0));
        assert_eq!(speed_to_length_scale(Some(10.0)), Some(0.25));
    }

    #[test]
    fn test_normal_speed_matches_omitted_speed_on_the_command_line() {
        let normal = SynthesisParams::from_request(&request(Some(1.0), None));
        let nearly_normal = SynthesisParams::from_request(&request(Some(0.9995), None));
        let omitted = SynthesisParams::from_request(&request(None, None));
        assert_eq!(normal, omitted);
        assert_eq!(nearly_normal, omitted);
        assert!(normal.to_args().is_empty());
    }

    #[test]
    fn test_explicit_length_scale_wins_over_speed() {
        let params = SynthesisParams::from_request(&request(Some(2.0), Some(1.3)));
        assert_eq!(params.length_scale, Some(1.3));
    }

    #[test]
    fn test_invocation_arguments_and_output() {
        let scratch = tempfile::tempdir().unwrap();
        let model = voice(scratch.path());
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .times(1)
            .withf(|inv| {
                let args = inv.args_lossy();
                args[0] == "--model"
                    && args[1].ends_with("ryan.onnx")
                    && args[2] == "--config"
                    && args[3].ends_with("ryan.onnx.json")
                    && args[4] == "--output_file"
                    && args[5].ends_with(".wav")
                    && args[6..]
                        == [
                            "--length_scale",
                            "0.5000",
                            "--noise_scale",
                            "0.6670",
                            "--speaker",
                            "3",
                        ]
                    && inv.stdin.as_deref() == Some(b"Cleared for takeoff".as_slice())
            })
            .returning(|inv| {
                std::fs::write(&inv.args[5], b"RIFF-audio").unwrap();
                Ok(ProcessOutput {
                    status_code: Some(0),
                    success: true,
                    ..Default::default()
                })
            });

        let params = SynthesisParams {
            length_scale: speed_to_length_scale(Some(2.0)),
            noise_scale: Some(0.667),
            noise_w: None,
            speaker_id: Some(3),
        };
        let work = tempfile::tempdir().unwrap();
        let audio = executor(runner, work.path())
            .synthesize(&model, "Cleared for takeoff", &params)
            .unwrap();

        assert_eq!(audio, b"RIFF-audio");
        assert_eq!(dir_entries(work.path()), 0);
    }

    #[test]
    fn test_engine_failure_reports_stderr_and_cleans_up() {
        let scratch = tempfile::tempdir().unwrap();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().times(1).returning(|_| {
            Ok(ProcessOutput {
                status_code: Some(1),
                success: false,
                stdout: b"progress".to_vec(),
                stderr: b"Unable to load model\n".to_vec(),
            })
        });

        let err = executor(runner, scratch.path())
            .synthesize(&voice(scratch.path()), "hi", &SynthesisParams::default())
            .unwrap_err();

        assert_eq!(err.kind(), "engine_failed");
        assert!(err.to_string().contains("Unable to load model"));
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[test]
    fn test_silent_failure_uses_generic_message() {
        let scratch = tempfile::tempdir().unwrap();
        let mut runner = MockProcessRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(ProcessOutput::default()));

        let err = executor(runner, scratch.path())
            .synthesize(&voice(scratch.path()), "hi", &SynthesisParams::default())
            .unwrap_err();
        assert!(err.to_string().contains("piper exited with a non-zero status"));
    }

    #[test]
    fn test_timeout_cleans_up_scratch() {
        let scratch = tempfile::tempdir().unwrap();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().returning(|inv| {
            Err(ProcessError::TimedOut {
                program: inv.program_name(),
                timeout: inv.timeout,
            })
        });

        let err = executor(runner, scratch.path())
            .synthesize(&voice(scratch.path()), "hi", &SynthesisParams::default())
            .unwrap_err();
        assert_eq!(err.kind(), "engine_timeout");
        assert_eq!(dir_entries(scratch.path()), 0);
    }

    #[test]
    fn test_missing_binary_spawns_nothing() {
        let scratch = tempfile::tempdir().unwrap();
        let mut runner = MockProcessRunner::new();
        runner.expect_run().never();

        let executor = SynthesisExecutor::new(
            Arc::new(runner),
            "no-such-piper-binary",
            scratch.path(),
            Duration::from_secs(1),
        );
        let err = executor
            .synthesize(&voice(scratch.path()), "hi", &SynthesisParams::default())
            .unwrap_err();
        assert!(err.to_string().contains("no-such-piper-binary"));
    }
}
