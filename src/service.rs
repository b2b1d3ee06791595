//! # Request Orchestration
//!
//! `SpeechService` is the synchronous core behind the HTTP handlers. It
//! validates client input, resolves models through the registry and runs the
//! executors in order. Every call is blocking and is expected to run on the
//! blocking thread pool.
//!
//! ## Error Classification:
//! `ServiceError::is_client_error` decides between 4xx and 5xx responses.
//! Problems with what the client sent (empty text, bad base64, unknown voice,
//! unsupported format, undecodable audio, nothing recognized) are client
//! errors; everything that goes wrong on our side is not.

use crate::config::AppConfig;
use crate::download::Downloader;
use crate::process::ProcessRunner;
use crate::registry::{ArtifactStore, CachedModels, ModelKind, ModelRegistry, PrewarmFailure, ResolutionError};
use crate::synthesis::{SynthesisError, SynthesisExecutor, SynthesisParams};
use crate::transcode::{AudioFormat, TranscodeError, Transcoder};
use crate::transcription::executor::TranscriptionOptions;
use crate::transcription::whisper::WhisperLoader;
use crate::transcription::{
    EngineSettings, TranscriptionDefaults, TranscriptionError, TranscriptionExecutor, TranscriptionResult,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Body of `POST /v1/audio/speech`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SpeechRequest {
    #[serde(alias = "text")]
    pub input: String,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub response_format: Option<String>,
    pub speed: Option<f64>,
    pub length_scale: Option<f64>,
    pub noise_scale: Option<f64>,
    pub noise_w: Option<f64>,
    pub speaker_id: Option<i64>,
}

/// Body of `POST /v1/audio/transcriptions`. `audio` is base64 encoded.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TranscriptionRequest {
    pub audio: Option<String>,
    /// File extension of the encoded audio, `wav` when omitted
    pub format: Option<String>,
    pub model: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub temperature: Option<f64>,
    pub vad_filter: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechOutput {
    pub audio: Vec<u8>,
    pub mime: &'static str,
    pub model_id: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientInputError {
    #[error("input text is required")]
    EmptyText,

    #[error("voice '{requested}' is not available for model '{model}' (available: '{available}')")]
    VoiceUnavailable {
        requested: String,
        model: String,
        available: String,
    },

    #[error("audio payload is required")]
    EmptyAudio,

    #[error("invalid base64 audio: {0}")]
    InvalidEncoding(String),
}

impl ClientInputError {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientInputError::EmptyText => "empty_text",
            ClientInputError::VoiceUnavailable { .. } => "voice_unavailable",
            ClientInputError::EmptyAudio => "empty_audio",
            ClientInputError::InvalidEncoding(_) => "invalid_encoding",
        }
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Input(#[from] ClientInputError),

    /// `from_request` records whether the client named the model.
    #[error("{source}")]
    Resolution {
        source: ResolutionError,
        from_request: bool,
    },

    #[error("no default {kind} model configured")]
    NoDefaultModel { kind: ModelKind },

    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),
}

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Input(e) => e.kind(),
            ServiceError::Resolution { source, .. } => source.kind(),
            ServiceError::NoDefaultModel { .. } => "no_default_model",
            ServiceError::Synthesis(e) => e.kind(),
            ServiceError::Transcode(e) => e.kind(),
            ServiceError::Transcription(e) => e.kind(),
        }
    }

    pub fn is_client_error(&self) -> bool {
        match self {
            ServiceError::Input(_) => true,
            ServiceError::Resolution {
                source: ResolutionError::BadIdentifier { .. },
                from_request,
            } => *from_request,
            ServiceError::Transcode(TranscodeError::UnsupportedFormat { .. }) => true,
            ServiceError::Transcription(TranscriptionError::EmptyResult | TranscriptionError::Decode(_)) => true,
            _ => false,
        }
    }
}

/// Models and formats used when a request does not name one.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefaults {
    pub synthesis_models: Vec<String>,
    pub response_format: String,
    pub transcription_model: String,
}

pub struct SpeechService {
    registry: Arc<ModelRegistry>,
    synthesis: SynthesisExecutor,
    transcoder: Transcoder,
    transcription: TranscriptionExecutor,
    defaults: ServiceDefaults,
}

impl SpeechService {
    pub fn new(
        registry: Arc<ModelRegistry>,
        synthesis: SynthesisExecutor,
        transcoder: Transcoder,
        transcription: TranscriptionExecutor,
        defaults: ServiceDefaults,
    ) -> Self {
        Self {
            registry,
            synthesis,
            transcoder,
            transcription,
            defaults,
        }
    }

    /// Wire the registry and executors from configuration.
    pub fn from_config(config: &AppConfig, runner: Arc<dyn ProcessRunner>) -> anyhow::Result<Self> {
        let store = ArtifactStore::new(&config.storage.cache_dir);
        let engine_settings = EngineSettings {
            device: config.transcription.device.clone(),
            compute_type: config.transcription.compute_type.clone(),
            workers: config.transcription.workers,
            download_root: store.stt_dir(),
            hub_endpoint: config.hub.base_url.clone(),
            ffmpeg_binary: config.transcoder.ffmpeg_binary.clone(),
            ffmpeg_timeout: config.transcoder.timeout(),
        };
        let registry = ModelRegistry::new(
            store,
            &config.hub.base_url,
            Downloader::new(config.downloader.timeout()),
            Arc::new(WhisperLoader::new(Arc::clone(&runner))),
            engine_settings,
        );

        let scratch_dir = &config.storage.scratch_dir;
        let synthesis = SynthesisExecutor::new(
            Arc::clone(&runner),
            &config.synthesis.piper_binary,
            scratch_dir,
            config.synthesis.timeout(),
        );
        let transcoder = Transcoder::new(
            runner,
            &config.transcoder.ffmpeg_binary,
            scratch_dir,
            config.transcoder.timeout(),
        );
        let transcription = TranscriptionExecutor::new(
            scratch_dir,
            TranscriptionDefaults {
                beam_size: config.transcription.beam_size,
                best_of: config.transcription.best_of,
                language: config.transcription.language.clone(),
                temperature: config.transcription.temperature,
                vad_filter: config.transcription.vad_filter,
                prompt: config.transcription.prompt.clone(),
            },
        );

        Ok(Self::new(
            Arc::new(registry),
            synthesis,
            transcoder,
            transcription,
            ServiceDefaults {
                synthesis_models: config.synthesis.default_models.clone(),
                response_format: config.synthesis.default_format.clone(),
                transcription_model: config.transcription.default_model.clone(),
            },
        ))
    }

    pub fn defaults(&self) -> &ServiceDefaults {
        &self.defaults
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechOutput, ServiceError> {
        let text = request.input.trim();
        if text.is_empty() {
            return Err(ClientInputError::EmptyText.into());
        }

        let format_name = non_empty(request.response_format.as_deref()).unwrap_or(&self.defaults.response_format);
        let format: AudioFormat = format_name.parse()?;

        let (identifier, from_request) = match non_empty(request.model.as_deref()) {
            Some(model) => (model, true),
            None => (
                self.defaults
                    .synthesis_models
                    .first()
                    .map(String::as_str)
                    .ok_or(ServiceError::NoDefaultModel {
                        kind: ModelKind::Synthesis,
                    })?,
                false,
            ),
        };

        let model = self
            .registry
            .resolve_synthesis(identifier)
            .map_err(|source| ServiceError::Resolution { source, from_request })?;

        if let Some(voice) = non_empty(request.voice.as_deref()) {
            if voice != model.voice_name {
                return Err(ClientInputError::VoiceUnavailable {
                    requested: voice.to_string(),
                    model: model.identifier.clone(),
                    available: model.voice_name.clone(),
                }
                .into());
            }
        }

        let params = SynthesisParams::from_request(request);
        debug!(model = %model.identifier, format = %format, params = ?params, "Synthesizing speech");
        let wav = self.synthesis.synthesize(&model, text, &params)?;
        let encoded = self.transcoder.transcode(wav, format)?;

        Ok(SpeechOutput {
            audio: encoded.bytes,
            mime: encoded.mime_type,
            model_id: model.identifier.clone(),
        })
    }

    pub fn transcribe(&self, request: &TranscriptionRequest) -> Result<TranscriptionResult, ServiceError> {
        let payload = non_empty(request.audio.as_deref()).ok_or(ClientInputError::EmptyAudio)?;
        let audio = STANDARD
            .decode(payload)
            .map_err(|e| ClientInputError::InvalidEncoding(e.to_string()))?;

        let (identifier, from_request) = match non_empty(request.model.as_deref()) {
            Some(model) => (model, true),
            None => (self.defaults.transcription_model.as_str(), false),
        };
        let model = self
            .registry
            .resolve_transcription(identifier)
            .map_err(|source| ServiceError::Resolution { source, from_request })?;

        let overrides = TranscriptionOptions {
            language: request.language.clone(),
            temperature: request.temperature,
            vad_filter: request.vad_filter,
            prompt: request.prompt.clone(),
        };
        let format = non_empty(request.format.as_deref());
        Ok(self.transcription.transcribe(&model, &audio, format, &overrides)?)
    }

    pub fn cached_models(&self) -> CachedModels {
        self.registry.cached_identifiers()
    }

    /// Resolve every configured model.
    pub fn prewarm(&self) -> Vec<PrewarmFailure> {
        info!(
            synthesis = ?self.defaults.synthesis_models,
            transcription = %self.defaults.transcription_model,
            "Prewarming models"
        );
        self.registry
            .prewarm(&self.defaults.synthesis_models, &self.defaults.transcription_model)
    }

    /// Prewarm and check that both external binaries can be found.
    ///
    /// Returns one message per problem; empty means ready.
    pub fn readiness_problems(&self) -> Vec<String> {
        let mut problems: Vec<String> = self
            .prewarm()
            .into_iter()
            .map(|failure| failure.error)
            .collect();
        if let Err(e) = self.synthesis.binary_path() {
            problems.push(e.to_string());
        }
        if let Err(e) = self.transcoder.binary_path() {
            problems.push(e.to_string());
        }
        problems
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
