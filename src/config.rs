//! # Configuration Management
//!
//! This module loads the gateway's configuration from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables with the APP_ prefix
//! - The variable names used by earlier deployments of the service
//!   (`SPEACHES_*`, `HOST`, `PORT`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (`SPEACHES_TTS_MODELS`, `PORT`, ...)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_TRANSCRIPTION__DEVICE`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys use a double underscore in `APP_` variables so that field
//! names containing underscores survive: `APP_SYNTHESIS__PIPER_BINARY`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub hub: HubConfig,
    pub downloader: DownloaderConfig,
    pub synthesis: SynthesisConfig,
    pub transcoder: TranscoderConfig,
    pub transcription: TranscriptionConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: address to bind to (`0.0.0.0` accepts connections from anywhere)
/// - `port`: TCP port to listen on
/// - `max_body_bytes`: JSON payload limit. Transcription requests carry
///   base64 audio, so this is far above actix's 32 KiB default.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

/// Where model artifacts and per-request scratch files live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root of the model cache (`tts/` and `stt/` are created below it)
    pub cache_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloaderConfig {
    pub timeout_secs: u64,
}

/// Text-to-speech settings.
///
/// ## Fields:
/// - `default_models`: voices preloaded at startup; the first one serves
///   requests that do not name a model
/// - `piper_binary`: name or path of the piper executable
/// - `default_format`: `response_format` used when a request omits it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    pub default_models: Vec<String>,
    pub piper_binary: String,
    pub default_format: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscoderConfig {
    pub ffmpeg_binary: String,
    pub timeout_secs: u64,
}

/// Speech-to-text settings.
///
/// ## Fields:
/// - `default_model`: Whisper model for requests that do not name one
///   ("tiny.en", "base", "small", "medium", "large-v3", or a hub repository)
/// - `device` / `compute_type`: where and at what precision weights are loaded
/// - `workers`: model instances per loaded model, i.e. how many
///   transcriptions of the same model can run at once
/// - `beam_size`, `best_of`, `language`, `temperature`, `vad_filter`,
///   `prompt`: decoding defaults; requests may override the last four
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub default_model: String,
    pub device: String,
    pub compute_type: String,
    pub workers: usize,
    pub beam_size: usize,
    pub best_of: usize,
    pub language: Option<String>,
    pub temperature: f64,
    pub vad_filter: bool,
    pub prompt: Option<String>,
}

/// Performance tuning configuration.
///
/// `max_concurrent_jobs` bounds how many synthesis or transcription requests
/// run on the blocking pool at the same time; further requests wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_jobs: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                max_body_bytes: 50 * 1024 * 1024,
            },
            storage: StorageConfig {
                cache_dir: PathBuf::from("/app/models"),
                scratch_dir: env::temp_dir(),
            },
            hub: HubConfig {
                base_url: "https://huggingface.co".to_string(),
            },
            downloader: DownloaderConfig { timeout_secs: 300 },
            synthesis: SynthesisConfig {
                default_models: vec!["speaches-ai/piper-en_US-ryan-low".to_string()],
                piper_binary: "piper".to_string(),
                default_format: "mp3".to_string(),
                timeout_secs: 120,
            },
            transcoder: TranscoderConfig {
                ffmpeg_binary: "ffmpeg".to_string(),
                timeout_secs: 120,
            },
            transcription: TranscriptionConfig {
                default_model: "tiny.en".to_string(),
                device: "cpu".to_string(),
                compute_type: "int8".to_string(),
                workers: 1,
                beam_size: 5,
                best_of: 5,
                language: None,
                temperature: 0.0,
                vad_filter: false,
                prompt: None,
            },
            performance: PerformanceConfig {
                max_concurrent_jobs: 4,
            },
        }
    }
}

/// Deployment variables and the keys they override.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("SPEACHES_MODEL_DIR", "storage.cache_dir"),
    ("SPEACHES_STT_MODEL", "transcription.default_model"),
    ("SPEACHES_PIPER_BINARY", "synthesis.piper_binary"),
    ("SPEACHES_WHISPER_DEVICE", "transcription.device"),
    ("SPEACHES_WHISPER_COMPUTE", "transcription.compute_type"),
    ("SPEACHES_WHISPER_WORKERS", "transcription.workers"),
    ("SPEACHES_WHISPER_BEAM_SIZE", "transcription.beam_size"),
    ("SPEACHES_WHISPER_BEST_OF", "transcription.best_of"),
    ("SPEACHES_WHISPER_LANGUAGE", "transcription.language"),
    ("SPEACHES_WHISPER_TEMPERATURE", "transcription.temperature"),
    ("SPEACHES_WHISPER_VAD", "transcription.vad_filter"),
    ("SPEACHES_WHISPER_PROMPT", "transcription.prompt"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
];

impl AppConfig {
    /// Load configuration from the process environment and `config.toml`.
    pub fn load() -> Result<Self> {
        Self::load_from(|name| env::var(name).ok())
    }

    /// Load configuration, reading deployment variables through `lookup`.
    ///
    /// `APP_*` variables are always read from the process environment.
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("synthesis.default_models")
                    .try_parsing(true),
            );

        for (name, key) in LEGACY_ENV {
            if let Some(value) = lookup(name) {
                settings = settings.set_override(*key, value)?;
            }
        }

        // Whitespace separated, as in existing deployments.
        if let Some(models) = lookup("SPEACHES_TTS_MODELS") {
            let models: Vec<String> = models.split_whitespace().map(str::to_string).collect();
            if !models.is_empty() {
                settings = settings.set_override("synthesis.default_models", models)?;
            }
        }

        let mut config: AppConfig = settings.build()?.try_deserialize()?;
        config.normalize();
        Ok(config)
    }

    /// Treat blank optional values as unset and trim identifiers.
    fn normalize(&mut self) {
        let blank_to_none = |value: &mut Option<String>| {
            if value.as_deref().map(str::trim).is_some_and(str::is_empty) {
                *value = None;
            }
        };
        blank_to_none(&mut self.transcription.language);
        blank_to_none(&mut self.transcription.prompt);

        self.transcription.default_model = self.transcription.default_model.trim().to_string();
        self.synthesis.default_models.retain(|m| !m.trim().is_empty());
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("Max concurrent jobs must be greater than 0"));
        }

        if self.transcription.workers == 0 {
            return Err(anyhow::anyhow!("Transcription workers must be greater than 0"));
        }

        if self.transcription.beam_size == 0 || self.transcription.best_of == 0 {
            return Err(anyhow::anyhow!("beam_size and best_of must be greater than 0"));
        }

        let temperature = self.transcription.temperature;
        if temperature.is_nan() || temperature < 0.0 {
            return Err(anyhow::anyhow!(
                "Transcription temperature must be non-negative, got {}",
                temperature
            ));
        }

        if self.transcription.default_model.is_empty() {
            return Err(anyhow::anyhow!("A default transcription model is required"));
        }

        for (name, binary) in [
            ("synthesis.piper_binary", &self.synthesis.piper_binary),
            ("transcoder.ffmpeg_binary", &self.transcoder.ffmpeg_binary),
        ] {
            if binary.trim().is_empty() {
                return Err(anyhow::anyhow!("{} cannot be empty", name));
            }
        }

        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("max_body_bytes must be greater than 0"));
        }

        Ok(())
    }
}

impl DownloaderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SynthesisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TranscoderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}
