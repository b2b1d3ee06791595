//! # Application State Management
//!
//! Shared state handed to every request handler through `web::Data`.
//!
//! ## Contents:
//! - **config**: the configuration the process started with (read-only)
//! - **service**: the synchronous speech core (registry + executors)
//! - **jobs**: semaphore bounding concurrent blocking jobs
//! - **metrics**: request/error counters, updated by the metrics middleware
//!
//! ## Blocking Work:
//! Synthesis and transcription block for seconds. `run_job` waits for a
//! semaphore permit, then moves the work onto actix's blocking thread pool
//! with `web::block`, so the async workers keep accepting connections.

use crate::config::AppConfig;
use crate::error::AppError;
use crate::service::SpeechService;
use actix_web::web;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub service: Arc<SpeechService>,
    jobs: Arc<Semaphore>,

    /// Performance metrics (updated by every request)
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Synthesis/transcription jobs currently running on the blocking pool
    pub active_jobs: u32,

    /// Key: endpoint name (e.g., "POST /v1/audio/speech")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, service: Arc<SpeechService>) -> Self {
        let jobs = Arc::new(Semaphore::new(config.performance.max_concurrent_jobs));
        Self {
            config: Arc::new(config),
            service,
            jobs,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Run `job` against the speech service on the blocking pool.
    ///
    /// At most `performance.max_concurrent_jobs` jobs run at once; callers
    /// beyond that wait for a permit.
    pub async fn run_job<F, T, E>(&self, job: F) -> Result<T, AppError>
    where
        F: FnOnce(&SpeechService) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<AppError> + Send + 'static,
    {
        let _permit = self.jobs.acquire().await?;
        let service = Arc::clone(&self.service);

        self.update_active_jobs(|active| active + 1);
        let result = web::block(move || job(&service)).await;
        self.update_active_jobs(|active| active.saturating_sub(1));

        result?.map_err(Into::into)
    }

    pub fn available_job_slots(&self) -> usize {
        self.jobs.available_permits()
    }

    fn update_active_jobs(&self, update: impl FnOnce(u32) -> u32) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.active_jobs = update(metrics.active_jobs);
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        metrics.error_count += 1;
    }

    /// Record one request to `endpoint` (e.g. "POST /v1/audio/speech").
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Copy of the current metrics, so no lock is held while responding.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap_or_else(PoisonError::into_inner);
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            active_jobs: metrics.active_jobs,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::download::Downloader;
    use crate::process::{ProcessRunner, SystemProcessRunner};
    use crate::registry::{ArtifactStore, ModelRegistry};
    use crate::service::ServiceDefaults;
    use crate::synthesis::SynthesisExecutor;
    use crate::transcode::Transcoder;
    use crate::transcription::{
        DecodeOptions, EngineSegment, EngineSettings, RecognizerLoader, SegmentStream, SpeechRecognizer,
        TranscriptionDefaults, TranscriptionExecutor, TranscriptionInfo,
    };
    use std::path::Path;
    use std::time::Duration;

    struct EchoStream {
        text: Option<String>,
    }

    impl Iterator for EchoStream {
        type Item = anyhow::Result<EngineSegment>;

        fn next(&mut self) -> Option<Self::Item> {
            self.text.take().map(|text| {
                Ok(EngineSegment {
                    start: 0.0,
                    end: 1.0,
                    text,
                })
            })
        }
    }

    impl SegmentStream for EchoStream {
        fn info(&self) -> TranscriptionInfo {
            TranscriptionInfo {
                language: Some("en".into()),
                duration: 1.0,
            }
        }
    }

    /// Recognizes the audio file's contents as text.
    struct EchoRecognizer;

    impl SpeechRecognizer for EchoRecognizer {
        fn transcribe<'a>(
            &'a self,
            audio_path: &Path,
            _options: &DecodeOptions,
        ) -> anyhow::Result<Box<dyn SegmentStream + 'a>> {
            let text = std::fs::read_to_string(audio_path)?;
            Ok(Box::new(EchoStream { text: Some(text) }))
        }
    }

    struct EchoLoader;

    impl RecognizerLoader for EchoLoader {
        fn load(&self, _identifier: &str, _settings: &EngineSettings) -> anyhow::Result<Arc<dyn SpeechRecognizer>> {
            Ok(Arc::new(EchoRecognizer))
        }
    }

    /// State backed by a temporary cache, an echoing recognizer and a
    /// synthesis binary that does not exist.
    pub(crate) fn test_state(root: &Path) -> AppState {
        let mut config = AppConfig::default();
        config.storage.cache_dir = root.join("models");
        config.storage.scratch_dir = root.to_path_buf();
        config.hub.base_url = "http://127.0.0.1:9".into();
        config.synthesis.piper_binary = "definitely-not-piper".into();

        let store = ArtifactStore::new(&config.storage.cache_dir);
        let settings = EngineSettings {
            device: "cpu".into(),
            compute_type: "int8".into(),
            workers: 1,
            download_root: store.stt_dir(),
            hub_endpoint: config.hub.base_url.clone(),
            ffmpeg_binary: "ffmpeg".into(),
            ffmpeg_timeout: Duration::from_secs(5),
        };
        let registry = ModelRegistry::new(
            store,
            &config.hub.base_url,
            Downloader::new(Duration::from_secs(5)),
            Arc::new(EchoLoader),
            settings,
        );
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
        let timeout = Duration::from_secs(5);
        let service = SpeechService::new(
            Arc::new(registry),
            SynthesisExecutor::new(Arc::clone(&runner), &config.synthesis.piper_binary, root, timeout),
            Transcoder::new(runner, &config.transcoder.ffmpeg_binary, root, timeout),
            TranscriptionExecutor::new(
                root,
                TranscriptionDefaults {
                    beam_size: 5,
                    best_of: 5,
                    language: None,
                    temperature: 0.0,
                    vad_filter: false,
                    prompt: None,
                },
            ),
            ServiceDefaults {
                synthesis_models: config.synthesis.default_models.clone(),
                response_format: config.synthesis.default_format.clone(),
                transcription_model: config.transcription.default_model.clone(),
            },
        );
        AppState::new(config, Arc::new(service))
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_state;
    use super::*;
    use crate::service::{ClientInputError, ServiceError};

    #[test]
    fn test_endpoint_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state.record_endpoint_request("POST /v1/audio/speech", 30, false);
        state.record_endpoint_request("POST /v1/audio/speech", 10, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["POST /v1/audio/speech"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[actix_web::test]
    async fn test_run_job_returns_result_and_releases_permit() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let slots = state.available_job_slots();

        let value = state
            .run_job(|service| Ok::<_, ServiceError>(service.defaults().transcription_model.clone()))
            .await
            .unwrap();
        assert_eq!(value, "tiny.en");

        let err = state
            .run_job(|_| Err::<(), _>(ServiceError::from(ClientInputError::EmptyAudio)))
            .await
            .unwrap_err();
        assert_eq!(err.status(), actix_web::http::StatusCode::BAD_REQUEST);

        assert_eq!(state.available_job_slots(), slots);
        assert_eq!(state.get_metrics_snapshot().active_jobs, 0);
    }
}
