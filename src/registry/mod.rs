//! # Model Registry
//!
//! Process-wide cache from model identifier to a resolved, ready-to-use model.
//! Constructed once at startup and shared by every request path.
//!
//! ## Resolution:
//! - **Synthesis**: a piper voice is a `<voice>.onnx` plus `<voice>.onnx.json`
//!   pair under `tts/`. Cached pairs resolve without network access; otherwise
//!   the identifier must be a `scope/name` hub repository and the missing files
//!   are downloaded.
//! - **Transcription**: the engine loader builds an in-memory recognizer, with
//!   its weights cached under `stt/`.
//!
//! ## Concurrency:
//! Each kind has its own single-flight map, so a given identifier is
//! initialized at most once at a time and concurrent callers share the
//! outcome. Failures are never cached.

mod single_flight;

pub use single_flight::{InitAbandoned, SingleFlight};

use crate::download::{Downloader, FetchError};
use crate::transcription::{EngineSettings, RecognizerLoader, SpeechRecognizer};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Which half of the service a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Synthesis,
    Transcription,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Synthesis => write!(f, "synthesis"),
            ModelKind::Transcription => write!(f, "transcription"),
        }
    }
}

/// A piper voice whose files are present in the artifact store.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSynthesisModel {
    pub identifier: String,
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub voice_name: String,
}

/// An initialized transcription engine.
pub struct ResolvedTranscriptionModel {
    pub identifier: String,
    pub engine: Arc<dyn SpeechRecognizer>,
}

impl fmt::Debug for ResolvedTranscriptionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedTranscriptionModel")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum ResolvedModel {
    Synthesis(Arc<ResolvedSynthesisModel>),
    Transcription(Arc<ResolvedTranscriptionModel>),
}

impl ResolvedModel {
    pub fn identifier(&self) -> &str {
        match self {
            ResolvedModel::Synthesis(model) => &model.identifier,
            ResolvedModel::Transcription(model) => &model.identifier,
        }
    }
}

/// Why a model could not be resolved. Never cached.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("invalid model identifier '{identifier}': {reason}")]
    BadIdentifier { identifier: String, reason: String },

    #[error("could not fetch model '{identifier}': {source}")]
    Fetch {
        identifier: String,
        #[source]
        source: FetchError,
    },

    #[error("could not initialize model '{identifier}': {message}")]
    EngineInit { identifier: String, message: String },
}

impl ResolutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ResolutionError::BadIdentifier { .. } => "bad_identifier",
            ResolutionError::Fetch { .. } => "fetch_failed",
            ResolutionError::EngineInit { .. } => "engine_init_failed",
        }
    }
}

impl From<InitAbandoned> for ResolutionError {
    fn from(value: InitAbandoned) -> Self {
        ResolutionError::EngineInit {
            identifier: value.key,
            message: "initialization aborted unexpectedly".to_string(),
        }
    }
}

/// Filesystem layout of the model cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tts_dir(&self) -> PathBuf {
        self.root.join("tts")
    }

    pub fn stt_dir(&self) -> PathBuf {
        self.root.join("stt")
    }

    /// `(model, config)` paths for a piper voice.
    pub fn voice_paths(&self, voice_name: &str) -> (PathBuf, PathBuf) {
        let dir = self.tts_dir();
        (
            dir.join(format!("{}.onnx", voice_name)),
            dir.join(format!("{}.onnx.json", voice_name)),
        )
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.tts_dir())?;
        std::fs::create_dir_all(self.stt_dir())
    }
}

/// Identifiers that have been resolved so far, per kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CachedModels {
    pub synthesis: Vec<String>,
    pub transcription: Vec<String>,
}

/// A failure collected during `prewarm`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrewarmFailure {
    pub kind: ModelKind,
    pub identifier: String,
    pub error: String,
}

pub struct ModelRegistry {
    store: ArtifactStore,
    hub_base_url: String,
    downloader: Downloader,
    loader: Arc<dyn RecognizerLoader>,
    engine_settings: EngineSettings,
    synthesis: SingleFlight<Arc<ResolvedSynthesisModel>, ResolutionError>,
    transcription: SingleFlight<Arc<ResolvedTranscriptionModel>, ResolutionError>,
}

impl ModelRegistry {
    pub fn new(
        store: ArtifactStore,
        hub_base_url: impl Into<String>,
        downloader: Downloader,
        loader: Arc<dyn RecognizerLoader>,
        engine_settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            hub_base_url: hub_base_url.into().trim_end_matches('/').to_string(),
            downloader,
            loader,
            engine_settings,
            synthesis: SingleFlight::new(),
            transcription: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        self.store.ensure_dirs()
    }

    /// Lookup-or-create the model named by `identifier`.
    pub fn resolve(&self, identifier: &str, kind: ModelKind) -> Result<ResolvedModel, ResolutionError> {
        match kind {
            ModelKind::Synthesis => self.resolve_synthesis(identifier).map(ResolvedModel::Synthesis),
            ModelKind::Transcription => self
                .resolve_transcription(identifier)
                .map(ResolvedModel::Transcription),
        }
    }

    pub fn resolve_synthesis(&self, identifier: &str) -> Result<Arc<ResolvedSynthesisModel>, ResolutionError> {
        let identifier = clean_identifier(identifier)?;
        self.synthesis
            .get_or_try_init(identifier, || self.acquire_voice(identifier).map(Arc::new))
    }

    pub fn resolve_transcription(
        &self,
        identifier: &str,
    ) -> Result<Arc<ResolvedTranscriptionModel>, ResolutionError> {
        let identifier = clean_identifier(identifier)?;
        self.transcription.get_or_try_init(identifier, || {
            let started = Instant::now();
            info!(model = %identifier, "Initializing transcription engine");
            let engine = self
                .loader
                .load(identifier, &self.engine_settings)
                .map_err(|e| ResolutionError::EngineInit {
                    identifier: identifier.to_string(),
                    message: format!("{:#}", e),
                })?;
            info!(
                model = %identifier,
                elapsed_ms = %started.elapsed().as_millis(),
                "Transcription engine ready"
            );
            Ok(Arc::new(ResolvedTranscriptionModel {
                identifier: identifier.to_string(),
                engine,
            }))
        })
    }

    pub fn cached_identifiers(&self) -> CachedModels {
        CachedModels {
            synthesis: self.synthesis.ready_keys(),
            transcription: self.transcription.ready_keys(),
        }
    }

    /// Resolve every configured model, logging and collecting failures.
    pub fn prewarm<S: AsRef<str>>(&self, synthesis_ids: &[S], transcription_id: &str) -> Vec<PrewarmFailure> {
        let mut failures = Vec::new();
        if let Err(e) = self.ensure_dirs() {
            warn!(root = %self.store.root().display(), error = %e, "Failed to create model cache directories");
        }

        for id in synthesis_ids {
            if let Err(e) = self.resolve_synthesis(id.as_ref()) {
                error!(model = %id.as_ref(), error = %e, "Failed to preload synthesis model");
                failures.push(PrewarmFailure {
                    kind: ModelKind::Synthesis,
                    identifier: id.as_ref().to_string(),
                    error: e.to_string(),
                });
            }
        }

        if let Err(e) = self.resolve_transcription(transcription_id) {
            error!(model = %transcription_id, error = %e, "Failed to preload transcription model");
            failures.push(PrewarmFailure {
                kind: ModelKind::Transcription,
                identifier: transcription_id.to_string(),
                error: e.to_string(),
            });
        }
        failures
    }

    fn acquire_voice(&self, identifier: &str) -> Result<ResolvedSynthesisModel, ResolutionError> {
        let voice_name = voice_name(identifier).ok_or_else(|| ResolutionError::BadIdentifier {
            identifier: identifier.to_string(),
            reason: "identifier does not name a voice".to_string(),
        })?;
        let (model_path, config_path) = self.store.voice_paths(voice_name);

        let resolved = ResolvedSynthesisModel {
            identifier: identifier.to_string(),
            model_path,
            config_path,
            voice_name: voice_name.to_string(),
        };

        if resolved.model_path.exists() && resolved.config_path.exists() {
            info!(model = %identifier, voice = %voice_name, "Using cached synthesis voice");
            return Ok(resolved);
        }

        if !identifier.contains('/') {
            return Err(ResolutionError::BadIdentifier {
                identifier: identifier.to_string(),
                reason: "voice is not cached locally and the identifier is not a hub repository \
                         (expected e.g. 'speaches-ai/piper-en_US-ryan-low')"
                    .to_string(),
            });
        }

        let base = format!("{}/{}/resolve/main", self.hub_base_url, identifier);
        for (file, destination) in [
            ("model.onnx", &resolved.model_path),
            ("model.onnx.json", &resolved.config_path),
        ] {
            if destination.exists() {
                continue;
            }
            self.downloader
                .fetch(&format!("{}/{}", base, file), destination)
                .map_err(|source| ResolutionError::Fetch {
                    identifier: identifier.to_string(),
                    source,
                })?;
        }

        info!(model = %identifier, voice = %voice_name, "Synthesis voice downloaded");
        Ok(resolved)
    }
}

fn clean_identifier(identifier: &str) -> Result<&str, ResolutionError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(ResolutionError::BadIdentifier {
            identifier: identifier.to_string(),
            reason: "model identifier must not be empty".to_string(),
        });
    }
    Ok(trimmed)
}

/// Last `/`-separated component of an identifier, if non-empty.
pub fn voice_name(identifier: &str) -> Option<&str> {
    identifier
        .trim()
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcription::{DecodeOptions, SegmentStream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct NullRecognizer;

    impl SpeechRecognizer for NullRecognizer {
        fn transcribe<'a>(
            &'a self,
            _audio_path: &Path,
            _options: &DecodeOptions,
        ) -> anyhow::Result<Box<dyn SegmentStream + 'a>> {
            anyhow::bail!("not used in registry tests")
        }
    }

    /// Loader that counts calls and fails for identifiers starting with "bad".
    struct CountingLoader {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl RecognizerLoader for CountingLoader {
        fn load(&self, identifier: &str, _settings: &EngineSettings) -> anyhow::Result<Arc<dyn SpeechRecognizer>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if identifier.starts_with("bad") {
                anyhow::bail!("unknown whisper model '{}'", identifier);
            }
            Ok(Arc::new(NullRecognizer))
        }
    }

    fn registry(root: &Path, hub: &str, loader: Arc<CountingLoader>) -> ModelRegistry {
        let store = ArtifactStore::new(root);
        let settings = EngineSettings {
            device: "cpu".into(),
            compute_type: "int8".into(),
            workers: 1,
            download_root: store.stt_dir(),
            hub_endpoint: hub.to_string(),
            ffmpeg_binary: "ffmpeg".into(),
            ffmpeg_timeout: Duration::from_secs(5),
        };
        ModelRegistry::new(
            store,
            hub,
            Downloader::new(Duration::from_secs(5)),
            loader,
            settings,
        )
    }

    fn loader(delay_ms: u64) -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        })
    }

    #[test]
    fn test_voice_name_is_last_component() {
        assert_eq!(voice_name("speaches-ai/piper-en_US-ryan-low"), Some("piper-en_US-ryan-low"));
        assert_eq!(voice_name("  local-voice "), Some("local-voice"));
        assert_eq!(voice_name("scope/"), None);
    }

    #[test]
    fn test_cached_voice_resolves_without_network() {
        let dir = tempfile::tempdir().unwrap();
        // Unroutable hub: any download attempt would fail the test.
        let registry = registry(dir.path(), "http://127.0.0.1:9", loader(0));
        registry.ensure_dirs().unwrap();
        let (model, config) = registry.store().voice_paths("ryan");
        std::fs::write(&model, b"onnx").unwrap();
        std::fs::write(&config, b"{}").unwrap();

        let resolved = registry.resolve_synthesis(" ryan ").unwrap();
        assert_eq!(resolved.identifier, "ryan");
        assert_eq!(resolved.voice_name, "ryan");
        assert_eq!(resolved.model_path, model);
        assert_eq!(registry.cached_identifiers().synthesis, vec!["ryan".to_string()]);
    }

    #[test]
    fn test_bare_uncached_identifier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), "http://127.0.0.1:9", loader(0));

        let err = registry.resolve_synthesis("ryan").unwrap_err();
        assert_eq!(err.kind(), "bad_identifier");

        let err = registry.resolve_synthesis("   ").unwrap_err();
        assert_eq!(err.kind(), "bad_identifier");
    }

    #[test]
    fn test_namespaced_voice_downloads_model_then_config() {
        let mut server = mockito::Server::new();
        let model_mock = server
            .mock("GET", "/speaches-ai/piper-en_US-ryan-low/resolve/main/model.onnx")
            .with_body("weights")
            .expect(1)
            .create();
        let config_mock = server
            .mock("GET", "/speaches-ai/piper-en_US-ryan-low/resolve/main/model.onnx.json")
            .with_body("{\"audio\":{}}")
            .expect(1)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), &server.url(), loader(0));

        let resolved = registry.resolve_synthesis("speaches-ai/piper-en_US-ryan-low").unwrap();
        // Second call is served from the registry without touching the hub.
        let again = registry.resolve_synthesis("speaches-ai/piper-en_US-ryan-low").unwrap();

        model_mock.assert();
        config_mock.assert();
        assert!(Arc::ptr_eq(&resolved, &again));
        assert_eq!(resolved.voice_name, "piper-en_US-ryan-low");
        assert_eq!(std::fs::read(&resolved.model_path).unwrap(), b"weights");
        assert!(resolved.config_path.ends_with("tts/piper-en_US-ryan-low.onnx.json"));
    }

    #[test]
    fn test_failed_download_is_not_cached() {
        let mut server = mockito::Server::new();
        let missing = server
            .mock("GET", "/scope/voice/resolve/main/model.onnx")
            .with_status(404)
            .expect(2)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), &server.url(), loader(0));

        for _ in 0..2 {
            let err = registry.resolve_synthesis("scope/voice").unwrap_err();
            match err {
                ResolutionError::Fetch { source, .. } => assert!(!source.transient),
                other => panic!("unexpected error: {other:?}"),
            }
        }
        missing.assert();
        assert!(registry.cached_identifiers().synthesis.is_empty());
    }

    #[test]
    fn test_concurrent_transcription_resolution_loads_once() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(100);
        let registry = Arc::new(registry(dir.path(), "http://127.0.0.1:9", Arc::clone(&loader)));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve_transcription("tiny.en").unwrap()
                })
            })
            .collect();

        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
        assert!(resolved.iter().all(|r| Arc::ptr_eq(r, &resolved[0])));

        match registry.resolve("tiny.en", ModelKind::Transcription).unwrap() {
            ResolvedModel::Transcription(model) => assert!(Arc::ptr_eq(&model, &resolved[0])),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn test_concurrent_voice_resolution_downloads_once() {
        let mut server = mockito::Server::new();
        let model_mock = server
            .mock("GET", "/speaches-ai/piper-en_US-amy-low/resolve/main/model.onnx")
            .with_body("weights")
            .expect(1)
            .create();
        let config_mock = server
            .mock("GET", "/speaches-ai/piper-en_US-amy-low/resolve/main/model.onnx.json")
            .with_body("{}")
            .expect(1)
            .create();

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(registry(dir.path(), &server.url(), loader(0)));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.resolve_synthesis("speaches-ai/piper-en_US-amy-low").unwrap()
                })
            })
            .collect();

        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        model_mock.assert();
        config_mock.assert();
        assert!(resolved.iter().all(|r| Arc::ptr_eq(r, &resolved[0])));
        assert_eq!(std::fs::read(&resolved[0].model_path).unwrap(), b"weights");
        assert_eq!(
            registry.cached_identifiers().synthesis,
            vec!["speaches-ai/piper-en_US-amy-low".to_string()]
        );
    }

    #[test]
    fn test_engine_failure_retries_on_next_call() {
        let dir = tempfile::tempdir().unwrap();
        let loader = loader(0);
        let registry = registry(dir.path(), "http://127.0.0.1:9", Arc::clone(&loader));

        for _ in 0..2 {
            let err = registry.resolve_transcription("bad-model").unwrap_err();
            assert_eq!(err.kind(), "engine_init_failed");
            assert!(err.to_string().contains("unknown whisper model"));
        }
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_prewarm_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path(), "http://127.0.0.1:9", loader(0));

        let failures = registry.prewarm(&["bare-voice"], "bad-stt");
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, ModelKind::Synthesis);
        assert_eq!(failures[1].kind, ModelKind::Transcription);
        assert!(dir.path().join("tts").is_dir());
        assert!(dir.path().join("stt").is_dir());
    }
}
