//! # HTTP Handlers
//!
//! OpenAI-style audio endpoints plus model listing. Handlers only translate
//! between HTTP and `SpeechService`; all work runs through
//! `AppState::run_job`.
//!
//! ## Available Endpoints:
//! - `POST /v1/audio/speech` - text to audio
//! - `POST /v1/audio/transcriptions` - base64 audio to text
//! - `GET /v1/models` - configured and loaded models
//! - `GET /healthz`, `GET /metrics` - see `health`

pub mod models;
pub mod speech;
pub mod transcriptions;

use crate::error::AppError;
use crate::health;
use actix_web::web;

pub use models::list_models;
pub use speech::create_speech;
pub use transcriptions::create_transcription;

/// JSON extractor settings: body size limit and errors in the API's format.
pub fn json_config(max_body_bytes: usize) -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(max_body_bytes)
        .error_handler(|err, _req| AppError::bad_request(format!("invalid request body: {}", err)).into())
}

/// Register every route of the service.
pub fn routes(cfg: &mut web::ServiceConfig, max_body_bytes: usize) {
    cfg.app_data(json_config(max_body_bytes))
        .route("/healthz", web::get().to(health::health_check))
        .route("/metrics", web::get().to(health::detailed_metrics))
        .service(
            web::scope("/v1")
                .route("/audio/speech", web::post().to(create_speech))
                .route("/audio/transcriptions", web::post().to(create_transcription))
                .route("/models", web::get().to(list_models)),
        );
}
