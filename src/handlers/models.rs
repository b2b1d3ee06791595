//! # Model Listing
//!
//! `GET /v1/models` reports the configured default models and the models
//! resolved so far in this process.

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ModelGroup {
    pub defaults: Vec<String>,
    pub loaded: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub synthesis: ModelGroup,
    pub transcription: ModelGroup,
    pub timestamp: String,
}

pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let defaults = state.service.defaults();
    let cached = state.service.cached_models();

    HttpResponse::Ok().json(ModelsResponse {
        synthesis: ModelGroup {
            defaults: defaults.synthesis_models.clone(),
            loaded: cached.synthesis,
        },
        transcription: ModelGroup {
            defaults: vec![defaults.transcription_model.clone()],
            loaded: cached.transcription,
        },
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}
