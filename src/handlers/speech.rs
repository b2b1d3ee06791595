use crate::error::AppResult;
use crate::service::SpeechRequest;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use tracing::info;

/// Synthesize speech.
///
/// ## Endpoint: `POST /v1/audio/speech`
///
/// ## Request Body:
/// ```json
/// {
///   "input": "Cleared for takeoff",
///   "model": "speaches-ai/piper-en_US-ryan-low",
///   "voice": "piper-en_US-ryan-low",
///   "response_format": "mp3",
///   "speed": 1.2
/// }
/// ```
///
/// ## Response:
/// The encoded audio with a matching `Content-Type` and the resolved model in
/// the `x-model-id` header.
pub async fn create_speech(
    state: web::Data<AppState>,
    request: web::Json<SpeechRequest>,
) -> AppResult<HttpResponse> {
    let request = request.into_inner();
    let output = state
        .run_job(move |service| service.synthesize(&request))
        .await?;

    info!(model = %output.model_id, mime = output.mime, bytes = output.audio.len(), "Speech response ready");
    Ok(HttpResponse::Ok()
        .content_type(output.mime)
        .insert_header(("x-model-id", output.model_id))
        .body(output.audio))
}

#[cfg(test)]
mod tests {
    use crate::handlers::routes;
    use crate::state::test_support::test_state;
    use actix_web::{test, web, App};
    use serde_json::json;

    #[actix_web::test]
    async fn test_blank_input_is_a_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(|cfg| routes(cfg, 1024 * 1024)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/v1/audio/speech")
            .set_json(json!({ "input": "   " }))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "empty_text");
    }

    #[actix_web::test]
    async fn test_malformed_json_uses_error_format() {
        let dir = tempfile::tempdir().unwrap();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state(dir.path())))
                .configure(|cfg| routes(cfg, 1024 * 1024)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/v1/audio/speech")
            .insert_header(("content-type", "application/json"))
            .set_payload("{\"input\": ")
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 400);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "bad_request");
    }

    #[actix_web::test]
    async fn test_missing_engine_binary_is_a_500() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let store = state.service.registry().store().clone();
        store.ensure_dirs().unwrap();
        let (model, config) = store.voice_paths("piper-en_US-ryan-low");
        std::fs::write(model, b"onnx").unwrap();
        std::fs::write(config, b"{}").unwrap();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .configure(|cfg| routes(cfg, 1024 * 1024)),
        )
        .await;

        let request = test::TestRequest::post()
            .uri("/v1/audio/speech")
            .set_json(json!({ "input": "hello", "response_format": "wav" }))
            .to_request();
        let response = test::call_service(&app, request).await;
        assert_eq!(response.status(), 500);

        let body: serde_json::Value = test::read_body_json(response).await;
        assert_eq!(body["error"]["type"], "binary_not_found");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("definitely-not-piper"));
    }
}
