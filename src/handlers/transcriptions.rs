use crate::error::AppResult;
use crate::service::TranscriptionRequest;
use crate::state::AppState;
use crate::transcription::TranscriptionResult;
use actix_web::web;

/// Transcribe base64 encoded audio.
///
/// ## Endpoint: `POST /v1/audio/transcriptions`
///
/// ## Request Body:
/// ```json
/// {
///   "audio": "UklGRi...",
///   "format": "wav",
///   "model": "tiny.en",
///   "language": "en",
///   "prompt": "ATC phraseology",
///   "temperature": 0.0,
///   "vad_filter": true
/// }
/// ```
///
/// ## Response:
/// ```json
/// {
///   "text": "Tower, ready for departure.",
///   "language": "en",
///   "duration": 2.4,
///   "segments": [{ "id": 0, "start": 0.0, "end": 2.4, "text": " Tower, ready for departure." }]
/// }
/// ```
pub async fn create_transcription(
    state: web::Data<AppState>,
    request: web::Json<TranscriptionRequest>,
) -> AppResult<web::Json<TranscriptionResult>> {
    let request = request.into_inner();
    let result = state
        .run_job(move |service| service.transcribe(&request))
        .await?;
    Ok(web::Json(result))
}
