//! Debug endpoint for trying the detection engine without a WebSocket connection.
//!
//! The probe runs one frame from the engine's initial state. It never creates,
//! reads or updates a session.

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::frame::decode_base64_pcm;
use crate::error::{AppError, AppResult, SessionError};
use crate::state::AppState;

/// Request to classify a single frame
#[derive(Debug, Deserialize)]
pub struct ProbeRequest {
    /// Little-endian 16-bit PCM, standard base64
    pub audio: String,
}

/// Result of a probe
#[derive(Debug, Serialize)]
pub struct ProbeResponse {
    pub engine: String,
    pub vad_probability: f32,
    pub is_noisy: bool,
    pub classification: &'static str,
    /// Samples in the request before adaptation
    pub samples_received: usize,
    pub frame_length: usize,
    pub processing_time_ms: f64,
}

/// Classify one frame
///
/// POST /api/v1/debug/probe
/// Body: {"audio": "<base64 PCM>"}
pub async fn probe_frame(
    state: web::Data<AppState>,
    req: web::Json<ProbeRequest>,
) -> AppResult<HttpResponse> {
    let start_time = std::time::Instant::now();

    let samples = decode_base64_pcm(&req.audio)?;
    let adapter = state.sessions.adapter();
    let frame = adapter.adapt(&samples)?;

    let engine = Arc::clone(state.sessions.engine());
    let inference = web::block(move || {
        let initial_state = engine.initial_state();
        engine.infer(&frame, &initial_state)
    })
    .await
    .map_err(|e| AppError::Internal(format!("probe task failed: {}", e)))?
    .map_err(|e| SessionError::InferenceFailure(e.to_string()))?;

    let is_noisy = inference.probability <= state.config.detection.speech_threshold;
    let response = ProbeResponse {
        engine: state.sessions.engine().name().to_string(),
        vad_probability: inference.probability,
        is_noisy,
        classification: if is_noisy { "no_speech" } else { "speech" },
        samples_received: samples.len(),
        frame_length: adapter.frame_length(),
        processing_time_ms: start_time.elapsed().as_secs_f64() * 1000.0,
    };

    tracing::debug!(
        vad_probability = response.vad_probability,
        samples = response.samples_received,
        "Debug probe classified frame"
    );

    Ok(HttpResponse::Ok().json(response))
}
