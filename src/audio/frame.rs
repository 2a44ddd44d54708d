//! # Frame Decoding and Adaptation
//!
//! Turns whatever the transport delivered into the fixed-size frame the inference
//! engine expects. Clients may stream 40ms chunks while the engine wants exactly
//! `frame_length` samples, so short frames are zero-padded and long ones truncated
//! instead of failing the session.
//!
//! ## Accepted payloads:
//! - **Binary**: raw little-endian signed 16-bit PCM
//! - **Base64**: the same PCM wrapped in a JSON `audio_frame` message
//!
//! The sample rate is never checked here. Sending a rate other than the one the
//! engine was built for is a caller error.

use crate::error::{SessionError, SessionResult};
use base64::{engine::general_purpose, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// A frame of exactly `frame_length` samples, ready for inference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Vec<i16>,
}

impl Frame {
    /// Convert 16-bit PCM samples to 32-bit float format for ML models.
    ///
    /// ## Conversion:
    /// Scales from 16-bit integer range [-32768, 32767] to float range [-1.0, 1.0)
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
    }
}

#[cfg(test)]
impl Frame {
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Normalizes raw transport frames to the engine's fixed frame length.
///
/// ## Purpose:
/// Pure and stateless apart from the configured length, so one adapter is shared by
/// every session.
#[derive(Debug, Clone, Copy)]
pub struct FrameAdapter {
    frame_length: usize,
}

impl FrameAdapter {
    pub fn new(frame_length: usize) -> Self {
        Self { frame_length }
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Adapt decoded samples to the configured frame length.
    pub fn adapt(&self, raw: &[i16]) -> SessionResult<Frame> {
        adapt(raw, self.frame_length)
    }

    /// Decode little-endian PCM bytes and adapt them in one step.
    pub fn adapt_bytes(&self, data: &[u8]) -> SessionResult<Frame> {
        let samples = decode_pcm(data)?;
        self.adapt(&samples)
    }
}

/// Fit `raw` into exactly `required_length` samples.
///
/// ## Rules:
/// - **Longer**: keep the first `required_length` samples
/// - **Shorter**: right-pad with zero samples
/// - **Equal**: pass through unchanged
///
/// ## Errors:
/// `InvalidFrame` when `raw` is empty.
pub fn adapt(raw: &[i16], required_length: usize) -> SessionResult<Frame> {
    if raw.is_empty() {
        return Err(SessionError::InvalidFrame("frame contains no samples".to_string()));
    }

    let mut samples = Vec::with_capacity(required_length);
    samples.extend_from_slice(&raw[..raw.len().min(required_length)]);
    samples.resize(required_length, 0);

    Ok(Frame { samples })
}

/// Decode raw little-endian 16-bit PCM into samples.
///
/// ## Validation Checks:
/// 1. **Data length**: must not be empty
/// 2. **Alignment**: must be even; a dangling byte cannot form a 16-bit sample
pub fn decode_pcm(data: &[u8]) -> SessionResult<Vec<i16>> {
    if data.is_empty() {
        return Err(SessionError::InvalidFrame("audio payload is empty".to_string()));
    }

    if data.len() % 2 != 0 {
        return Err(SessionError::InvalidFrame(format!(
            "audio payload length {} is not a whole number of 16-bit samples",
            data.len()
        )));
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 2);

    // Read each 16-bit sample (little-endian format)
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    Ok(samples)
}

/// Decode base64-wrapped PCM, as sent in JSON `audio_frame` messages.
pub fn decode_base64_pcm(encoded: &str) -> SessionResult<Vec<i16>> {
    let bytes = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| SessionError::InvalidFrame(format!("audio is not valid base64: {}", e)))?;
    decode_pcm(&bytes)
}
