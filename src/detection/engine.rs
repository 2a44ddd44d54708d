//! # Inference Engine Contract
//!
//! The classifier is a black box to the rest of the server: it receives one fixed-size
//! frame plus the recurrent state produced by the previous call for the same session,
//! and returns a speech probability together with the next state.
//!
//! ## Contract:
//! - **Deterministic**: identical `(frame, state)` pairs give identical results
//! - **Opaque state**: callers only thread `RecurrentState` from one call to the next
//! - **Blocking**: `infer` may take a while; callers run it off the async executor
//!
//! `EnergyEngine` is the built-in implementation. It needs no model file, which keeps
//! the server usable on its own; a neural model plugs in by implementing the trait.

use crate::audio::frame::Frame;
use crate::config::DetectionConfig;
use anyhow::{anyhow, Result};

/// Memory carried between successive inference calls of one session.
///
/// Nothing outside the engine that created it may interpret the values.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecurrentState(Vec<f32>);

impl RecurrentState {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// Output of one inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    /// Speech probability in [0, 1]
    pub probability: f32,
    /// State to pass into the next call for the same session
    pub state: RecurrentState,
}

/// A stateful frame classifier.
///
/// ## Thread Safety:
/// One engine instance is shared by every session (`Arc<dyn InferenceEngine>`), so all
/// per-session memory must travel through `RecurrentState`, never through `&self`.
pub trait InferenceEngine: Send + Sync {
    /// Short name used in logs and the health endpoint.
    fn name(&self) -> &str;

    /// State for the first frame of a new session.
    fn initial_state(&self) -> RecurrentState;

    /// Classify one frame given the state left by the previous frame.
    fn infer(&self, frame: &Frame, state: &RecurrentState) -> Result<Inference>;
}

/// Lowest level the engine reports, used for digital silence.
const MIN_LEVEL_DB: f32 = -100.0;

/// Noise floor assumed before the first frame has been heard.
const INITIAL_NOISE_FLOOR_DB: f32 = -60.0;

/// Width of the logistic transition between noise and speech.
const PROBABILITY_SLOPE_DB: f32 = 3.0;

/// Adaptive-noise-floor speech detector.
///
/// ## How it works:
/// 1. Compute the frame's RMS level in dBFS
/// 2. Compare it against the session's noise floor (the recurrent state)
/// 3. Map `level - floor - margin` through a logistic curve to get a probability
/// 4. Move the floor: down immediately to quieter frames, up slowly otherwise
#[derive(Debug, Clone)]
pub struct EnergyEngine {
    noise_margin_db: f32,
    floor_rise_db_per_frame: f32,
}

impl EnergyEngine {
    pub fn new(noise_margin_db: f32, floor_rise_db_per_frame: f32) -> Self {
        Self {
            noise_margin_db,
            floor_rise_db_per_frame,
        }
    }

    pub fn from_config(config: &DetectionConfig) -> Self {
        Self::new(config.noise_margin_db, config.floor_rise_db_per_frame)
    }
}

impl InferenceEngine for EnergyEngine {
    fn name(&self) -> &str {
        "energy"
    }

    fn initial_state(&self) -> RecurrentState {
        RecurrentState::new(vec![INITIAL_NOISE_FLOOR_DB])
    }

    fn infer(&self, frame: &Frame, state: &RecurrentState) -> Result<Inference> {
        let floor_db = match state.as_slice() {
            [floor] if floor.is_finite() => *floor,
            other => {
                return Err(anyhow!(
                    "energy engine expects a single finite noise floor, got {:?}",
                    other
                ))
            }
        };

        let level_db = level_dbfs(&frame.to_f32());
        let excess = level_db - floor_db - self.noise_margin_db;
        let probability = 1.0 / (1.0 + (-excess / PROBABILITY_SLOPE_DB).exp());

        let next_floor = if level_db < floor_db {
            level_db
        } else {
            (floor_db + self.floor_rise_db_per_frame).min(level_db)
        };

        Ok(Inference {
            probability,
            state: RecurrentState::new(vec![next_floor]),
        })
    }
}

/// RMS level of normalized samples in dBFS, floored at `MIN_LEVEL_DB`.
fn level_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return MIN_LEVEL_DB;
    }

    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_square.sqrt();
    if rms <= 0.0 {
        return MIN_LEVEL_DB;
    }

    (20.0 * rms.log10()).max(MIN_LEVEL_DB)
}
