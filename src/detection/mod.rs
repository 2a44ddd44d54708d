//! # Detection Module
//!
//! Everything between an adapted frame and the values reported to the client.
//!
//! ## Key Components:
//! - **engine**: the `InferenceEngine` contract and the built-in `EnergyEngine`
//! - **smoothing**: moving average + majority vote over a bounded window
//! - **hysteresis**: consecutive-frame gate for the displayed speech state

pub mod engine;       // Inference contract and built-in engine
pub mod hysteresis;   // Display state machine
pub mod smoothing;    // Rolling window smoothing

pub use engine::{EnergyEngine, Inference, InferenceEngine, RecurrentState};
pub use hysteresis::{DisplayState, Hysteresis, StateChange};
pub use smoothing::{SmoothingController, SmoothingWindow};
