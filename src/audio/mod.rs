//! # Audio Session Module
//!
//! Turns the raw audio a client streams in into per-connection detection results.
//!
//! ## Key Components:
//! - **Frame Adapter**: PCM decoding and fixed-length frame shaping
//! - **Session Manager**: per-connection state, ordering and idle eviction
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz (16,000 Hz) by default
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! The WebSocket transport lives in src/websocket.rs at the root level.

pub mod frame;        // PCM decoding and frame adaptation
pub mod session;      // Session state management
