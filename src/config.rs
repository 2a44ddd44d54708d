//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: converts between Rust structs and data formats (TOML, JSON, env vars)
//! - **derive macros**: generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` environment variables
//! 2. Environment variables (APP_SERVER__PORT, APP_DETECTION__FRAME_LENGTH, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::{Context, Result};        // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                         // For reading environment variables
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Sections:
/// - **server**: where the HTTP/WebSocket listener binds
/// - **detection**: frame size, smoothing and hysteresis parameters for the pipeline
/// - **session**: connection lifecycle (idle expiry, heartbeat, capacity)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Parameters of the per-frame detection pipeline.
///
/// ## Fields:
/// - `sample_rate`: rate the inference step expects; clients must already send this rate
/// - `frame_length`: fixed sample count handed to the engine (512 = 32ms at 16kHz)
/// - `smoothing_window_size`: number of raw outcomes averaged per session (W)
/// - `hysteresis_threshold`: consecutive disagreeing frames before the display state flips
/// - `speech_threshold`: probabilities above this count as speech
/// - `noise_margin_db`: how far above the noise floor a frame must be to look like speech
/// - `floor_rise_db_per_frame`: how fast the built-in engine lets its noise floor climb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub sample_rate: u32,
    pub frame_length: usize,
    pub smoothing_window_size: usize,
    pub hysteresis_threshold: u32,
    pub speech_threshold: f32,
    pub noise_margin_db: f32,
    pub floor_rise_db_per_frame: f32,
}

/// Connection lifecycle settings.
///
/// ## Fields:
/// - `idle_timeout_secs`: sessions without a frame for this long are evicted (1 hour by default)
/// - `sweep_interval_secs`: how often the background sweeper looks for idle sessions
/// - `max_concurrent_sessions`: connect requests beyond this are refused
/// - `heartbeat_interval_secs` / `client_timeout_secs`: WebSocket liveness checks
/// - `frame_queue_capacity`: frames a connection may have waiting for inference; further
///   frames are dropped with an `overloaded` error
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub frame_queue_capacity: usize,
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            detection: DetectionConfig {
                sample_rate: 16000,
                frame_length: 512,              // 32ms at 16kHz
                smoothing_window_size: 4,       // ~160ms of 40ms transport frames
                hysteresis_threshold: 3,
                speech_threshold: 0.5,
                noise_margin_db: 12.0,
                floor_rise_db_per_frame: 0.05,
            },
            session: SessionConfig {
                idle_timeout_secs: 3600,
                sweep_interval_secs: 60,
                max_concurrent_sessions: 1000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                frame_queue_capacity: 32,       // ~1.3s of 40ms frames
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_DETECTION__SMOOTHING_WINDOW_SIZE=6`: Override the smoothing window
    /// - `APP_SESSION__IDLE_TIMEOUT_SECS=600`: Override idle expiry
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// Field names contain underscores, so nested keys are separated with a double
    /// underscore.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings
            .build()
            .context("failed to assemble configuration sources")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;
        Ok(config)
    }

    /// Parse a configuration from a TOML document layered over the defaults,
    /// the same way `config.toml` is layered in `load()`.
    #[cfg(test)]
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Frame length, window size and hysteresis threshold are non-zero
    /// - Speech threshold is a probability
    /// - Idle timeout, sweep interval and capacity are non-zero
    /// - The client timeout is longer than the heartbeat interval
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let detection = &self.detection;
        if detection.sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rate must be greater than 0"));
        }
        if detection.frame_length == 0 {
            return Err(anyhow::anyhow!("Frame length must be greater than 0"));
        }
        if detection.smoothing_window_size == 0 {
            return Err(anyhow::anyhow!("Smoothing window size must be greater than 0"));
        }
        if detection.hysteresis_threshold == 0 {
            return Err(anyhow::anyhow!("Hysteresis threshold must be greater than 0"));
        }
        if !(0.0..=1.0).contains(&detection.speech_threshold) {
            return Err(anyhow::anyhow!(
                "Speech threshold must be within [0, 1], got {}",
                detection.speech_threshold
            ));
        }
        if detection.floor_rise_db_per_frame < 0.0 {
            return Err(anyhow::anyhow!("Noise floor rise rate cannot be negative"));
        }

        let session = &self.session;
        if session.idle_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Idle timeout must be greater than 0"));
        }
        if session.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Sweep interval must be greater than 0"));
        }
        if session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if session.heartbeat_interval_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }
        if session.frame_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Frame queue capacity must be greater than 0"));
        }
        if session.client_timeout_secs <= session.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must exceed the heartbeat interval ({}s)",
                session.client_timeout_secs,
                session.heartbeat_interval_secs
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.detection.frame_length, 512);
        assert_eq!(config.detection.smoothing_window_size, 4);
        assert_eq!(config.detection.hysteresis_threshold, 3);
        assert_eq!(config.session.idle_timeout(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.smoothing_window_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.detection.speech_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.frame_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.client_timeout_secs = config.session.heartbeat_interval_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [detection]
            smoothing_window_size = 6
            hysteresis_threshold = 5

            [session]
            idle_timeout_secs = 120
            frame_queue_capacity = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.detection.smoothing_window_size, 6);
        assert_eq!(config.detection.hysteresis_threshold, 5);
        assert_eq!(config.session.idle_timeout_secs, 120);
        assert_eq!(config.session.frame_queue_capacity, 8);
        // Untouched fields keep their defaults
        assert_eq!(config.detection.frame_length, 512);
        assert_eq!(config.server.port, 8080);
    }
}
