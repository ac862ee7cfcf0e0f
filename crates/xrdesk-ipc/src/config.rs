//! Capture pipeline configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Tunables for the capture fleet.
///
/// The defaults are calibrated against observed driver behavior; the
/// dirty-rect expansion and drag threshold in particular should not be
/// changed without re-checking cursor trails on real hardware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Timeout passed to the OS "acquire next frame" call (default: 100).
    pub acquire_timeout_ms: u32,

    /// Pixels added to the right/bottom of every dirty rect (default: 16).
    pub dirty_rect_expansion: u32,

    /// Max jump of a hidden cursor before it is treated as a window drag (default: 32).
    pub cursor_drag_threshold: i32,

    /// Slots per staging pool arena (default: 8).
    pub pool_capacity: usize,

    /// Requests at or below this size in both axes use the small arena (default: 128).
    pub pool_small_limit: u32,

    /// Pool allocations are rounded up to a multiple of this (default: 64).
    pub pool_rounding: u32,

    /// Max rects per frame for the pooled cross-adapter copy path (default: 8).
    pub pool_max_rects: usize,

    /// Max rect width for the pooled cross-adapter copy path (default: 1024).
    pub pool_max_rect_width: u32,

    /// Max rect height for the pooled cross-adapter copy path (default: 512).
    pub pool_max_rect_height: u32,

    /// Acquire passes slower than this are logged (default: 5000).
    pub slow_acquire_warning_us: u64,

    /// Quiet period after a display change before re-enumerating (default: 500).
    pub hotplug_settle_ms: u64,

    /// A frame left unconsumed longer than this marks the worker as falling behind (default: 250).
    pub render_stall_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 100,
            dirty_rect_expansion: 16,
            cursor_drag_threshold: 32,
            pool_capacity: 8,
            pool_small_limit: 128,
            pool_rounding: 64,
            pool_max_rects: 8,
            pool_max_rect_width: 1024,
            pool_max_rect_height: 512,
            slow_acquire_warning_us: 5000,
            hotplug_settle_ms: 500,
            render_stall_ms: 250,
        }
    }
}

impl CaptureConfig {
    /// Reads a JSON config file, filling missing fields with defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses a JSON config, filling missing fields with defaults.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity == 0 {
            return Err(ConfigError::Invalid("pool_capacity must be at least 1".into()));
        }
        if self.pool_rounding == 0 {
            return Err(ConfigError::Invalid("pool_rounding must be non-zero".into()));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid("acquire_timeout_ms must be non-zero".into()));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms as u64)
    }

    pub fn slow_acquire_threshold(&self) -> Duration {
        Duration::from_micros(self.slow_acquire_warning_us)
    }

    pub fn hotplug_settle_delay(&self) -> Duration {
        Duration::from_millis(self.hotplug_settle_ms)
    }

    pub fn render_stall_threshold(&self) -> Duration {
        Duration::from_millis(self.render_stall_ms)
    }
}
