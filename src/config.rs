//! Pipeline configuration
//!
//! All tunables live here with defaults matching the device firmware
//! (100 Hz, ±2 g accelerometer, ±250 °/s gyroscope). Configurations load from
//! and save to TOML.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub serial: SerialConfig,
    pub processor: ProcessorConfig,
    pub segmenter: SegmenterConfig,
    pub labeler: LabelerConfig,
    pub buffer: BufferConfig,
    pub notify: NotifyConfig,
}

/// Serial link settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    /// Per-read timeout; bounds how long a stop request can go unnoticed
    pub read_timeout_ms: u64,
    /// How long `stop` waits for the reader thread
    pub join_timeout_ms: u64,
}

/// Unit conversion and filtering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub sample_rate_hz: u32,
    /// Counts per g
    pub accel_scale: f64,
    /// Counts per °/s
    pub gyro_scale: f64,
    pub gyro_cutoff_hz: f64,
    pub accel_cutoff_hz: f64,
    pub default_calibration_seconds: f64,
}

/// Shot segmentation state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// °/s
    pub threshold_on: f64,
    /// °/s
    pub threshold_off: f64,
    pub enter_duration_ms: i64,
    pub exit_duration_ms: i64,
    pub min_segment_ms: i64,
    pub cooldown_ms: i64,
    pub adaptive: bool,
    pub adaptive_window: usize,
    pub adaptive_min_samples: usize,
    /// Noise multiplier for the on threshold; off uses `k - 1`
    pub adaptive_k: f64,
}

/// Button label alignment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelerConfig {
    pub debounce_ms: i64,
    pub pressed_level: u8,
    pub min_delay_ms: i64,
    pub max_delay_ms: i64,
}

/// Rolling sample window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub max_seconds: u32,
}

/// Outbound notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Per-sample notification rate by device time; 0 forwards every sample
    pub sample_rate_hz: u32,
    pub stats_interval_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            join_timeout_ms: 2000,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 100,
            accel_scale: 16384.0,
            gyro_scale: 131.0,
            gyro_cutoff_hz: 18.0,
            accel_cutoff_hz: 12.0,
            default_calibration_seconds: 2.0,
        }
    }
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            threshold_on: 50.0,
            threshold_off: 30.0,
            enter_duration_ms: 80,
            exit_duration_ms: 200,
            min_segment_ms: 300,
            cooldown_ms: 400,
            adaptive: true,
            adaptive_window: 500,
            adaptive_min_samples: 50,
            adaptive_k: 3.0,
        }
    }
}

impl Default for LabelerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            pressed_level: 1,
            min_delay_ms: 50,
            max_delay_ms: 3000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_seconds: 60 }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 30,
            stats_interval_ms: 1000,
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::Config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), PipelineError> {
        std::fs::write(path, self.to_toml()?)
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String, PipelineError> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Ring buffer capacity in samples
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.max_seconds as usize * self.processor.sample_rate_hz as usize
    }

    /// Check the configuration for values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |msg: &str| Err(PipelineError::Config(msg.to_string()));

        if self.processor.sample_rate_hz == 0 {
            return invalid("sample rate must be positive");
        }
        if self.processor.accel_scale <= 0.0 || self.processor.gyro_scale <= 0.0 {
            return invalid("sensor scales must be positive");
        }
        if self.processor.gyro_cutoff_hz <= 0.0 || self.processor.accel_cutoff_hz <= 0.0 {
            return invalid("filter cutoff frequencies must be positive");
        }
        if self.segmenter.threshold_off >= self.segmenter.threshold_on {
            return invalid("threshold_off must be below threshold_on");
        }
        if self.segmenter.enter_duration_ms < 0
            || self.segmenter.exit_duration_ms < 0
            || self.segmenter.cooldown_ms < 0
            || self.segmenter.min_segment_ms < 0
        {
            return invalid("segmenter durations must not be negative");
        }
        if self.segmenter.adaptive
            && (self.segmenter.adaptive_window == 0
                || self.segmenter.adaptive_min_samples > self.segmenter.adaptive_window)
        {
            return invalid("adaptive_min_samples must fit in a non-empty adaptive_window");
        }
        if self.labeler.min_delay_ms > self.labeler.max_delay_ms {
            return invalid("min_delay_ms must not exceed max_delay_ms");
        }
        if self.buffer_capacity() == 0 {
            return invalid("ring buffer capacity must be positive");
        }
        if self.serial.read_timeout_ms == 0 {
            return invalid("read timeout must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_capacity(), 6000);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [serial]
            port = "/dev/ttyACM0"

            [segmenter]
            adaptive = false
            "#,
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud_rate, 115_200);
        assert!(!config.segmenter.adaptive);
        assert_eq!(config.segmenter.threshold_on, 50.0);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = PipelineConfig::default();
        let text = config.to_toml().unwrap();
        let parsed = PipelineConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let mut config = PipelineConfig::default();
        config.segmenter.threshold_off = 60.0;
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_delay_window() {
        let mut config = PipelineConfig::default();
        config.labeler.min_delay_ms = 5000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let path = std::env::temp_dir().join(format!("shotsense-{}.toml", uuid::Uuid::new_v4()));
        let mut config = PipelineConfig::default();
        config.buffer.max_seconds = 10;
        config.save_to_file(&path).unwrap();

        let loaded = PipelineConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.buffer_capacity(), 1000);
    }
}
