//! Core types for the shotsense pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw frames, calibrated samples, shot segments, label events and
//! buffered samples.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of IMUs on the device
pub const SENSOR_COUNT: usize = 2;

/// Three-axis reading in physical units
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Euclidean norm
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Raw counts from one IMU, in wire order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawImu {
    pub accel: [i32; 3],
    pub gyro: [i32; 3],
}

/// One parsed line of the input protocol, before unit conversion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Packet counter, wraps modulo 65536
    pub sequence: u16,
    /// Device clock (ms)
    pub device_time_ms: i64,
    /// Auxiliary button level (0/1)
    pub button_level: u8,
    /// Raw readings for sensor 1 and sensor 2
    pub sensors: [RawImu; SENSOR_COUNT],
    /// Local receipt time (ns since the Unix epoch), 0 until stamped
    pub receipt_time_ns: i64,
}

/// Sample in physical units with filtered magnitudes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSample {
    pub sequence: u16,
    pub device_time_ms: i64,
    pub receipt_time_ns: i64,
    pub button_level: u8,
    /// Acceleration per sensor (g)
    pub accel_g: [Vec3; SENSOR_COUNT],
    /// Bias-corrected angular rate per sensor (°/s)
    pub gyro_dps: [Vec3; SENSOR_COUNT],
    /// Filtered |gyro| of sensor 1 (°/s)
    pub gyro_mag_1: f64,
    /// Filtered |gyro| of sensor 2 (°/s)
    pub gyro_mag_2: f64,
    /// Filtered |accel| of sensor 1 (g)
    pub accel_mag_1: f64,
    /// Filtered |accel| of sensor 2 (g)
    pub accel_mag_2: f64,
}

/// Segment label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[default]
    Unknown,
    Good,
    Bad,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Unknown => "unknown",
            Label::Good => "good",
            Label::Bad => "bad",
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(Label::Unknown),
            "good" => Ok(Label::Good),
            "bad" => Ok(Label::Bad),
            other => Err(PipelineError::InvalidLabel(other.to_string())),
        }
    }
}

/// Summary features of a finished segment, rounded to two decimals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentFeatures {
    #[serde(rename = "dur")]
    pub duration_ms: i64,
    pub g1_rms: f64,
    pub g1_peak: f64,
    pub g2_rms: f64,
    pub g2_peak: f64,
    /// RMS of |g2 - g1|
    pub dg_rms: f64,
}

/// One detected motion episode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotSegment {
    /// Opaque unique token
    pub id: String,
    pub start_time_ms: i64,
    /// 0 while the segment is still open
    pub end_time_ms: i64,
    pub duration_ms: i64,
    /// Populated once, at finalization
    pub features: Option<SegmentFeatures>,
    pub label: Label,
    pub label_time_ms: Option<i64>,
    pub samples: Vec<CalibratedSample>,
}

impl ShotSegment {
    /// Open a new segment at `start_time_ms`
    pub fn open(id: String, start_time_ms: i64) -> Self {
        Self {
            id,
            start_time_ms,
            end_time_ms: 0,
            duration_ms: 0,
            features: None,
            label: Label::Unknown,
            label_time_ms: None,
            samples: Vec::new(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.end_time_ms != 0
    }

    /// Public view without the raw sample list
    pub fn summary(&self) -> SegmentSummary {
        SegmentSummary {
            id: self.id.clone(),
            start_time_ms: self.start_time_ms,
            end_time_ms: self.end_time_ms,
            duration_ms: self.duration_ms,
            features: self.features,
            label: self.label,
            label_time_ms: self.label_time_ms,
            sample_count: self.samples.len(),
        }
    }
}

/// Segment fields that are safe to hand to outside consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSummary {
    pub id: String,
    pub start_time_ms: i64,
    pub end_time_ms: i64,
    pub duration_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<SegmentFeatures>,
    pub label: Label,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label_time_ms: Option<i64>,
    pub sample_count: usize,
}

/// Kind of label event, named after the label it applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    LabelGood,
    LabelBad,
    LabelUnknown,
}

impl LabelKind {
    pub fn label(&self) -> Label {
        match self {
            LabelKind::LabelGood => Label::Good,
            LabelKind::LabelBad => Label::Bad,
            LabelKind::LabelUnknown => Label::Unknown,
        }
    }
}

impl From<Label> for LabelKind {
    fn from(label: Label) -> Self {
        match label {
            Label::Good => LabelKind::LabelGood,
            Label::Bad => LabelKind::LabelBad,
            Label::Unknown => LabelKind::LabelUnknown,
        }
    }
}

/// Accepted button edge or manual override
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEvent {
    pub kind: LabelKind,
    pub host_time_ms: i64,
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_segment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
}

/// Calibrated sample plus its insertion index in the ring buffer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedSample {
    pub global_index: u64,
    #[serde(flatten)]
    pub sample: CalibratedSample,
}

/// Gyroscope bias offset (°/s), one value per axis
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GyroOffset {
    pub gx1: f64,
    pub gy1: f64,
    pub gz1: f64,
    pub gx2: f64,
    pub gy2: f64,
    pub gz2: f64,
}

impl GyroOffset {
    /// Offset for sensor index 0 or 1
    pub fn for_sensor(&self, sensor: usize) -> Vec3 {
        if sensor == 0 {
            Vec3::new(self.gx1, self.gy1, self.gz1)
        } else {
            Vec3::new(self.gx2, self.gy2, self.gz2)
        }
    }
}

/// Calibration state reported to the control surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationStatus {
    pub active: bool,
    pub collected: usize,
    pub target: usize,
    pub offset: GyroOffset,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_parsing() {
        assert_eq!("good".parse::<Label>().unwrap(), Label::Good);
        assert_eq!("bad".parse::<Label>().unwrap(), Label::Bad);
        assert_eq!("unknown".parse::<Label>().unwrap(), Label::Unknown);
        assert!(matches!(
            "great".parse::<Label>(),
            Err(PipelineError::InvalidLabel(v)) if v == "great"
        ));
    }

    #[test]
    fn test_label_kind_serialization() {
        let json = serde_json::to_string(&LabelKind::from(Label::Good)).unwrap();
        assert_eq!(json, "\"label_good\"");
    }

    #[test]
    fn test_summary_omits_samples() {
        let mut segment = ShotSegment::open("abc".to_string(), 1000);
        segment.end_time_ms = 1400;
        segment.duration_ms = 400;

        let value = serde_json::to_value(segment.summary()).unwrap();
        assert!(value.get("samples").is_none());
        assert_eq!(value["sample_count"], 0);
        assert_eq!(value["label"], "unknown");
    }
}
