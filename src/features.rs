//! Segment feature derivation
//!
//! This module summarises the samples of a finished shot segment:
//! - Segment duration
//! - RMS and peak of each filtered gyroscope magnitude
//! - RMS of the per-sample difference between the two magnitudes

use crate::types::{CalibratedSample, SegmentFeatures};

/// Feature deriver for finished segments
pub struct FeatureDeriver;

impl FeatureDeriver {
    /// Derive features over every sample of a segment.
    ///
    /// Returns `None` for an empty sample list.
    pub fn derive(duration_ms: i64, samples: &[CalibratedSample]) -> Option<SegmentFeatures> {
        if samples.is_empty() {
            return None;
        }

        let g1: Vec<f64> = samples.iter().map(|s| s.gyro_mag_1).collect();
        let g2: Vec<f64> = samples.iter().map(|s| s.gyro_mag_2).collect();
        let dg: Vec<f64> = g1.iter().zip(&g2).map(|(a, b)| (b - a).abs()).collect();

        Some(SegmentFeatures {
            duration_ms,
            g1_rms: round2(rms(&g1)),
            g1_peak: round2(peak(&g1)),
            g2_rms: round2(rms(&g2)),
            g2_peak: round2(peak(&g2)),
            dg_rms: round2(rms(&dg)),
        })
    }
}

/// Root mean square
fn rms(values: &[f64]) -> f64 {
    let sum_sq: f64 = values.iter().map(|v| v * v).sum();
    (sum_sq / values.len() as f64).sqrt()
}

fn peak(values: &[f64]) -> f64 {
    values.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

/// Round to two decimal places for reporting
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;
    use pretty_assertions::assert_eq;

    fn sample(g1: f64, g2: f64) -> CalibratedSample {
        CalibratedSample {
            sequence: 0,
            device_time_ms: 0,
            receipt_time_ns: 0,
            button_level: 0,
            accel_g: [Vec3::default(); 2],
            gyro_dps: [Vec3::default(); 2],
            gyro_mag_1: g1,
            gyro_mag_2: g2,
            accel_mag_1: 1.0,
            accel_mag_2: 1.0,
        }
    }

    #[test]
    fn test_features() {
        let samples = vec![sample(3.0, 1.0), sample(4.0, 1.0)];
        let features = FeatureDeriver::derive(500, &samples).unwrap();

        assert_eq!(features.duration_ms, 500);
        // sqrt((9 + 16) / 2) = 3.5355
        assert_eq!(features.g1_rms, 3.54);
        assert_eq!(features.g1_peak, 4.0);
        assert_eq!(features.g2_rms, 1.0);
        assert_eq!(features.g2_peak, 1.0);
        // |1 - 3| = 2, |1 - 4| = 3 → sqrt(13 / 2) = 2.5495
        assert_eq!(features.dg_rms, 2.55);
    }

    #[test]
    fn test_empty_segment_has_no_features() {
        assert!(FeatureDeriver::derive(300, &[]).is_none());
    }

    #[test]
    fn test_peak_not_below_rms() {
        let samples: Vec<_> = (0..50).map(|i| sample(i as f64, 0.5 * i as f64)).collect();
        let features = FeatureDeriver::derive(490, &samples).unwrap();
        assert!(features.g1_peak >= features.g1_rms);
        assert!(features.g2_peak >= features.g2_rms);
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.234), 1.23);
        assert_eq!(round2(1.236), 1.24);
        assert_eq!(round2(-0.004), -0.0);
    }
}
