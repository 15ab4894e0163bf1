//! Sample processing
//!
//! Converts raw frames into calibrated samples:
//! - Unit conversion (counts → g, counts → °/s)
//! - Gyroscope bias calibration and subtraction
//! - Per-sensor magnitudes
//! - First-order low-pass filtering of each magnitude

use crate::config::ProcessorConfig;
use crate::error::PipelineError;
use crate::types::{CalibratedSample, CalibrationStatus, GyroOffset, RawFrame, Vec3, SENSOR_COUNT};
use std::f64::consts::PI;

/// First-order IIR low-pass filter over a scalar signal.
///
/// `filtered = α·x + (1 − α)·previous`; the first value passes through.
#[derive(Debug, Clone)]
pub struct LowPassFilter {
    alpha: f64,
    previous: Option<f64>,
}

impl LowPassFilter {
    /// Filter with cutoff `cutoff_hz` for a signal sampled at `sample_rate_hz`
    pub fn new(cutoff_hz: f64, sample_rate_hz: f64) -> Self {
        Self {
            alpha: Self::alpha_for(cutoff_hz, sample_rate_hz),
            previous: None,
        }
    }

    /// `α = dt / (rc + dt)` with `rc = 1 / (2π·f_c)` and `dt = 1 / f_s`
    pub fn alpha_for(cutoff_hz: f64, sample_rate_hz: f64) -> f64 {
        let rc = 1.0 / (2.0 * PI * cutoff_hz);
        let dt = 1.0 / sample_rate_hz;
        dt / (rc + dt)
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn apply(&mut self, value: f64) -> f64 {
        let filtered = match self.previous {
            Some(prev) => self.alpha * value + (1.0 - self.alpha) * prev,
            None => value,
        };
        self.previous = Some(filtered);
        filtered
    }

    pub fn reset(&mut self) {
        self.previous = None;
    }
}

/// In-progress bias collection
#[derive(Debug, Clone)]
struct CalibrationRun {
    target: usize,
    sums: [f64; 6],
    collected: usize,
}

impl CalibrationRun {
    fn new(target: usize) -> Self {
        Self {
            target,
            sums: [0.0; 6],
            collected: 0,
        }
    }

    fn add(&mut self, gyro: &[Vec3; SENSOR_COUNT]) {
        let axes = [
            gyro[0].x, gyro[0].y, gyro[0].z, gyro[1].x, gyro[1].y, gyro[1].z,
        ];
        for (sum, value) in self.sums.iter_mut().zip(axes) {
            *sum += value;
        }
        self.collected += 1;
    }

    fn is_complete(&self) -> bool {
        self.collected >= self.target
    }

    fn mean(&self) -> GyroOffset {
        let n = self.collected.max(1) as f64;
        GyroOffset {
            gx1: self.sums[0] / n,
            gy1: self.sums[1] / n,
            gz1: self.sums[2] / n,
            gx2: self.sums[3] / n,
            gy2: self.sums[4] / n,
            gz2: self.sums[5] / n,
        }
    }
}

/// Stateful frame → sample converter.
///
/// Owns filter and calibration state, so it must be driven from a single
/// owner (the ingest thread).
pub struct SampleProcessor {
    config: ProcessorConfig,
    offset: GyroOffset,
    calibration: Option<CalibrationRun>,
    gyro_filters: [LowPassFilter; SENSOR_COUNT],
    accel_filters: [LowPassFilter; SENSOR_COUNT],
}

impl Default for SampleProcessor {
    fn default() -> Self {
        Self::new(ProcessorConfig::default())
    }
}

impl SampleProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        let rate = config.sample_rate_hz as f64;
        let gyro = LowPassFilter::new(config.gyro_cutoff_hz, rate);
        let accel = LowPassFilter::new(config.accel_cutoff_hz, rate);
        Self {
            gyro_filters: [gyro.clone(), gyro],
            accel_filters: [accel.clone(), accel],
            offset: GyroOffset::default(),
            calibration: None,
            config,
        }
    }

    /// Convert one raw frame into a calibrated sample
    pub fn process(&mut self, raw: &RawFrame) -> CalibratedSample {
        let accel_scale = self.config.accel_scale;
        let gyro_scale = self.config.gyro_scale;

        let accel_g: [Vec3; SENSOR_COUNT] =
            std::array::from_fn(|i| scale(&raw.sensors[i].accel, accel_scale));
        let mut gyro_dps: [Vec3; SENSOR_COUNT] =
            std::array::from_fn(|i| scale(&raw.sensors[i].gyro, gyro_scale));

        // Calibration sees converted values before any bias is removed
        if let Some(run) = self.calibration.as_mut() {
            run.add(&gyro_dps);
            if run.is_complete() {
                self.offset = run.mean();
                log::info!(
                    "Gyro calibration finished over {} samples: {:?}",
                    run.collected,
                    self.offset
                );
                self.calibration = None;
            }
        }

        for (sensor, gyro) in gyro_dps.iter_mut().enumerate() {
            let bias = self.offset.for_sensor(sensor);
            gyro.x -= bias.x;
            gyro.y -= bias.y;
            gyro.z -= bias.z;
        }

        let gyro_mag_1 = self.gyro_filters[0].apply(gyro_dps[0].magnitude());
        let gyro_mag_2 = self.gyro_filters[1].apply(gyro_dps[1].magnitude());
        let accel_mag_1 = self.accel_filters[0].apply(accel_g[0].magnitude());
        let accel_mag_2 = self.accel_filters[1].apply(accel_g[1].magnitude());

        CalibratedSample {
            sequence: raw.sequence,
            device_time_ms: raw.device_time_ms,
            receipt_time_ns: raw.receipt_time_ns,
            button_level: raw.button_level,
            accel_g,
            gyro_dps,
            gyro_mag_1,
            gyro_mag_2,
            accel_mag_1,
            accel_mag_2,
        }
    }

    /// Start collecting `sample_rate × duration_seconds` samples for a new bias.
    ///
    /// Any collection already in progress is discarded. Returns the number of
    /// samples that will be collected.
    pub fn start_calibration(&mut self, duration_seconds: f64) -> Result<usize, PipelineError> {
        if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
            return Err(PipelineError::InvalidCalibration(format!(
                "duration must be positive, got {duration_seconds}"
            )));
        }
        let target = (self.config.sample_rate_hz as f64 * duration_seconds) as usize;
        if target == 0 {
            return Err(PipelineError::InvalidCalibration(format!(
                "{duration_seconds}s at {} Hz collects no samples",
                self.config.sample_rate_hz
            )));
        }

        if self.calibration.is_some() {
            log::info!("Restarting gyro calibration, discarding partial collection");
        }
        self.calibration = Some(CalibrationRun::new(target));
        log::info!("Gyro calibration started: collecting {target} samples");
        Ok(target)
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibration.is_some()
    }

    pub fn calibration_offset(&self) -> GyroOffset {
        self.offset
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        let (collected, target) = self
            .calibration
            .as_ref()
            .map(|run| (run.collected, run.target))
            .unwrap_or((0, 0));
        CalibrationStatus {
            active: self.calibration.is_some(),
            collected,
            target,
            offset: self.offset,
        }
    }

    /// Forget filter history (e.g. after a link restart)
    pub fn reset_filters(&mut self) {
        for filter in self.gyro_filters.iter_mut().chain(self.accel_filters.iter_mut()) {
            filter.reset();
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}

fn scale(raw: &[i32; 3], counts_per_unit: f64) -> Vec3 {
    Vec3::new(
        raw[0] as f64 / counts_per_unit,
        raw[1] as f64 / counts_per_unit,
        raw[2] as f64 / counts_per_unit,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RawImu;

    fn frame(accel: [i32; 3], gyro: [i32; 3]) -> RawFrame {
        RawFrame {
            sequence: 0,
            device_time_ms: 0,
            button_level: 0,
            sensors: [RawImu { accel, gyro }, RawImu { accel, gyro }],
            receipt_time_ns: 0,
        }
    }

    #[test]
    fn test_unit_conversion() {
        let mut processor = SampleProcessor::default();
        let sample = processor.process(&frame([16384, 0, 0], [131, 0, -262]));

        assert_eq!(sample.accel_g[0].x, 1.0);
        assert_eq!(sample.gyro_dps[0].x, 1.0);
        assert_eq!(sample.gyro_dps[1].z, -2.0);
    }

    #[test]
    fn test_first_sample_passes_through_filter() {
        let mut processor = SampleProcessor::default();
        let sample = processor.process(&frame([0, 0, 16384], [0, 393, 524]));

        // |(0, 3, 4)| = 5
        assert!((sample.gyro_mag_1 - 5.0).abs() < 1e-12);
        assert!((sample.accel_mag_1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_filter_alpha() {
        let alpha = LowPassFilter::alpha_for(18.0, 100.0);
        let rc = 1.0 / (2.0 * PI * 18.0);
        assert!((alpha - 0.01 / (rc + 0.01)).abs() < 1e-12);
        assert!(alpha > 0.0 && alpha < 1.0);
    }

    #[test]
    fn test_filter_converges_to_constant() {
        let mut filter = LowPassFilter::new(12.0, 100.0);
        filter.apply(0.0);
        let mut out = 0.0;
        for _ in 0..200 {
            out = filter.apply(7.5);
        }
        assert!((out - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_filter_smooths_step() {
        let mut processor = SampleProcessor::default();
        processor.process(&frame([0, 0, 0], [0, 0, 0]));
        let sample = processor.process(&frame([0, 0, 0], [1310, 0, 0]));

        // A step from 0 to 10 °/s is attenuated by α
        let alpha = LowPassFilter::alpha_for(18.0, 100.0);
        assert!((sample.gyro_mag_1 - alpha * 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_calibration_computes_mean_offset() {
        let mut processor = SampleProcessor::default();
        let target = processor.start_calibration(0.05).unwrap();
        assert_eq!(target, 5);
        assert!(processor.is_calibrating());

        for _ in 0..4 {
            processor.process(&frame([0, 0, 16384], [262, -131, 0]));
        }
        assert!(processor.is_calibrating());
        assert_eq!(processor.calibration_status().collected, 4);

        processor.process(&frame([0, 0, 16384], [262, -131, 0]));
        assert!(!processor.is_calibrating());

        let offset = processor.calibration_offset();
        assert!((offset.gx1 - 2.0).abs() < 1e-12);
        assert!((offset.gy1 + 1.0).abs() < 1e-12);
        assert!((offset.gx2 - 2.0).abs() < 1e-12);

        // Bias is removed from subsequent samples
        let sample = processor.process(&frame([0, 0, 16384], [262, -131, 0]));
        assert!(sample.gyro_dps[0].magnitude() < 1e-12);
    }

    #[test]
    fn test_calibration_restart_discards_partial() {
        let mut processor = SampleProcessor::default();
        processor.start_calibration(0.05).unwrap();
        for _ in 0..3 {
            processor.process(&frame([0, 0, 0], [1000, 0, 0]));
        }

        processor.start_calibration(0.02).unwrap();
        processor.process(&frame([0, 0, 0], [131, 0, 0]));
        processor.process(&frame([0, 0, 0], [131, 0, 0]));

        assert!(!processor.is_calibrating());
        assert!((processor.calibration_offset().gx1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_calibration_rejects_empty_collection() {
        let mut processor = SampleProcessor::default();
        assert!(processor.start_calibration(0.0).is_err());
        assert!(processor.start_calibration(0.001).is_err());
        assert!(processor.start_calibration(f64::NAN).is_err());
        assert!(!processor.is_calibrating());
    }
}
