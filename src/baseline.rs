//! Adaptive noise baseline
//!
//! This module keeps a rolling window of idle gyroscope magnitudes and derives
//! hysteresis thresholds from it: `on = median + k·σ`, `off = median + (k−1)·σ`.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default window size in samples (≈5 s at 100 Hz)
pub const DEFAULT_BASELINE_WINDOW: usize = 500;

/// Minimum samples before thresholds are derived
pub const DEFAULT_MIN_SAMPLES: usize = 50;

/// Hysteresis threshold pair (°/s)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub on: f64,
    pub off: f64,
}

/// Robust statistics of the current window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseEstimate {
    /// Upper median
    pub baseline: f64,
    /// Population standard deviation
    pub noise: f64,
}

/// Rolling window of idle magnitudes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoiseBaseline {
    values: VecDeque<f64>,
    window_size: usize,
    min_samples: usize,
    k: f64,
}

impl Default for NoiseBaseline {
    fn default() -> Self {
        Self::new(DEFAULT_BASELINE_WINDOW, DEFAULT_MIN_SAMPLES, 3.0)
    }
}

impl NoiseBaseline {
    /// Create a baseline with the given window, warm-up length and noise multiplier
    pub fn new(window_size: usize, min_samples: usize, k: f64) -> Self {
        Self {
            values: VecDeque::with_capacity(window_size),
            window_size,
            min_samples,
            k,
        }
    }

    /// Add one idle sample and return recomputed thresholds once warmed up
    pub fn update(&mut self, value: f64) -> Option<Thresholds> {
        self.values.push_back(value);
        while self.values.len() > self.window_size {
            self.values.pop_front();
        }

        let estimate = self.estimate()?;
        Some(Thresholds {
            on: estimate.baseline + self.k * estimate.noise,
            off: estimate.baseline + (self.k - 1.0) * estimate.noise,
        })
    }

    /// Median and standard deviation, if enough samples are present
    pub fn estimate(&self) -> Option<NoiseEstimate> {
        if self.values.len() < self.min_samples || self.values.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let baseline = sorted[sorted.len() / 2];

        let n = self.values.len() as f64;
        let mean = self.values.iter().sum::<f64>() / n;
        let variance = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

        Some(NoiseEstimate {
            baseline,
            noise: variance.sqrt(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_thresholds_before_warmup() {
        let mut baseline = NoiseBaseline::default();
        for _ in 0..49 {
            assert!(baseline.update(1.0).is_none());
        }
        assert!(baseline.update(1.0).is_some());
    }

    #[test]
    fn test_constant_signal_collapses_to_baseline() {
        let mut baseline = NoiseBaseline::default();
        let mut thresholds = None;
        for _ in 0..60 {
            thresholds = baseline.update(2.0);
        }
        let thresholds = thresholds.unwrap();
        assert!((thresholds.on - 2.0).abs() < 1e-12);
        assert!((thresholds.off - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_thresholds_keep_hysteresis() {
        let mut baseline = NoiseBaseline::new(100, 10, 3.0);
        let mut thresholds = None;
        for i in 0..100 {
            // Alternating 1.0 / 3.0: median 3.0 (upper), σ = 1.0
            thresholds = baseline.update(if i % 2 == 0 { 1.0 } else { 3.0 });
        }
        let thresholds = thresholds.unwrap();
        assert!((thresholds.on - 6.0).abs() < 1e-9);
        assert!((thresholds.off - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_window_rolls() {
        let mut baseline = NoiseBaseline::new(3, 1, 3.0);
        for v in [10.0, 20.0, 30.0, 40.0, 50.0] {
            baseline.update(v);
        }
        assert_eq!(baseline.len(), 3);
        // Window holds 30, 40, 50
        assert_eq!(baseline.estimate().unwrap().baseline, 40.0);
    }
}
