//! Shot segmentation
//!
//! A three-state hysteresis machine over the filtered gyroscope-1 magnitude:
//! - IDLE → ACTIVE: magnitude above `threshold_on` for `enter_duration_ms`
//! - ACTIVE → COOLDOWN: magnitude below `threshold_off` for `exit_duration_ms`
//! - COOLDOWN → IDLE: fixed `cooldown_ms` timer, then the segment is finalized
//!
//! The cooldown is a refractory period: motion during it neither extends nor
//! restarts the episode.

use crate::baseline::{NoiseBaseline, Thresholds};
use crate::config::SegmenterConfig;
use crate::features::FeatureDeriver;
use crate::types::{CalibratedSample, Label, SegmentSummary, ShotSegment};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Segmenter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Idle,
    Active,
    Cooldown,
}

/// Lifecycle notifications emitted by [`Segmenter::process`]
#[derive(Debug, Clone, PartialEq)]
pub enum SegmenterEvent {
    /// A new segment opened (IDLE → ACTIVE)
    Started(SegmentSummary),
    /// A segment was finalized and kept
    Finished(SegmentSummary),
}

pub struct Segmenter {
    config: SegmenterConfig,
    thresholds: Thresholds,
    state: SegmentState,
    current: Option<ShotSegment>,
    segments: Vec<ShotSegment>,
    /// Start of the current continuous qualifying run
    condition_start_ms: Option<i64>,
    cooldown_start_ms: Option<i64>,
    baseline: NoiseBaseline,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            thresholds: Thresholds {
                on: config.threshold_on,
                off: config.threshold_off,
            },
            baseline: NoiseBaseline::new(
                config.adaptive_window,
                config.adaptive_min_samples,
                config.adaptive_k,
            ),
            state: SegmentState::Idle,
            current: None,
            segments: Vec::new(),
            condition_start_ms: None,
            cooldown_start_ms: None,
            config,
        }
    }

    /// Feed one sample through the state machine
    pub fn process(&mut self, sample: &CalibratedSample) -> Option<SegmenterEvent> {
        let magnitude = sample.gyro_mag_1;
        let t_ms = sample.device_time_ms;

        match self.state {
            SegmentState::Idle => {
                if self.config.adaptive {
                    if let Some(thresholds) = self.baseline.update(magnitude) {
                        self.thresholds = thresholds;
                    }
                }
                self.handle_idle(sample, magnitude, t_ms)
            }
            SegmentState::Active => {
                self.handle_active(sample, magnitude, t_ms);
                None
            }
            SegmentState::Cooldown => self.handle_cooldown(sample, t_ms),
        }
    }

    fn handle_idle(
        &mut self,
        sample: &CalibratedSample,
        magnitude: f64,
        t_ms: i64,
    ) -> Option<SegmenterEvent> {
        if magnitude <= self.thresholds.on {
            self.condition_start_ms = None;
            return None;
        }

        let since = *self.condition_start_ms.get_or_insert(t_ms);
        if t_ms - since < self.config.enter_duration_ms {
            return None;
        }

        self.condition_start_ms = None;
        self.state = SegmentState::Active;

        let mut segment = ShotSegment::open(Uuid::new_v4().to_string(), t_ms);
        segment.samples.push(sample.clone());
        log::debug!(
            "Segment {} opened at {} ms (on={:.2}, off={:.2})",
            segment.id,
            t_ms,
            self.thresholds.on,
            self.thresholds.off
        );
        let summary = segment.summary();
        self.current = Some(segment);
        Some(SegmenterEvent::Started(summary))
    }

    fn handle_active(&mut self, sample: &CalibratedSample, magnitude: f64, t_ms: i64) {
        if let Some(segment) = self.current.as_mut() {
            segment.samples.push(sample.clone());
        }

        if magnitude >= self.thresholds.off {
            self.condition_start_ms = None;
            return;
        }

        let since = *self.condition_start_ms.get_or_insert(t_ms);
        if t_ms - since >= self.config.exit_duration_ms {
            self.condition_start_ms = None;
            self.enter_cooldown(t_ms);
        }
    }

    fn enter_cooldown(&mut self, t_ms: i64) {
        self.state = SegmentState::Cooldown;
        self.cooldown_start_ms = Some(t_ms);

        if let Some(segment) = self.current.as_mut() {
            segment.end_time_ms = t_ms;
            segment.duration_ms = t_ms - segment.start_time_ms;
        }
    }

    fn handle_cooldown(&mut self, sample: &CalibratedSample, t_ms: i64) -> Option<SegmenterEvent> {
        if let Some(segment) = self.current.as_mut() {
            segment.samples.push(sample.clone());
        }

        let started = self.cooldown_start_ms?;
        if t_ms - started < self.config.cooldown_ms {
            return None;
        }

        self.finish_segment()
    }

    fn finish_segment(&mut self) -> Option<SegmenterEvent> {
        self.state = SegmentState::Idle;
        self.cooldown_start_ms = None;
        self.condition_start_ms = None;

        let mut segment = self.current.take()?;
        if segment.duration_ms < self.config.min_segment_ms {
            log::debug!(
                "Discarding segment {}: {} ms < {} ms",
                segment.id,
                segment.duration_ms,
                self.config.min_segment_ms
            );
            return None;
        }

        segment.features = FeatureDeriver::derive(segment.duration_ms, &segment.samples);
        log::info!(
            "Shot segment completed: {}, duration={}ms",
            segment.id,
            segment.duration_ms
        );
        let summary = segment.summary();
        self.segments.push(segment);
        Some(SegmenterEvent::Finished(summary))
    }

    pub fn state(&self) -> SegmentState {
        self.state
    }

    /// Thresholds currently in effect
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// Finalized segments, oldest first
    pub fn segments(&self) -> &[ShotSegment] {
        &self.segments
    }

    /// Finalized segments for label updates
    pub fn segments_mut(&mut self) -> &mut [ShotSegment] {
        &mut self.segments
    }

    /// Segment being accumulated (ACTIVE or COOLDOWN)
    pub fn current_segment(&self) -> Option<&ShotSegment> {
        self.current.as_ref()
    }

    pub fn get_segment(&self, id: &str) -> Option<&ShotSegment> {
        self.segments.iter().find(|s| s.id == id)
    }

    /// Label counts over finalized segments: (good, bad, unknown)
    pub fn label_counts(&self) -> (usize, usize, usize) {
        self.segments
            .iter()
            .fold((0, 0, 0), |(good, bad, unknown), s| match s.label {
                Label::Good => (good + 1, bad, unknown),
                Label::Bad => (good, bad + 1, unknown),
                Label::Unknown => (good, bad, unknown + 1),
            })
    }

    /// Drop all segments and return to IDLE; thresholds and noise history are kept
    pub fn clear_segments(&mut self) {
        self.segments.clear();
        self.current = None;
        self.state = SegmentState::Idle;
        self.condition_start_ms = None;
        self.cooldown_start_ms = None;
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }
}
