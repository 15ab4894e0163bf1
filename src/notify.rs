//! Outbound notifications
//!
//! This module defines the JSON messages the pipeline pushes to its host
//! (live sample stream, segment lifecycle, label results, periodic stats) and
//! the decimator that thins the 100 Hz sample stream for display.

use crate::error::PipelineError;
use crate::ingest::IngestSnapshot;
use crate::types::{CalibratedSample, Label, LabelEvent, LabelKind, SegmentSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Sending half of the notification channel
pub type NotificationSender = UnboundedSender<Notification>;

/// One outbound message, tagged by `type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Notification {
    Sample { data: SampleNotice },
    Segment {
        event: SegmentPhase,
        data: SegmentSummary,
    },
    Label { data: LabelNotice },
    Stat { data: StatsSnapshot },
}

impl Notification {
    /// Compact JSON, one message per line
    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentPhase {
    Start,
    End,
}

/// Display subset of a calibrated sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleNotice {
    pub seq: u16,
    pub t_ms: i64,
    pub btn: u8,
    pub g1_mag: f64,
    pub g2_mag: f64,
    pub a1_mag: f64,
    pub a2_mag: f64,
    pub gx1: f64,
    pub gy1: f64,
    pub gz1: f64,
    pub gx2: f64,
    pub gy2: f64,
    pub gz2: f64,
}

impl From<&CalibratedSample> for SampleNotice {
    fn from(sample: &CalibratedSample) -> Self {
        let [g1, g2] = sample.gyro_dps;
        Self {
            seq: sample.sequence,
            t_ms: sample.device_time_ms,
            btn: sample.button_level,
            g1_mag: sample.gyro_mag_1,
            g2_mag: sample.gyro_mag_2,
            a1_mag: sample.accel_mag_1,
            a2_mag: sample.accel_mag_2,
            gx1: g1.x,
            gy1: g1.y,
            gz1: g1.z,
            gx2: g2.x,
            gy2: g2.y,
            gz2: g2.z,
        }
    }
}

/// Outcome of a button press or manual override
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelNotice {
    /// `None` when a press matched no segment
    pub segment_id: Option<String>,
    pub label: Label,
    pub kind: LabelKind,
    pub t_label_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
}

impl From<&LabelEvent> for LabelNotice {
    fn from(event: &LabelEvent) -> Self {
        Self {
            segment_id: event.matched_segment_id.clone(),
            label: event.kind.label(),
            kind: event.kind,
            t_label_ms: event.host_time_ms,
            delay_ms: event.delay_ms,
        }
    }
}

/// Periodic health report
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    #[serde(flatten)]
    pub ingest: IngestSnapshot,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    pub total_segments: usize,
    pub good_shots: usize,
    pub bad_shots: usize,
    pub unknown_shots: usize,
    pub is_calibrating: bool,
    pub is_running: bool,
}

/// Thins the sample stream to a target rate by device time.
///
/// A rate of 0 forwards every sample.
#[derive(Debug, Clone)]
pub struct SampleDecimator {
    interval_ms: f64,
    last_sent_ms: Option<i64>,
}

impl SampleDecimator {
    pub fn new(target_hz: u32) -> Self {
        Self {
            interval_ms: if target_hz == 0 {
                0.0
            } else {
                1000.0 / f64::from(target_hz)
            },
            last_sent_ms: None,
        }
    }

    pub fn should_send(&mut self, t_ms: i64) -> bool {
        let due = match self.last_sent_ms {
            Some(last) => (t_ms - last) as f64 >= self.interval_ms,
            None => true,
        };
        if due {
            self.last_sent_ms = Some(t_ms);
        }
        due
    }

    pub fn reset(&mut self) {
        self.last_sent_ms = None;
    }
}

/// Pipeline-side end of the notification channel
#[derive(Debug)]
pub struct Notifier {
    sender: Option<NotificationSender>,
    decimator: SampleDecimator,
}

impl Notifier {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sender: None,
            decimator: SampleDecimator::new(sample_rate_hz),
        }
    }

    pub fn attach(&mut self, sender: NotificationSender) {
        self.sender = Some(sender);
        self.decimator.reset();
    }

    pub fn detach(&mut self) -> Option<NotificationSender> {
        self.sender.take()
    }

    pub fn is_attached(&self) -> bool {
        self.sender.is_some()
    }

    /// Forward a sample if the decimator lets it through
    pub fn sample(&mut self, sample: &CalibratedSample) {
        if self.sender.is_some() && self.decimator.should_send(sample.device_time_ms) {
            self.send(Notification::Sample {
                data: SampleNotice::from(sample),
            });
        }
    }

    pub fn send(&mut self, notification: Notification) {
        let Some(sender) = &self.sender else {
            return;
        };
        if sender.send(notification).is_err() {
            log::debug!("Notification receiver dropped; detaching");
            self.sender = None;
        }
    }
}
