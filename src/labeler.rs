//! Button label alignment
//!
//! Detects debounced rising edges of the button level and pairs each edge with
//! the most recent finished segment whose end lies inside the delay window
//! `[min_delay_ms, max_delay_ms]` before the press.

use crate::config::LabelerConfig;
use crate::error::PipelineError;
use crate::types::{CalibratedSample, Label, LabelEvent, LabelKind, ShotSegment};

pub struct Labeler {
    config: LabelerConfig,
    last_level: Option<u8>,
    last_press_ms: Option<i64>,
    events: Vec<LabelEvent>,
    event_seq: u32,
}

impl Default for Labeler {
    fn default() -> Self {
        Self::new(LabelerConfig::default())
    }
}

impl Labeler {
    pub fn new(config: LabelerConfig) -> Self {
        Self {
            config,
            last_level: None,
            last_press_ms: None,
            events: Vec::new(),
            event_seq: 0,
        }
    }

    /// Track the button level of one sample and label on an accepted press.
    ///
    /// `segments` is the segmenter's list, oldest first. A matched segment is
    /// set to [`Label::Good`] in place.
    pub fn process_sample(
        &mut self,
        sample: &CalibratedSample,
        segments: &mut [ShotSegment],
    ) -> Option<LabelEvent> {
        let level = sample.button_level;
        let t_ms = sample.device_time_ms;

        let previous = self.last_level.replace(level)?;
        let pressed = self.config.pressed_level;
        if previous == pressed || level != pressed {
            return None;
        }

        if let Some(last) = self.last_press_ms {
            if t_ms - last < self.config.debounce_ms {
                log::debug!("Button press ignored (debounce): {} ms", t_ms - last);
                return None;
            }
        }
        self.last_press_ms = Some(t_ms);

        let event = match self.find_match(t_ms, segments) {
            Some(index) => {
                let segment = &mut segments[index];
                let delay_ms = t_ms - segment.end_time_ms;
                segment.label = Label::Good;
                segment.label_time_ms = Some(t_ms);
                log::info!("Matched segment {}, delay={}ms", segment.id, delay_ms);

                LabelEvent {
                    kind: LabelKind::LabelGood,
                    host_time_ms: t_ms,
                    sequence: u32::from(sample.sequence),
                    matched_segment_id: Some(segment.id.clone()),
                    delay_ms: Some(delay_ms),
                }
            }
            None => {
                log::warn!(
                    "No matching segment for button press at t={}ms ({} finished segments)",
                    t_ms,
                    segments.iter().filter(|s| s.is_finalized()).count()
                );
                LabelEvent {
                    kind: LabelKind::LabelGood,
                    host_time_ms: t_ms,
                    sequence: u32::from(sample.sequence),
                    matched_segment_id: None,
                    delay_ms: None,
                }
            }
        };

        self.event_seq += 1;
        self.events.push(event.clone());
        Some(event)
    }

    /// Index of the newest finished segment inside the delay window.
    ///
    /// Segments end in order, so the scan stops at the first one older than
    /// `max_delay_ms`.
    fn find_match(&self, t_ms: i64, segments: &[ShotSegment]) -> Option<usize> {
        for (index, segment) in segments.iter().enumerate().rev() {
            if !segment.is_finalized() {
                continue;
            }
            let delay = t_ms - segment.end_time_ms;
            if (self.config.min_delay_ms..=self.config.max_delay_ms).contains(&delay) {
                return Some(index);
            }
            if delay > self.config.max_delay_ms {
                break;
            }
        }
        None
    }

    /// Set a segment's label directly, bypassing the delay window
    pub fn label_segment(
        &mut self,
        id: &str,
        label: Label,
        segments: &mut [ShotSegment],
    ) -> Result<LabelEvent, PipelineError> {
        let Some(segment) = segments.iter_mut().find(|s| s.id == id) else {
            log::warn!("Manual label failed: segment {id} not found");
            return Err(PipelineError::UnknownSegment(id.to_string()));
        };

        segment.label = label;
        segment.label_time_ms = None;

        let event = LabelEvent {
            kind: LabelKind::from(label),
            host_time_ms: segment.end_time_ms,
            sequence: self.event_seq,
            matched_segment_id: Some(segment.id.clone()),
            delay_ms: Some(0),
        };
        self.event_seq += 1;
        self.events.push(event.clone());

        log::info!("Manual label: segment {id} marked as {label}");
        Ok(event)
    }

    /// All events since the last clear, oldest first
    pub fn events(&self) -> &[LabelEvent] {
        &self.events
    }

    pub fn last_event(&self) -> Option<&LabelEvent> {
        self.events.last()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
        self.event_seq = 0;
    }

    pub fn config(&self) -> &LabelerConfig {
        &self.config
    }
}
