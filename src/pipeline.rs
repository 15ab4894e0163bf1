//! Pipeline orchestration
//!
//! [`ShotPipeline`] chains the per-frame stages:
//! 1. SampleProcessor - Unit conversion, bias removal, filtering
//! 2. RingBuffer - Rolling window for live queries
//! 3. Segmenter - Shot detection
//! 4. Labeler - Button press alignment
//! 5. Notifier - Outbound messages
//!
//! [`PipelineService`] moves the pipeline onto the ingest thread while the link
//! is running and routes control calls to it over a command channel.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ingest::{FrameSink, FrameSource, IngestReader, IngestStats, SerialSource};
use crate::labeler::Labeler;
use crate::notify::{Notification, NotificationSender, Notifier, SegmentPhase, StatsSnapshot};
use crate::processor::SampleProcessor;
use crate::ring_buffer::RingBuffer;
use crate::segmenter::{Segmenter, SegmenterEvent};
use crate::types::{
    CalibratedSample, CalibrationStatus, Label, LabelEvent, RawFrame, SegmentSummary, ShotSegment,
};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pipeline state readable from any thread
#[derive(Debug, Default)]
pub struct PipelineStatus {
    running: AtomicBool,
    calibrating: AtomicBool,
    total_segments: AtomicUsize,
    good: AtomicUsize,
    bad: AtomicUsize,
    unknown: AtomicUsize,
}

impl PipelineStatus {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_calibrating(&self) -> bool {
        self.calibrating.load(Ordering::Relaxed)
    }

    /// Finished segments as (total, good, bad, unknown)
    pub fn segment_counts(&self) -> (usize, usize, usize, usize) {
        (
            self.total_segments.load(Ordering::Relaxed),
            self.good.load(Ordering::Relaxed),
            self.bad.load(Ordering::Relaxed),
            self.unknown.load(Ordering::Relaxed),
        )
    }

    fn record_segments(&self, segmenter: &Segmenter) {
        let (good, bad, unknown) = segmenter.label_counts();
        self.total_segments
            .store(segmenter.segments().len(), Ordering::Relaxed);
        self.good.store(good, Ordering::Relaxed);
        self.bad.store(bad, Ordering::Relaxed);
        self.unknown.store(unknown, Ordering::Relaxed);
    }
}

/// Everything one frame produced
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub sample: CalibratedSample,
    pub global_index: u64,
    pub segment: Option<SegmenterEvent>,
    pub label: Option<LabelEvent>,
}

/// Synchronous processing chain for one device stream.
///
/// Owns all stage state, so exactly one thread drives it at a time.
pub struct ShotPipeline {
    processor: SampleProcessor,
    segmenter: Segmenter,
    labeler: Labeler,
    buffer: Arc<RingBuffer>,
    status: Arc<PipelineStatus>,
    notifier: Notifier,
}

impl ShotPipeline {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_shared(
            config,
            Arc::new(RingBuffer::from_config(config)),
            Arc::new(PipelineStatus::default()),
        )
    }

    /// Build a pipeline that writes into an existing buffer and status
    pub fn with_shared(
        config: &PipelineConfig,
        buffer: Arc<RingBuffer>,
        status: Arc<PipelineStatus>,
    ) -> Self {
        Self {
            processor: SampleProcessor::new(config.processor.clone()),
            segmenter: Segmenter::new(config.segmenter.clone()),
            labeler: Labeler::new(config.labeler.clone()),
            buffer,
            status,
            notifier: Notifier::new(config.notify.sample_rate_hz),
        }
    }

    /// Run one frame through every stage
    pub fn process_frame(&mut self, frame: &RawFrame) -> FrameOutcome {
        let sample = self.processor.process(frame);
        let global_index = self.buffer.push(sample.clone());
        let segment = self.segmenter.process(&sample);
        let label = self
            .labeler
            .process_sample(&sample, self.segmenter.segments_mut());

        self.notifier.sample(&sample);
        match &segment {
            Some(SegmenterEvent::Started(summary)) => self.notifier.send(Notification::Segment {
                event: SegmentPhase::Start,
                data: summary.clone(),
            }),
            Some(SegmenterEvent::Finished(summary)) => self.notifier.send(Notification::Segment {
                event: SegmentPhase::End,
                data: summary.clone(),
            }),
            None => {}
        }
        if let Some(event) = &label {
            self.notifier.send(Notification::Label {
                data: event.into(),
            });
        }

        if matches!(segment, Some(SegmenterEvent::Finished(_))) || label.is_some() {
            self.status.record_segments(&self.segmenter);
        }
        self.status
            .calibrating
            .store(self.processor.is_calibrating(), Ordering::Relaxed);

        FrameOutcome {
            sample,
            global_index,
            segment,
            label,
        }
    }

    pub fn start_calibration(&mut self, duration_seconds: f64) -> Result<usize, PipelineError> {
        let target = self.processor.start_calibration(duration_seconds)?;
        self.status.calibrating.store(true, Ordering::Relaxed);
        Ok(target)
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.processor.calibration_status()
    }

    /// Manually set a finished segment's label
    pub fn label_segment(&mut self, id: &str, label: Label) -> Result<LabelEvent, PipelineError> {
        let event = self
            .labeler
            .label_segment(id, label, self.segmenter.segments_mut())?;
        self.notifier.send(Notification::Label {
            data: (&event).into(),
        });
        self.status.record_segments(&self.segmenter);
        Ok(event)
    }

    pub fn segment_summaries(&self) -> Vec<SegmentSummary> {
        self.segmenter
            .segments()
            .iter()
            .map(ShotSegment::summary)
            .collect()
    }

    pub fn get_segment(&self, id: &str) -> Option<ShotSegment> {
        self.segmenter.get_segment(id).cloned()
    }

    /// Forget finished segments and label history
    pub fn clear_segments(&mut self) {
        self.segmenter.clear_segments();
        self.labeler.clear_events();
        self.status.record_segments(&self.segmenter);
    }

    pub fn attach_notifications(&mut self, sender: NotificationSender) {
        self.notifier.attach(sender);
    }

    pub fn processor(&self) -> &SampleProcessor {
        &self.processor
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn labeler(&self) -> &Labeler {
        &self.labeler
    }

    pub fn buffer(&self) -> &Arc<RingBuffer> {
        &self.buffer
    }

    pub fn status(&self) -> &Arc<PipelineStatus> {
        &self.status
    }
}

/// Control request executed on the ingest thread
enum Command {
    StartCalibration {
        seconds: f64,
        reply: Sender<Result<usize, PipelineError>>,
    },
    CalibrationStatus {
        reply: Sender<CalibrationStatus>,
    },
    LabelSegment {
        id: String,
        label: Label,
        reply: Sender<Result<LabelEvent, PipelineError>>,
    },
    Segments {
        reply: Sender<Vec<SegmentSummary>>,
    },
    Segment {
        id: String,
        reply: Sender<Option<ShotSegment>>,
    },
    ClearSegments {
        reply: Sender<()>,
    },
    AttachNotifications {
        sender: NotificationSender,
        reply: Sender<()>,
    },
}

impl Command {
    fn execute(self, pipeline: &mut ShotPipeline) {
        // A caller that timed out has dropped its receiver; ignore send errors
        match self {
            Command::StartCalibration { seconds, reply } => {
                let _ = reply.send(pipeline.start_calibration(seconds));
            }
            Command::CalibrationStatus { reply } => {
                let _ = reply.send(pipeline.calibration_status());
            }
            Command::LabelSegment { id, label, reply } => {
                let _ = reply.send(pipeline.label_segment(&id, label));
            }
            Command::Segments { reply } => {
                let _ = reply.send(pipeline.segment_summaries());
            }
            Command::Segment { id, reply } => {
                let _ = reply.send(pipeline.get_segment(&id));
            }
            Command::ClearSegments { reply } => {
                pipeline.clear_segments();
                let _ = reply.send(());
            }
            Command::AttachNotifications { sender, reply } => {
                pipeline.attach_notifications(sender);
                let _ = reply.send(());
            }
        }
    }
}

/// Pipeline plus its command inbox, as run by the ingest thread
struct Worker {
    pipeline: ShotPipeline,
    commands: Receiver<Command>,
}

impl FrameSink for Worker {
    fn on_frame(&mut self, frame: RawFrame) {
        self.pipeline.process_frame(&frame);
    }

    fn on_tick(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            command.execute(&mut self.pipeline);
        }
    }
}

enum ServiceState {
    Idle(Box<ShotPipeline>),
    Running {
        reader: IngestReader<Worker>,
        commands: Sender<Command>,
    },
    /// The last reader thread missed its join deadline and still owns the
    /// pipeline; the next start builds a fresh one
    Detached,
}

/// Owner of the pipeline, its ingest thread and the control surface
pub struct PipelineService {
    config: PipelineConfig,
    state: ServiceState,
    stats: Arc<IngestStats>,
    buffer: Arc<RingBuffer>,
    status: Arc<PipelineStatus>,
    notifications: Option<NotificationSender>,
}

impl PipelineService {
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let buffer = Arc::new(RingBuffer::from_config(&config));
        let status = Arc::new(PipelineStatus::default());
        let pipeline = ShotPipeline::with_shared(&config, Arc::clone(&buffer), Arc::clone(&status));

        Ok(Self {
            state: ServiceState::Idle(Box::new(pipeline)),
            stats: Arc::new(IngestStats::default()),
            buffer,
            status,
            notifications: None,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.config.serial.join_timeout_ms)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ServiceState::Running { .. })
    }

    /// True when running but the ingest thread has already exited
    pub fn ingest_finished(&self) -> bool {
        matches!(
            &self.state,
            ServiceState::Running { reader, .. } if reader.is_finished()
        )
    }

    /// Open the configured serial port and start ingesting
    pub fn start_serial(&mut self) -> Result<(), PipelineError> {
        self.reclaim_finished();
        if self.is_running() {
            return Err(PipelineError::AlreadyRunning);
        }
        let source = SerialSource::open(&self.config.serial)?;
        self.start(Box::new(source))
    }

    /// Start the ingest thread on an already-open source
    pub fn start(&mut self, source: Box<dyn FrameSource>) -> Result<(), PipelineError> {
        self.reclaim_finished();
        let pipeline = match std::mem::replace(&mut self.state, ServiceState::Detached) {
            ServiceState::Idle(pipeline) => *pipeline,
            running @ ServiceState::Running { .. } => {
                self.state = running;
                return Err(PipelineError::AlreadyRunning);
            }
            ServiceState::Detached => {
                log::warn!("Previous ingest thread is detached; starting a fresh pipeline");
                self.fresh_pipeline()
            }
        };

        let (commands, inbox) = unbounded();
        let worker = Worker {
            pipeline,
            commands: inbox,
        };
        let reader = IngestReader::start(source, worker, Arc::clone(&self.stats))?;

        self.state = ServiceState::Running { reader, commands };
        self.status.running.store(true, Ordering::Relaxed);
        log::info!("Pipeline started");
        Ok(())
    }

    /// Stop the ingest thread and take the pipeline back
    pub fn stop(&mut self) -> Result<(), PipelineError> {
        let reader = self.take_reader()?;
        let exit = reader.stop(self.join_timeout());
        self.restore(exit.map(|exit| (exit.sink, exit.error)));
        log::info!("Pipeline stopped");
        Ok(())
    }

    /// Block until the source ends on its own (end of a replay, link loss)
    pub fn wait(&mut self) -> Result<(), PipelineError> {
        let reader = self.take_reader()?;
        match self.restore(reader.wait().map(|exit| (exit.sink, exit.error))) {
            Some(error) => Err(error),
            None if matches!(self.state, ServiceState::Detached) => {
                Err(PipelineError::ChannelClosed)
            }
            None => Ok(()),
        }
    }

    fn take_reader(&mut self) -> Result<IngestReader<Worker>, PipelineError> {
        match std::mem::replace(&mut self.state, ServiceState::Detached) {
            ServiceState::Running { reader, .. } => Ok(reader),
            other => {
                self.state = other;
                Err(PipelineError::NotRunning)
            }
        }
    }

    /// Put a returned pipeline back, or stay detached; yields any stream error
    fn restore(&mut self, exit: Option<(Worker, Option<PipelineError>)>) -> Option<PipelineError> {
        self.status.running.store(false, Ordering::Relaxed);
        let (worker, error) = exit?;
        if let Some(error) = &error {
            log::warn!("Ingest ended with error: {error}");
        }
        self.state = ServiceState::Idle(Box::new(worker.pipeline));
        error
    }

    /// Reclaim the pipeline if the reader already exited on its own
    fn reclaim_finished(&mut self) {
        if self.ingest_finished() {
            let _ = self.wait();
        }
    }

    fn fresh_pipeline(&self) -> ShotPipeline {
        let mut pipeline = ShotPipeline::with_shared(
            &self.config,
            Arc::clone(&self.buffer),
            Arc::clone(&self.status),
        );
        if let Some(sender) = &self.notifications {
            pipeline.attach_notifications(sender.clone());
        }
        pipeline
    }

    /// Run a control call locally when idle, or on the ingest thread when running
    fn request<T>(
        &mut self,
        command: impl FnOnce(Sender<T>) -> Command,
        local: impl FnOnce(&mut ShotPipeline) -> T,
    ) -> Result<T, PipelineError> {
        self.reclaim_finished();
        let timeout = self.join_timeout();
        match &mut self.state {
            ServiceState::Idle(pipeline) => Ok(local(pipeline.as_mut())),
            ServiceState::Running { commands, .. } => {
                let (reply, response) = bounded(1);
                commands
                    .send(command(reply))
                    .map_err(|_| PipelineError::ChannelClosed)?;
                response.recv_timeout(timeout).map_err(|e| match e {
                    RecvTimeoutError::Timeout => {
                        PipelineError::ControlTimeout(timeout.as_millis() as u64)
                    }
                    RecvTimeoutError::Disconnected => PipelineError::ChannelClosed,
                })
            }
            ServiceState::Detached => Err(PipelineError::ChannelClosed),
        }
    }

    /// Route outbound notifications to `sender`
    pub fn attach_notifications(&mut self, sender: NotificationSender) -> Result<(), PipelineError> {
        self.notifications = Some(sender.clone());
        let local = sender.clone();
        self.request(
            |reply| Command::AttachNotifications { sender, reply },
            |pipeline| pipeline.attach_notifications(local),
        )
    }

    /// Start gyro bias calibration; returns the number of samples to collect
    pub fn start_calibration(&mut self, duration_seconds: f64) -> Result<usize, PipelineError> {
        self.request(
            |reply| Command::StartCalibration {
                seconds: duration_seconds,
                reply,
            },
            |pipeline| pipeline.start_calibration(duration_seconds),
        )?
    }

    pub fn calibration_status(&mut self) -> Result<CalibrationStatus, PipelineError> {
        self.request(
            |reply| Command::CalibrationStatus { reply },
            |pipeline| pipeline.calibration_status(),
        )
    }

    /// Manual label override; `label` is one of `good`, `bad`, `unknown`
    pub fn label_segment(&mut self, id: &str, label: &str) -> Result<LabelEvent, PipelineError> {
        let label: Label = label.parse()?;
        let owned = id.to_string();
        self.request(
            |reply| Command::LabelSegment {
                id: owned,
                label,
                reply,
            },
            |pipeline| pipeline.label_segment(id, label),
        )?
    }

    pub fn segments(&mut self) -> Result<Vec<SegmentSummary>, PipelineError> {
        self.request(
            |reply| Command::Segments { reply },
            |pipeline| pipeline.segment_summaries(),
        )
    }

    pub fn get_segment(&mut self, id: &str) -> Result<ShotSegment, PipelineError> {
        let owned = id.to_string();
        self.request(
            |reply| Command::Segment { id: owned, reply },
            |pipeline| pipeline.get_segment(id),
        )?
        .ok_or_else(|| PipelineError::UnknownSegment(id.to_string()))
    }

    pub fn clear_segments(&mut self) -> Result<(), PipelineError> {
        self.request(
            |reply| Command::ClearSegments { reply },
            |pipeline| pipeline.clear_segments(),
        )
    }

    /// Shared sample window, readable while running
    pub fn buffer(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn ingest_stats(&self) -> Arc<IngestStats> {
        Arc::clone(&self.stats)
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        snapshot(&self.stats, &self.buffer, &self.status)
    }

    /// Emit a `stat` notification every `notify.stats_interval_ms` until the
    /// receiver is dropped. Must be called from within a tokio runtime.
    pub fn spawn_stats_task(&self, sender: NotificationSender) -> tokio::task::JoinHandle<()> {
        let stats = Arc::clone(&self.stats);
        let buffer = Arc::clone(&self.buffer);
        let status = Arc::clone(&self.status);
        let period = Duration::from_millis(self.config.notify.stats_interval_ms.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let data = snapshot(&stats, &buffer, &status);
                if sender.send(Notification::Stat { data }).is_err() {
                    log::debug!("Stats receiver dropped");
                    break;
                }
            }
        })
    }
}

impl Drop for PipelineService {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn snapshot(stats: &IngestStats, buffer: &RingBuffer, status: &PipelineStatus) -> StatsSnapshot {
    let (total_segments, good_shots, bad_shots, unknown_shots) = status.segment_counts();
    StatsSnapshot {
        ingest: stats.snapshot(),
        buffer_size: buffer.len(),
        buffer_capacity: buffer.capacity(),
        total_segments,
        good_shots,
        bad_shots,
        unknown_shots,
        is_calibrating: status.is_calibrating(),
        is_running: status.is_running(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{ReadOutcome, ReaderSource};
    use crate::segmenter::SegmentState;
    use crate::types::RawImu;
    use pretty_assertions::assert_eq;
    use std::io::{self, Cursor};

    const MOTION_START_MS: i64 = 1000;
    const MOTION_END_MS: i64 = 1500;
    const PRESS_MS: i64 = 2410;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.segmenter.adaptive = false;
        config.buffer.max_seconds = 10;
        config.notify.sample_rate_hz = 0;
        config
    }

    /// Quiet device, an 80 °/s burst, then a button press 700 ms after the
    /// segment ends (cooldown begins at 1710 ms)
    fn scripted_frames() -> Vec<RawFrame> {
        (0..400)
            .map(|i| {
                let t_ms = i * 10;
                let gyro_x = if (MOTION_START_MS..MOTION_END_MS).contains(&t_ms) {
                    80 * 131
                } else {
                    0
                };
                let button_level = u8::from((PRESS_MS..PRESS_MS + 50).contains(&t_ms));
                let imu = RawImu {
                    accel: [0, 0, 16384],
                    gyro: [gyro_x, 0, 0],
                };
                RawFrame {
                    sequence: i as u16,
                    device_time_ms: t_ms,
                    button_level,
                    sensors: [imu, imu],
                    receipt_time_ns: 0,
                }
            })
            .collect()
    }

    fn to_line(frame: &RawFrame) -> String {
        let [s1, s2] = frame.sensors;
        let header = [
            i64::from(frame.sequence),
            frame.device_time_ms,
            i64::from(frame.button_level),
        ];
        let values: Vec<String> = header
            .into_iter()
            .chain(
                [s1.accel, s1.gyro, s2.accel, s2.gyro]
                    .into_iter()
                    .flatten()
                    .map(i64::from),
            )
            .map(|v| v.to_string())
            .collect();
        format!("{}\n", values.join(","))
    }

    fn replay_source(frames: &[RawFrame]) -> Box<dyn FrameSource> {
        let text: String = frames.iter().map(to_line).collect();
        Box::new(ReaderSource::new(Cursor::new(text.into_bytes()), "replay"))
    }

    /// Source that never produces data, like an idle serial port
    struct IdleSource;

    impl FrameSource for IdleSource {
        fn next_line(&mut self) -> io::Result<ReadOutcome> {
            std::thread::sleep(Duration::from_millis(5));
            Ok(ReadOutcome::Timeout)
        }

        fn describe(&self) -> String {
            "idle".to_string()
        }
    }

    #[test]
    fn test_shot_then_press_is_labeled() {
        let config = test_config();
        let mut pipeline = ShotPipeline::new(&config);

        let mut label_events = Vec::new();
        for frame in scripted_frames() {
            let outcome = pipeline.process_frame(&frame);
            label_events.extend(outcome.label);
        }

        let segments = pipeline.segment_summaries();
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert!(segment.start_time_ms > MOTION_START_MS);
        assert!(segment.end_time_ms > MOTION_END_MS);
        assert!(segment.duration_ms >= config.segmenter.min_segment_ms);
        assert_eq!(segment.label, Label::Good);
        assert_eq!(segment.label_time_ms, Some(PRESS_MS));

        assert_eq!(label_events.len(), 1);
        assert_eq!(label_events[0].matched_segment_id.as_ref(), Some(&segment.id));
        assert_eq!(
            label_events[0].delay_ms,
            Some(PRESS_MS - segment.end_time_ms)
        );

        assert_eq!(pipeline.status().segment_counts(), (1, 1, 0, 0));
        assert_eq!(pipeline.buffer().len(), 400);
        assert_eq!(pipeline.segmenter().state(), SegmentState::Idle);
    }

    #[test]
    fn test_manual_relabel() {
        let mut pipeline = ShotPipeline::new(&test_config());
        for frame in scripted_frames() {
            pipeline.process_frame(&frame);
        }
        let id = pipeline.segment_summaries()[0].id.clone();

        let event = pipeline.label_segment(&id, Label::Bad).unwrap();
        assert_eq!(event.delay_ms, Some(0));
        assert_eq!(pipeline.get_segment(&id).unwrap().label, Label::Bad);
        assert_eq!(pipeline.status().segment_counts(), (1, 0, 1, 0));

        assert!(matches!(
            pipeline.label_segment("nope", Label::Good),
            Err(PipelineError::UnknownSegment(_))
        ));
    }

    #[test]
    fn test_replay_through_service() {
        let mut service = PipelineService::new(test_config()).unwrap();
        service.start(replay_source(&scripted_frames())).unwrap();
        service.wait().unwrap();

        assert!(!service.is_running());
        let segments = service.segments().unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].label, Label::Good);

        let stats = service.stats_snapshot();
        assert_eq!(stats.ingest.total_rx, 400);
        assert_eq!(stats.ingest.dropped, 0);
        assert_eq!(stats.buffer_size, 400);
        assert_eq!(stats.good_shots, 1);

        let full = service.get_segment(&segments[0].id).unwrap();
        assert!(!full.samples.is_empty());
    }

    #[test]
    fn test_service_start_stop_lifecycle() {
        let mut service = PipelineService::new(test_config()).unwrap();
        assert!(matches!(service.stop(), Err(PipelineError::NotRunning)));

        service.start(Box::new(IdleSource)).unwrap();
        assert!(service.is_running());
        assert!(service.stats_snapshot().is_running);
        assert!(matches!(
            service.start(Box::new(IdleSource)),
            Err(PipelineError::AlreadyRunning)
        ));

        service.stop().unwrap();
        assert!(!service.is_running());
        assert!(!service.stats_snapshot().is_running);

        // Restart reuses the same pipeline
        service.start(Box::new(IdleSource)).unwrap();
        service.stop().unwrap();
    }

    /// Source blocked in a read well past the join timeout
    struct StuckSource;

    impl FrameSource for StuckSource {
        fn next_line(&mut self) -> io::Result<ReadOutcome> {
            std::thread::sleep(Duration::from_millis(800));
            Ok(ReadOutcome::Timeout)
        }

        fn describe(&self) -> String {
            "stuck".to_string()
        }
    }

    #[test]
    fn test_stop_timeout_detaches_then_restarts_fresh() {
        let mut config = test_config();
        config.serial.join_timeout_ms = 100;
        let mut service = PipelineService::new(config).unwrap();

        service.start(Box::new(StuckSource)).unwrap();
        assert!(matches!(
            service.start_calibration(1.0),
            Err(PipelineError::ControlTimeout(100))
        ));

        service.stop().unwrap();
        assert!(!service.is_running());
        assert!(!service.stats_snapshot().is_running);
        assert!(matches!(
            service.calibration_status(),
            Err(PipelineError::ChannelClosed)
        ));
        assert!(matches!(service.stop(), Err(PipelineError::NotRunning)));

        // The abandoned thread kept the old pipeline; this one starts clean
        service.start(Box::new(IdleSource)).unwrap();
        assert!(service.is_running());
        assert!(!service.calibration_status().unwrap().active);
        assert_eq!(service.start_calibration(1.0).unwrap(), 100);
        service.stop().unwrap();
        assert!(service.calibration_status().unwrap().active);
    }

    #[test]
    fn test_control_calls_while_running() {
        let mut service = PipelineService::new(test_config()).unwrap();
        service.start(Box::new(IdleSource)).unwrap();

        assert_eq!(service.start_calibration(2.0).unwrap(), 200);
        let status = service.calibration_status().unwrap();
        assert!(status.active);
        assert_eq!(status.target, 200);

        assert!(matches!(
            service.start_calibration(0.0),
            Err(PipelineError::InvalidCalibration(_))
        ));
        assert!(matches!(
            service.label_segment("missing", "good"),
            Err(PipelineError::UnknownSegment(_))
        ));
        assert!(matches!(
            service.label_segment("missing", "great"),
            Err(PipelineError::InvalidLabel(_))
        ));
        assert!(service.segments().unwrap().is_empty());

        service.stop().unwrap();
        assert!(service.calibration_status().unwrap().active);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = test_config();
        config.processor.sample_rate_hz = 0;
        assert!(matches!(
            PipelineService::new(config),
            Err(PipelineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_notifications_reach_async_host() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut service = PipelineService::new(test_config()).unwrap();
        service.attach_notifications(tx).unwrap();

        service.start(replay_source(&scripted_frames())).unwrap();
        service.wait().unwrap();

        let mut samples = 0;
        let mut phases = Vec::new();
        let mut labels = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message {
                Notification::Sample { .. } => samples += 1,
                Notification::Segment { event, .. } => phases.push(event),
                Notification::Label { data } => labels.push(data),
                Notification::Stat { .. } => {}
            }
        }

        assert_eq!(samples, 400);
        assert_eq!(phases, vec![SegmentPhase::Start, SegmentPhase::End]);
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].label, Label::Good);
        assert!(labels[0].segment_id.is_some());
    }

    #[tokio::test]
    async fn test_stats_task_reports_periodically() {
        let mut config = test_config();
        config.notify.stats_interval_ms = 10;
        let service = PipelineService::new(config).unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handle = service.spawn_stats_task(tx);

        for _ in 0..2 {
            match rx.recv().await {
                Some(Notification::Stat { data }) => {
                    assert_eq!(data.buffer_capacity, 1000);
                    assert!(!data.is_running);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }

        drop(rx);
        handle.await.unwrap();
    }
}
