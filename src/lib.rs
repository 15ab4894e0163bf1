//! shotsense - Real-time shot segmentation for a dual-IMU wearable
//!
//! shotsense ingests a 100 Hz stream of raw readings from two IMUs over a
//! serial link and runs each frame through a fixed pipeline: unit conversion
//! and bias calibration → rolling buffer → hysteresis shot segmentation →
//! button label alignment → outbound notifications.
//!
//! ## Modules
//!
//! - **Ingest**: Line protocol parsing, gap and rate statistics, reader thread
//! - **Processing**: Calibration, filtering, segmentation, labeling
//! - **Service**: Thread ownership, control surface and notification hand-off

pub mod baseline;
pub mod config;
pub mod error;
pub mod features;
pub mod ingest;
pub mod labeler;
pub mod notify;
pub mod pipeline;
pub mod processor;
pub mod ring_buffer;
pub mod segmenter;
pub mod types;

pub use config::PipelineConfig;
pub use error::{LineError, PipelineError};
pub use ingest::{list_ports, parse_line, FrameSource, IngestStats, ReaderSource, SerialSource};
pub use notify::{Notification, NotificationSender, StatsSnapshot};
pub use pipeline::{PipelineService, ShotPipeline};
pub use ring_buffer::RingBuffer;
pub use types::{CalibratedSample, Label, LabelEvent, RawFrame, SegmentSummary, ShotSegment};

/// Crate version reported by the CLI
pub const SHOTSENSE_VERSION: &str = env!("CARGO_PKG_VERSION");
