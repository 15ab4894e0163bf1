//! Serial ingest
//!
//! Reads the device's line protocol on a dedicated thread:
//!
//! ```text
//! seq,t_ms,btn,ax1,ay1,az1,gx1,gy1,gz1,ax2,ay2,az2,gx2,gy2,gz2
//! ```
//!
//! Each accepted line becomes a [`RawFrame`] stamped with local receipt time
//! and is handed to a [`FrameSink`] on the reader thread. Malformed lines and
//! sequence gaps only feed the [`IngestStats`] counters.

use crate::config::SerialConfig;
use crate::error::{LineError, PipelineError};
use crate::types::{RawFrame, RawImu};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Number of comma-separated fields in one record
pub const FIELD_COUNT: usize = 15;

/// Parse one line of the device protocol
pub fn parse_line(line: &str) -> Result<RawFrame, LineError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(LineError::Empty);
    }
    if line.starts_with('#') {
        return Err(LineError::Comment);
    }

    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(LineError::FieldCount(fields.len()));
    }

    let mut values = [0i64; FIELD_COUNT];
    for (index, (slot, field)) in values.iter_mut().zip(&fields).enumerate() {
        *slot = field.parse().map_err(|_| invalid(index, field))?;
    }

    let sequence = u16::try_from(values[0]).map_err(|_| invalid(0, fields[0]))?;
    let button_level = u8::try_from(values[2]).map_err(|_| invalid(2, fields[2]))?;

    let mut raw = [0i32; 12];
    for (offset, slot) in raw.iter_mut().enumerate() {
        let index = offset + 3;
        *slot = i32::try_from(values[index]).map_err(|_| invalid(index, fields[index]))?;
    }

    Ok(RawFrame {
        sequence,
        device_time_ms: values[1],
        button_level,
        sensors: [
            RawImu {
                accel: [raw[0], raw[1], raw[2]],
                gyro: [raw[3], raw[4], raw[5]],
            },
            RawImu {
                accel: [raw[6], raw[7], raw[8]],
                gyro: [raw[9], raw[10], raw[11]],
            },
        ],
        receipt_time_ns: 0,
    })
}

fn invalid(index: usize, value: &str) -> LineError {
    LineError::InvalidField {
        index,
        value: value.to_string(),
    }
}

/// Detects gaps in the 16-bit packet counter
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u16>,
}

impl SequenceTracker {
    /// Record a sequence number and return how many packets were skipped
    pub fn observe(&mut self, sequence: u16) -> u32 {
        let Some(last) = self.last.replace(sequence) else {
            return 0;
        };
        let expected = last.wrapping_add(1);
        u32::from(sequence.wrapping_sub(expected))
    }

    pub fn last(&self) -> Option<u16> {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

/// Packets-per-second over a one-second window
#[derive(Debug, Clone)]
pub struct PacketRateWindow {
    window: Duration,
    started: Option<Instant>,
    count: u64,
}

impl Default for PacketRateWindow {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl PacketRateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: None,
            count: 0,
        }
    }

    /// Count one packet; returns a fresh rate whenever the window elapses
    pub fn record(&mut self, now: Instant) -> Option<f64> {
        let started = *self.started.get_or_insert(now);
        self.count += 1;

        let elapsed = now.saturating_duration_since(started);
        if elapsed < self.window {
            return None;
        }

        let rate = self.count as f64 / elapsed.as_secs_f64();
        self.started = Some(now);
        self.count = 0;
        Some(rate)
    }
}

/// Live ingest counters, shared between the reader thread and observers
#[derive(Debug, Default)]
pub struct IngestStats {
    pps_bits: AtomicU64,
    dropped: AtomicU64,
    parse_errors: AtomicU64,
    total_rx: AtomicU64,
    decode_errors: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestSnapshot {
    pub pps: f64,
    pub dropped: u64,
    pub parse_errors: u64,
    pub total_rx: u64,
    pub decode_errors: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            pps: f64::from_bits(self.pps_bits.load(Ordering::Relaxed)),
            dropped: self.dropped.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            total_rx: self.total_rx.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.pps_bits,
            &self.dropped,
            &self.parse_errors,
            &self.total_rx,
            &self.decode_errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn set_pps(&self, pps: f64) {
        self.pps_bits.store(pps.to_bits(), Ordering::Relaxed);
    }
}

/// Result of one line read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete line, terminator included
    Line(Vec<u8>),
    /// Nothing complete arrived within the read timeout
    Timeout,
    /// The stream ended
    Closed,
}

/// Anything the reader thread can pull protocol lines from
pub trait FrameSource: Send {
    fn next_line(&mut self) -> io::Result<ReadOutcome>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;

    /// Whether the stream ending means the link was lost. Replays end
    /// normally; a live device never should.
    fn is_live(&self) -> bool {
        false
    }
}

/// Line source over any buffered reader (captured logs, pipes, tests)
pub struct ReaderSource<R> {
    reader: R,
    name: String,
    pending: Vec<u8>,
}

impl<R: BufRead + Send> ReaderSource<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            pending: Vec::new(),
        }
    }
}

impl<R: BufRead + Send> FrameSource for ReaderSource<R> {
    fn next_line(&mut self) -> io::Result<ReadOutcome> {
        // Partial data from a timed-out read stays in `pending`
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) if self.pending.is_empty() => Ok(ReadOutcome::Closed),
            Ok(_) => Ok(ReadOutcome::Line(std::mem::take(&mut self.pending))),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(ReadOutcome::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

/// Serial port opened 8N1 with a per-read timeout
pub struct SerialSource {
    inner: ReaderSource<BufReader<Box<dyn serialport::SerialPort>>>,
}

impl SerialSource {
    pub fn open(config: &SerialConfig) -> Result<Self, PipelineError> {
        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| {
                log::error!("Failed to open serial port {}: {e}", config.port);
                PipelineError::Transport {
                    port: config.port.clone(),
                    message: e.to_string(),
                }
            })?;

        log::info!("Serial opened: {} @ {} baud", config.port, config.baud_rate);
        let name = format!("{}@{}", config.port, config.baud_rate);
        Ok(Self {
            inner: ReaderSource::new(BufReader::new(port), name),
        })
    }
}

impl FrameSource for SerialSource {
    fn next_line(&mut self) -> io::Result<ReadOutcome> {
        self.inner.next_line()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn is_live(&self) -> bool {
        true
    }
}

/// Serial port visible to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Enumerate serial ports on this host
pub fn list_ports() -> Result<Vec<PortInfo>, PipelineError> {
    let ports = serialport::available_ports().map_err(|e| PipelineError::Transport {
        port: "*".to_string(),
        message: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let (kind, description) = match port.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    "usb",
                    usb.product
                        .or(usb.manufacturer)
                        .or_else(|| Some(format!("{:04x}:{:04x}", usb.vid, usb.pid))),
                ),
                serialport::SerialPortType::PciPort => ("pci", None),
                serialport::SerialPortType::BluetoothPort => ("bluetooth", None),
                serialport::SerialPortType::Unknown => ("unknown", None),
            };
            PortInfo {
                name: port.port_name,
                kind: kind.to_string(),
                description,
            }
        })
        .collect())
}

/// Consumer of frames on the reader thread
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: RawFrame);

    /// Runs once per loop iteration, after a frame or a read timeout
    fn on_tick(&mut self) {}
}

impl<F> FrameSink for F
where
    F: FnMut(RawFrame) + Send + 'static,
{
    fn on_frame(&mut self, frame: RawFrame) {
        self(frame)
    }
}

/// What the reader thread hands back when it exits
pub struct ReaderExit<K> {
    pub sink: K,
    /// Set when the link failed mid-stream
    pub error: Option<PipelineError>,
}

/// Handle to a running reader thread
pub struct IngestReader<K> {
    stop: Arc<AtomicBool>,
    stats: Arc<IngestStats>,
    handle: JoinHandle<ReaderExit<K>>,
    done: Receiver<()>,
}

impl<K: FrameSink> IngestReader<K> {
    /// Spawn the reader thread. Counters in `stats` are reset first.
    pub fn start(
        source: Box<dyn FrameSource>,
        sink: K,
        stats: Arc<IngestStats>,
    ) -> Result<Self, PipelineError> {
        stats.reset();
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done) = bounded::<()>(1);

        let handle = {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name("shotsense-ingest".to_string())
                .spawn(move || {
                    let exit = read_loop(source, sink, &stats, &stop);
                    let _ = done_tx.send(());
                    exit
                })?
        };

        log::info!("Ingest started");
        Ok(Self {
            stop,
            stats,
            handle,
            done,
        })
    }

    pub fn stats(&self) -> &Arc<IngestStats> {
        &self.stats
    }

    /// True once the loop has exited on its own (stream closed or failed)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Request a stop and wait at most `join_timeout` for the thread.
    ///
    /// Returns `None` if the thread did not stop in time; it is then left
    /// detached and exits after its current blocking read.
    pub fn stop(self, join_timeout: Duration) -> Option<ReaderExit<K>> {
        log::info!("Stopping ingest...");
        self.stop.store(true, Ordering::Relaxed);
        self.join(join_timeout)
    }

    /// Wait for the loop to end on its own, e.g. at the end of a replay
    pub fn wait(self) -> Option<ReaderExit<K>> {
        let _ = self.done.recv();
        self.join_now()
    }

    fn join(self, timeout: Duration) -> Option<ReaderExit<K>> {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => self.join_now(),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Read thread did not stop within {} ms; detaching",
                    timeout.as_millis()
                );
                None
            }
        }
    }

    fn join_now(self) -> Option<ReaderExit<K>> {
        match self.handle.join() {
            Ok(exit) => Some(exit),
            Err(_) => {
                log::error!("Read thread panicked");
                None
            }
        }
    }
}

fn read_loop<K: FrameSink>(
    mut source: Box<dyn FrameSource>,
    mut sink: K,
    stats: &IngestStats,
    stop: &AtomicBool,
) -> ReaderExit<K> {
    log::info!("Read loop started: {}", source.describe());
    let mut tracker = SequenceTracker::default();
    let mut rate = PacketRateWindow::default();
    let mut error = None;

    while !stop.load(Ordering::Relaxed) {
        match source.next_line() {
            Ok(ReadOutcome::Line(bytes)) => {
                if let Some(frame) = decode(&bytes, stats) {
                    let dropped = tracker.observe(frame.sequence);
                    if dropped > 0 {
                        stats.dropped.fetch_add(u64::from(dropped), Ordering::Relaxed);
                        log::warn!("Dropped {dropped} packets (now at seq {})", frame.sequence);
                    }
                    stats.total_rx.fetch_add(1, Ordering::Relaxed);
                    if let Some(pps) = rate.record(Instant::now()) {
                        stats.set_pps(pps);
                    }
                    sink.on_frame(frame);
                }
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::Closed) if source.is_live() => {
                log::error!("Link closed unexpectedly: {}", source.describe());
                error = Some(PipelineError::Stream(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} closed", source.describe()),
                )));
                break;
            }
            Ok(ReadOutcome::Closed) => {
                log::info!("Source closed: {}", source.describe());
                break;
            }
            Err(e) => {
                log::error!("Link failed: {e}");
                error = Some(PipelineError::Stream(e));
                break;
            }
        }
        sink.on_tick();
    }

    log::info!("Read loop ended");
    ReaderExit { sink, error }
}

/// Decode and parse one line, counting failures
fn decode(bytes: &[u8], stats: &IngestStats) -> Option<RawFrame> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => std::borrow::Cow::Borrowed(text),
        Err(_) => {
            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            String::from_utf8_lossy(bytes)
        }
    };

    match parse_line(&text) {
        Ok(mut frame) => {
            frame.receipt_time_ns = chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default();
            Some(frame)
        }
        Err(e) => {
            stats.parse_errors.fetch_add(1, Ordering::Relaxed);
            log::debug!("Parse error: {e}");
            None
        }
    }
}
