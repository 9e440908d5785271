//! Sampling sessions and data-file retrieval.

use crate::clock::to_calendar;
use crate::hal::{Accelerometer, Broker, MonotonicClock, Storage, StorageError};
use crate::node::SensingSchedule;
use tracing::{debug, info, warn};

/// Raw counts per g at the ±2 g full-scale range.
pub const ACCEL_COUNTS_PER_G: f32 = 16384.0;
/// Broker message budget per retrieval chunk.
pub const RETRIEVAL_CHUNK_LEN: usize = 850;
pub const RETRIEVAL_THROTTLE_MS: u64 = 50;

const COLUMN_HEADER: &str = "time_ms  , ax      , ay      , az";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SensingError {
    #[error("sensor or storage not ready")]
    NotReady,
    #[error("no session prepared")]
    NotPrepared,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// `N<node:03>_<log:03>.txt`
pub fn data_file_name(node_id: u8, log_number: i16) -> String {
    format!("N{node_id:03}_{log_number:03}.txt")
}

/// Counts to g with a per-axis calibration scale.
pub fn counts_to_g(raw: i16, scale: f32) -> f32 {
    f32::from(raw) * scale / ACCEL_COUNTS_PER_G
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub file_name: String,
    pub samples: u32,
    pub log_number: i16,
}

/// One sampling run into one data file.
#[derive(Debug, Clone, Default)]
pub struct SensingSession {
    file_name: Option<String>,
    start_ms: u64,
    last_sample_ms: u64,
    period_ms: u64,
    sample_count: u32,
    calibration: [f32; 3],
}

impl SensingSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_prepared(&self) -> bool {
        self.file_name.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    /// Open the next data file and write its metadata header.
    pub fn prepare(
        &mut self,
        node_id: u8,
        schedule: &SensingSchedule,
        calibration: [f32; 3],
        storage: &mut dyn Storage,
    ) -> Result<&str, SensingError> {
        debug_assert!(schedule.rate_hz > 0, "sensing rate must be non-zero");
        let log_number = storage.load_log_number();
        let name = data_file_name(node_id, log_number.saturating_add(1));
        info!(file = %name, "opening data file");

        storage.create_file(&name)?;
        let header = [
            "=============== Sampling Metadata ===============".to_string(),
            format!("Node ID: {node_id}"),
            format!("Start Time: {}", to_calendar(schedule.scheduled_start_ms)),
            format!("Sampling Rate: {} Hz", schedule.rate_hz),
            format!("Duration: {} s", schedule.duration_s),
            "================= Sampling Data =================".to_string(),
            COLUMN_HEADER.to_string(),
        ];
        for line in &header {
            storage.append_line(&name, line)?;
        }

        *self = Self {
            file_name: None,
            start_ms: schedule.scheduled_start_ms,
            last_sample_ms: schedule.scheduled_start_ms,
            period_ms: u64::from(1000 / schedule.rate_hz.max(1)).max(1),
            sample_count: 0,
            calibration,
        };
        Ok(self.file_name.insert(name).as_str())
    }

    /// Take one sample if a period has elapsed since the last one. Returns
    /// whether a sample was written.
    pub fn sample_once(
        &mut self,
        now: u64,
        imu: &mut dyn Accelerometer,
        storage: &mut dyn Storage,
    ) -> Result<bool, SensingError> {
        let Some(name) = self.file_name.as_deref() else {
            return Err(SensingError::NotPrepared);
        };
        if now.saturating_sub(self.last_sample_ms) < self.period_ms {
            return Ok(false);
        }
        self.last_sample_ms += self.period_ms;

        let (ax, ay, az) = imu.read_acceleration();
        let [sx, sy, sz] = self.calibration;
        let elapsed = now.saturating_sub(self.start_ms);
        let line = format!(
            "{elapsed:8},{:8.6},{:8.6},{:8.6}",
            counts_to_g(ax, sx),
            counts_to_g(ay, sy),
            counts_to_g(az, sz)
        );
        storage.append_line(name, &line)?;
        self.sample_count += 1;
        Ok(true)
    }

    /// Close the session and advance the persisted log number.
    pub fn stop(&mut self, storage: &mut dyn Storage) -> Option<SessionSummary> {
        let file_name = self.file_name.take()?;
        let log_number = storage.load_log_number().saturating_add(1);
        storage.persist_log_number(log_number);
        info!(file = %file_name, samples = self.sample_count, log_number, "sampling completed");
        let summary = SessionSummary {
            file_name,
            samples: self.sample_count,
            log_number,
        };
        self.sample_count = 0;
        Some(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalReport {
    pub chunks: usize,
    pub bytes: usize,
    pub failed_chunks: usize,
}

/// Split into pieces of at most `max_len` bytes, never cutting a UTF-8
/// sequence in two.
fn split_chunks(contents: &[u8], max_len: usize) -> Vec<&[u8]> {
    let is_continuation = |b: u8| b & 0xC0 == 0x80;
    let mut chunks = Vec::new();
    let mut rest = contents;
    while !rest.is_empty() {
        let mut end = rest.len().min(max_len);
        if end < rest.len() {
            let floor = end.saturating_sub(3).max(1);
            while end > floor && is_continuation(rest[end]) {
                end -= 1;
            }
        }
        let (chunk, tail) = rest.split_at(end);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// Stream `file_name` to the broker as `<file>[i/n]:<data>` chunks followed
/// by `<file>[done]`.
pub fn retrieve_file<C: MonotonicClock>(
    file_name: &str,
    storage: &mut dyn Storage,
    broker: &mut dyn Broker,
    topic: &str,
    clock: &C,
) -> Result<RetrievalReport, StorageError> {
    let contents = storage.read_file(file_name)?;
    let chunks = split_chunks(&contents, RETRIEVAL_CHUNK_LEN);
    let total = chunks.len();
    info!(file = file_name, bytes = contents.len(), chunks = total, "retrieving file");

    let mut report = RetrievalReport {
        chunks: total,
        bytes: 0,
        failed_chunks: 0,
    };
    for (i, chunk) in chunks.into_iter().enumerate() {
        let text = format!("{file_name}[{}/{total}]:{}", i + 1, String::from_utf8_lossy(chunk));
        if broker.publish(topic, &text) {
            report.bytes += chunk.len();
            debug!(chunk = i + 1, total, sent = report.bytes, "chunk sent");
        } else {
            report.failed_chunks += 1;
            warn!(chunk = i + 1, "failed to send chunk");
        }
        clock.delay_ms(RETRIEVAL_THROTTLE_MS);
    }

    broker.publish(topic, &format!("{file_name}[done]"));
    info!(file = file_name, "file upload completed");
    Ok(report)
}
