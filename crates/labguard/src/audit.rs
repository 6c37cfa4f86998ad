//! Append-only audit journal and the statistics derived from it.
//!
//! Every record is handed to an [`AuditSink`] before it counts as written.
//! [`JsonlSink`] appends one JSON object per line and flushes each record;
//! the journal is replayed on open so statistics survive restarts.

use crate::status_store::StatusStore;
use crate::types::{AuditEvent, AuditRecord, DeviceId, LatencyStats, Phase};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use healthcheck::CheckResult;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit journal IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid time window '{0}'")]
    Window(String),
}

impl From<AuditError> for common::Error {
    fn from(err: AuditError) -> Self {
        common::Error::audit(err)
    }
}

/// Durable storage behind the audit log.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record. Returns only once the record is written.
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Visit every stored record, oldest first, without loading them all.
    async fn scan(
        &self,
        visit: &mut (dyn FnMut(AuditRecord) + Send),
    ) -> Result<(), AuditError>;

    /// Remove every record appended before `cutoff`. Appends may continue
    /// while the bulk of the work runs. Returns the number removed.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError>;

    /// Every stored record, oldest first.
    async fn load(&self) -> Result<Vec<AuditRecord>, AuditError> {
        let mut records = Vec::new();
        self.scan(&mut |record| records.push(record)).await?;
        Ok(records)
    }
}

/// JSON-lines journal on local disk.
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<File>,
    /// Serializes prune runs.
    pruning: tokio::sync::Mutex<()>,
    sync: bool,
}

impl JsonlSink {
    /// Open (or create) the journal for appending. With `sync`, every record
    /// is also `fdatasync`ed.
    pub async fn open(path: impl Into<PathBuf>, sync: bool) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = Self::open_append(&path).await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            pruning: tokio::sync::Mutex::new(()),
            sync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open_append(path: &Path) -> Result<File, AuditError> {
        Ok(OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?)
    }

    fn encode(record: &AuditRecord) -> Result<Vec<u8>, AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        Ok(line)
    }

    async fn open_read(&self) -> Result<Option<BufReader<File>>, AuditError> {
        match File::open(&self.path).await {
            Ok(file) => Ok(Some(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonlSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let line = Self::encode(record)?;
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        if self.sync {
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn scan(
        &self,
        visit: &mut (dyn FnMut(AuditRecord) + Send),
    ) -> Result<(), AuditError> {
        let Some(mut reader) = self.open_read().await? else {
            return Ok(());
        };
        let mut line = String::new();
        let mut number = 0usize;
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                break;
            }
            number += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditRecord>(line.trim_end()) {
                Ok(record) => visit(record),
                // Typically a torn final line after a crash.
                Err(e) => warn!(path = %self.path.display(), line = number, error = %e, "Skipping unreadable audit record"),
            }
        }
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let _pruning = self.pruning.lock().await;
        let Some(mut reader) = self.open_read().await? else {
            return Ok(0);
        };

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut tmp = File::create(&tmp_path).await?;
        let mut removed = 0usize;
        let mut copied_to = 0u64;
        let mut line = String::new();

        // Bulk pass, concurrent with appends. Stops before a line that is
        // still being written.
        loop {
            line.clear();
            let read = reader.read_line(&mut line).await?;
            if read == 0 || !line.ends_with('\n') {
                break;
            }
            copied_to += read as u64;
            match serde_json::from_str::<AuditRecord>(line.trim_end()) {
                Ok(record) if record.at < cutoff => removed += 1,
                Ok(_) => tmp.write_all(line.as_bytes()).await?,
                Err(_) if line.trim().is_empty() => {}
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Dropping unreadable audit record");
                }
            }
        }
        drop(reader);

        if removed == 0 {
            drop(tmp);
            tokio::fs::remove_file(&tmp_path).await?;
            return Ok(0);
        }

        // Appends are blocked only while the tail written since is copied.
        let mut file = self.file.lock().await;
        let mut source = File::open(&self.path).await?;
        source.seek(SeekFrom::Start(copied_to)).await?;
        tokio::io::copy(&mut source, &mut tmp).await?;
        tmp.flush().await?;
        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.path).await?;
        *file = Self::open_append(&self.path).await?;
        Ok(removed)
    }
}

/// Volatile sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<AuditRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AuditSink for MemorySink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.lock().push(record.clone());
        Ok(())
    }

    async fn scan(
        &self,
        visit: &mut (dyn FnMut(AuditRecord) + Send),
    ) -> Result<(), AuditError> {
        for record in self.records() {
            visit(record);
        }
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, AuditError> {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| r.at >= cutoff);
        Ok(before - records.len())
    }
}

/// Uptime over a window: successful primary checks over all primary checks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UptimeStats {
    pub total_checks: usize,
    pub successful_checks: usize,
    /// Percentage rounded to two decimals.
    pub uptime_percent: f64,
}

/// One row of a lab summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceUptime {
    pub device_id: DeviceId,
    pub label: String,
    pub phase: Phase,
    pub uptime: Option<UptimeStats>,
    pub latency: Option<LatencyStats>,
}

/// Parse a statistics window such as `1h`, `24h`, `7d` or `30d`.
pub fn parse_window(text: &str) -> Result<Duration, AuditError> {
    humantime::parse_duration(text.trim()).map_err(|_| AuditError::Window(text.to_string()))
}

fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Running uptime and latency totals of one device.
#[derive(Debug, Default)]
struct WindowTotals {
    total: usize,
    successful: usize,
    latency_count: usize,
    latency_sum: f64,
    latency_min: f64,
    latency_max: f64,
}

impl WindowTotals {
    fn add(&mut self, result: &CheckResult) {
        self.total += 1;
        if !result.success {
            return;
        }
        self.successful += 1;
        if let Some(ms) = result.latency_ms() {
            if self.latency_count == 0 {
                self.latency_min = ms;
                self.latency_max = ms;
            } else {
                self.latency_min = self.latency_min.min(ms);
                self.latency_max = self.latency_max.max(ms);
            }
            self.latency_count += 1;
            self.latency_sum += ms;
        }
    }

    fn uptime(&self) -> Option<UptimeStats> {
        if self.total == 0 {
            return None;
        }
        let percent = self.successful as f64 / self.total as f64 * 100.0;
        Some(UptimeStats {
            total_checks: self.total,
            successful_checks: self.successful,
            uptime_percent: (percent * 100.0).round() / 100.0,
        })
    }

    fn latency(&self) -> Option<LatencyStats> {
        (self.latency_count > 0).then(|| LatencyStats {
            min_ms: self.latency_min,
            max_ms: self.latency_max,
            mean_ms: self.latency_sum / self.latency_count as f64,
            count: self.latency_count,
        })
    }
}

/// The audit log: durable sink, in-memory history and live event feed.
///
/// Statistics are served from memory while the window fits in the retained
/// history and from the sink otherwise.
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    /// Next sequence number; held while one record is written.
    writer: tokio::sync::Mutex<u64>,
    history: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
    /// Older records exist in the sink than in `history`.
    truncated: AtomicBool,
    events: broadcast::Sender<AuditRecord>,
}

impl AuditLog {
    /// Empty log over `sink`, keeping at most `capacity` records in memory.
    pub fn new(sink: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sink,
            writer: tokio::sync::Mutex::new(1),
            history: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            truncated: AtomicBool::new(false),
            events,
        }
    }

    /// Volatile log, mostly for tests.
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(Arc::new(MemorySink::new()), capacity)
    }

    /// Open a log and replay what `sink` already holds. Only the newest
    /// `capacity` records are kept in memory.
    pub async fn open(sink: Arc<dyn AuditSink>, capacity: usize) -> Result<Self, AuditError> {
        let log = Self::new(sink, capacity);
        let capacity = log.capacity;
        let mut tail = VecDeque::new();
        let mut replayed = 0usize;
        let mut max_seq = 0u64;
        log.sink
            .scan(&mut |record| {
                replayed += 1;
                max_seq = max_seq.max(record.seq);
                if tail.len() == capacity {
                    tail.pop_front();
                }
                tail.push_back(record);
            })
            .await?;

        let next_seq = max_seq + 1;
        *log.writer.lock().await = next_seq;
        log.truncated.store(replayed > capacity, Ordering::Relaxed);
        *log.write_history() = tail;
        info!(records = replayed, next_seq, "Audit journal replayed");
        Ok(log)
    }

    /// Durably record one event. The record is visible to queries and
    /// subscribers only after the sink accepted it.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditRecord, AuditError> {
        let mut next_seq = self.writer.lock().await;
        let record = AuditRecord {
            seq: *next_seq,
            at: Utc::now(),
            event,
        };
        self.sink.append(&record).await?;
        *next_seq += 1;

        {
            let mut history = self.write_history();
            if history.len() == self.capacity {
                history.pop_front();
                self.truncated.store(true, Ordering::Relaxed);
            }
            history.push_back(record.clone());
        }
        drop(next_seq);

        // Nobody listening is fine.
        let _ = self.events.send(record.clone());
        Ok(record)
    }

    /// Live feed of appended records.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.events.subscribe()
    }

    /// The most recent `limit` transitions and healing records, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.read_history()
            .iter()
            .rev()
            .filter(|r| r.event.is_activity())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Recent activity of one device, newest first.
    pub fn recent_for(&self, device_id: &str, limit: usize) -> Vec<AuditRecord> {
        self.read_history()
            .iter()
            .rev()
            .filter(|r| r.event.is_activity() && r.event.device_id() == device_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Uptime of `device_id` over the trailing `window`.
    pub async fn uptime(
        &self,
        device_id: &str,
        window: Duration,
    ) -> Result<Option<UptimeStats>, AuditError> {
        self.uptime_since(device_id, window_start(Utc::now(), window))
            .await
    }

    pub async fn uptime_since(
        &self,
        device_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<UptimeStats>, AuditError> {
        let totals = self.totals_since(&[device_id], since).await?;
        Ok(totals.get(device_id).and_then(WindowTotals::uptime))
    }

    /// Latency of successful primary checks over the trailing `window`.
    pub async fn latency_stats(
        &self,
        device_id: &str,
        window: Duration,
    ) -> Result<Option<LatencyStats>, AuditError> {
        let since = window_start(Utc::now(), window);
        let totals = self.totals_since(&[device_id], since).await?;
        Ok(totals.get(device_id).and_then(WindowTotals::latency))
    }

    /// Uptime and latency of every published device of a lab, computed in a
    /// single pass.
    pub async fn lab_summary(
        &self,
        store: &StatusStore,
        lab_id: &str,
        window: Duration,
    ) -> Result<Vec<DeviceUptime>, AuditError> {
        let states = store.snapshot_lab(lab_id);
        let ids: Vec<&str> = states.iter().map(|s| s.device_id.as_str()).collect();
        let totals = self
            .totals_since(&ids, window_start(Utc::now(), window))
            .await?;

        Ok(states
            .iter()
            .map(|state| {
                let totals = totals.get(state.device_id.as_str());
                DeviceUptime {
                    uptime: totals.and_then(WindowTotals::uptime),
                    latency: totals.and_then(WindowTotals::latency),
                    device_id: state.device_id.clone(),
                    label: state.label.clone(),
                    phase: state.phase,
                }
            })
            .collect())
    }

    /// Primary-check totals of `devices` since `since`.
    async fn totals_since(
        &self,
        devices: &[&str],
        since: DateTime<Utc>,
    ) -> Result<HashMap<String, WindowTotals>, AuditError> {
        let mut totals: HashMap<String, WindowTotals> = HashMap::new();
        let mut add = |record: &AuditRecord| {
            if let Some(result) = record.event.primary_check() {
                if result.timestamp >= since && devices.iter().any(|id| *id == result.device_id) {
                    totals.entry(result.device_id.clone()).or_default().add(result);
                }
            }
        };

        if !self.history_covers(since, &mut add) {
            debug!(since = %since, "Statistics window exceeds in-memory history, scanning journal");
            self.sink.scan(&mut |record| add(&record)).await?;
        }
        Ok(totals)
    }

    /// Feed the in-memory history to `visit` when it holds every record
    /// relevant since `since`. Returns false without visiting otherwise.
    fn history_covers(&self, since: DateTime<Utc>, visit: &mut impl FnMut(&AuditRecord)) -> bool {
        let history = self.read_history();
        let complete = !self.truncated.load(Ordering::Relaxed)
            || history.front().is_some_and(|oldest| oldest.at < since);
        if complete {
            history.iter().for_each(visit);
        }
        complete
    }

    /// Drop every record older than `older_than` from the journal and from
    /// memory. Returns the number of journal records removed.
    pub async fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, AuditError> {
        let removed = self.sink.prune(older_than).await?;
        let kept = {
            let mut history = self.write_history();
            history.retain(|r| r.at >= older_than);
            history.len()
        };
        debug!(removed, kept, "Audit journal pruned");
        Ok(removed)
    }

    /// Apply a retention window relative to now.
    pub async fn prune_retention(&self, retention: Duration) -> Result<usize, AuditError> {
        self.prune(window_start(Utc::now(), retention)).await
    }

    /// Records currently held in memory.
    pub fn len(&self) -> usize {
        self.read_history().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_history().is_empty()
    }

    fn read_history(&self) -> std::sync::RwLockReadGuard<'_, VecDeque<AuditRecord>> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_history(&self) -> std::sync::RwLockWriteGuard<'_, VecDeque<AuditRecord>> {
        self.history
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
