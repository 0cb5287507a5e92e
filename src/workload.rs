use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::error::HarnessError;

/* ============================= CONFIG ============================= */

pub const COLLECT_TIMEOUT: Duration = Duration::from_secs(90);
pub const COLLECT_POLL: Duration = Duration::from_secs(3);

/* ============================= TYPES ============================= */

/// One workload run (tasked family) or one parsed producer log line
/// (stream family). `time` is monotonic seconds since the generator started.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadEntry {
    pub time: f64,
    pub request_count: u64,
    pub log: String,
    pub ok: bool,
}

/// A fixed-duration workload run; the generator schedules it repeatedly.
#[async_trait]
pub trait WorkloadTask: Send + Sync {
    async fn run_once(&self) -> WorkloadEntry;
}

/// A long-running producer whose log lines are polled and parsed into
/// entries. `fetch` may return already-seen entries; the cursor filters them.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn fetch(&self, since: Option<f64>) -> Result<Vec<WorkloadEntry>, HarnessError>;
}

/// Common surface of both generator families.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn start(&mut self);
    async fn stop(&mut self);
    async fn collect(
        &self,
        number: u64,
        start_time: Option<f64>,
    ) -> Result<Vec<WorkloadEntry>, HarnessError>;
    async fn recent_entries(&self, duration_secs: f64) -> Result<Vec<WorkloadEntry>, HarnessError>;
    /// Monotonic seconds since the generator was created.
    fn now(&self) -> f64;
}

/* ============================= SHARED HELPERS ============================= */

/// Index of the first entry with `time >= start_time`. History is ordered by
/// `time`, so this is a binary search over a stable prefix.
fn start_index(entries: &[WorkloadEntry], start_time: f64) -> usize {
    entries.partition_point(|e| e.time < start_time)
}

fn check_window(now: f64, start_time: f64, timeout: Duration) -> Result<(), HarnessError> {
    if start_time > now {
        return Err(HarnessError::Workload(
            "start_time cannot be in the future".into(),
        ));
    }
    if now - start_time > timeout.as_secs_f64() {
        return Err(HarnessError::Workload(
            "start_time is too far in the past".into(),
        ));
    }
    Ok(())
}

async fn collect_loop<F>(
    history: &Mutex<Vec<WorkloadEntry>>,
    number: u64,
    start_time: f64,
    timeout: Duration,
    poll: Duration,
    now: impl Fn() -> f64,
    mut refresh: F,
) -> Result<Vec<WorkloadEntry>, HarnessError>
where
    F: AsyncFnMut() -> Result<(), HarnessError>,
{
    if number == 0 {
        return Ok(Vec::new());
    }

    loop {
        refresh().await?;
        {
            let entries = history.lock().await;
            let start = start_index(&entries, start_time);
            let accumulated: u64 = entries[start..].iter().map(|e| e.request_count).sum();
            if accumulated >= number {
                return Ok(entries[start..].to_vec());
            }
        }
        if now() - start_time >= timeout.as_secs_f64() {
            return Err(HarnessError::CollectTimeout(timeout));
        }
        sleep(poll).await;
    }
}

/* ============================= TASKED FAMILY ============================= */

/// Repeats a fixed-duration workload run on a background task, appending one
/// entry per run stamped with the run's start time.
pub struct TaskedWorkload {
    origin: Instant,
    history: Arc<Mutex<Vec<WorkloadEntry>>>,
    task: Arc<dyn WorkloadTask>,
    shutdown: broadcast::Sender<()>,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
    poll: Duration,
}

impl TaskedWorkload {
    pub fn new(task: Arc<dyn WorkloadTask>) -> Self {
        Self::with_timing(task, COLLECT_TIMEOUT, COLLECT_POLL)
    }

    pub fn with_timing(task: Arc<dyn WorkloadTask>, timeout: Duration, poll: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            origin: Instant::now(),
            history: Arc::new(Mutex::new(Vec::new())),
            task,
            shutdown,
            worker: None,
            timeout,
            poll,
        }
    }
}

#[async_trait]
impl Workload for TaskedWorkload {
    async fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        let task = self.task.clone();
        let history = self.history.clone();
        let origin = self.origin;

        self.worker = Some(tokio::spawn(async move {
            info!("workload_generator_started");
            loop {
                let run_start = origin.elapsed().as_secs_f64();
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("workload_generator_stopped");
                        return;
                    }
                    mut entry = task.run_once() => {
                        entry.time = run_start;
                        history.lock().await.push(entry);
                    }
                }
            }
        }));
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    async fn collect(
        &self,
        number: u64,
        start_time: Option<f64>,
    ) -> Result<Vec<WorkloadEntry>, HarnessError> {
        let now = self.now();
        let start_time = start_time.unwrap_or(now);
        check_window(now, start_time, self.timeout)?;
        collect_loop(
            &self.history,
            number,
            start_time,
            self.timeout,
            self.poll,
            || self.origin.elapsed().as_secs_f64(),
            async || Ok(()),
        )
        .await
    }

    async fn recent_entries(&self, duration_secs: f64) -> Result<Vec<WorkloadEntry>, HarnessError> {
        if duration_secs <= 0.0 {
            return Ok(Vec::new());
        }
        let start_time = self.now() - duration_secs;
        let entries = self.history.lock().await;
        let start = start_index(&entries, start_time);
        Ok(entries[start..].to_vec())
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/* ============================= STREAM FAMILY ============================= */

/// Cursor-based reader over a long-running producer. Extraction skips
/// entries at or before `last_log_time` so repeated polls never double-ingest.
pub struct StreamWorkload {
    origin: Instant,
    history: Arc<Mutex<Vec<WorkloadEntry>>>,
    source: Arc<dyn LogSource>,
    last_log_time: Arc<Mutex<Option<f64>>>,
    shutdown: broadcast::Sender<()>,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
    poll: Duration,
}

impl StreamWorkload {
    pub fn new(source: Arc<dyn LogSource>) -> Self {
        Self::with_timing(source, COLLECT_TIMEOUT, COLLECT_POLL)
    }

    pub fn with_timing(source: Arc<dyn LogSource>, timeout: Duration, poll: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            origin: Instant::now(),
            history: Arc::new(Mutex::new(Vec::new())),
            source,
            last_log_time: Arc::new(Mutex::new(None)),
            shutdown,
            worker: None,
            timeout,
            poll,
        }
    }

    /// Pull new producer output into the history, advancing the cursor.
    pub async fn extract(&self) -> Result<(), HarnessError> {
        extract_into(&self.source, &self.history, &self.last_log_time).await
    }
}

async fn extract_into(
    source: &Arc<dyn LogSource>,
    history: &Arc<Mutex<Vec<WorkloadEntry>>>,
    last_log_time: &Arc<Mutex<Option<f64>>>,
) -> Result<(), HarnessError> {
    // The producer may cap each response, so drain until nothing new arrives.
    loop {
        let since = *last_log_time.lock().await;
        let new_logs = source.fetch(since).await?;
        if new_logs.is_empty() {
            return Ok(());
        }

        if new_logs.windows(2).any(|w| w[1].time < w[0].time) {
            return Err(HarnessError::Workload(
                "producer log entries are not ordered by time".into(),
            ));
        }

        let cutoff = since.unwrap_or(f64::NEG_INFINITY);
        let fresh: Vec<WorkloadEntry> =
            new_logs.into_iter().filter(|e| e.time > cutoff).collect();
        if fresh.is_empty() {
            return Ok(());
        }

        let newest = fresh.iter().map(|e| e.time).fold(cutoff, f64::max);
        history.lock().await.extend(fresh);
        *last_log_time.lock().await = Some(newest);
    }
}

#[async_trait]
impl Workload for StreamWorkload {
    async fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let mut shutdown = self.shutdown.subscribe();
        let source = self.source.clone();
        let history = self.history.clone();
        let last_log_time = self.last_log_time.clone();
        let poll = self.poll;

        self.worker = Some(tokio::spawn(async move {
            info!("stream_reader_started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!("stream_reader_stopped");
                        return;
                    }
                    _ = sleep(poll) => {
                        if let Err(e) = extract_into(&source, &history, &last_log_time).await {
                            warn!(error = %e, "stream_extract_failed");
                        }
                    }
                }
            }
        }));
    }

    async fn stop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }

    async fn collect(
        &self,
        number: u64,
        start_time: Option<f64>,
    ) -> Result<Vec<WorkloadEntry>, HarnessError> {
        let now = self.now();
        let start_time = start_time.unwrap_or(now);
        check_window(now, start_time, self.timeout)?;
        collect_loop(
            &self.history,
            number,
            start_time,
            self.timeout,
            self.poll,
            || self.origin.elapsed().as_secs_f64(),
            async || self.extract().await,
        )
        .await
    }

    async fn recent_entries(&self, duration_secs: f64) -> Result<Vec<WorkloadEntry>, HarnessError> {
        if duration_secs <= 0.0 {
            return Ok(Vec::new());
        }
        self.extract().await?;
        let start_time = self.now() - duration_secs;
        let entries = self.history.lock().await;
        let start = start_index(&entries, start_time);
        Ok(entries[start..].to_vec())
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

/* ============================= TESTS ============================= */
