//! Aggregate download progress across concurrent blob fetchers.
//!
//! Byte counts arrive from every fetcher on the hot path, so accounting is
//! two-tier: chunks land in a `pending` counter behind its own short-held
//! mutex and are only folded into the main counters once a batch threshold
//! is reached. A periodic task drains stragglers and emits the progress
//! line consumed by the wrapping launcher.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use super::constants::PROGRESS_BATCH_BYTES;

/// Interval between periodic drains.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum spacing between emitted progress lines.
const LOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Counters {
    total_bytes_expected: u64,
    total_bytes_downloaded: u64,
    completed_files: usize,
    last_log: Option<Instant>,
}

/// Tracks bytes and files across concurrent downloads with batched updates.
#[derive(Debug)]
pub struct ProgressTracker {
    total_files: usize,
    start_time: Instant,
    counters: Mutex<Counters>,
    pending_bytes: Mutex<u64>,
    shutdown: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressTracker {
    /// Creates the tracker and launches its periodic drain/log task.
    #[must_use]
    pub fn new(total_files: usize) -> Arc<Self> {
        let tracker = Arc::new(Self {
            total_files,
            start_time: Instant::now(),
            counters: Mutex::new(Counters {
                total_bytes_expected: 0,
                total_bytes_downloaded: 0,
                completed_files: 0,
                last_log: None,
            }),
            pending_bytes: Mutex::new(0),
            shutdown: Notify::new(),
            task: Mutex::new(None),
        });

        let worker = Arc::clone(&tracker);
        let handle = tokio::spawn(async move { worker.run_periodic().await });
        // The lock is uncontended here; the task slot is only filled once.
        if let Ok(mut slot) = tracker.task.try_lock() {
            *slot = Some(handle);
        }
        tracker
    }

    /// Registers a blob's expected size (from `Content-Length`).
    pub async fn add_expected(&self, bytes: u64) {
        let mut counters = self.counters.lock().await;
        counters.total_bytes_expected += bytes;
    }

    /// Records downloaded bytes on the batched fast path.
    ///
    /// The main counter mutex is only touched once at least
    /// [`PROGRESS_BATCH_BYTES`] have accumulated.
    pub async fn update_progress(&self, bytes: u64) {
        let mut pending = self.pending_bytes.lock().await;
        *pending += bytes;
        if *pending >= PROGRESS_BATCH_BYTES {
            let batch = std::mem::take(&mut *pending);
            drop(pending);
            let mut counters = self.counters.lock().await;
            counters.total_bytes_downloaded += batch;
        }
    }

    /// Marks one blob as fully installed and emits a progress line.
    ///
    /// Pending bytes are folded in first so the line reflects the blob that
    /// just finished.
    pub async fn complete_file(&self) {
        self.drain_pending().await;
        let mut counters = self.counters.lock().await;
        counters.completed_files += 1;
        self.log_line(&mut counters);
    }

    /// Stops the periodic task, draining pending bytes one final time.
    ///
    /// Must be awaited before the tracker is discarded so the task observes
    /// the shutdown signal.
    pub async fn cleanup(&self) {
        self.shutdown.notify_one();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Bytes drained into the main counter so far.
    pub async fn downloaded_bytes(&self) -> u64 {
        self.counters.lock().await.total_bytes_downloaded
    }

    /// Bytes still waiting in the batch tier.
    pub async fn pending(&self) -> u64 {
        *self.pending_bytes.lock().await
    }

    /// Completed file count.
    pub async fn completed(&self) -> usize {
        self.counters.lock().await.completed_files
    }

    /// Current percentage: byte-based when sizes are known, else file-based.
    pub async fn percentage(&self) -> f64 {
        let counters = self.counters.lock().await;
        Self::percentage_of(&counters, self.total_files)
    }

    async fn run_periodic(&self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_pending().await;
                    let mut counters = self.counters.lock().await;
                    let due = counters
                        .last_log
                        .is_none_or(|at| at.elapsed() >= LOG_INTERVAL);
                    if due {
                        self.log_line(&mut counters);
                    }
                }
                () = self.shutdown.notified() => {
                    self.drain_pending().await;
                    break;
                }
            }
        }
    }

    async fn drain_pending(&self) {
        let mut pending = self.pending_bytes.lock().await;
        if *pending == 0 {
            return;
        }
        let batch = std::mem::take(&mut *pending);
        drop(pending);
        let mut counters = self.counters.lock().await;
        counters.total_bytes_downloaded += batch;
    }

    fn log_line(&self, counters: &mut Counters) {
        counters.last_log = Some(Instant::now());
        let elapsed = self.start_time.elapsed().as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let speed_mbps = if elapsed > 0.0 {
            (counters.total_bytes_downloaded as f64 / (1024.0 * 1024.0)) / elapsed
        } else {
            0.0
        };
        let percentage = Self::percentage_of(counters, self.total_files);
        info!(
            "[CRYPTOAGENTS_LOGGER] [MODEL_INSTALL] --progress {percentage:.1}% ({}/{} files) --speed {speed_mbps:.2} MB/s",
            counters.completed_files, self.total_files
        );
    }

    #[allow(clippy::cast_precision_loss)]
    fn percentage_of(counters: &Counters, total_files: usize) -> f64 {
        if counters.total_bytes_expected > 0 {
            let pct = (counters.total_bytes_downloaded as f64
                / counters.total_bytes_expected as f64)
                * 100.0;
            pct.min(100.0)
        } else if total_files > 0 {
            (counters.completed_files as f64 / total_files as f64) * 100.0
        } else {
            0.0
        }
    }
}
