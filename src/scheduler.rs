use backon::{BackoffBuilder, ExponentialBuilder};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::workers::{CycleReport, InboxError, InboxWorker};

/// First wait after a failed cycle
const FAILURE_MIN_DELAY: Duration = Duration::from_secs(60);
const FAILURE_MAX_DELAY: Duration = Duration::from_secs(30 * 60);

/// Snapshot of the monitor for the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub inbox_dir: PathBuf,
    pub interval_secs: u64,
    pub batch_size: usize,
    pub cycles_completed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct MonitorStats {
    cycles_completed: u64,
    last_run_at: Option<DateTime<Utc>>,
    last_report: Option<CycleReport>,
    last_error: Option<String>,
}

impl MonitorStats {
    fn record(&mut self, result: &Result<CycleReport, InboxError>) {
        self.cycles_completed += 1;
        self.last_run_at = Some(Utc::now());
        match result {
            Ok(report) => {
                self.last_report = Some(report.clone());
                self.last_error = None;
            }
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }
}

struct RunningTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Background inbox polling with an explicit start/stop lifecycle
///
/// One loop at most runs at a time. `stop` cancels the loop and waits a
/// bounded time for it to finish, aborting it if it does not.
#[derive(Clone)]
pub struct InboxMonitor {
    worker: InboxWorker,
    interval: Duration,
    stop_timeout: Duration,
    task: Arc<Mutex<Option<RunningTask>>>,
    stats: Arc<Mutex<MonitorStats>>,
}

impl InboxMonitor {
    pub fn new(worker: InboxWorker, interval: Duration, stop_timeout: Duration) -> Self {
        Self {
            worker,
            interval,
            stop_timeout,
            task: Arc::new(Mutex::new(None)),
            stats: Arc::new(Mutex::new(MonitorStats::default())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawn the polling loop; returns false if it was already running
    #[instrument(skip(self), fields(interval_secs = self.interval.as_secs()))]
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Inbox monitor already running");
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(
            self.worker.clone(),
            self.interval,
            Arc::clone(&self.stats),
            token.clone(),
        ));
        *task = Some(RunningTask { token, handle });

        info!(
            "Inbox monitor started on {} every {}s",
            self.worker.inbox_dir().display(),
            self.interval.as_secs()
        );
        true
    }

    /// Signal the loop to stop and wait for it, up to the stop timeout
    ///
    /// Returns false if the monitor was not running.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> bool {
        let running = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(RunningTask { token, mut handle }) = running else {
            debug!("Inbox monitor not running");
            return false;
        };

        token.cancel();
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(_) => info!("Inbox monitor stopped"),
            Err(_) => {
                warn!(
                    "Inbox monitor did not stop within {:?}, aborting",
                    self.stop_timeout
                );
                handle.abort();
            }
        }
        true
    }

    /// Run one cycle immediately, outside the loop
    pub async fn run_once(&self) -> Result<CycleReport, InboxError> {
        let result = self.worker.run_cycle().await;
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result);
        result
    }

    pub fn status(&self) -> MonitorStatus {
        let running = self.is_running();
        let stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        MonitorStatus {
            running,
            inbox_dir: self.worker.inbox_dir().to_path_buf(),
            interval_secs: self.interval.as_secs(),
            batch_size: self.worker.batch_size(),
            cycles_completed: stats.cycles_completed,
            last_run_at: stats.last_run_at,
            last_report: stats.last_report.clone(),
            last_error: stats.last_error.clone(),
        }
    }
}

fn failure_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(FAILURE_MIN_DELAY)
        .with_max_delay(FAILURE_MAX_DELAY)
        .with_factor(2.0)
        .with_max_times(8)
}

async fn poll_loop(
    worker: InboxWorker,
    interval: Duration,
    stats: Arc<Mutex<MonitorStats>>,
    token: CancellationToken,
) {
    let mut failures: Option<backon::ExponentialBackoff> = None;

    while !token.is_cancelled() {
        let result = worker.run_cycle().await;
        stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&result);

        let wait = match result {
            Ok(_) => {
                failures = None;
                interval
            }
            Err(e) => {
                let delay = failures
                    .get_or_insert_with(|| failure_backoff().build())
                    .next()
                    .unwrap_or(FAILURE_MAX_DELAY);
                error!("Inbox cycle failed, retrying in {:?}: {}", delay, e);
                delay
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    debug!("Inbox poll loop exited");
}
