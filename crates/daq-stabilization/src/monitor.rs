//! Background power sampling.
//!
//! A [`PowerMonitor`] owns one background task that reads a single analog
//! input of a shared connection at a fixed rate and appends each reading to a
//! time-windowed history. Readers take clone-on-read snapshots, so stability
//! computations never hold the history lock.
//!
//! Failed reads skip the tick: they are counted, never recorded as zero, and
//! never stop the task. The first failure of a run of failures is logged at
//! `warn`, then every [`FAILURE_LOG_INTERVAL`]th, and the recovery at `info`.

use crate::connection::HardwareConnection;
use daq_core::error::DaqError;
use daq_core::limits::{self, MONITOR_STOP_TIMEOUT};
use daq_core::pid::InputSource;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::Instrument;

/// Consecutive failed reads between two warnings.
pub const FAILURE_LOG_INTERVAL: u64 = 100;

/// One voltage reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerSample {
    /// When the reading completed
    pub timestamp: Instant,
    /// Measured voltage
    pub value: f64,
}

struct History {
    samples: VecDeque<PowerSample>,
    accepting: bool,
}

impl History {
    fn prune(&mut self, now: Instant, retention: Duration) {
        let Some(cutoff) = now.checked_sub(retention) else {
            return;
        };
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.timestamp < cutoff)
        {
            self.samples.pop_front();
        }
    }
}

struct MonitorTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic sampler for one input of a shared connection.
pub struct PowerMonitor {
    connection: Arc<HardwareConnection>,
    source: InputSource,
    retention: Duration,
    history: Arc<RwLock<History>>,
    skipped: Arc<AtomicU64>,
    task: Mutex<Option<MonitorTask>>,
}

impl PowerMonitor {
    /// Create a stopped monitor.
    pub fn new(
        connection: Arc<HardwareConnection>,
        source: InputSource,
        retention: Duration,
    ) -> Self {
        Self {
            connection,
            source,
            retention,
            history: Arc::new(RwLock::new(History {
                samples: VecDeque::new(),
                accepting: false,
            })),
            skipped: Arc::new(AtomicU64::new(0)),
            task: Mutex::new(None),
        }
    }

    /// Monitored input.
    pub fn source(&self) -> InputSource {
        self.source
    }

    /// Start sampling at `sample_rate_hz`.
    ///
    /// Clears any previous history. A no-op when already running. Must be
    /// called from within a Tokio runtime.
    pub fn start(&self, sample_rate_hz: f64) -> Result<(), DaqError> {
        let period = limits::sample_period(sample_rate_hz)?;
        let mut task = self.task.lock();
        if task.is_some() {
            tracing::debug!(source = %self.source, "Monitor already running");
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DaqError::InvalidState {
            operation: "start monitor",
            state: "outside a Tokio runtime".to_string(),
        })?;

        {
            let mut history = self.history.write();
            history.samples.clear();
            history.accepting = true;
        }
        self.skipped.store(0, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let span = tracing::info_span!("power_monitor", connection = %self.connection.identity());
        let handle = runtime.spawn(
            sample_loop(
                self.connection.clone(),
                self.source,
                period,
                self.retention,
                self.history.clone(),
                self.skipped.clone(),
                shutdown_rx,
            )
            .instrument(span),
        );
        *task = Some(MonitorTask { shutdown, handle });

        tracing::info!(
            connection = %self.connection.identity(),
            source = %self.source,
            sample_rate_hz,
            "Power monitor started"
        );
        Ok(())
    }

    /// Stop sampling and wait (bounded) for the task to exit.
    ///
    /// No sample is appended after this returns. A task that does not exit
    /// within [`MONITOR_STOP_TIMEOUT`] is aborted.
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        self.history.write().accepting = false;

        let Some(MonitorTask {
            shutdown,
            mut handle,
        }) = task
        else {
            return;
        };

        let _ = shutdown.send(true);
        match timeout(MONITOR_STOP_TIMEOUT, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                tracing::error!(source = %self.source, "Power monitor task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                tracing::warn!(
                    source = %self.source,
                    "Power monitor did not stop within {:?}, aborting",
                    MONITOR_STOP_TIMEOUT
                );
                handle.abort();
            }
        }
        tracing::info!(source = %self.source, samples = self.len(), "Power monitor stopped");
    }

    /// Whether the sampling task is running.
    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.history.read().samples.len()
    }

    /// Whether no samples are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent sample.
    pub fn latest(&self) -> Option<PowerSample> {
        self.history.read().samples.back().copied()
    }

    /// Copy of the retained history, oldest first.
    pub fn snapshot(&self) -> Vec<PowerSample> {
        self.history.read().samples.iter().copied().collect()
    }

    /// Ticks skipped because of a failed read since the last start.
    pub fn skipped_samples(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }
}

impl Drop for PowerMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.handle.abort();
        }
    }
}

impl std::fmt::Debug for PowerMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerMonitor")
            .field("connection", self.connection.identity())
            .field("source", &self.source)
            .field("running", &self.is_running())
            .field("samples", &self.len())
            .finish()
    }
}

async fn sample_loop(
    connection: Arc<HardwareConnection>,
    source: InputSource,
    period: Duration,
    retention: Duration,
    history: Arc<RwLock<History>>,
    skipped: Arc<AtomicU64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut failing: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        match connection.read_input(source).await {
            Ok(value) => {
                if failing > 0 {
                    tracing::info!(source = %source, failed = failing, "Sampling recovered");
                    failing = 0;
                }
                let now = Instant::now();
                let mut history = history.write();
                if !history.accepting {
                    break;
                }
                history.samples.push_back(PowerSample {
                    timestamp: now,
                    value,
                });
                history.prune(now, retention);
            }
            Err(e) => {
                let total = skipped.fetch_add(1, Ordering::SeqCst) + 1;
                failing += 1;
                if failing == 1 || failing % FAILURE_LOG_INTERVAL == 0 {
                    tracing::warn!(
                        source = %source,
                        consecutive = failing,
                        skipped = total,
                        "Skipping sample: {}",
                        e
                    );
                } else {
                    tracing::trace!(source = %source, consecutive = failing, "Read failed: {}", e);
                }
            }
        }
    }
    tracing::debug!(source = %source, "Sampling loop exited");
}
