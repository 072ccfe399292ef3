//! Health monitoring and metrics for a buffer channel

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Health metrics for a channel
///
/// All fields use atomic operations so the client thread, the component's
/// completion thread and the monitor can update and read them concurrently.
pub struct ChannelHealth {
    /// Work items submitted to the component
    pub works_queued: AtomicU64,

    /// Completions processed (delivered or not)
    pub works_completed: AtomicU64,

    /// Completions ignored because they were flushed, stale or omitted
    pub works_discarded: AtomicU64,

    /// Input buffers offered to the client
    pub input_buffers_offered: AtomicU64,

    /// Output buffers delivered to the client
    pub output_buffers_delivered: AtomicU64,

    /// Payload bytes submitted to the component
    pub bytes_queued: AtomicU64,

    /// Keepalive works queued while the pipeline looked paused
    pub keepalives: AtomicU64,

    /// Decrypt or descramble failures
    pub decrypt_failures: AtomicU64,

    /// Fatal errors reported to the session
    pub fatal_errors: AtomicU64,

    /// Timestamp (as Unix microseconds) of the last queued or completed work
    pub last_progress_time: AtomicU64,
}

impl ChannelHealth {
    pub fn new() -> Self {
        Self {
            works_queued: AtomicU64::new(0),
            works_completed: AtomicU64::new(0),
            works_discarded: AtomicU64::new(0),
            input_buffers_offered: AtomicU64::new(0),
            output_buffers_delivered: AtomicU64::new(0),
            bytes_queued: AtomicU64::new(0),
            keepalives: AtomicU64::new(0),
            decrypt_failures: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            last_progress_time: AtomicU64::new(now_micros()),
        }
    }

    fn touch(&self) {
        self.last_progress_time.store(now_micros(), Ordering::Relaxed);
    }

    pub fn record_work_queued(&self, bytes: usize) {
        self.touch();
        self.works_queued.fetch_add(1, Ordering::Relaxed);
        self.bytes_queued.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_work_completed(&self) {
        self.touch();
        self.works_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_discarded(&self) {
        self.works_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_input_offered(&self) {
        self.input_buffers_offered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_output_delivered(&self) {
        self.output_buffers_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_keepalive(&self) {
        self.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decrypt_failure(&self) {
        self.decrypt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fatal_error(&self) {
        self.fatal_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn works_queued(&self) -> u64 {
        self.works_queued.load(Ordering::Relaxed)
    }

    pub fn works_completed(&self) -> u64 {
        self.works_completed.load(Ordering::Relaxed)
    }

    pub fn works_discarded(&self) -> u64 {
        self.works_discarded.load(Ordering::Relaxed)
    }

    pub fn input_buffers_offered(&self) -> u64 {
        self.input_buffers_offered.load(Ordering::Relaxed)
    }

    pub fn output_buffers_delivered(&self) -> u64 {
        self.output_buffers_delivered.load(Ordering::Relaxed)
    }

    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued.load(Ordering::Relaxed)
    }

    pub fn keepalives(&self) -> u64 {
        self.keepalives.load(Ordering::Relaxed)
    }

    pub fn decrypt_failures(&self) -> u64 {
        self.decrypt_failures.load(Ordering::Relaxed)
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::Relaxed)
    }

    pub fn last_progress_time(&self) -> u64 {
        self.last_progress_time.load(Ordering::Relaxed)
    }

    /// Work items queued but not completed yet
    pub fn works_in_flight(&self) -> u64 {
        self.works_queued().saturating_sub(self.works_completed())
    }

    /// Share of completions that were discarded, as a percentage
    pub fn discard_rate(&self) -> f64 {
        let completed = self.works_completed();
        if completed == 0 {
            return 0.0;
        }
        (self.works_discarded() as f64 / completed as f64) * 100.0
    }

    /// Check if no work was queued or completed for the given duration
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        let elapsed_micros = now_micros().saturating_sub(self.last_progress_time());
        elapsed_micros > threshold.as_micros() as u64
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            works_queued: self.works_queued(),
            works_completed: self.works_completed(),
            works_discarded: self.works_discarded(),
            input_buffers_offered: self.input_buffers_offered(),
            output_buffers_delivered: self.output_buffers_delivered(),
            bytes_queued: self.bytes_queued(),
            keepalives: self.keepalives(),
            decrypt_failures: self.decrypt_failures(),
            fatal_errors: self.fatal_errors(),
            discard_rate: self.discard_rate(),
        }
    }
}

impl Default for ChannelHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone)]
pub struct HealthSummary {
    pub works_queued: u64,
    pub works_completed: u64,
    pub works_discarded: u64,
    pub input_buffers_offered: u64,
    pub output_buffers_delivered: u64,
    pub bytes_queued: u64,
    pub keepalives: u64,
    pub decrypt_failures: u64,
    pub fatal_errors: u64,
    pub discard_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} works queued, {} completed ({} discarded, {:.2}%), {} inputs offered, {} outputs delivered, {} bytes, {} keepalives, {} decrypt failures, {} fatal errors",
            self.works_queued,
            self.works_completed,
            self.works_discarded,
            self.discard_rate,
            self.input_buffers_offered,
            self.output_buffers_delivered,
            self.bytes_queued,
            self.keepalives,
            self.decrypt_failures,
            self.fatal_errors
        )
    }
}

/// Health alert types
#[derive(Debug, Clone)]
pub enum HealthAlert {
    /// Work is in flight but nothing moved for the threshold duration
    Stalled { duration: Duration, in_flight: u64 },

    /// High share of discarded completions
    HighDiscardRate { rate: f64 },

    /// New decrypt failures since the last check
    DecryptFailures { count: u64 },

    /// New fatal errors since the last check
    FatalErrors { count: u64 },
}

impl std::fmt::Display for HealthAlert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthAlert::Stalled {
                duration,
                in_flight,
            } => {
                write!(f, "Channel stalled for {:?} with {} works in flight", duration, in_flight)
            }
            HealthAlert::HighDiscardRate { rate } => {
                write!(f, "High discard rate: {:.2}%", rate)
            }
            HealthAlert::DecryptFailures { count } => {
                write!(f, "Decrypt failures: {}", count)
            }
            HealthAlert::FatalErrors { count } => {
                write!(f, "Fatal errors: {}", count)
            }
        }
    }
}

/// Health monitoring service
///
/// Periodically checks channel health and sends alerts when issues are detected.
pub struct HealthMonitor {
    health: Arc<ChannelHealth>,
    alert_tx: mpsc::Sender<HealthAlert>,
    check_interval: Duration,
    stall_threshold: Duration,
    discard_rate_threshold: f64,
}

impl HealthMonitor {
    pub fn new(health: Arc<ChannelHealth>, alert_tx: mpsc::Sender<HealthAlert>) -> Self {
        Self {
            health,
            alert_tx,
            check_interval: Duration::from_secs(5),
            stall_threshold: Duration::from_secs(5),
            discard_rate_threshold: 10.0, // 10% of completions
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn with_discard_rate_threshold(mut self, threshold: f64) -> Self {
        self.discard_rate_threshold = threshold;
        self
    }

    /// Run the health monitor until the alert receiver is dropped
    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.check_interval);
        let mut last_decrypt_failures = 0u64;
        let mut last_fatal_errors = 0u64;

        loop {
            interval.tick().await;
            if self.alert_tx.is_closed() {
                return;
            }

            let in_flight = self.health.works_in_flight();
            if in_flight > 0 && self.health.is_stalled(self.stall_threshold) {
                let _ = self
                    .alert_tx
                    .send(HealthAlert::Stalled {
                        duration: self.stall_threshold,
                        in_flight,
                    })
                    .await;
            }

            let rate = self.health.discard_rate();
            if rate > self.discard_rate_threshold {
                let _ = self
                    .alert_tx
                    .send(HealthAlert::HighDiscardRate { rate })
                    .await;
            }

            let decrypt_failures = self.health.decrypt_failures();
            if decrypt_failures > last_decrypt_failures {
                let _ = self
                    .alert_tx
                    .send(HealthAlert::DecryptFailures {
                        count: decrypt_failures - last_decrypt_failures,
                    })
                    .await;
                last_decrypt_failures = decrypt_failures;
            }

            let fatal_errors = self.health.fatal_errors();
            if fatal_errors > last_fatal_errors {
                let _ = self
                    .alert_tx
                    .send(HealthAlert::FatalErrors {
                        count: fatal_errors - last_fatal_errors,
                    })
                    .await;
                last_fatal_errors = fatal_errors;
            }
        }
    }
}
