//! Periodic collection jobs.
//!
//! Every registered provider gets its own task and its own timer, so a slow
//! or failing vendor never delays another provider. On each tick the
//! provider is collected and its metrics are reconciled into the registry.
//! A failed poll leaves the previously published values in place; the next
//! tick is the only retry.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = Arc::new(MetricRegistry::new());
//! let mut scheduler = Scheduler::new(Arc::clone(&registry));
//! scheduler.register(aws, Duration::from_secs(5400), Duration::from_secs(10))?;
//! scheduler.start()?;
//! // ... serve registry.read_all() ...
//! scheduler.shutdown().await?;
//! ```

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::providers::{CostProvider, PollResult};
use crate::registry::{Measurement, MetricRegistry, RegistryError};

/// Scheduler errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler is already running.
    #[error("Scheduler already running")]
    AlreadyRunning,

    /// Scheduler is not running.
    #[error("Scheduler not running")]
    NotRunning,

    /// A provider with the same name is already registered.
    #[error("Provider already registered: {0}")]
    DuplicateJob(String),

    /// Interval must be non-zero and at most [`MAX_PERIOD`].
    #[error("Invalid interval for {0}: must be between 1s and one year")]
    InvalidInterval(String),

    /// Initial delay must be at most [`MAX_PERIOD`].
    #[error("Invalid initial delay for {0}: must be at most one year")]
    InvalidDelay(String),
}

/// Longest interval or initial delay a job accepts.
pub const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// What happened during one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Provider is disabled.
    Skipped,
    /// Fresh data was reconciled into this many metrics.
    Reconciled { metrics: usize },
    /// Some metrics were reconciled; `failed` metrics kept their values.
    Partial { metrics: usize, failed: usize },
    /// Vendor call failed, registry untouched.
    Failed,
    /// Registry was closed before the results could be stored.
    Dropped,
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    #[default]
    Idle,
    Running,
}

/// Observable status of one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobStatus {
    /// Provider name.
    pub provider: String,
    /// Current state.
    pub state: JobState,
    /// Completed poll cycles, any outcome.
    pub runs: u64,
    /// Poll cycles in which the provider, or one of its metrics, failed.
    pub failures: u64,
    /// End of the last poll that reconciled fresh data.
    pub last_success: Option<DateTime<Utc>>,
}

type SharedStatus = Arc<Mutex<JobStatus>>;

struct Job {
    provider: Arc<dyn CostProvider>,
    interval: Duration,
    initial_delay: Duration,
    status: SharedStatus,
}

/// Runs each provider on its own fixed interval.
pub struct Scheduler {
    registry: Arc<MetricRegistry>,
    jobs: Vec<Job>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    running: bool,
}

impl Scheduler {
    /// Create a scheduler writing into `registry`.
    #[must_use]
    pub fn new(registry: Arc<MetricRegistry>) -> Self {
        Self {
            registry,
            jobs: Vec::new(),
            cancel: CancellationToken::new(),
            handles: Vec::new(),
            running: false,
        }
    }

    /// Register a provider to poll every `interval`, first after `initial_delay`.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler already started, the name is taken,
    /// or the interval or delay is out of range.
    pub fn register(
        &mut self,
        provider: Arc<dyn CostProvider>,
        interval: Duration,
        initial_delay: Duration,
    ) -> Result<(), SchedulerError> {
        if self.running {
            return Err(SchedulerError::AlreadyRunning);
        }
        let name = provider.name();
        if interval.is_zero() || interval > MAX_PERIOD {
            return Err(SchedulerError::InvalidInterval(name.to_string()));
        }
        if initial_delay > MAX_PERIOD {
            return Err(SchedulerError::InvalidDelay(name.to_string()));
        }
        if self.jobs.iter().any(|j| j.provider.name() == name) {
            return Err(SchedulerError::DuplicateJob(name.to_string()));
        }

        info!(
            provider = name,
            enabled = provider.is_enabled(),
            interval_secs = interval.as_secs(),
            initial_delay_secs = initial_delay.as_secs(),
            "Registered provider job"
        );
        self.jobs.push(Job {
            provider,
            interval,
            initial_delay,
            status: Arc::new(Mutex::new(JobStatus {
                provider: name.to_string(),
                ..JobStatus::default()
            })),
        });
        Ok(())
    }

    /// Spawn one background task per registered provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is already running.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.running {
            return Err(SchedulerError::AlreadyRunning);
        }

        self.cancel = CancellationToken::new();
        for job in &self.jobs {
            let provider = Arc::clone(&job.provider);
            let status = Arc::clone(&job.status);
            let registry = Arc::clone(&self.registry);
            let cancel = self.cancel.clone();
            let (interval, initial_delay) = (job.interval, job.initial_delay);
            self.handles.push(tokio::spawn(async move {
                run_job(provider, registry, status, interval, initial_delay, cancel).await;
            }));
        }
        self.running = true;

        info!(jobs = self.jobs.len(), "Scheduler started");
        Ok(())
    }

    /// Stop scheduling new polls and wait for in-flight polls to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the scheduler is not running.
    pub async fn shutdown(&mut self) -> Result<(), SchedulerError> {
        if !self.running {
            return Err(SchedulerError::NotRunning);
        }

        info!("Stopping scheduler, draining in-flight polls");
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Provider job task failed");
            }
        }
        self.running = false;

        info!("Scheduler stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Status of every job, in registration order.
    #[must_use]
    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|j| j.status.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .collect()
    }
}

async fn run_job(
    provider: Arc<dyn CostProvider>,
    registry: Arc<MetricRegistry>,
    status: SharedStatus,
    interval: Duration,
    initial_delay: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + initial_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(provider = provider.name(), "Job cancelled");
                break;
            }
            _ = ticker.tick() => {}
        }

        update(&status, |s| s.state = JobState::Running);
        // Cancellation is only observed between polls, so a poll that has
        // started always runs to completion.
        let outcome = AssertUnwindSafe(poll_provider(provider.as_ref(), &registry))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                error!(provider = provider.name(), "Provider poll panicked");
                PollOutcome::Failed
            });
        update(&status, |s| {
            s.state = JobState::Idle;
            s.runs += 1;
            match outcome {
                PollOutcome::Failed => s.failures += 1,
                PollOutcome::Reconciled { .. } => s.last_success = Some(Utc::now()),
                PollOutcome::Partial { .. } => {
                    s.failures += 1;
                    s.last_success = Some(Utc::now());
                }
                PollOutcome::Skipped | PollOutcome::Dropped => {}
            }
        });
    }
}

fn update(status: &SharedStatus, f: impl FnOnce(&mut JobStatus)) {
    f(&mut status.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Collect one provider and reconcile its metrics.
///
/// Every metric the provider owns is reconciled, including the ones it
/// reported nothing for, so vanished label sets are cleared. A failed or
/// skipped poll never touches the registry, and a metric that failed on its
/// own keeps its previous values.
pub async fn poll_provider(provider: &dyn CostProvider, registry: &MetricRegistry) -> PollOutcome {
    let (measurements, failed) = match provider.collect().await {
        PollResult::Skipped => return PollOutcome::Skipped,
        PollResult::Failed(e) => {
            warn!(
                provider = provider.name(),
                error = %e,
                "Poll failed, keeping previously published values"
            );
            return PollOutcome::Failed;
        }
        PollResult::Collected(measurements) => (measurements, HashSet::new()),
        PollResult::Partial {
            measurements,
            failed,
        } => {
            warn!(
                provider = provider.name(),
                failed = ?failed,
                "Some metrics failed, keeping their previously published values"
            );
            (measurements, failed.into_iter().collect())
        }
    };

    let owned: HashSet<String> = provider
        .metrics()
        .into_iter()
        .map(|d| d.name)
        .filter(|name| !failed.contains(name))
        .collect();
    let mut grouped: BTreeMap<String, Vec<Measurement>> =
        owned.iter().map(|name| (name.clone(), Vec::new())).collect();
    for m in measurements {
        if failed.contains(&m.metric) {
            continue;
        }
        if !owned.contains(&m.metric) {
            debug!(provider = provider.name(), metric = %m.metric, "Measurement for undeclared metric");
        }
        grouped.entry(m.metric.clone()).or_default().push(m);
    }

    for (metric, batch) in &grouped {
        match registry.reconcile(metric, batch) {
            Ok(_) => {}
            Err(RegistryError::Closed) => {
                debug!(provider = provider.name(), "Registry closed, dropping poll results");
                return PollOutcome::Dropped;
            }
            Err(e) => {
                warn!(provider = provider.name(), metric = %metric, error = %e, "Failed to reconcile metric");
            }
        }
    }

    if failed.is_empty() {
        PollOutcome::Reconciled {
            metrics: grouped.len(),
        }
    } else {
        PollOutcome::Partial {
            metrics: grouped.len(),
            failed: failed.len(),
        }
    }
}
