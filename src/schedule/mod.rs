//! Periodic job scheduling
//!
//! A clock-injectable dispatcher. Each registered job has a period, a
//! jitter fraction and an async handler. Ticks for a job whose previous
//! run is still in flight are skipped and counted. Shutdown flows through
//! a watch-channel token that every handler observes at its suspension
//! points.

use crate::error::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Injectable wall clock
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.write() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.write() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read()
    }
}

/// Cooperative cancellation token cloned into every job handler.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is signalled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owning side of the shutdown signal.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
    token: ShutdownToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx,
            token: ShutdownToken { rx },
        }
    }

    pub fn token(&self) -> ShutdownToken {
        self.token.clone()
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

pub type JobHandler =
    Arc<dyn Fn(ShutdownToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct JobSpec {
    pub name: String,
    pub period: Duration,
    /// Fraction of the period each tick is shifted by, uniformly in
    /// `[-jitter, +jitter]`
    pub jitter: f64,
    /// Fire once right after registration instead of waiting one period
    pub immediate: bool,
    pub handler: JobHandler,
}

pub struct Scheduler {
    token: ShutdownToken,
    jobs: Vec<JoinHandle<()>>,
    skipped: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(token: ShutdownToken) -> Self {
        Self {
            token,
            jobs: Vec::new(),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Ticks skipped because the previous run of a job was still going.
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn register(&mut self, spec: JobSpec) {
        let token = self.token.clone();
        let skipped = self.skipped.clone();

        let handle = tokio::spawn(async move {
            let mut current: Option<JoinHandle<()>> = None;
            let mut first = true;

            loop {
                let delay = if first && spec.immediate {
                    Duration::ZERO
                } else {
                    jittered(spec.period, spec.jitter)
                };
                first = false;

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                // Coalesce: a tick while the previous run is in flight is
                // dropped, not queued.
                if let Some(handle) = &current {
                    if !handle.is_finished() {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        debug!(job = %spec.name, "tick skipped, previous run in flight");
                        continue;
                    }
                }

                let fut = (spec.handler)(token.clone());
                let name = spec.name.clone();
                current = Some(tokio::spawn(async move {
                    if let Err(e) = fut.await {
                        warn!(job = %name, error = %e, kind = e.kind(), "job tick failed");
                    }
                }));
            }

            // Cancellation was signalled; wait for the in-flight run,
            // which observes the same token.
            if let Some(handle) = current.take() {
                let _ = handle.await;
            }
        });
        self.jobs.push(handle);
    }

    /// Wait for every job loop to finish after shutdown, up to `grace`.
    /// Returns false if the grace period expired with tasks still alive.
    pub async fn join(self, grace: Duration) -> bool {
        let all = futures::future::join_all(self.jobs);
        tokio::time::timeout(grace, all).await.is_ok()
    }
}

fn jittered(period: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return period;
    }
    let shift = 1.0 + jitter.min(1.0) * (rand::random::<f64>() * 2.0 - 1.0);
    period.mul_f64(shift.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(
        name: &str,
        period: Duration,
        counter: Arc<AtomicUsize>,
        hold: Duration,
    ) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            period,
            jitter: 0.0,
            immediate: false,
            handler: Arc::new(move |_token| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(hold).await;
                    Ok(())
                })
            }),
        }
    }

    #[tokio::test]
    async fn job_fires_periodically() {
        let handle = ShutdownHandle::new();
        let mut scheduler = Scheduler::new(handle.token());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_job(
            "tick",
            Duration::from_millis(20),
            counter.clone(),
            Duration::ZERO,
        ));

        tokio::time::sleep(Duration::from_millis(130)).await;
        handle.shutdown();
        assert!(scheduler.join(Duration::from_secs(1)).await);
        let fired = counter.load(Ordering::Relaxed);
        assert!(fired >= 3, "expected >= 3 ticks, got {}", fired);
    }

    #[tokio::test]
    async fn overlapping_ticks_are_coalesced() {
        let handle = ShutdownHandle::new();
        let mut scheduler = Scheduler::new(handle.token());
        let counter = Arc::new(AtomicUsize::new(0));
        // Handler runs much longer than the period, so most ticks skip.
        scheduler.register(counting_job(
            "slow",
            Duration::from_millis(10),
            counter.clone(),
            Duration::from_millis(120),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.shutdown();
        let skipped = scheduler.skipped_ticks();
        assert!(scheduler.join(Duration::from_secs(1)).await);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(skipped > 0);
    }

    #[tokio::test]
    async fn immediate_job_fires_without_waiting() {
        let handle = ShutdownHandle::new();
        let mut scheduler = Scheduler::new(handle.token());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut spec = counting_job(
            "now",
            Duration::from_secs(3600),
            counter.clone(),
            Duration::ZERO,
        );
        spec.immediate = true;
        scheduler.register(spec);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();
        assert!(scheduler.join(Duration::from_secs(1)).await);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_ticks() {
        let handle = ShutdownHandle::new();
        let mut scheduler = Scheduler::new(handle.token());
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(counting_job(
            "never",
            Duration::from_secs(3600),
            counter.clone(),
            Duration::ZERO,
        ));

        handle.shutdown();
        assert!(scheduler.join(Duration::from_secs(1)).await);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn handler_observes_cancellation() {
        let handle = ShutdownHandle::new();
        let mut scheduler = Scheduler::new(handle.token());
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_clone = finished.clone();
        scheduler.register(JobSpec {
            name: "cooperative".into(),
            period: Duration::from_millis(10),
            jitter: 0.0,
            immediate: true,
            handler: Arc::new(move |token| {
                let finished = finished_clone.clone();
                Box::pin(async move {
                    token.cancelled().await;
                    finished.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                })
            }),
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown();
        assert!(scheduler.join(Duration::from_secs(1)).await);
        assert_eq!(finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(Utc::now());
        let before = clock.now();
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now() - before, chrono::Duration::minutes(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let period = Duration::from_secs(100);
        for _ in 0..100 {
            let d = jittered(period, 0.1);
            assert!(d >= Duration::from_secs(90) && d <= Duration::from_secs(110));
        }
        assert_eq!(jittered(period, 0.0), period);
    }
}
