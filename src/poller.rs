use anyhow::Result;
use log::warn;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

/// What a poll task wants the poller to do after a snapshot was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Continue,
    Finished,
}

/// Capability polled by [`ProgressPoller`]: fetch one status snapshot, fold
/// it into the task's state, and report whether the snapshot was terminal.
#[trait_variant::make(Send)]
pub trait PollTask {
    type Snapshot: Send;

    async fn fetch(&mut self) -> Result<Self::Snapshot>;

    fn apply(&mut self, snapshot: Self::Snapshot) -> PollOutcome;

    fn on_error(&mut self, err: anyhow::Error);
}

/// Interval-driven single-flight poll loop.
///
/// One fetch is issued per tick; a tick that fires while a fetch is still
/// outstanding is skipped, not queued, so snapshots are applied strictly in
/// fetch order. The first fetch happens one period after `start`. A fetch
/// error is reported to the task exactly once and ends the poll. `stop` is
/// idempotent; a response arriving after `stop` is discarded.
pub struct ProgressPoller {
    interval: Duration,
    active: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressPoller {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            active: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Begin polling with `task`. A no-op if this poller is already running:
    /// at most one timer and one in-flight request exist per instance.
    pub fn start<T>(&mut self, mut task: T)
    where
        T: PollTask + Send + 'static,
    {
        if self.is_active() {
            warn!("poller already running, start() ignored");
            return;
        }

        self.active.store(true, Ordering::SeqCst);
        let active = Arc::clone(&self.active);
        let period = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                match task.fetch().await {
                    Ok(snapshot) => {
                        // stopped while the request was in flight
                        if !active.load(Ordering::SeqCst) {
                            break;
                        }
                        if task.apply(snapshot) == PollOutcome::Finished {
                            active.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    Err(err) => {
                        if active.load(Ordering::SeqCst) {
                            task.on_error(err);
                        }
                        active.store(false, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }));
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop polling. Idempotent; no task callback runs after this returns.
    pub fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Wait until the poll loop ends: terminal snapshot, fetch error, or
    /// `stop`.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            // Err only when the task was aborted by stop()
            let _ = handle.await;
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ProgressPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
