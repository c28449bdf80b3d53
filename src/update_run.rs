use crate::{
    poller::{PollOutcome, PollTask, ProgressPoller},
    state::{StateHandle, Transition},
    timeline::Timeline,
    update_service_client::{UpdateProgress, UpdateRunStatus, UpdateServiceClient},
};
use anyhow::Result;
use log::debug;
use std::{sync::Arc, time::Duration};

/// Drives one update run.
///
/// The activation request is fire-and-forget: the run is observed through
/// progress polling whether or not that request lands, and a failed
/// activation surfaces, if at all, through the poll error path. The server's
/// cumulative run log is flushed incrementally against an offset cursor that
/// starts at zero for every run.
pub struct UpdateCoordinator<C> {
    client: Arc<C>,
    timeline: Timeline,
    state: StateHandle,
    poll_interval: Duration,
}

impl<C> UpdateCoordinator<C>
where
    C: UpdateServiceClient + Send + Sync + 'static,
{
    pub fn new(
        client: Arc<C>,
        timeline: Timeline,
        state: StateHandle,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            timeline,
            state,
            poll_interval,
        }
    }

    pub async fn start_update(&self) -> Result<()> {
        debug!("start_update() called");

        self.timeline.append("Starting update...");

        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            if let Err(e) = client.start_update().await {
                debug!("update activation request failed: {e:#}");
            }
        });

        let mut poller = ProgressPoller::new(self.poll_interval);
        poller.start(RunWatch {
            client: Arc::clone(&self.client),
            timeline: self.timeline.clone(),
            state: self.state.clone(),
            cursor: 0,
        });
        poller.join().await;

        Ok(())
    }
}

/// Poll task over the update-status endpoint.
struct RunWatch<C> {
    client: Arc<C>,
    timeline: Timeline,
    state: StateHandle,
    cursor: usize,
}

impl<C> RunWatch<C> {
    /// Append the not-yet-seen tail of the cumulative log and advance the
    /// cursor. Never re-appends an already-seen range.
    fn flush_new(&mut self, log: &str) {
        if log.len() < self.cursor || !log.is_char_boundary(self.cursor) {
            // the server restarted the run with a fresh log
            self.cursor = 0;
        }
        let new = &log[self.cursor..];
        if !new.is_empty() {
            self.timeline.append(new);
        }
        self.cursor = log.len();
    }
}

impl<C> PollTask for RunWatch<C>
where
    C: UpdateServiceClient + Send + Sync,
{
    type Snapshot = UpdateProgress;

    async fn fetch(&mut self) -> Result<UpdateProgress> {
        self.client.update_progress().await
    }

    fn apply(&mut self, snapshot: UpdateProgress) -> PollOutcome {
        match snapshot.status {
            UpdateRunStatus::Extracting => {
                // not edge-triggered: the estimate is worth a line per tick
                self.timeline.append(&format!(
                    "Extracting bundle - approximately {}% complete.",
                    snapshot.percent
                ));
                PollOutcome::Continue
            }
            UpdateRunStatus::Running => {
                self.flush_new(&snapshot.log);
                PollOutcome::Continue
            }
            UpdateRunStatus::Complete | UpdateRunStatus::Error => {
                self.flush_new(&snapshot.log);
                self.timeline.append(&format!("Update {}.", snapshot.status));
                self.state.apply(Transition::UpdateFinished);
                PollOutcome::Finished
            }
            UpdateRunStatus::Unknown => PollOutcome::Continue,
        }
    }

    fn on_error(&mut self, err: anyhow::Error) {
        debug!("update progress fetch failed: {err:#}");
        self.timeline.append("Failed to fetch update progress.");
    }
}
