use crate::{
    poller::{PollOutcome, PollTask, ProgressPoller},
    state::{StateHandle, Transition, VersionField},
    timeline::Timeline,
    update_service_client::{
        PackageUpload, UploadError, UploadId, UploadProgress, UpdateServiceClient,
    },
};
use anyhow::{Result, bail};
use log::debug;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

/// A byte-progress line is logged on every 5th delivery only; logging each
/// one would flood the timeline.
const BYTE_PROGRESS_LOG_STRIDE: u32 = 5;

/// Drives one package upload.
///
/// The byte transfer and the server-side disk-write / decryption progress
/// poll run concurrently. The operation completes when the poll reaches a
/// terminal condition: the decrypted version became available, or the poll
/// failed. A failed byte transfer does not stop the poll by itself: the
/// server may still be processing a previously transferred package.
pub struct UploadCoordinator<C> {
    client: Arc<C>,
    timeline: Timeline,
    state: StateHandle,
    poll_interval: Duration,
}

impl<C> UploadCoordinator<C>
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

    pub async fn upload_package(&self, package: PackageUpload) -> Result<()> {
        debug!("upload_package() called with {}", package.file_name);

        if self.state.snapshot().uploading {
            bail!("upload already in progress");
        }

        self.state.apply(Transition::UploadStarted);
        self.timeline.append("Starting upload...");

        let upload_id = UploadId::new(&package.file_name);
        debug!("watching processing progress for upload {upload_id}");

        let mut poller = ProgressPoller::new(self.poll_interval);
        poller.start(DecryptionWatch {
            client: Arc::clone(&self.client),
            timeline: self.timeline.clone(),
            state: self.state.clone(),
            upload_id,
            last_disk_percent: None,
            decrypting: false,
        });

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let timeline = self.timeline.clone();
        let progress_log = tokio::spawn(async move {
            let mut deliveries = 0u32;
            while let Some(percent) = progress_rx.recv().await {
                if deliveries % BYTE_PROGRESS_LOG_STRIDE == 0 {
                    timeline.append(&format!("Upload progress: {percent}%"));
                }
                deliveries += 1;
            }
        });

        match self.client.upload_package(package, progress_tx).await {
            Ok(ack) => self.timeline.append(&ack.status),
            Err(UploadError::Rejected { detail }) => {
                self.timeline.append(&format!("Bundle Error: {detail}"));
                self.state.apply(Transition::TransferFailed);
            }
            Err(UploadError::Transport(err)) => {
                self.timeline.append(&format!("Unexpected error: {err}"));
                self.state.apply(Transition::TransferFailed);
            }
        }

        let _ = progress_log.await;
        poller.join().await;

        Ok(())
    }
}

/// Poll task over the disk-write / decryption status of one upload.
struct DecryptionWatch<C> {
    client: Arc<C>,
    timeline: Timeline,
    state: StateHandle,
    upload_id: UploadId,
    last_disk_percent: Option<u8>,
    decrypting: bool,
}

impl<C> PollTask for DecryptionWatch<C>
where
    C: UpdateServiceClient + Send + Sync,
{
    type Snapshot = UploadProgress;

    async fn fetch(&mut self) -> Result<UploadProgress> {
        self.client.upload_progress(&self.upload_id).await
    }

    fn apply(&mut self, snapshot: UploadProgress) -> PollOutcome {
        let percent = snapshot.disk_write_percent.min(100);

        if percent < 100 {
            // edge-triggered: one line per distinct percent value
            if self.last_disk_percent != Some(percent) {
                self.timeline
                    .append(&format!("Writing to disk {percent}% complete..."));
                self.last_disk_percent = Some(percent);
            }
            return PollOutcome::Continue;
        }

        if self.last_disk_percent != Some(100) {
            self.timeline
                .append("Disk write fully completed. Starting decryption...");
            self.last_disk_percent = Some(100);
        }

        match snapshot.decrypted_version.as_deref().map(str::trim) {
            Some(version) if !version.is_empty() => {
                self.timeline.append("Upload and decryption complete!");
                self.timeline.append(&format!("Target version: {version}."));
                self.state.apply(Transition::PackageDecrypted(
                    VersionField::from_reported(version),
                ));
                PollOutcome::Finished
            }
            _ => {
                if !self.decrypting {
                    self.timeline.append("Decryption started...");
                    self.decrypting = true;
                }
                self.timeline.append(&format!(
                    "Decryption elapsed: {}, approx. remaining: {}",
                    secs_label(snapshot.decryption_elapsed_secs),
                    secs_label(snapshot.decryption_remaining_secs)
                ));
                PollOutcome::Continue
            }
        }
    }

    fn on_error(&mut self, err: anyhow::Error) {
        debug!("upload progress fetch failed: {err:#}");
        self.timeline.append("Failed to fetch upload progress.");
        self.state.apply(Transition::UploadPollFailed);
    }
}

/// The server cannot distinguish "not started" from zero seconds, so zero
/// renders as "Unknown".
fn secs_label(value: f64) -> String {
    let rounded = value.round() as i64;
    if rounded == 0 {
        "Unknown".to_string()
    } else {
        format!("{rounded}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update_service_client::{MockUpdateServiceClient, UploadAck};
    use anyhow::anyhow;
    use mockall::Sequence;
    use std::path::PathBuf;

    fn test_package() -> PackageUpload {
        PackageUpload {
            file_name: "fw.tar.gz.enc".to_string(),
            path: PathBuf::from("/tmp/fw.tar.gz.enc"),
            total_size: 10 * 1024 * 1024,
        }
    }

    fn ack() -> UploadAck {
        UploadAck {
            status: "Upload successful!".to_string(),
            filename: Some("fw.tar.gz.enc".to_string()),
            version: None,
        }
    }

    fn disk(percent: u8) -> UploadProgress {
        UploadProgress {
            disk_write_percent: percent,
            ..Default::default()
        }
    }

    fn decrypting(elapsed: f64, remaining: f64) -> UploadProgress {
        UploadProgress {
            disk_write_percent: 100,
            decryption_elapsed_secs: elapsed,
            decryption_remaining_secs: remaining,
            ..Default::default()
        }
    }

    fn decrypted(version: &str) -> UploadProgress {
        UploadProgress {
            disk_write_percent: 100,
            decrypted_version: Some(version.to_string()),
            ..Default::default()
        }
    }

    fn expect_progress_sequence(
        client: &mut MockUpdateServiceClient,
        snapshots: Vec<Result<UploadProgress>>,
    ) {
        let mut seq = Sequence::new();
        for snapshot in snapshots {
            client
                .expect_upload_progress()
                .times(1)
                .in_sequence(&mut seq)
                .return_once(move |_| Box::pin(async move { snapshot }));
        }
    }

    fn coordinator(client: MockUpdateServiceClient) -> (UploadCoordinator<MockUpdateServiceClient>, Timeline, StateHandle) {
        let timeline = Timeline::new();
        let state = StateHandle::new();
        let coordinator = UploadCoordinator::new(
            Arc::new(client),
            timeline.clone(),
            state.clone(),
            Duration::from_secs(1),
        );
        (coordinator, timeline, state)
    }

    fn texts(timeline: &Timeline) -> Vec<String> {
        timeline.lines().into_iter().map(|l| l.text).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn full_upload_reaches_decrypted_version() {
        let mut client = MockUpdateServiceClient::new();
        client.expect_upload_package().times(1).returning(|_, progress| {
            for percent in [0u8, 20, 40, 60, 80, 100] {
                let _ = progress.send(percent);
            }
            Box::pin(async { Ok(ack()) })
        });
        expect_progress_sequence(
            &mut client,
            vec![
                Ok(disk(50)),
                Ok(disk(100)),
                Ok(decrypting(3.0, 7.0)),
                Ok(decrypted("2.4.0")),
            ],
        );

        let (coordinator, timeline, state) = coordinator(client);
        coordinator.upload_package(test_package()).await.unwrap();

        let lines = texts(&timeline);
        assert_eq!(lines[0], "Starting upload...");
        // throttled byte progress: deliveries 0 and 5 only
        assert!(lines.contains(&"Upload progress: 0%".to_string()));
        assert!(lines.contains(&"Upload progress: 100%".to_string()));
        assert!(!lines.contains(&"Upload progress: 20%".to_string()));
        assert!(lines.contains(&"Upload successful!".to_string()));

        let disk_50 = position(&lines, "Writing to disk 50% complete...");
        let disk_done = position(&lines, "Disk write fully completed. Starting decryption...");
        let started = position(&lines, "Decryption started...");
        let elapsed = position(&lines, "Decryption elapsed: 3s, approx. remaining: 7s");
        let complete = position(&lines, "Upload and decryption complete!");
        let target = position(&lines, "Target version: 2.4.0.");
        assert!(disk_50 < disk_done);
        assert!(disk_done < started);
        assert!(started < elapsed);
        assert!(elapsed < complete);
        assert_eq!(target, complete + 1);

        let session = state.snapshot();
        assert!(!session.uploading);
        assert!(session.upload_succeeded);
        assert_eq!(session.target, VersionField::from_reported("2.4.0"));
    }

    fn position(lines: &[String], needle: &str) -> usize {
        lines
            .iter()
            .position(|l| l == needle)
            .unwrap_or_else(|| panic!("missing line: {needle}"))
    }

    #[tokio::test(start_paused = true)]
    async fn disk_write_lines_are_edge_triggered() {
        let mut client = MockUpdateServiceClient::new();
        client
            .expect_upload_package()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(ack()) }));
        expect_progress_sequence(
            &mut client,
            vec![
                Ok(disk(50)),
                Ok(disk(50)),
                Ok(disk(75)),
                Ok(disk(75)),
                Ok(decrypted("2.4.0")),
            ],
        );

        let (coordinator, timeline, _state) = coordinator(client);
        coordinator.upload_package(test_package()).await.unwrap();

        let lines = texts(&timeline);
        let count = |needle: &str| lines.iter().filter(|l| *l == needle).count();
        assert_eq!(count("Writing to disk 50% complete..."), 1);
        assert_eq!(count("Writing to disk 75% complete..."), 1);
        assert_eq!(
            count("Disk write fully completed. Starting decryption..."),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_seconds_render_as_unknown() {
        let mut client = MockUpdateServiceClient::new();
        client
            .expect_upload_package()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(ack()) }));
        expect_progress_sequence(
            &mut client,
            vec![Ok(decrypting(0.0, 7.4)), Ok(decrypted("2.4.0"))],
        );

        let (coordinator, timeline, _state) = coordinator(client);
        coordinator.upload_package(test_package()).await.unwrap();

        assert!(
            texts(&timeline)
                .contains(&"Decryption elapsed: Unknown, approx. remaining: 7s".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_transfer_does_not_stop_progress_polling() {
        let mut client = MockUpdateServiceClient::new();
        client.expect_upload_package().times(1).returning(|_, _| {
            Box::pin(async {
                Err(UploadError::Rejected {
                    detail: "Missing required file(s): .version.".to_string(),
                })
            })
        });
        expect_progress_sequence(&mut client, vec![Ok(disk(50)), Ok(decrypted("2.4.0"))]);

        let (coordinator, timeline, state) = coordinator(client);
        coordinator.upload_package(test_package()).await.unwrap();

        let lines = texts(&timeline);
        assert!(lines.contains(&"Bundle Error: Missing required file(s): .version.".to_string()));
        // the poll leg still ran to its own terminal condition
        assert!(lines.contains(&"Target version: 2.4.0.".to_string()));
        assert!(state.snapshot().upload_succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failure_logs_unexpected_error() {
        let mut client = MockUpdateServiceClient::new();
        client
            .expect_upload_package()
            .times(1)
            .returning(|_, _| Box::pin(async { Err(UploadError::Transport(anyhow!("connection reset"))) }));
        expect_progress_sequence(
            &mut client,
            vec![Err(anyhow!("no upload info found for this filename"))],
        );

        let (coordinator, timeline, state) = coordinator(client);
        coordinator.upload_package(test_package()).await.unwrap();

        let lines = texts(&timeline);
        assert!(lines.contains(&"Unexpected error: connection reset".to_string()));
        assert!(lines.contains(&"Failed to fetch upload progress.".to_string()));

        let session = state.snapshot();
        assert!(!session.uploading);
        assert!(!session.upload_succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_upload_is_rejected_as_busy() {
        let client = MockUpdateServiceClient::new();
        let (coordinator, timeline, state) = coordinator(client);
        state.apply(Transition::UploadStarted);

        let result = coordinator.upload_package(test_package()).await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("already in progress"));
        assert!(timeline.lines().is_empty());
    }
}
