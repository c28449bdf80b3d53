use crate::{
    config::AppConfig,
    state::{SessionState, StateHandle, Transition, VersionField, ViewModel},
    timeline::{self, Timeline},
    update_run::UpdateCoordinator,
    update_service_client::{PackageUpload, UpdateServiceClient},
    upload::UploadCoordinator,
};
use anyhow::{Context, Result};
use log::{debug, error};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::watch;

/// Composition root for the update page.
///
/// Wires the timeline, the session state, and the two coordinators into the
/// user-visible actions: choose a package, upload it, start the staged
/// update, export the logs. View-state is recomputed on every internal
/// transition, so a presentation layer only has to re-render on change.
pub struct UpdateController<C> {
    client: Arc<C>,
    timeline: Timeline,
    state: StateHandle,
    package: Mutex<Option<PackageUpload>>,
    upload: UploadCoordinator<C>,
    update: UpdateCoordinator<C>,
}

impl<C> UpdateController<C>
where
    C: UpdateServiceClient + Send + Sync + 'static,
{
    pub fn new(client: C) -> Self {
        Self::with_poll_interval(client, AppConfig::get().poll.interval)
    }

    pub fn with_poll_interval(client: C, poll_interval: Duration) -> Self {
        let client = Arc::new(client);
        let timeline = Timeline::new();
        let state = StateHandle::new();

        Self {
            upload: UploadCoordinator::new(
                Arc::clone(&client),
                timeline.clone(),
                state.clone(),
                poll_interval,
            ),
            update: UpdateCoordinator::new(
                Arc::clone(&client),
                timeline.clone(),
                state.clone(),
                poll_interval,
            ),
            client,
            timeline,
            state,
            package: Mutex::new(None),
        }
    }

    /// Query the current and staged firmware versions. The two queries are
    /// independent: a failed one leaves its field at `Loading`.
    pub async fn initialize(&self) {
        debug!("initialize() called");

        let (current, staged) = tokio::join!(
            self.client.current_version(),
            self.client.staged_version()
        );

        match current {
            Ok(version) => self.state.apply(Transition::CurrentVersionLoaded(
                VersionField::from_reported(&version),
            )),
            Err(e) => error!("failed to get current version: {e:#}"),
        }
        match staged {
            Ok(version) => self.state.apply(Transition::StagedVersionLoaded(
                VersionField::from_reported(&version),
            )),
            Err(e) => error!("failed to get staged version: {e:#}"),
        }
    }

    pub fn choose_package(&self, package: PackageUpload) {
        debug!("choose_package() called with {}", package.file_name);
        *self.package.lock().unwrap() = Some(package);
        self.state.apply(Transition::PackageChosen);
    }

    pub fn clear_package(&self) {
        *self.package.lock().unwrap() = None;
        self.state.apply(Transition::PackageCleared);
    }

    /// Upload the chosen package. A no-op while the upload gate is closed.
    pub async fn upload(&self) -> Result<()> {
        if !self.state.snapshot().upload_enabled() {
            debug!("upload() called while disabled");
            return Ok(());
        }
        let Some(package) = self.package.lock().unwrap().clone() else {
            debug!("upload() called without a chosen package");
            return Ok(());
        };
        self.upload.upload_package(package).await
    }

    /// Start the staged update. A no-op while the start-update gate is
    /// closed.
    pub async fn start_update(&self) -> Result<()> {
        if !self.state.snapshot().start_update_enabled() {
            debug!("start_update() called while disabled");
            return Ok(());
        }
        self.update.start_update().await
    }

    pub fn view(&self) -> ViewModel {
        ViewModel::from(&self.state.snapshot())
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Write the timeline to `update_logs.txt` in `dir` and return the path.
    pub async fn save_logs(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(timeline::EXPORT_FILE_NAME);
        debug!("save_logs() called, writing {}", path.display());

        tokio::fs::write(&path, self.timeline.export_text())
            .await
            .context("failed to write update log export")?;
        Ok(path)
    }
}
