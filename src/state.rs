use semver::Version;
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::sync::watch;

/// A version slot of the update session: still being queried, unresolvable,
/// or a concrete version.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum VersionField {
    #[default]
    Loading,
    /// The server reported `Unknown`, an empty value, or a string that does
    /// not parse as a version. Treated as a disabled condition, not an error.
    Unknown,
    Available(Version),
}

impl VersionField {
    /// Classify a server-reported version string.
    pub fn from_reported(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw == "Unknown" {
            return Self::Unknown;
        }
        match Version::parse(raw) {
            Ok(version) => Self::Available(version),
            Err(_) => Self::Unknown,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

impl fmt::Display for VersionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionField::Loading => write!(f, "Loading..."),
            VersionField::Unknown => write!(f, "Unknown"),
            VersionField::Available(version) => write!(f, "{version}"),
        }
    }
}

/// Complete state of one update session.
///
/// Mutated exclusively through [`SessionState::apply`]: coordinators emit
/// [`Transition`]s instead of writing fields, so there is no order-of-write
/// ambiguity between asynchronous callbacks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    pub uploading: bool,
    pub upload_succeeded: bool,
    pub package_selected: bool,
    pub current: VersionField,
    pub target: VersionField,
}

#[derive(Clone, Debug)]
pub enum Transition {
    PackageChosen,
    PackageCleared,
    CurrentVersionLoaded(VersionField),
    StagedVersionLoaded(VersionField),
    UploadStarted,
    /// The byte transfer failed; polling may still be running.
    TransferFailed,
    /// The disk-write/decryption progress poll failed.
    UploadPollFailed,
    /// Decryption confirmed the staged package's version.
    PackageDecrypted(VersionField),
    /// The update run reached a terminal status, successful or not.
    UpdateFinished,
}

impl SessionState {
    pub fn apply(&self, transition: Transition) -> SessionState {
        let mut next = self.clone();
        match transition {
            Transition::PackageChosen => next.package_selected = true,
            Transition::PackageCleared => next.package_selected = false,
            Transition::CurrentVersionLoaded(version) => next.current = version,
            Transition::StagedVersionLoaded(version) => next.target = version,
            Transition::UploadStarted => {
                next.uploading = true;
                next.upload_succeeded = false;
            }
            Transition::TransferFailed | Transition::UploadPollFailed => next.uploading = false,
            Transition::PackageDecrypted(version) => {
                next.target = version;
                next.uploading = false;
                next.upload_succeeded = true;
            }
            Transition::UpdateFinished => next.current = next.target.clone(),
        }
        next
    }

    pub fn upload_enabled(&self) -> bool {
        !self.uploading && self.package_selected
    }

    pub fn start_update_enabled(&self) -> bool {
        !(self.uploading && !self.upload_succeeded)
            && self.current != self.target
            && self.target.is_available()
    }
}

/// Shared session state handle.
///
/// Transitions are applied atomically and every change is published to
/// subscribers, so a presentation layer can re-render on each internal
/// transition without extra logic.
#[derive(Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<SessionState>>,
}

impl StateHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SessionState::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn apply(&self, transition: Transition) {
        self.tx.send_modify(|state| *state = state.apply(transition));
    }

    pub fn snapshot(&self) -> SessionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Presentation-ready snapshot: flags, version chip labels, action gates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ViewModel {
    pub uploading: bool,
    pub upload_succeeded: bool,
    pub current_version: String,
    pub target_version: String,
    pub upload_enabled: bool,
    pub start_update_enabled: bool,
}

impl From<&SessionState> for ViewModel {
    fn from(state: &SessionState) -> Self {
        Self {
            uploading: state.uploading,
            upload_succeeded: state.upload_succeeded,
            current_version: state.current.to_string(),
            target_version: state.target.to_string(),
            upload_enabled: state.upload_enabled(),
            start_update_enabled: state.start_update_enabled(),
        }
    }
}
