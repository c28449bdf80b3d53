use crate::{
    config::AppConfig,
    http_client::{POLL_REQUEST_TIMEOUT, api_client, handle_http_response},
};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream;
use log::{debug, info};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use reqwest::{Body, Client, multipart};
use serde::Deserialize;
use std::{
    fmt,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{fs::File, io::AsyncReadExt, sync::mpsc::UnboundedSender};
use trait_variant::make;

/// Suffix required of encrypted update packages.
pub const PACKAGE_SUFFIX: &str = ".tar.gz.enc";

/// Update package staged for upload.
#[derive(Clone, Debug)]
pub struct PackageUpload {
    pub file_name: String,
    pub path: PathBuf,
    pub total_size: u64,
}

impl PackageUpload {
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .context("package path has no file name")?;

        anyhow::ensure!(
            file_name.ends_with(PACKAGE_SUFFIX),
            "package file must have the {PACKAGE_SUFFIX} suffix: {file_name}"
        );

        let total_size = tokio::fs::metadata(&path)
            .await
            .context("failed to read package metadata")?
            .len();

        Ok(Self {
            file_name,
            path,
            total_size,
        })
    }
}

/// Identifier for one upload attempt, derived from the package name and the
/// moment the upload started.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadId {
    file_name: String,
    started_epoch_ms: u128,
}

impl UploadId {
    pub fn new(file_name: &str) -> Self {
        let started_epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self {
            file_name: file_name.to_string(),
            started_epoch_ms,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.file_name, self.started_epoch_ms)
    }
}

/// Disk-write / decryption progress reported while an uploaded package is
/// processed on the device.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct UploadProgress {
    #[serde(default)]
    pub disk_write_percent: u8,
    /// Version decrypted from the bundle; present once decryption finished.
    #[serde(default, rename = "upload_version")]
    pub decrypted_version: Option<String>,
    #[serde(default)]
    pub decryption_elapsed_secs: f64,
    #[serde(default)]
    pub decryption_remaining_secs: f64,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateRunStatus {
    Extracting,
    Running,
    Complete,
    Error,
    /// Reported before a run is initialized; a no-op for the poll loop.
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for UpdateRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UpdateRunStatus::Extracting => "extracting",
            UpdateRunStatus::Running => "running",
            UpdateRunStatus::Complete => "complete",
            UpdateRunStatus::Error => "error",
            UpdateRunStatus::Unknown => "unknown",
        };
        write!(f, "{label}")
    }
}

/// Snapshot of a running update. The server returns the cumulative run log
/// in full on every poll; clients diff it against a remembered offset.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct UpdateProgress {
    #[serde(default)]
    pub percent: u8,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub status: UpdateRunStatus,
}

/// Server acknowledgement of a completed package transfer.
#[derive(Clone, Debug, Deserialize)]
pub struct UploadAck {
    pub status: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Deserialize)]
struct RejectionBody {
    detail: String,
}

/// Package transfer failure, keeping the server's explicit rejection apart
/// from transport trouble: the two produce different console lines.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("{detail}")]
    Rejected { detail: String },
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Byte-level transfer progress (0–100), reported arbitrarily often.
pub type ByteProgressSender = UnboundedSender<u8>;

/// Client for the device's update API.
#[make(Send)]
#[cfg_attr(any(test, feature = "mock"), automock)]
pub trait UpdateServiceClient {
    /// Transfer the package, reporting byte-level progress through
    /// `progress`.
    async fn upload_package(
        &self,
        package: PackageUpload,
        progress: ByteProgressSender,
    ) -> Result<UploadAck, UploadError>;

    /// Disk-write / decryption progress for one upload attempt.
    async fn upload_progress(&self, upload_id: &UploadId) -> Result<UploadProgress>;

    /// Activate the staged update. Callers treat this as fire-and-forget;
    /// the run is observed through [`Self::update_progress`].
    async fn start_update(&self) -> Result<String>;

    async fn update_progress(&self) -> Result<UpdateProgress>;

    async fn current_version(&self) -> Result<String>;

    async fn staged_version(&self) -> Result<String>;
}

/// [`UpdateServiceClient`] over the console's REST API.
#[derive(Clone)]
pub struct HttpUpdateServiceClient {
    client: Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpUpdateServiceClient {
    // API endpoint constants
    const CURRENT_VERSION_ENDPOINT: &str = "/updates/version";
    const STAGED_VERSION_ENDPOINT: &str = "/updates/version/staged";
    const UPLOAD_ENDPOINT: &str = "/updates/upload";
    const UPLOAD_PROGRESS_ENDPOINT: &str = "/updates/upload/progress";
    const START_UPDATE_ENDPOINT: &str = "/updates/update";
    const UPDATE_PROGRESS_ENDPOINT: &str = "/updates/update-progress";

    const UPLOAD_CHUNK_BYTES: usize = 1024 * 1024;

    pub fn new() -> Result<Self> {
        let api = &AppConfig::get().api;
        Self::with_base_url(&api.base_url, api.auth_token.clone())
    }

    pub fn with_base_url(base_url: &str, auth_token: Option<String>) -> Result<Self> {
        Ok(Self {
            client: api_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        })
    }

    fn build_url(&self, path: &str) -> String {
        // Normalize path to always start with a single "/"
        let normalized_path = path.trim_start_matches('/');
        format!("{}/{normalized_path}", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// GET a JSON resource from the device API.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.build_url(path);
        debug!("GET {url}");

        let res = self
            .authorize(self.client.get(&url))
            .query(query)
            .timeout(POLL_REQUEST_TIMEOUT)
            .send()
            .await
            .context(format!("failed to send GET request to {url}"))?;

        let body = handle_http_response(res, &format!("GET {url}")).await?;
        serde_json::from_str(&body).context(format!("failed to parse response from {url}"))
    }

    /// Body stream over the package file that reports transfer progress as
    /// percent steps.
    fn progress_body(file: File, total_size: u64, progress: ByteProgressSender) -> Body {
        let stream = stream::unfold((file, 0u64), move |(mut file, sent)| {
            let progress = progress.clone();
            async move {
                let mut buf = vec![0u8; Self::UPLOAD_CHUNK_BYTES];
                match file.read(&mut buf).await {
                    Ok(0) => None,
                    Ok(n) => {
                        buf.truncate(n);
                        let sent = sent + n as u64;
                        let percent = if total_size == 0 {
                            100
                        } else {
                            (sent * 100 / total_size).min(100) as u8
                        };
                        // a closed receiver just means nobody is listening
                        let _ = progress.send(percent);
                        Some((Ok(Bytes::from(buf)), (file, sent)))
                    }
                    Err(e) => Some((Err(e), (file, sent))),
                }
            }
        });

        Body::wrap_stream(stream)
    }
}

impl UpdateServiceClient for HttpUpdateServiceClient {
    async fn upload_package(
        &self,
        package: PackageUpload,
        progress: ByteProgressSender,
    ) -> Result<UploadAck, UploadError> {
        let url = self.build_url(Self::UPLOAD_ENDPOINT);
        info!(
            "POST {url} ({}, {} bytes)",
            package.file_name, package.total_size
        );

        let file = File::open(&package.path)
            .await
            .context("failed to open package file")
            .map_err(UploadError::Transport)?;

        let part = multipart::Part::stream_with_length(
            Self::progress_body(file, package.total_size, progress),
            package.total_size,
        )
        .file_name(package.file_name.clone());
        let form = multipart::Form::new()
            .part("file", part)
            .text("total_size", package.total_size.to_string());

        let res = self
            .authorize(self.client.post(&url))
            .multipart(form)
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))
            .map_err(UploadError::Transport)?;

        let status = res.status();
        if !status.is_success() {
            // the API reports rejections as {"detail": "..."}
            let body = res.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<RejectionBody>(&body)
                .map(|rejection| rejection.detail)
                .unwrap_or_else(|_| format!("upload failed with status {status}"));
            return Err(UploadError::Rejected { detail });
        }

        let body = res
            .text()
            .await
            .context("failed to read upload response")
            .map_err(UploadError::Transport)?;
        serde_json::from_str(&body)
            .context("failed to parse upload response")
            .map_err(UploadError::Transport)
    }

    async fn upload_progress(&self, upload_id: &UploadId) -> Result<UploadProgress> {
        self.get_json(
            Self::UPLOAD_PROGRESS_ENDPOINT,
            &[("filename", upload_id.file_name())],
        )
        .await
    }

    async fn start_update(&self) -> Result<String> {
        let url = self.build_url(Self::START_UPDATE_ENDPOINT);
        info!("POST {url}");

        // no request timeout: the server answers when the run is over
        let res = self
            .authorize(self.client.post(&url))
            .send()
            .await
            .context(format!("failed to send POST request to {url}"))?;

        handle_http_response(res, &format!("POST {url}")).await
    }

    async fn update_progress(&self) -> Result<UpdateProgress> {
        self.get_json(Self::UPDATE_PROGRESS_ENDPOINT, &[]).await
    }

    async fn current_version(&self) -> Result<String> {
        self.get_json(Self::CURRENT_VERSION_ENDPOINT, &[]).await
    }

    async fn staged_version(&self) -> Result<String> {
        self.get_json(Self::STAGED_VERSION_ENDPOINT, &[]).await
    }
}
