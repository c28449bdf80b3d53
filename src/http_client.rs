use anyhow::{Context, Result, ensure};
use reqwest::{Client, Response};
use std::time::Duration;

/// Connect timeout for all device API requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout applied to status polls. The package transfer and the
/// update activation request are exempt: their duration is bounded by the
/// transfer respectively by the server-side update run.
pub const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Create the HTTP client used against the device API.
pub fn api_client() -> Result<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to create HTTP client")
}

/// Handle HTTP response by checking status and extracting body
///
/// This is a common utility for processing HTTP responses.
/// It ensures the response status is successful and extracts the body text.
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET /updates/version")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub async fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().await.context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}
