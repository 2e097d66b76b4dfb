//! Control-plane HTTP client with retry/backoff

use anyhow::{bail, Context, Result};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use trainforge_proto::{
    ClaimRequest, ClaimResponse, HeartbeatRequest, HeartbeatResponse, LogBatch, PendingJob,
    RegisterRequest, StatusUpdate,
};

/// Retries for ordinary control calls
const DEFAULT_RETRIES: u32 = 3;
/// Read/connect timeout for control calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
/// Timeout for archive transfers
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);
/// Backoff ceiling between retries
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Thin wrapper over reqwest; every call retries transient failures
/// (network errors and 5xx) with exponential backoff.
pub struct ApiClient {
    base: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send_with_retry<F, Fut>(&self, mut request: F, retries: u32) -> Result<reqwest::Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = reqwest::Result<reqwest::Response>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            match request().await {
                Ok(response) if response.status().is_server_error() && attempt < retries => {
                    warn!(status = %response.status(), attempt, "server error, retrying");
                }
                Ok(response) => return Ok(response),
                Err(e) if attempt < retries => {
                    debug!(attempt, "request failed, retrying: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
            attempt += 1;
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Probe /health; used by the reconnect loop.
    pub async fn healthy(&self) -> bool {
        match self.http.get(self.url("/health")).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<()> {
        let response = self
            .send_with_retry(
                || {
                    self.http
                        .post(self.url("/api/workers/register"))
                        .json(request)
                        .send()
                },
                DEFAULT_RETRIES,
            )
            .await?;
        if !response.status().is_success() {
            bail!("registration rejected: {}", response.status());
        }
        Ok(())
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        request: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let path = format!("/api/workers/{}/heartbeat", worker_id);
        // A single attempt: the caller counts consecutive failures.
        let response = self.http.post(self.url(&path)).json(request).send().await?;
        if !response.status().is_success() {
            bail!("heartbeat rejected: {}", response.status());
        }
        Ok(response.json().await?)
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        let path = format!("/api/workers/{}/deregister", worker_id);
        self.http.post(self.url(&path)).send().await?;
        Ok(())
    }

    pub async fn pending_jobs(&self, worker_id: &str) -> Result<Vec<PendingJob>> {
        let response = self
            .send_with_retry(
                || {
                    self.http
                        .get(self.url("/api/jobs/pending"))
                        .query(&[("worker_id", worker_id)])
                        .send()
                },
                1,
            )
            .await?;
        if !response.status().is_success() {
            bail!("pending query rejected: {}", response.status());
        }
        Ok(response.json().await?)
    }

    /// Claim a job. A 409 is a benign race; it comes back as success=false.
    pub async fn claim(&self, job_id: &str, worker_id: &str) -> Result<ClaimResponse> {
        let path = format!("/api/jobs/{}/claim", job_id);
        let request = ClaimRequest {
            worker_id: worker_id.to_string(),
        };
        let response = self
            .send_with_retry(
                || self.http.post(self.url(&path)).json(&request).send(),
                DEFAULT_RETRIES,
            )
            .await?;

        match response.status() {
            s if s.is_success() || s == reqwest::StatusCode::CONFLICT => {
                Ok(response.json().await?)
            }
            s => bail!("claim rejected: {}", s),
        }
    }

    pub async fn update_status(&self, job_id: &str, update: &StatusUpdate) -> Result<()> {
        let path = format!("/api/jobs/{}/status", job_id);
        let response = self
            .send_with_retry(
                || self.http.put(self.url(&path)).json(update).send(),
                DEFAULT_RETRIES,
            )
            .await?;
        if !response.status().is_success() {
            bail!("status update rejected: {}", response.status());
        }
        Ok(())
    }

    /// Ship one ordered batch of log lines. A failure is returned to the
    /// shipper, which keeps the batch for the next flush.
    pub async fn ship_logs(&self, job_id: &str, batch: &LogBatch) -> Result<()> {
        let path = format!("/api/jobs/{}/logs/batch", job_id);
        let response = self
            .send_with_retry(|| self.http.post(self.url(&path)).json(batch).send(), 1)
            .await?;
        if !response.status().is_success() {
            bail!("log batch rejected: {}", response.status());
        }
        Ok(())
    }

    /// Stream the project archive to disk.
    pub async fn download_project(&self, job_id: &str, dest: &Path) -> Result<()> {
        let path = format!("/api/jobs/{}/files", job_id);
        let response = self
            .send_with_retry(
                || {
                    self.http
                        .get(self.url(&path))
                        .timeout(TRANSFER_TIMEOUT)
                        .send()
                },
                DEFAULT_RETRIES,
            )
            .await?;
        if !response.status().is_success() {
            bail!("project download failed: {}", response.status());
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;
        let mut response = response;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Upload the results archive as multipart form data.
    pub async fn upload_results(&self, job_id: &str, archive: &Path) -> Result<()> {
        let path = format!("/api/jobs/{}/results", job_id);
        let bytes = tokio::fs::read(archive)
            .await
            .with_context(|| format!("failed to read {}", archive.display()))?;

        let response = self
            .send_with_retry(
                || {
                    let part = reqwest::multipart::Part::bytes(bytes.clone())
                        .file_name("results.zip")
                        .mime_str("application/zip")
                        .expect("static mime type");
                    let form = reqwest::multipart::Form::new().part("results", part);
                    self.http
                        .post(self.url(&path))
                        .timeout(TRANSFER_TIMEOUT)
                        .multipart(form)
                        .send()
                },
                DEFAULT_RETRIES,
            )
            .await?;
        if !response.status().is_success() {
            bail!("results upload failed: {}", response.status());
        }
        Ok(())
    }
}
