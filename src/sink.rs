use crate::model::Run;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

const MAX_RETRIES: u32 = 3;

/// Acknowledgement returned by the console for a submitted run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitResponse {
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub view_url: Option<String>,
}

/// Client for the web console's run intake endpoint.
pub struct ConsoleSink {
    console_url: String,
    token: Option<String>,
    retry_base: Duration,
    http: reqwest::Client,
}

impl ConsoleSink {
    pub fn new(console_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            console_url: console_url.into(),
            token: None,
            retry_base: Duration::from_millis(500),
            http,
        })
    }

    /// Send `Authorization: Bearer <token>` with every submission.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Base delay for the exponential backoff between retries.
    pub fn with_retry_base(mut self, delay: Duration) -> Self {
        self.retry_base = delay;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/v1/runs", self.console_url.trim_end_matches('/'))
    }

    /// Submit one final run record.
    ///
    /// Retries up to 3 times with exponential backoff on 5xx responses
    /// and network errors. An empty success body is accepted.
    pub async fn submit(&self, run: &Run) -> Result<SubmitResponse> {
        let url = self.endpoint();

        for attempt in 0..=MAX_RETRIES {
            let mut request = self.http.post(&url);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let delay = self.retry_base * 2u32.pow(attempt);
            match request.json(run).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.text().await.context("failed to read console response")?;
                    if body.trim().is_empty() {
                        return Ok(SubmitResponse::default());
                    }
                    return serde_json::from_str(&body).context("failed to parse console response");
                }
                Ok(resp) if resp.status().is_server_error() && attempt < MAX_RETRIES => {
                    warn!(
                        status = %resp.status(),
                        attempt = attempt + 1,
                        "console server error, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(resp) => {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("console rejected run {}: {status} - {body}", run.id);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        "console unreachable, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).context(format!(
                        "failed to submit run {} after {MAX_RETRIES} retries",
                        run.id
                    ));
                }
            }
        }

        anyhow::bail!("failed to submit run {} after {MAX_RETRIES} retries", run.id)
    }

    /// Submit every run, logging failures instead of returning them.
    pub async fn submit_all(&self, runs: &[Run]) -> usize {
        let mut delivered = 0;
        for run in runs {
            match self.submit(run).await {
                Ok(_) => delivered += 1,
                Err(e) => warn!("Could not deliver run {} to console: {:#}", run.id, e),
            }
        }
        delivered
    }
}
