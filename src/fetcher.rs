use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::Settings;

/// Body of a successfully fetched article page.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub body: String,
    pub latency_ms: u64,
}

/// Result of fetching one key. Only `Page` carries content; the other two
/// are data outcomes for the extractor, not pipeline errors.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Page(RawPage),
    NotFound { status: u16 },
    Transport(String),
}

impl FetchOutcome {
    fn is_retryable(&self) -> bool {
        match self {
            FetchOutcome::Page(_) => false,
            FetchOutcome::NotFound { status } => *status == 429 || *status >= 500,
            FetchOutcome::Transport(_) => true,
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, pmid: i64) -> FetchOutcome;
}

/// Fetches `{base_url}/{pmid}/` with a per-request timeout and a bounded
/// number of retries on 429, 5xx and transport errors.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    max_retries: u32,
    backoff: Duration,
}

impl HttpFetcher {
    pub fn new(settings: &Settings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .user_agent(settings.user_agent.as_str())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(HttpFetcher {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries,
            backoff: settings.backoff(),
        })
    }

    pub fn url_for(&self, pmid: i64) -> String {
        format!("{}/{}/", self.base_url, pmid)
    }

    async fn fetch_once(&self, url: &str) -> FetchOutcome {
        let start = Instant::now();
        let response = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => return FetchOutcome::Transport(describe(&e)),
        };

        let status = response.status();
        if !status.is_success() {
            return FetchOutcome::NotFound {
                status: status.as_u16(),
            };
        }

        match response.text().await {
            Ok(body) => FetchOutcome::Page(RawPage {
                status: status.as_u16(),
                body,
                latency_ms: start.elapsed().as_millis() as u64,
            }),
            Err(e) => FetchOutcome::Transport(describe(&e)),
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, pmid: i64) -> FetchOutcome {
        let url = self.url_for(pmid);
        let mut attempt = 0;
        loop {
            let outcome = self.fetch_once(&url).await;
            if !outcome.is_retryable() || attempt >= self.max_retries {
                debug!(pmid, attempt, "fetch finished: {:?}", short(&outcome));
                return outcome;
            }

            let backoff = self.backoff.saturating_mul(1 << attempt.min(16));
            warn!(
                "Retrying pmid {} (attempt {}/{}) after {:?}, backing off {:.1}s",
                pmid,
                attempt + 1,
                self.max_retries,
                short(&outcome),
                backoff.as_secs_f64()
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {}", e)
    } else if e.is_connect() {
        format!("connect: {}", e)
    } else {
        e.to_string()
    }
}

fn short(outcome: &FetchOutcome) -> String {
    match outcome {
        FetchOutcome::Page(p) => format!("HTTP {} ({} bytes)", p.status, p.body.len()),
        FetchOutcome::NotFound { status } => format!("HTTP {}", status),
        FetchOutcome::Transport(reason) => reason.clone(),
    }
}
