//! Page fetching behind a small trait so test doubles and alternative
//! engines (e.g. a headless browser) can swap in without touching the
//! orchestrator.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header;

use harvest_core::time::utc_now_iso;

use crate::error::Result;

pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

/// Result envelope of one page fetch. Transport failures are encoded here;
/// a fetcher never errors across this boundary.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub url: String,
    pub ok: bool,
    pub html: Option<String>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub fetched_at: String,
}

impl FetchOutcome {
    pub fn success(url: &str, html: String, status_code: u16, elapsed_ms: u64) -> Self {
        FetchOutcome {
            url: url.to_string(),
            ok: true,
            html: Some(html),
            status_code: Some(status_code),
            error: None,
            elapsed_ms,
            fetched_at: utc_now_iso(),
        }
    }

    pub fn failure(url: &str, status_code: Option<u16>, error: String, elapsed_ms: u64) -> Self {
        FetchOutcome {
            url: url.to_string(),
            ok: false,
            html: None,
            status_code,
            error: Some(error),
            elapsed_ms,
            fetched_at: utc_now_iso(),
        }
    }
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout_sec: f64) -> FetchOutcome;
}

/// Direct HTTP fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout_sec: f64) -> FetchOutcome {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs_f64(timeout_sec))
            .send()
            .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match response {
            Ok(response) => {
                let status_code = response.status().as_u16();
                match response.error_for_status() {
                    Ok(response) => match response.text().await {
                        Ok(html) => FetchOutcome::success(url, html, status_code, elapsed_ms),
                        Err(err) => {
                            FetchOutcome::failure(url, Some(status_code), err.to_string(), elapsed_ms)
                        }
                    },
                    Err(err) => {
                        tracing::warn!("Fetch of {} returned status {}", url, status_code);
                        FetchOutcome::failure(url, Some(status_code), err.to_string(), elapsed_ms)
                    }
                }
            }
            Err(err) => FetchOutcome::failure(
                url,
                err.status().map(|status| status.as_u16()),
                err.to_string(),
                elapsed_ms,
            ),
        }
    }
}
