//! Rate-limited, retrying HTTP image downloads with content hashing.

mod error;
mod limiter;

pub use error::Error;
pub use limiter::AdaptiveLimiter;

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::header;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWriteExt, BufWriter};

use harvest_core::time::utc_now_iso;

use crate::error::Result;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";

pub const DOWNLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const HASH_BLOCK_SIZE: usize = 8 * 1024;

const BACKOFF_BASE_SEC: f64 = 0.5;
const BACKOFF_MAX_SEC: f64 = 8.0;

/// Result of downloading one image. Exhausted retries yield `ok = false`
/// with `error` populated; this value never carries a panic or an `Err`.
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    pub ok: bool,
    pub retries_used: u32,
    pub http_status: Option<u16>,
    pub content_type: Option<String>,
    pub size_bytes: Option<u64>,
    pub sha256: Option<String>,
    pub downloaded_at: Option<String>,
    pub error: Option<String>,
}

/// Downloader seam. The shipped HTTP implementation always returns `Ok`;
/// `Err` is reserved for unexpected faults and aborts the surrounding run.
#[async_trait]
pub trait ImageDownloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        timeout_sec: f64,
        retries: u32,
        delay_sec: f64,
    ) -> anyhow::Result<DownloadResult>;
}

struct CompletedTransfer {
    http_status: u16,
    content_type: Option<String>,
    size_bytes: u64,
    sha256: String,
}

/// HTTP downloader with an adaptive rate limiter.
pub struct HttpDownloader {
    client: reqwest::Client,
    limiter: AdaptiveLimiter,
}

impl HttpDownloader {
    pub fn new(max_requests_per_sec: f64, max_burst: u32) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
        let client = reqwest::Client::builder().default_headers(headers).build()?;
        Ok(HttpDownloader {
            client,
            limiter: AdaptiveLimiter::new(max_requests_per_sec, max_burst),
        })
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }

    /// One attempt: GET the URL and stream the body to `destination` while
    /// hashing and counting bytes.
    async fn transfer(&self, url: &str, destination: &Path, timeout_sec: f64) -> Result<CompletedTransfer> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs_f64(timeout_sec))
            .send()
            .await?;
        let mut response = response.error_for_status()?;
        let http_status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(destination).await?;
        let mut writer = BufWriter::with_capacity(DOWNLOAD_CHUNK_SIZE, file);
        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        while let Some(chunk) = response.chunk().await? {
            if chunk.is_empty() {
                continue;
            }
            writer.write_all(&chunk).await?;
            hasher.update(&chunk);
            size_bytes += chunk.len() as u64;
        }
        writer.flush().await?;

        Ok(CompletedTransfer {
            http_status,
            content_type,
            size_bytes,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

#[async_trait]
impl ImageDownloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        destination: &Path,
        timeout_sec: f64,
        retries: u32,
        delay_sec: f64,
    ) -> anyhow::Result<DownloadResult> {
        let attempts = retries + 1;
        let mut last_error = None;
        let mut last_status = None;

        for attempt in 1..=attempts {
            self.limiter.acquire().await;
            match self.transfer(url, destination, timeout_sec).await {
                Ok(done) => {
                    self.limiter.report_success();
                    return Ok(DownloadResult {
                        ok: true,
                        retries_used: attempt - 1,
                        http_status: Some(done.http_status),
                        content_type: done.content_type,
                        size_bytes: Some(done.size_bytes),
                        sha256: Some(done.sha256),
                        downloaded_at: Some(utc_now_iso()),
                        error: None,
                    });
                }
                Err(err) => {
                    let status = err.http_status();
                    if let Some(code) = status {
                        last_status = Some(code);
                    }
                    if matches!(status, Some(429) | Some(503)) {
                        self.limiter.report_throttled();
                    }
                    tracing::warn!("Download attempt {}/{} failed for {}: {}", attempt, attempts, url, err);
                    last_error = Some(err.to_string());
                    if attempt < attempts {
                        let delay = retry_delay(attempt, delay_sec, status);
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                }
            }
        }

        Ok(DownloadResult {
            ok: false,
            retries_used: retries,
            http_status: last_status,
            error: last_error,
            ..Default::default()
        })
    }
}

/// Delay before the next attempt. Throttling statuses use capped exponential
/// backoff with uniform jitter in `[0.8, 1.2)`; otherwise a positive
/// configured delay wins, falling back to plain capped exponential.
pub fn retry_delay(attempt: u32, delay_sec: f64, http_status: Option<u16>) -> f64 {
    let capped_exponential =
        |base: f64| (base * 2f64.powi(attempt as i32 - 1)).min(BACKOFF_MAX_SEC);
    match http_status {
        Some(429) | Some(503) => {
            let jitter = rand::thread_rng().gen_range(0.8..1.2);
            capped_exponential(delay_sec.max(BACKOFF_BASE_SEC)) * jitter
        }
        _ if delay_sec > 0.0 => delay_sec,
        _ => capped_exponential(BACKOFF_BASE_SEC),
    }
}

/// SHA-256 of an existing file, streamed in 8 KiB blocks.
pub fn file_sha256(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; HASH_BLOCK_SIZE];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_uses_configured_delay_for_plain_failures() {
        assert_eq!(retry_delay(1, 0.2, Some(500)), 0.2);
        assert_eq!(retry_delay(3, 1.5, None), 1.5);
    }

    #[test]
    fn retry_delay_backs_off_exponentially_without_a_delay() {
        assert_eq!(retry_delay(1, 0.0, None), 0.5);
        assert_eq!(retry_delay(2, 0.0, None), 1.0);
        assert_eq!(retry_delay(5, 0.0, None), 8.0);
        assert_eq!(retry_delay(10, 0.0, Some(404)), 8.0);
    }

    #[test]
    fn retry_delay_jitters_throttled_statuses_within_bounds() {
        for status in [429u16, 503] {
            for attempt in 1..=6 {
                let delay = retry_delay(attempt, 0.2, Some(status));
                let raw = (0.5 * 2f64.powi(attempt as i32 - 1)).min(8.0);
                assert!(delay >= raw * 0.8 - 1e-9, "attempt {attempt}: {delay} < {}", raw * 0.8);
                assert!(delay < raw * 1.2 + 1e-9, "attempt {attempt}: {delay} >= {}", raw * 1.2);
            }
        }
    }

    #[test]
    fn retry_delay_prefers_larger_configured_delay_when_throttled() {
        let delay = retry_delay(1, 3.0, Some(429));
        assert!(delay >= 3.0 * 0.8 - 1e-9);
        assert!(delay < 3.0 * 1.2 + 1e-9);
    }

    #[test]
    fn file_sha256_matches_known_vector() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert_eq!(
            file_sha256(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn file_sha256_streams_multi_block_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let payload = vec![7u8; HASH_BLOCK_SIZE * 3 + 17];
        std::fs::write(&path, &payload).unwrap();
        let expected = hex::encode(Sha256::digest(&payload));
        assert_eq!(file_sha256(&path).unwrap(), expected);
    }
}
