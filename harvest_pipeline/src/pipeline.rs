//! The harvesting pipeline: a restartable state machine over pages and
//! images. Every persisted transition commits before the next I/O is issued,
//! so a process-level interrupt is recoverable via `reset_running_to_pending`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use gallery_client::{parse_gallery_upper_bound, parse_image_urls, FetchOutcome, PageFetcher};
use harvest_core::config::RunConfig;
use harvest_core::naming::{image_file_name, page_dir_name, source_id_from_page_url};
use harvest_core::sequence;
use harvest_core::status::{ImageStatus, JobStatus, PageStatus};
use harvest_core::time::utc_now_iso;
use harvest_core::{Error, Result};
use harvest_download::{file_sha256, DownloadResult, ImageDownloader};
use harvest_store::model::ImageOutcome;
use harvest_store::{JobStats, StateStore};

use crate::sidecar;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RetrySummary {
    pub retried: u64,
    pub recovered: u64,
    pub failed_again: u64,
}

/// Drives one job: the store is exclusively owned here (single writer);
/// fetcher and downloader are seams for alternative engines and test
/// doubles.
pub struct HarvestPipeline {
    config: RunConfig,
    store: StateStore,
    fetcher: Box<dyn PageFetcher>,
    fallback_fetcher: Option<Box<dyn PageFetcher>>,
    downloader: Box<dyn ImageDownloader>,
}

impl HarvestPipeline {
    pub fn new(
        config: RunConfig,
        store: StateStore,
        fetcher: Box<dyn PageFetcher>,
        downloader: Box<dyn ImageDownloader>,
    ) -> Self {
        HarvestPipeline {
            config,
            store,
            fetcher,
            fallback_fetcher: None,
            downloader,
        }
    }

    /// Install the fetcher consulted once when the primary returned HTML but
    /// the parser extracted zero URLs.
    pub fn with_fallback_fetcher(mut self, fetcher: Box<dyn PageFetcher>) -> Self {
        self.fallback_fetcher = Some(fetcher);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run the main harvesting flow and return aggregated stats.
    pub async fn run(&mut self, job_id: &str, config_json: &str) -> Result<JobStats> {
        std::fs::create_dir_all(&self.config.output_dir)?;

        if self.config.resume {
            self.store.upsert_job(job_id, config_json, JobStatus::Running)?;
            self.store.reset_running_to_pending(job_id)?;
        } else {
            self.store.reset_job(job_id, config_json)?;
        }
        self.store.add_event(job_id, "job_start", "job started", None)?;
        tracing::info!("Job {} started", job_id);

        match self.run_pages(job_id).await {
            Ok(()) => {
                self.store.set_job_status(job_id, JobStatus::Completed, true)?;
                self.store.add_event(job_id, "job_end", "job finished", None)?;
                tracing::info!("Job {} finished", job_id);
                self.store.stats_for_job(job_id)
            }
            Err(err) => {
                tracing::error!("Job {} failed: {}", job_id, err);
                if let Err(store_err) = self.store.set_job_status(job_id, JobStatus::Failed, true) {
                    tracing::error!("Cannot mark job {} as failed: {}", job_id, store_err);
                }
                if let Err(store_err) =
                    self.store
                        .add_event(job_id, "job_failed", &format!("unhandled error: {}", err), None)
                {
                    tracing::error!("Cannot record job_failed event: {}", store_err);
                }
                Err(err)
            }
        }
    }

    async fn run_pages(&mut self, job_id: &str) -> Result<()> {
        let mut consecutive_page_failures = 0u32;
        let mut page_num = self.config.start_num;

        loop {
            if let Some(end_num) = self.config.end_num {
                if page_num > end_num {
                    break;
                }
            }

            let page_url = self.config.page_url(page_num);
            let source_id = source_id_from_page_url(&page_url, page_num);
            let page = self.store.ensure_page(job_id, page_num, &page_url, &source_id)?;

            if self.config.resume && page.page_status()?.is_done() {
                page_num += 1;
                continue;
            }

            let page_ok = self.process_page(job_id, page_num, &page_url).await?;
            if page_ok {
                consecutive_page_failures = 0;
            } else {
                consecutive_page_failures += 1;
            }

            if self.config.end_num.is_none()
                && consecutive_page_failures >= self.config.stop_after_consecutive_page_failures
            {
                self.store.add_event(
                    job_id,
                    "stop_threshold",
                    &format!("stopped after {} consecutive page failures", consecutive_page_failures),
                    None,
                )?;
                tracing::warn!(
                    "Job {} stopped after {} consecutive page failures",
                    job_id,
                    consecutive_page_failures
                );
                break;
            }

            page_num += 1;
            if self.config.request_delay_sec > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(self.config.request_delay_sec)).await;
            }
        }
        Ok(())
    }

    /// Per-page state machine. Returns true iff the page settled as
    /// completed (with or without image failures).
    async fn process_page(&mut self, job_id: &str, page_num: i32, page_url: &str) -> Result<bool> {
        let source_id = source_id_from_page_url(page_url, page_num);
        let page = self.store.ensure_page(job_id, page_num, page_url, &source_id)?;
        self.store
            .update_page(page.id, PageStatus::Running, None, None, None, false)?;
        self.store
            .add_event(job_id, "page_start", &format!("page {} started", page_num), Some(page.id))?;

        let fetched = Self::fetch_with_retries(
            self.fetcher.as_ref(),
            page_url,
            self.config.page_timeout_sec,
            self.config.page_retries,
            self.config.request_delay_sec,
        )
        .await;
        let html = if fetched.ok { fetched.html.clone() } else { None };
        let Some(html) = html else {
            let reason = fetched
                .error
                .clone()
                .unwrap_or_else(|| "response carried no html".to_string());
            self.store.update_page(
                page.id,
                PageStatus::FailedFetch,
                None,
                Some(0),
                Some(&reason),
                true,
            )?;
            self.store.add_event(
                job_id,
                "page_fetch_failed",
                &format!("page {} fetch failed: {}", page_num, reason),
                Some(page.id),
            )?;
            tracing::warn!("Page {} fetch failed: {}", page_num, reason);
            return Ok(false);
        };

        let mut parsed =
            parse_image_urls(&html, page_url, &self.config.selector).map_err(anyhow::Error::from)?;

        if parsed.image_urls.is_empty() && self.config.playwright_fallback {
            if let Some(fallback) = &self.fallback_fetcher {
                tracing::info!("Page {} parsed empty; consulting fallback fetcher", page_num);
                let fallback_fetched = Self::fetch_with_retries(
                    fallback.as_ref(),
                    page_url,
                    self.config.page_timeout_sec,
                    0,
                    self.config.request_delay_sec,
                )
                .await;
                if fallback_fetched.ok {
                    if let Some(fallback_html) = fallback_fetched.html {
                        parsed = parse_image_urls(&fallback_html, page_url, &self.config.selector)
                            .map_err(anyhow::Error::from)?;
                    }
                }
            }
        }

        if parsed.image_urls.is_empty() {
            self.store
                .update_page(page.id, PageStatus::NoImages, Some(0), Some(0), None, true)?;
            self.write_page_sidecar(job_id, page.id)?;
            self.store.add_event(
                job_id,
                "page_no_images",
                &format!("page {} yielded no image urls", page_num),
                Some(page.id),
            )?;
            return Ok(false);
        }

        let image_urls = self.expanded_image_urls(&parsed.image_urls, &html)?;

        let page_dir = self.config.output_dir.join(page_dir_name(page_num));
        let triples: Vec<(i32, String, String)> = image_urls
            .iter()
            .enumerate()
            .map(|(offset, url)| {
                let local_path = page_dir.join(image_file_name(url));
                (offset as i32 + 1, url.clone(), local_path.to_string_lossy().into_owned())
            })
            .collect();
        let image_count = triples.len() as i32;

        self.store.upsert_page_images(page.id, &triples)?;
        self.store
            .update_page(page.id, PageStatus::Running, None, Some(image_count), None, false)?;
        let page_images = self.store.get_page_images(page.id)?;

        for image in &page_images {
            if image.image_status()?.is_terminal() {
                continue;
            }
            let destination = PathBuf::from(&image.local_path);

            if let Some(size_bytes) = existing_file_size(&destination) {
                // Fast path: a non-empty file on disk is accepted as the
                // completed artifact without network verification.
                let outcome = ImageOutcome {
                    retries: image.retries,
                    http_status: Some(200),
                    content_type: None,
                    size_bytes: Some(size_bytes as i64),
                    sha256: Some(file_sha256(&destination).map_err(anyhow::Error::from)?),
                    downloaded_at: Some(utc_now_iso()),
                    error: None,
                };
                self.store
                    .update_image_result(image.id, ImageStatus::Completed, &outcome)?;
                self.store.update_page(
                    page.id,
                    PageStatus::Running,
                    Some(image.image_index),
                    Some(image_count),
                    None,
                    false,
                )?;
                continue;
            }

            self.store.update_image_running(image.id)?;
            let result = self
                .downloader
                .download(
                    &image.url,
                    &destination,
                    self.config.image_timeout_sec,
                    self.config.image_retries,
                    self.config.request_delay_sec,
                )
                .await?;

            if result.ok {
                self.store.update_image_result(
                    image.id,
                    ImageStatus::Completed,
                    &outcome_from_download(&result),
                )?;
                self.store.update_page(
                    page.id,
                    PageStatus::Running,
                    Some(image.image_index),
                    Some(image_count),
                    None,
                    false,
                )?;
            } else {
                self.store.update_image_result(
                    image.id,
                    ImageStatus::Failed,
                    &outcome_from_download(&result),
                )?;
                let error = result.error.as_deref().unwrap_or("unknown error");
                self.store.add_event(
                    job_id,
                    "image_failed",
                    &format!(
                        "page {} image {} still failing after retries: {}",
                        page_num, image.image_index, error
                    ),
                    Some(page.id),
                )?;
                tracing::warn!("Page {} image {} failed: {}", page_num, image.image_index, error);
            }
        }

        self.refresh_page_status(page.id)?;
        self.write_page_sidecar(job_id, page.id)?;
        let settled = self
            .store
            .get_page(job_id, page_num)?
            .ok_or_else(|| Error::ObjectNotFound(format!("page {} of job {}", page_num, job_id)))?;
        Ok(matches!(
            settled.page_status()?,
            PageStatus::Completed | PageStatus::CompletedWithFailures
        ))
    }

    /// Retry failed image rows, refresh the touched pages, and rewrite their
    /// sidecars. Parameters default to the run configuration.
    pub async fn retry_failed(
        &mut self,
        job_id: &str,
        limit: Option<i64>,
        timeout_sec: Option<f64>,
        retries: Option<u32>,
        delay_sec: Option<f64>,
    ) -> Result<RetrySummary> {
        let timeout_sec = timeout_sec.unwrap_or(self.config.image_timeout_sec);
        let retries = retries.unwrap_or(self.config.image_retries);
        let delay_sec = delay_sec.unwrap_or(self.config.request_delay_sec);

        let failed_images = self.store.get_failed_images(job_id, limit)?;
        let mut summary = RetrySummary::default();
        let mut touched_pages = BTreeSet::new();

        for row in &failed_images {
            summary.retried += 1;
            touched_pages.insert(row.image.page_id);
            let destination = PathBuf::from(&row.image.local_path);
            let result = self
                .downloader
                .download(&row.image.url, &destination, timeout_sec, retries, delay_sec)
                .await?;
            let status = if result.ok {
                summary.recovered += 1;
                ImageStatus::Completed
            } else {
                summary.failed_again += 1;
                ImageStatus::Failed
            };
            self.store
                .update_image_result(row.image.id, status, &outcome_from_download(&result))?;
        }

        for page_id in touched_pages {
            self.refresh_page_status(page_id)?;
            self.write_page_sidecar(job_id, page_id)?;
        }

        self.store.add_event(
            job_id,
            "retry_failed",
            &format!(
                "retried failed images: retried={}, recovered={}, failed_again={}",
                summary.retried, summary.recovered, summary.failed_again
            ),
            None,
        )?;
        Ok(summary)
    }

    /// Export the job-level metadata summary JSON.
    pub fn export_job_metadata(&mut self, job_id: &str, output_path: &std::path::Path) -> Result<PathBuf> {
        let stats = self.store.stats_for_job(job_id)?;
        let pages = self.store.list_pages(job_id)?;
        let mut payload_pages = Vec::with_capacity(pages.len());
        for page in &pages {
            let images = self.store.get_page_images(page.id)?;
            payload_pages.push(serde_json::json!({
                "page_num": page.page_num,
                "page_url": page.page_url,
                "source_id": page.source_id,
                "status": page.status,
                "image_count": page.image_count,
                "last_completed_image_index": page.last_completed_image_index,
                "failed_images": sidecar::count_by_status(&images, ImageStatus::Failed),
                "metadata_path": sidecar::page_metadata_path(&self.config.output_dir, page.page_num)
                    .to_string_lossy(),
            }));
        }
        let payload = serde_json::json!({
            "generated_at": utc_now_iso(),
            "job": stats.job,
            "totals": { "pages": stats.pages, "images": stats.images },
            "pages": payload_pages,
        });
        sidecar::write_json_atomic(output_path, &payload)?;
        Ok(output_path.to_path_buf())
    }

    async fn fetch_with_retries(
        fetcher: &dyn PageFetcher,
        url: &str,
        timeout_sec: f64,
        retries: u32,
        delay_sec: f64,
    ) -> FetchOutcome {
        let attempts = retries + 1;
        let mut result = fetcher.fetch(url, timeout_sec).await;
        let mut attempt = 1;
        while attempt < attempts && !(result.ok && result.html.is_some()) {
            if delay_sec > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay_sec)).await;
            }
            result = fetcher.fetch(url, timeout_sec).await;
            attempt += 1;
        }
        result
    }

    /// Expand the parsed URL list through the numeric-sequence rules: a
    /// parsed upper bound extends the list to the advertised count; without
    /// a bound, gap-filling from the common seed is allowed only when the
    /// configuration does not require a bound.
    fn expanded_image_urls(&self, urls: &[String], html: &str) -> Result<Vec<String>> {
        let bound = parse_gallery_upper_bound(html, &self.config.sequence_count_selector)
            .map_err(anyhow::Error::from)?;
        if let Some(count) = bound {
            if let Some(expanded) = sequence::expand_image_urls(urls, count as usize) {
                tracing::info!(
                    "Expanded {} parsed urls to advertised count {}",
                    urls.len(),
                    count
                );
                return Ok(expanded);
            }
        } else if !self.config.sequence_require_upper_bound {
            if let Some((seed, max_index)) = sequence::infer_sequence_span(urls) {
                let span = (max_index - seed.start_index + 1) as usize;
                if span > urls.len() {
                    tracing::info!("Filling sequence gaps: {} urls over a span of {}", urls.len(), span);
                    return Ok((0..span as u32)
                        .map(|offset| sequence::build_sequence_url(&seed, seed.start_index + offset))
                        .collect());
                }
            }
        }
        Ok(urls.to_vec())
    }

    /// Recompute a page's status from its image rows.
    fn refresh_page_status(&mut self, page_id: i32) -> Result<()> {
        if self.store.get_page_by_id(page_id)?.is_none() {
            return Ok(());
        }
        let images = self.store.get_page_images(page_id)?;
        if images.is_empty() {
            self.store
                .update_page(page_id, PageStatus::NoImages, None, Some(0), None, true)?;
            return Ok(());
        }

        let mut has_open = false;
        let mut has_failed = false;
        let mut max_completed_index = 0;
        for image in &images {
            match image.image_status()? {
                ImageStatus::Pending | ImageStatus::Running => has_open = true,
                ImageStatus::Failed => has_failed = true,
                ImageStatus::Completed => {
                    max_completed_index = max_completed_index.max(image.image_index)
                }
            }
        }
        let image_count = images.len() as i32;

        if has_open {
            self.store.update_page(
                page_id,
                PageStatus::Running,
                Some(max_completed_index),
                Some(image_count),
                None,
                false,
            )?;
        } else {
            let status = if has_failed {
                PageStatus::CompletedWithFailures
            } else {
                PageStatus::Completed
            };
            self.store.update_page(
                page_id,
                status,
                Some(max_completed_index),
                Some(image_count),
                None,
                true,
            )?;
        }
        Ok(())
    }

    fn write_page_sidecar(&mut self, job_id: &str, page_id: i32) -> Result<()> {
        let Some(page) = self.store.get_page_by_id(page_id)? else {
            return Ok(());
        };
        let images = self.store.get_page_images(page_id)?;
        let path = sidecar::page_metadata_path(&self.config.output_dir, page.page_num);
        sidecar::write_page_metadata(&path, job_id, &self.config, &page, &images)
    }
}

fn outcome_from_download(result: &DownloadResult) -> ImageOutcome {
    ImageOutcome {
        retries: result.retries_used as i32,
        http_status: result.http_status.map(i32::from),
        content_type: result.content_type.clone(),
        size_bytes: result.size_bytes.map(|size| size as i64),
        sha256: result.sha256.clone(),
        downloaded_at: result.downloaded_at.clone(),
        error: result.error.clone(),
    }
}

/// Size of an existing regular file, when it is non-empty.
fn existing_file_size(path: &std::path::Path) -> Option<u64> {
    let metadata = std::fs::metadata(path).ok()?;
    (metadata.is_file() && metadata.len() > 0).then_some(metadata.len())
}
