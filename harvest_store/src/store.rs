//! SQLite-backed persistence for jobs, pages, images, and events.

use std::fs;
use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;

use harvest_core::schema::{events, images, jobs, pages};
use harvest_core::status::{ImageStatus, JobStatus, PageStatus};
use harvest_core::time::utc_now_iso;
use harvest_core::{Error, Result};

use crate::model::{
    Event, FailedImage, Image, ImageOutcome, ImageResultUpdate, ImageTotals, Job, JobStats,
    JobSummary, NewEvent, NewImage, NewJob, NewPage, Page, PageTotals,
};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS jobs (
  job_id TEXT PRIMARY KEY,
  status TEXT NOT NULL,
  config_json TEXT NOT NULL,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  finished_at TEXT
);

CREATE TABLE IF NOT EXISTS pages (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id TEXT NOT NULL,
  page_num INTEGER NOT NULL,
  page_url TEXT NOT NULL,
  source_id TEXT NOT NULL,
  status TEXT NOT NULL,
  last_completed_image_index INTEGER NOT NULL DEFAULT 0,
  image_count INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  finished_at TEXT,
  UNIQUE(job_id, page_num),
  FOREIGN KEY(job_id) REFERENCES jobs(job_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS images (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  page_id INTEGER NOT NULL,
  image_index INTEGER NOT NULL,
  url TEXT NOT NULL,
  local_path TEXT NOT NULL,
  status TEXT NOT NULL,
  retries INTEGER NOT NULL DEFAULT 0,
  http_status INTEGER,
  content_type TEXT,
  size_bytes INTEGER,
  sha256 TEXT,
  downloaded_at TEXT,
  error TEXT,
  updated_at TEXT NOT NULL,
  UNIQUE(page_id, image_index),
  FOREIGN KEY(page_id) REFERENCES pages(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS events (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id TEXT NOT NULL,
  page_id INTEGER,
  event_type TEXT NOT NULL,
  message TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY(job_id) REFERENCES jobs(job_id) ON DELETE CASCADE,
  FOREIGN KEY(page_id) REFERENCES pages(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_pages_job_id ON pages(job_id);
CREATE INDEX IF NOT EXISTS idx_images_page_id ON images(page_id);
CREATE INDEX IF NOT EXISTS idx_images_status ON images(status);
CREATE INDEX IF NOT EXISTS idx_events_job_id ON events(job_id);
";

/// Persistence layer for resumable harvesting jobs.
///
/// One `StateStore` owns one SQLite connection; the orchestrator is the only
/// writer for its job. Read-only consumers open their own store on the same
/// path.
pub struct StateStore {
    conn: SqliteConnection,
}

impl StateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut conn = SqliteConnection::establish(&path.to_string_lossy())?;
        conn.batch_execute(
            "PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL; \
             PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 30000;",
        )?;
        conn.batch_execute(SCHEMA_SQL)?;
        Ok(StateStore { conn })
    }

    // MARK: Jobs

    /// Create or refresh the job row, keeping `started_at` on conflict.
    pub fn upsert_job(&mut self, job_id: &str, config_json: &str, status: JobStatus) -> Result<()> {
        let now = utc_now_iso();
        let new_job = NewJob {
            job_id: job_id.to_string(),
            status: status.as_str().to_string(),
            config_json: config_json.to_string(),
            started_at: now.clone(),
            updated_at: now.clone(),
        };
        diesel::insert_into(jobs::table)
            .values(&new_job)
            .on_conflict(jobs::job_id)
            .do_update()
            .set((
                jobs::status.eq(status.as_str()),
                jobs::config_json.eq(config_json),
                jobs::updated_at.eq(&now),
            ))
            .execute(&mut self.conn)?;
        Ok(())
    }

    /// Delete previous state for a stable job id and recreate the root
    /// record. Pages, images, and events go with it via cascade.
    pub fn reset_job(&mut self, job_id: &str, config_json: &str) -> Result<()> {
        let now = utc_now_iso();
        self.conn.transaction::<_, Error, _>(|conn| {
            diesel::delete(jobs::table.find(job_id)).execute(conn)?;
            diesel::insert_into(jobs::table)
                .values(&NewJob {
                    job_id: job_id.to_string(),
                    status: JobStatus::Running.as_str().to_string(),
                    config_json: config_json.to_string(),
                    started_at: now.clone(),
                    updated_at: now.clone(),
                })
                .execute(conn)?;
            Ok(())
        })?;
        tracing::info!("Reset job {}", job_id);
        Ok(())
    }

    pub fn set_job_status(&mut self, job_id: &str, status: JobStatus, finish: bool) -> Result<()> {
        let now = utc_now_iso();
        if finish {
            diesel::update(jobs::table.find(job_id))
                .set((
                    jobs::status.eq(status.as_str()),
                    jobs::updated_at.eq(&now),
                    jobs::finished_at.eq(Some(now.clone())),
                ))
                .execute(&mut self.conn)?;
        } else {
            diesel::update(jobs::table.find(job_id))
                .set((jobs::status.eq(status.as_str()), jobs::updated_at.eq(&now)))
                .execute(&mut self.conn)?;
        }
        Ok(())
    }

    pub fn get_job(&mut self, job_id: &str) -> Result<Option<Job>> {
        Ok(jobs::table.find(job_id).first(&mut self.conn).optional()?)
    }

    pub fn get_latest_job(&mut self) -> Result<Option<Job>> {
        Ok(jobs::table
            .order(jobs::started_at.desc())
            .first(&mut self.conn)
            .optional()?)
    }

    pub fn list_jobs(&mut self) -> Result<Vec<Job>> {
        Ok(jobs::table
            .order(jobs::started_at.desc())
            .load(&mut self.conn)?)
    }

    // MARK: Pages

    /// Idempotent upsert keyed by `(job_id, page_num)`. Never regresses the
    /// page status or counters; only the URL, source id, and `updated_at`
    /// are refreshed on conflict.
    pub fn ensure_page(
        &mut self,
        job_id: &str,
        page_num: i32,
        page_url: &str,
        source_id: &str,
    ) -> Result<Page> {
        let now = utc_now_iso();
        diesel::insert_into(pages::table)
            .values(&NewPage {
                job_id: job_id.to_string(),
                page_num,
                page_url: page_url.to_string(),
                source_id: source_id.to_string(),
                status: PageStatus::Pending.as_str().to_string(),
                last_completed_image_index: 0,
                image_count: 0,
                started_at: now.clone(),
                updated_at: now.clone(),
            })
            .on_conflict((pages::job_id, pages::page_num))
            .do_update()
            .set((
                pages::page_url.eq(page_url),
                pages::source_id.eq(source_id),
                pages::updated_at.eq(&now),
            ))
            .execute(&mut self.conn)?;
        let page = pages::table
            .filter(pages::job_id.eq(job_id))
            .filter(pages::page_num.eq(page_num))
            .first(&mut self.conn)?;
        Ok(page)
    }

    pub fn get_page(&mut self, job_id: &str, page_num: i32) -> Result<Option<Page>> {
        Ok(pages::table
            .filter(pages::job_id.eq(job_id))
            .filter(pages::page_num.eq(page_num))
            .first(&mut self.conn)
            .optional()?)
    }

    pub fn get_page_by_id(&mut self, page_id: i32) -> Result<Option<Page>> {
        Ok(pages::table.find(page_id).first(&mut self.conn).optional()?)
    }

    pub fn list_pages(&mut self, job_id: &str) -> Result<Vec<Page>> {
        Ok(pages::table
            .filter(pages::job_id.eq(job_id))
            .order(pages::page_num.asc())
            .load(&mut self.conn)?)
    }

    /// Partial page update. `None` for either numeric field keeps the stored
    /// value; the error column is always overwritten with the given value.
    pub fn update_page(
        &mut self,
        page_id: i32,
        status: PageStatus,
        last_completed_image_index: Option<i32>,
        image_count: Option<i32>,
        error: Option<&str>,
        finish: bool,
    ) -> Result<()> {
        let now = utc_now_iso();
        self.conn.transaction::<_, Error, _>(|conn| {
            let page: Page = pages::table.find(page_id).first(conn)?;
            let last_completed =
                last_completed_image_index.unwrap_or(page.last_completed_image_index);
            let count = image_count.unwrap_or(page.image_count);
            let finished_at = if finish { Some(now.clone()) } else { page.finished_at };
            diesel::update(pages::table.find(page_id))
                .set((
                    pages::status.eq(status.as_str()),
                    pages::last_completed_image_index.eq(last_completed),
                    pages::image_count.eq(count),
                    pages::error.eq(error),
                    pages::updated_at.eq(&now),
                    pages::finished_at.eq(finished_at),
                ))
                .execute(conn)?;
            Ok(())
        })
    }

    // MARK: Images

    /// Bulk insert or refresh image rows for a page. Existing rows keep their
    /// status and retry counters; only the URL and target path may move.
    pub fn upsert_page_images(&mut self, page_id: i32, items: &[(i32, String, String)]) -> Result<()> {
        let now = utc_now_iso();
        self.conn.transaction::<_, Error, _>(|conn| {
            for (image_index, url, local_path) in items {
                diesel::insert_into(images::table)
                    .values(&NewImage {
                        page_id,
                        image_index: *image_index,
                        url: url.clone(),
                        local_path: local_path.clone(),
                        status: ImageStatus::Pending.as_str().to_string(),
                        retries: 0,
                        updated_at: now.clone(),
                    })
                    .on_conflict((images::page_id, images::image_index))
                    .do_update()
                    .set((
                        images::url.eq(url),
                        images::local_path.eq(local_path),
                        images::updated_at.eq(&now),
                    ))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    pub fn get_page_images(&mut self, page_id: i32) -> Result<Vec<Image>> {
        Ok(images::table
            .filter(images::page_id.eq(page_id))
            .order(images::image_index.asc())
            .load(&mut self.conn)?)
    }

    pub fn update_image_running(&mut self, image_id: i32) -> Result<()> {
        diesel::update(images::table.find(image_id))
            .set((
                images::status.eq(ImageStatus::Running.as_str()),
                images::updated_at.eq(utc_now_iso()),
            ))
            .execute(&mut self.conn)?;
        Ok(())
    }

    pub fn update_image_result(
        &mut self,
        image_id: i32,
        status: ImageStatus,
        outcome: &ImageOutcome,
    ) -> Result<()> {
        let update = ImageResultUpdate {
            status: status.as_str().to_string(),
            retries: outcome.retries,
            http_status: outcome.http_status,
            content_type: outcome.content_type.clone(),
            size_bytes: outcome.size_bytes,
            sha256: outcome.sha256.clone(),
            downloaded_at: outcome.downloaded_at.clone(),
            error: outcome.error.clone(),
            updated_at: utc_now_iso(),
        };
        diesel::update(images::table.find(image_id))
            .set(&update)
            .execute(&mut self.conn)?;
        Ok(())
    }

    /// Crash-recovery primitive: atomically revert every running page and
    /// every running image under the job back to pending.
    pub fn reset_running_to_pending(&mut self, job_id: &str) -> Result<()> {
        let now = utc_now_iso();
        self.conn.transaction::<_, Error, _>(|conn| {
            diesel::update(
                pages::table
                    .filter(pages::job_id.eq(job_id))
                    .filter(pages::status.eq(PageStatus::Running.as_str())),
            )
            .set((
                pages::status.eq(PageStatus::Pending.as_str()),
                pages::updated_at.eq(&now),
            ))
            .execute(conn)?;

            let job_page_ids = pages::table
                .filter(pages::job_id.eq(job_id))
                .select(pages::id);
            diesel::update(
                images::table
                    .filter(images::page_id.eq_any(job_page_ids))
                    .filter(images::status.eq(ImageStatus::Running.as_str())),
            )
            .set((
                images::status.eq(ImageStatus::Pending.as_str()),
                images::updated_at.eq(&now),
            ))
            .execute(conn)?;
            Ok(())
        })?;
        tracing::info!("Reverted running rows to pending for job {}", job_id);
        Ok(())
    }

    /// Failed images for a job, joined with their page context, ordered by
    /// `(page_num, image_index)`.
    pub fn get_failed_images(&mut self, job_id: &str, limit: Option<i64>) -> Result<Vec<FailedImage>> {
        let mut query = images::table
            .inner_join(pages::table)
            .filter(pages::job_id.eq(job_id))
            .filter(images::status.eq(ImageStatus::Failed.as_str()))
            .order((pages::page_num.asc(), images::image_index.asc()))
            .select((
                Image::as_select(),
                pages::page_num,
                pages::page_url,
                pages::source_id,
            ))
            .into_boxed();
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let rows: Vec<(Image, i32, String, String)> = query.load(&mut self.conn)?;
        Ok(rows
            .into_iter()
            .map(|(image, page_num, page_url, source_id)| FailedImage {
                image,
                page_num,
                page_url,
                source_id,
            })
            .collect())
    }

    // MARK: Events

    pub fn add_event(
        &mut self,
        job_id: &str,
        event_type: &str,
        message: &str,
        page_id: Option<i32>,
    ) -> Result<()> {
        diesel::insert_into(events::table)
            .values(&NewEvent {
                job_id: job_id.to_string(),
                page_id,
                event_type: event_type.to_string(),
                message: message.to_string(),
                created_at: utc_now_iso(),
            })
            .execute(&mut self.conn)?;
        Ok(())
    }

    pub fn list_events(&mut self, job_id: &str, limit: i64) -> Result<Vec<Event>> {
        Ok(events::table
            .filter(events::job_id.eq(job_id))
            .order(events::id.desc())
            .limit(limit)
            .load(&mut self.conn)?)
    }

    // MARK: Stats

    /// Aggregate pages by status and images by status, one query each.
    pub fn stats_for_job(&mut self, job_id: &str) -> Result<JobStats> {
        let job = self
            .get_job(job_id)?
            .ok_or_else(|| Error::ObjectNotFound(format!("job {}", job_id)))?;

        let page_counts: Vec<(String, i64)> = pages::table
            .filter(pages::job_id.eq(job_id))
            .group_by(pages::status)
            .select((pages::status, diesel::dsl::count_star()))
            .load(&mut self.conn)?;
        let mut page_totals = PageTotals::default();
        for (status, count) in page_counts {
            page_totals.total_pages += count;
            match status.parse::<PageStatus>() {
                Ok(PageStatus::Completed) | Ok(PageStatus::CompletedWithFailures) => {
                    page_totals.done_pages += count
                }
                Ok(PageStatus::FailedFetch) => page_totals.failed_pages += count,
                Ok(PageStatus::NoImages) => page_totals.empty_pages += count,
                _ => {}
            }
        }

        let image_counts: Vec<(String, i64)> = images::table
            .inner_join(pages::table)
            .filter(pages::job_id.eq(job_id))
            .group_by(images::status)
            .select((images::status, diesel::dsl::count_star()))
            .load(&mut self.conn)?;
        let mut image_totals = ImageTotals::default();
        for (status, count) in image_counts {
            image_totals.total_images += count;
            match status.parse::<ImageStatus>() {
                Ok(ImageStatus::Completed) => image_totals.completed_images += count,
                Ok(ImageStatus::Failed) => image_totals.failed_images += count,
                Ok(ImageStatus::Pending) | Ok(ImageStatus::Running) => {
                    image_totals.remaining_images += count
                }
                Err(_) => {}
            }
        }

        Ok(JobStats {
            job: JobSummary::from(&job),
            pages: page_totals,
            images: image_totals,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> StateStore {
        StateStore::open(dir.path().join("state.sqlite3")).unwrap()
    }

    fn seed_page(store: &mut StateStore, job_id: &str) -> Page {
        store.upsert_job(job_id, "{}", JobStatus::Running).unwrap();
        store
            .ensure_page(job_id, 1, "https://example/1.html", "1")
            .unwrap()
    }

    #[test]
    fn ensure_page_is_idempotent_and_never_regresses_status() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");
        assert_eq!(page.status, "pending");

        store
            .update_page(page.id, PageStatus::Completed, Some(3), Some(3), None, true)
            .unwrap();
        let again = store
            .ensure_page("job_x", 1, "https://example/1b.html", "1")
            .unwrap();
        assert_eq!(again.id, page.id);
        assert_eq!(again.status, "completed");
        assert_eq!(again.page_url, "https://example/1b.html");
        assert_eq!(again.last_completed_image_index, 3);
    }

    #[test]
    fn update_page_coalesces_numeric_fields() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");

        store
            .update_page(page.id, PageStatus::Running, Some(2), Some(5), None, false)
            .unwrap();
        store
            .update_page(page.id, PageStatus::Running, None, None, Some("boom"), false)
            .unwrap();
        let current = store.get_page_by_id(page.id).unwrap().unwrap();
        assert_eq!(current.last_completed_image_index, 2);
        assert_eq!(current.image_count, 5);
        assert_eq!(current.error.as_deref(), Some("boom"));
        assert!(current.finished_at.is_none());

        store
            .update_page(page.id, PageStatus::Completed, None, None, None, true)
            .unwrap();
        let current = store.get_page_by_id(page.id).unwrap().unwrap();
        assert!(current.finished_at.is_some());
        assert!(current.error.is_none());
    }

    #[test]
    fn upsert_page_images_keeps_status_and_retries() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");

        let items = vec![(1, "https://i/1.jpg".to_string(), "/tmp/a.jpg".to_string())];
        store.upsert_page_images(page.id, &items).unwrap();
        let image = store.get_page_images(page.id).unwrap().remove(0);
        store
            .update_image_result(
                image.id,
                ImageStatus::Failed,
                &ImageOutcome {
                    retries: 2,
                    error: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();

        let moved = vec![(1, "https://i/1.jpg".to_string(), "/tmp/b.jpg".to_string())];
        store.upsert_page_images(page.id, &moved).unwrap();
        let image = store.get_page_images(page.id).unwrap().remove(0);
        assert_eq!(image.status, "failed");
        assert_eq!(image.retries, 2);
        assert_eq!(image.local_path, "/tmp/b.jpg");
    }

    #[test]
    fn reset_running_to_pending_restores_interrupted_rows() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");
        store
            .update_page(page.id, PageStatus::Running, None, None, None, false)
            .unwrap();
        store
            .upsert_page_images(page.id, &[(1, "https://i/1.jpg".to_string(), "a.jpg".to_string())])
            .unwrap();
        let image = store.get_page_images(page.id).unwrap().remove(0);
        store.update_image_running(image.id).unwrap();

        store.reset_running_to_pending("job_x").unwrap();

        let page_after = store.get_page("job_x", 1).unwrap().unwrap();
        assert_eq!(page_after.status, "pending");
        let image_after = store.get_page_images(page.id).unwrap().remove(0);
        assert_eq!(image_after.status, "pending");
    }

    #[test]
    fn reset_job_cascades_to_pages_images_and_events() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");
        store
            .upsert_page_images(page.id, &[(1, "https://i/1.jpg".to_string(), "a.jpg".to_string())])
            .unwrap();
        store.add_event("job_x", "page_start", "page 1 started", Some(page.id)).unwrap();

        store.reset_job("job_x", "{}").unwrap();

        assert!(store.list_pages("job_x").unwrap().is_empty());
        assert!(store.get_page_images(page.id).unwrap().is_empty());
        assert!(store.list_events("job_x", 10).unwrap().is_empty());
        let job = store.get_job("job_x").unwrap().unwrap();
        assert_eq!(job.status, "running");
    }

    #[test]
    fn failed_images_and_stats_aggregate_by_status() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        let page = seed_page(&mut store, "job_x");
        store
            .upsert_page_images(
                page.id,
                &[
                    (1, "https://i/1.jpg".to_string(), "a.jpg".to_string()),
                    (2, "https://i/2.jpg".to_string(), "b.jpg".to_string()),
                ],
            )
            .unwrap();
        let images = store.get_page_images(page.id).unwrap();
        store
            .update_image_result(
                images[0].id,
                ImageStatus::Completed,
                &ImageOutcome {
                    http_status: Some(200),
                    size_bytes: Some(10),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_image_result(
                images[1].id,
                ImageStatus::Failed,
                &ImageOutcome {
                    error: Some("boom".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .update_page(page.id, PageStatus::CompletedWithFailures, Some(1), Some(2), None, true)
            .unwrap();

        let failed = store.get_failed_images("job_x", None).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].image.image_index, 2);
        assert_eq!(failed[0].page_num, 1);
        assert!(store.get_failed_images("job_x", Some(0)).unwrap().is_empty());

        let stats = store.stats_for_job("job_x").unwrap();
        assert_eq!(stats.pages.total_pages, 1);
        assert_eq!(stats.pages.done_pages, 1);
        assert_eq!(stats.images.total_images, 2);
        assert_eq!(stats.images.completed_images, 1);
        assert_eq!(stats.images.failed_images, 1);
        assert_eq!(stats.images.remaining_images, 0);
    }

    #[test]
    fn latest_job_orders_by_start_time() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir);
        store.upsert_job("job_a", "{}", JobStatus::Completed).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.upsert_job("job_b", "{}", JobStatus::Running).unwrap();
        let latest = store.get_latest_job().unwrap().unwrap();
        assert_eq!(latest.job_id, "job_b");
        assert_eq!(store.list_jobs().unwrap().len(), 2);
    }
}
