// Database model definitions.
//
// Timestamps are ISO-8601 UTC strings stored as TEXT; the column names are a
// contract for external read-only consumers, so the rows stay close to the
// wire format and expose typed accessors for the status fields.

use diesel::prelude::*;
use serde::Serialize;

use harvest_core::schema::{events, images, jobs, pages};
use harvest_core::status::{ImageStatus, JobStatus, PageStatus};
use harvest_core::Result;

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = jobs)]
#[diesel(primary_key(job_id))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Job {
    pub job_id: String,
    pub status: String,
    pub config_json: String,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl Job {
    pub fn job_status(&self) -> Result<JobStatus> {
        self.status.parse()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewJob {
    pub job_id: String,
    pub status: String,
    pub config_json: String,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = pages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Page {
    pub id: i32,
    pub job_id: String,
    pub page_num: i32,
    pub page_url: String,
    pub source_id: String,
    pub status: String,
    pub last_completed_image_index: i32,
    pub image_count: i32,
    pub error: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl Page {
    pub fn page_status(&self) -> Result<PageStatus> {
        self.status.parse()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = pages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewPage {
    pub job_id: String,
    pub page_num: i32,
    pub page_url: String,
    pub source_id: String,
    pub status: String,
    pub last_completed_image_index: i32,
    pub image_count: i32,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Associations, Debug, Clone, Serialize)]
#[diesel(table_name = images)]
#[diesel(belongs_to(Page))]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Image {
    pub id: i32,
    pub page_id: i32,
    pub image_index: i32,
    pub url: String,
    pub local_path: String,
    pub status: String,
    pub retries: i32,
    pub http_status: Option<i32>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub downloaded_at: Option<String>,
    pub error: Option<String>,
    pub updated_at: String,
}

impl Image {
    pub fn image_status(&self) -> Result<ImageStatus> {
        self.status.parse()
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = images)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewImage {
    pub page_id: i32,
    pub image_index: i32,
    pub url: String,
    pub local_path: String,
    pub status: String,
    pub retries: i32,
    pub updated_at: String,
}

/// Download outcome fields persisted onto an image row. `None` clears the
/// corresponding column so a recovered image loses its stale error.
#[derive(Debug, Clone, Default)]
pub struct ImageOutcome {
    pub retries: i32,
    pub http_status: Option<i32>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub downloaded_at: Option<String>,
    pub error: Option<String>,
}

#[derive(AsChangeset, Debug, Clone)]
#[diesel(table_name = images)]
#[diesel(treat_none_as_null = true)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub(crate) struct ImageResultUpdate {
    pub status: String,
    pub retries: i32,
    pub http_status: Option<i32>,
    pub content_type: Option<String>,
    pub size_bytes: Option<i64>,
    pub sha256: Option<String>,
    pub downloaded_at: Option<String>,
    pub error: Option<String>,
    pub updated_at: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, Serialize)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Event {
    pub id: i32,
    pub job_id: String,
    pub page_id: Option<i32>,
    pub event_type: String,
    pub message: String,
    pub created_at: String,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = events)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEvent {
    pub job_id: String,
    pub page_id: Option<i32>,
    pub event_type: String,
    pub message: String,
    pub created_at: String,
}

/// One failed image joined with the page columns a retry needs for context.
#[derive(Debug, Clone, Serialize)]
pub struct FailedImage {
    #[serde(flatten)]
    pub image: Image,
    pub page_num: i32,
    pub page_url: String,
    pub source_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub finished_at: Option<String>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        JobSummary {
            job_id: job.job_id.clone(),
            status: job.status.clone(),
            started_at: job.started_at.clone(),
            updated_at: job.updated_at.clone(),
            finished_at: job.finished_at.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PageTotals {
    pub total_pages: i64,
    pub done_pages: i64,
    pub failed_pages: i64,
    pub empty_pages: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ImageTotals {
    pub total_images: i64,
    pub completed_images: i64,
    pub failed_images: i64,
    pub remaining_images: i64,
}

/// Aggregated view of one job, page counts by status, image counts by status.
#[derive(Debug, Clone, Serialize)]
pub struct JobStats {
    pub job: JobSummary,
    pub pages: PageTotals,
    pub images: ImageTotals,
}
