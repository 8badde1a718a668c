//! Durable JSON summaries written next to the downloaded images.
//!
//! Every write goes to `<path>.tmp` first and is renamed into place; the
//! rename is the commit point, so a crash leaves at most an orphan temp file.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::json;

use harvest_core::config::RunConfig;
use harvest_core::naming::page_dir_name;
use harvest_core::status::ImageStatus;
use harvest_core::time::{duration_seconds, utc_now_iso};
use harvest_core::{Error, Result};
use harvest_store::model::{Image, Page};

pub fn page_metadata_path(output_dir: &Path, page_num: i32) -> PathBuf {
    output_dir.join(page_dir_name(page_num)).join("metadata.json")
}

pub(crate) fn write_page_metadata(
    path: &Path,
    job_id: &str,
    config: &RunConfig,
    page: &Page,
    images: &[Image],
) -> Result<()> {
    let payload_images: Vec<serde_json::Value> = images
        .iter()
        .map(|image| {
            json!({
                "index": image.image_index,
                "url": image.url,
                "local_path": image.local_path,
                "status": image.status,
                "retries": image.retries,
                "http_status": image.http_status,
                "content_type": image.content_type,
                "size_bytes": image.size_bytes,
                "sha256": image.sha256,
                "downloaded_at": image.downloaded_at,
                "error": image.error,
            })
        })
        .collect();

    let started_at = page.started_at.clone();
    let ended_at = page.finished_at.clone().unwrap_or_else(utc_now_iso);
    let success_count = count_by_status(images, ImageStatus::Completed);
    let failed_count = count_by_status(images, ImageStatus::Failed);

    let payload = json!({
        "job_id": job_id,
        "page_num": page.page_num,
        "page_url": page.page_url,
        "source_id": page.source_id,
        "selector": config.selector,
        "engine": config.engine.as_str(),
        "images": payload_images,
        "summary": {
            "total_count": images.len(),
            "success_count": success_count,
            "failed_count": failed_count,
            "status": page.status,
            "started_at": started_at,
            "ended_at": ended_at,
            "duration_sec": duration_seconds(&started_at, &ended_at),
        },
    });
    write_json_atomic(path, &payload)
}

pub(crate) fn count_by_status(images: &[Image], status: ImageStatus) -> usize {
    images
        .iter()
        .filter(|image| image.status == status.as_str())
        .count()
}

/// Write a JSON document through a temp file and an atomic rename.
/// Output is pretty-printed with two-space indent; non-ASCII stays literal.
pub(crate) fn write_json_atomic(path: &Path, payload: &serde_json::Value) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidConfig(format!("not a file path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name.to_string_lossy()));
    if let Some(parent) = tmp_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&tmp_path, serde_json::to_string_pretty(payload)?)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
