// Status enums for the three persisted entities. The database stores the
// snake_case string forms; these types keep transitions explicit in code.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(Error::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Running,
    FailedFetch,
    NoImages,
    Completed,
    CompletedWithFailures,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Pending => "pending",
            PageStatus::Running => "running",
            PageStatus::FailedFetch => "failed_fetch",
            PageStatus::NoImages => "no_images",
            PageStatus::Completed => "completed",
            PageStatus::CompletedWithFailures => "completed_with_failures",
        }
    }

    /// A settled page is skipped on resume; its images need no further work.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            PageStatus::Completed | PageStatus::CompletedWithFailures | PageStatus::NoImages
        )
    }

    /// Terminal statuses also include fetch failures, which resume retries.
    pub fn is_terminal(&self) -> bool {
        self.is_done() || matches!(self, PageStatus::FailedFetch)
    }
}

impl fmt::Display for PageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(PageStatus::Pending),
            "running" => Ok(PageStatus::Running),
            "failed_fetch" => Ok(PageStatus::FailedFetch),
            "no_images" => Ok(PageStatus::NoImages),
            "completed" => Ok(PageStatus::Completed),
            "completed_with_failures" => Ok(PageStatus::CompletedWithFailures),
            _ => Err(Error::UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Running => "running",
            ImageStatus::Completed => "completed",
            ImageStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImageStatus::Completed | ImageStatus::Failed)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ImageStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(ImageStatus::Pending),
            "running" => Ok(ImageStatus::Running),
            "completed" => Ok(ImageStatus::Completed),
            "failed" => Ok(ImageStatus::Failed),
            _ => Err(Error::UnknownStatus(s.to_string())),
        }
    }
}
