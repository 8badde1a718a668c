//! Run configuration, validation, and stable job identity.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

pub const NUM_PLACEHOLDER: &str = "{num}";
pub const DEFAULT_SELECTOR: &str = "div.gallerypic img";
pub const DEFAULT_SEQUENCE_COUNT_SELECTOR: &str = "#tishi p span";

const JOB_ID_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Requests,
    Playwright,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Requests => "requests",
            Engine::Playwright => "playwright",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "requests" => Ok(Engine::Requests),
            "playwright" => Ok(Engine::Playwright),
            _ => Err(Error::UnknownEngine(s.to_string())),
        }
    }
}

/// Runtime configuration for one harvesting job.
///
/// A subset of the fields forms the job identity (see [`RunConfig::job_id`]);
/// everything else is a tunable that may change between resumed runs of the
/// same job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub url_template: String,
    pub start_num: i32,
    pub end_num: Option<i32>,
    pub selector: String,
    pub output_dir: PathBuf,
    pub state_db: PathBuf,
    pub engine: Engine,
    pub resume: bool,
    pub page_timeout_sec: f64,
    pub image_timeout_sec: f64,
    pub image_retries: u32,
    pub page_retries: u32,
    pub request_delay_sec: f64,
    pub stop_after_consecutive_page_failures: u32,
    pub playwright_fallback: bool,
    pub sequence_count_selector: String,
    pub sequence_require_upper_bound: bool,
    pub sequence_probe_after_upper_bound: bool,
    pub max_requests_per_sec: f64,
    pub max_burst: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            url_template: String::new(),
            start_num: 0,
            end_num: None,
            selector: DEFAULT_SELECTOR.to_string(),
            output_dir: PathBuf::from("data/downloads"),
            state_db: PathBuf::from("data/state.sqlite3"),
            engine: Engine::Requests,
            resume: true,
            page_timeout_sec: 20.0,
            image_timeout_sec: 30.0,
            image_retries: 3,
            page_retries: 2,
            request_delay_sec: 0.2,
            stop_after_consecutive_page_failures: 5,
            playwright_fallback: false,
            sequence_count_selector: DEFAULT_SEQUENCE_COUNT_SELECTOR.to_string(),
            sequence_require_upper_bound: true,
            sequence_probe_after_upper_bound: false,
            max_requests_per_sec: 80.0,
            max_burst: 120,
        }
    }
}

impl RunConfig {
    pub fn new(url_template: impl Into<String>, start_num: i32) -> Self {
        RunConfig {
            url_template: url_template.into(),
            start_num,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.url_template.contains(NUM_PLACEHOLDER) {
            return Err(Error::InvalidConfig(format!(
                "url_template must contain the `{}` placeholder",
                NUM_PLACEHOLDER
            )));
        }
        if self.start_num < 0 {
            return Err(Error::InvalidConfig("start_num must be >= 0".to_string()));
        }
        if let Some(end_num) = self.end_num {
            if end_num < self.start_num {
                return Err(Error::InvalidConfig("end_num must be >= start_num".to_string()));
            }
        }
        if self.selector.trim().is_empty() {
            return Err(Error::InvalidConfig("selector must not be empty".to_string()));
        }
        if self.sequence_count_selector.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "sequence_count_selector must not be empty".to_string(),
            ));
        }
        if self.page_timeout_sec < 0.0 || self.image_timeout_sec < 0.0 {
            return Err(Error::InvalidConfig("timeouts must be >= 0".to_string()));
        }
        if self.request_delay_sec < 0.0 {
            return Err(Error::InvalidConfig("request_delay_sec must be >= 0".to_string()));
        }
        if self.stop_after_consecutive_page_failures < 1 {
            return Err(Error::InvalidConfig(
                "stop_after_consecutive_page_failures must be >= 1".to_string(),
            ));
        }
        if self.max_requests_per_sec <= 0.0 {
            return Err(Error::InvalidConfig("max_requests_per_sec must be > 0".to_string()));
        }
        if self.max_burst < 1 {
            return Err(Error::InvalidConfig("max_burst must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Concrete page URL for one template value.
    pub fn page_url(&self, page_num: i32) -> String {
        self.url_template.replace(NUM_PLACEHOLDER, &page_num.to_string())
    }

    /// The subset of fields that determine which stored job a run belongs to.
    /// Tunables like timeouts and retry budgets are deliberately excluded so
    /// that re-running with adjusted knobs resumes the same job.
    pub fn job_identity(&self) -> serde_json::Value {
        json!({
            "url_template": self.url_template,
            "selector": self.selector,
            "output_dir": self.output_dir.display().to_string(),
            "engine": self.engine.as_str(),
            "sequence_count_selector": self.sequence_count_selector,
            "sequence_require_upper_bound": self.sequence_require_upper_bound,
            "sequence_probe_after_upper_bound": self.sequence_probe_after_upper_bound,
        })
    }

    /// Stable job identifier: `job_` plus the first 16 hex chars of the SHA-1
    /// of the canonical (sorted-key) JSON form of the identity subset.
    pub fn job_id(&self) -> String {
        let canonical = self.job_identity().to_string();
        let digest = hex::encode(Sha1::digest(canonical.as_bytes()));
        format!("job_{}", &digest[..JOB_ID_HEX_LEN])
    }

    /// Canonical JSON snapshot of the full configuration, persisted verbatim
    /// on the job row.
    pub fn as_json(&self) -> Result<String> {
        // Round-trip through Value so the keys come out sorted.
        let value = serde_json::to_value(self)?;
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig::new("https://example.test/gallery/{num}.html", 1)
    }

    #[test]
    fn job_id_is_deterministic_and_prefixed() {
        let first = config().job_id();
        let second = config().job_id();
        assert_eq!(first, second);
        assert!(first.starts_with("job_"));
        assert_eq!(first.len(), "job_".len() + 16);
    }

    #[test]
    fn job_id_ignores_tunables_but_tracks_identity_fields() {
        let mut tuned = config();
        tuned.image_retries = 9;
        tuned.request_delay_sec = 5.0;
        tuned.end_num = Some(100);
        assert_eq!(tuned.job_id(), config().job_id());

        let mut reselected = config();
        reselected.selector = "div.other img".to_string();
        assert_ne!(reselected.job_id(), config().job_id());

        let mut probed = config();
        probed.sequence_probe_after_upper_bound = true;
        assert_ne!(probed.job_id(), config().job_id());
    }

    #[test]
    fn validation_rejects_missing_placeholder() {
        let bad = RunConfig::new("https://x/no-placeholder", 1);
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validation_rejects_inverted_range() {
        let mut bad = RunConfig::new("https://x/{num}", 5);
        bad.end_num = Some(4);
        assert!(matches!(bad.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn validation_rejects_empty_selector_and_zero_stop_threshold() {
        let mut bad = config();
        bad.selector = "  ".to_string();
        assert!(bad.validate().is_err());

        let mut bad = config();
        bad.stop_after_consecutive_page_failures = 0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn config_json_round_trips_and_sorts_keys() {
        let snapshot = config().as_json().unwrap();
        let restored: RunConfig = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(restored.url_template, config().url_template);
        assert_eq!(restored.selector, DEFAULT_SELECTOR);
        // Sorted keys make the snapshot canonical.
        let engine_pos = snapshot.find("\"engine\"").unwrap();
        let template_pos = snapshot.find("\"url_template\"").unwrap();
        assert!(engine_pos < template_pos);
    }

    #[test]
    fn page_url_substitutes_the_placeholder() {
        assert_eq!(config().page_url(7), "https://example.test/gallery/7.html");
    }

    #[test]
    fn engine_parses_case_insensitively() {
        assert_eq!("Requests".parse::<Engine>().unwrap(), Engine::Requests);
        assert_eq!("playwright".parse::<Engine>().unwrap(), Engine::Playwright);
        assert!("curl".parse::<Engine>().is_err());
    }
}
