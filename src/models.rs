use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::error::{OcrError, RenderError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Fa,
    Ar,
    En,
}

impl Language {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "fa" => Some(Language::Fa),
            "ar" => Some(Language::Ar),
            "en" => Some(Language::En),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::Fa => "fa",
            Language::Ar => "ar",
            Language::En => "en",
        }
    }

    pub fn is_rtl(&self) -> bool {
        matches!(self, Language::Fa | Language::Ar)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Assembling,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Pending,
    Processing,
    Success,
    Failed,
}

/// One page's state. Exactly one of these exists per page index from job
/// creation onward; a page never leaves `Success` except via an explicit
/// retry reset back to `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageResult {
    pub page_index: usize,
    pub status: PageStatus,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl PageResult {
    pub fn pending(page_index: usize) -> Self {
        Self {
            page_index,
            status: PageStatus::Pending,
            text: String::new(),
            error: None,
        }
    }

    pub fn mark_processing(&mut self) {
        self.status = PageStatus::Processing;
    }

    pub fn mark_success(&mut self, text: String) {
        self.status = PageStatus::Success;
        self.text = text;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = PageStatus::Failed;
        self.text = String::new();
        self.error = Some(error.into());
    }

    pub fn reset_to_pending(&mut self) {
        self.status = PageStatus::Pending;
        self.error = None;
    }
}

impl From<RenderError> for String {
    fn from(err: RenderError) -> Self {
        err.to_string()
    }
}

impl From<OcrError> for String {
    fn from(err: OcrError) -> Self {
        err.to_string()
    }
}

/// Plain-data job record. Mutated only by the orchestrator and the retry
/// entry point; everyone else reads a snapshot through the registry.
/// Derived counters (succeeded/failed/completed) are computed from the page
/// map rather than stored, which rules out drift between a counter and the
/// page it's supposed to summarize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_filename: String,
    pub language: Language,
    pub ocr_prompt: Option<String>,
    pub total_pages: usize,
    pub status: JobStatus,
    pub pages: BTreeMap<usize, PageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        id: String,
        source_filename: String,
        language: Language,
        ocr_prompt: Option<String>,
        total_pages: usize,
    ) -> Self {
        let pages = (0..total_pages)
            .map(|idx| (idx, PageResult::pending(idx)))
            .collect();
        Self {
            id,
            source_filename,
            language,
            ocr_prompt,
            total_pages,
            status: JobStatus::Pending,
            pages,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn pages_succeeded(&self) -> usize {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Success)
            .count()
    }

    pub fn pages_failed(&self) -> usize {
        self.pages
            .values()
            .filter(|p| p.status == PageStatus::Failed)
            .count()
    }

    pub fn pages_completed(&self) -> usize {
        self.pages_succeeded() + self.pages_failed()
    }

    pub fn failed_page_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .pages
            .values()
            .filter(|p| p.status == PageStatus::Failed)
            .map(|p| p.page_index)
            .collect();
        indices.sort_unstable();
        indices
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResponse {
    pub job_id: String,
    pub retrying_pages: Vec<usize>,
}

/// Full job snapshot served by the status endpoint. Counters are computed
/// from the page map at serialization time rather than carried on `Job`
/// itself, same rationale as `Job::pages_succeeded` and friends.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub source_filename: String,
    pub language: Language,
    pub status: JobStatus,
    pub total_pages: usize,
    pub pages_succeeded: usize,
    pub pages_failed: usize,
    pub pages_completed: usize,
    pub failed_pages: Vec<usize>,
    pub pages: Vec<PageResult>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            source_filename: job.source_filename.clone(),
            language: job.language,
            status: job.status,
            total_pages: job.total_pages,
            pages_succeeded: job.pages_succeeded(),
            pages_failed: job.pages_failed(),
            pages_completed: job.pages_completed(),
            failed_pages: job.failed_page_indices(),
            pages: job.pages.values().cloned().collect(),
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
            error: job.error.clone(),
        }
    }
}

/// Generates a 12-hex-character job id, short enough to show in a URL but
/// wide enough (48 bits) that collisions are not a practical concern for a
/// single-process job registry.
pub fn new_job_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_has_one_pending_page_per_index() {
        let job = Job::new("abc123".into(), "book.pdf".into(), Language::En, None, 3);
        assert_eq!(job.pages.len(), 3);
        for idx in 0..3 {
            assert_eq!(job.pages[&idx].status, PageStatus::Pending);
        }
    }

    #[test]
    fn derived_counters_reflect_page_map() {
        let mut job = Job::new("abc123".into(), "book.pdf".into(), Language::En, None, 3);
        job.pages.get_mut(&0).unwrap().mark_success("hi".into());
        job.pages.get_mut(&1).unwrap().mark_failed("boom");
        assert_eq!(job.pages_succeeded(), 1);
        assert_eq!(job.pages_failed(), 1);
        assert_eq!(job.pages_completed(), 2);
        assert_eq!(job.failed_page_indices(), vec![1]);
    }

    #[test]
    fn language_parses_known_codes_only() {
        assert_eq!(Language::parse("fa"), Some(Language::Fa));
        assert_eq!(Language::parse("AR"), Some(Language::Ar));
        assert_eq!(Language::parse("en"), Some(Language::En));
        assert_eq!(Language::parse("fr"), None);
    }

    #[test]
    fn job_id_is_twelve_hex_characters() {
        let id = new_job_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn job_snapshot_reflects_page_map() {
        let mut job = Job::new("abc123".into(), "book.pdf".into(), Language::Fa, None, 2);
        job.pages.get_mut(&0).unwrap().mark_success("hi".into());
        job.pages.get_mut(&1).unwrap().mark_failed("boom");
        let snapshot = JobSnapshot::from(&job);
        assert_eq!(snapshot.pages_succeeded, 1);
        assert_eq!(snapshot.pages_failed, 1);
        assert_eq!(snapshot.failed_pages, vec![1]);
        assert_eq!(snapshot.pages.len(), 2);
    }
}
