use thiserror::Error;

/// Per-page rendering failure. Absorbed by the orchestrator — it never
/// fails the job, only the page.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum RenderError {
    #[error("page {page} is out of range (document has {total} pages)")]
    InvalidPageIndex { page: usize, total: usize },

    #[error("failed to decode page {page}: {detail}")]
    DecodeFailed { page: usize, detail: String },
}

/// Per-page OCR failure, returned only after retry exhaustion.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum OcrError {
    #[error("ocr request failed: {0}")]
    Network(String),

    #[error("ocr endpoint returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("ocr endpoint returned malformed JSON: {0}")]
    MalformedJson(String),

    #[error("ocr endpoint returned empty text")]
    EmptyText,

    #[error("ocr request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("ocr retries exhausted after {attempts} attempts, last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

impl OcrError {
    /// Retryable per §4.2: network errors, HTTP 5xx, timeouts, and
    /// empty-text responses. Non-retryable: HTTP 4xx other than 408/429,
    /// malformed JSON.
    pub fn is_retryable(&self) -> bool {
        match self {
            OcrError::Network(_) | OcrError::Timeout { .. } | OcrError::EmptyText => true,
            OcrError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            OcrError::MalformedJson(_) => false,
            OcrError::RetriesExhausted { .. } => false,
        }
    }
}

/// Pipeline-level (job-fatal) failure: a producer that cannot render any
/// page, an assembler that cannot write the EPUB, or catastrophic
/// persistence failure. Per-page errors never escalate to this.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("failed to build epub: {0}")]
    Build(String),

    #[error("failed to write output file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("renderer could not open source pdf: {0}")]
    RenderSetup(String),

    #[error(transparent)]
    Assemble(#[from] AssembleError),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_5xx_is_retryable() {
        let err = OcrError::Http {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn http_4xx_other_than_408_429_is_not_retryable() {
        let err = OcrError::Http {
            status: 400,
            body: String::new(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn http_408_and_429_are_retryable() {
        assert!(OcrError::Http { status: 408, body: String::new() }.is_retryable());
        assert!(OcrError::Http { status: 429, body: String::new() }.is_retryable());
    }

    #[test]
    fn empty_text_is_retryable() {
        assert!(OcrError::EmptyText.is_retryable());
    }

    #[test]
    fn malformed_json_is_not_retryable() {
        assert!(!OcrError::MalformedJson("bad".into()).is_retryable());
    }
}
