use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::error::OcrError;

const BACKOFF_BASE_SECS: u64 = 1;
const BACKOFF_CAP_SECS: u64 = 30;

/// Posts a base64-encoded JPEG plus a text prompt to the vision endpoint and
/// returns the recognized text. OCR output is treated as opaque text — the
/// pipeline does not normalize or validate it beyond checking it isn't
/// blank.
#[async_trait]
pub trait OcrClient: Send + Sync {
    async fn ocr(
        &self,
        image_bytes: &[u8],
        prompt: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, OcrError>;
}

pub struct OllamaOcrClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OllamaOcrClient {
    pub fn new(base_url: String, model: String, timeout: Duration, max_retries: u32) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            model,
            timeout,
            max_retries,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
    images: Vec<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

#[async_trait]
impl OcrClient for OllamaOcrClient {
    /// Retries up to `max_retries` times. Attempt *k* (1-indexed) waits
    /// `base * 2^(k-1)` seconds, capped, before the next attempt. Checks
    /// `cancel` between attempts but never interrupts an in-flight request
    /// — it either completes or times out.
    async fn ocr(
        &self,
        image_bytes: &[u8],
        prompt: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, OcrError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(image_bytes);
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let mut last_err: Option<OcrError> = None;

        for attempt in 1..=self.max_retries.max(1) {
            if *cancel.borrow() {
                return Err(last_err.unwrap_or(OcrError::Network("cancelled".to_string())));
            }

            if attempt > 1 {
                let backoff = BACKOFF_BASE_SECS
                    .saturating_mul(1u64 << (attempt - 2))
                    .min(BACKOFF_CAP_SECS);
                debug!(attempt, backoff_secs = backoff, "backing off before ocr retry");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }

            match self.attempt_once(&url, prompt, &encoded).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(attempt, error = %err, retryable, "ocr attempt failed");
                    last_err = Some(err);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let last_error = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        Err(OcrError::RetriesExhausted {
            attempts: self.max_retries.max(1),
            last_error,
        })
    }
}

impl OllamaOcrClient {
    async fn attempt_once(
        &self,
        url: &str,
        prompt: &str,
        encoded_image: &str,
    ) -> Result<String, OcrError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
                images: vec![encoded_image.to_string()],
            }],
            stream: false,
        };

        let response = self
            .client
            .post(url)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    OcrError::Timeout {
                        secs: self.timeout.as_secs(),
                    }
                } else {
                    OcrError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(OcrError::Http {
                status: status_code,
                body: text,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| OcrError::MalformedJson(err.to_string()))?;

        let text = parsed.message.content.trim().to_string();
        if text.is_empty() {
            return Err(OcrError::EmptyText);
        }

        Ok(text)
    }
}

/// `base * 2^(attempt-1)` seconds, capped — exposed so the backoff math can
/// be unit tested without making real HTTP calls.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::from_secs(0);
    }
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << (attempt - 2))
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}

/// An `OcrClient` that scripts per-page outcomes instead of calling a real
/// vision endpoint, used by the end-to-end test suite. Pages are identified
/// by the marker `super::render::fake_page_marker` tags onto fake rendered
/// bytes; a page with no scripted outcome left in its queue succeeds with a
/// deterministic placeholder so tests only need to script the pages they
/// care about.
pub struct FakeOcrClient {
    scripted: std::sync::Mutex<std::collections::HashMap<usize, std::collections::VecDeque<Result<String, OcrError>>>>,
}

impl FakeOcrClient {
    pub fn new() -> Self {
        Self {
            scripted: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn script(&self, page_index: usize, outcome: Result<String, OcrError>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(page_index)
            .or_default()
            .push_back(outcome);
    }
}

impl Default for FakeOcrClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrClient for FakeOcrClient {
    /// Drains scripted outcomes for this page in order, the same way
    /// `OllamaOcrClient::ocr` drains HTTP attempts: a retryable error moves
    /// on to the next scripted outcome, a non-retryable one returns
    /// immediately, and running out of scripted outcomes after at least one
    /// retryable failure surfaces as `RetriesExhausted`. Lets a test script
    /// "503 then success" to exercise retry-recovery without a real
    /// vision endpoint or a real sleep.
    async fn ocr(
        &self,
        image_bytes: &[u8],
        _prompt: &str,
        _cancel: &watch::Receiver<bool>,
    ) -> Result<String, OcrError> {
        let page_index = super::render::parse_fake_page_marker(image_bytes).unwrap_or(0);
        let mut last_err: Option<OcrError> = None;

        loop {
            let next = {
                let mut guard = self.scripted.lock().unwrap();
                guard.get_mut(&page_index).and_then(|queue| queue.pop_front())
            };
            match next {
                Some(Ok(text)) => return Ok(text),
                Some(Err(err)) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = Some(err);
                    continue;
                }
                None => {
                    return match last_err {
                        Some(err) => Err(OcrError::RetriesExhausted {
                            attempts: 1,
                            last_error: err.to_string(),
                        }),
                        None => Ok(format!("recognized text for page {page_index}")),
                    };
                }
            }
        }
    }
}
