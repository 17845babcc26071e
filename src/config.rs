use std::env;

use anyhow::{Context, Result};

const DEFAULT_OCR_PROMPT: &str = "Extract all text from this scanned book page. Preserve \
paragraph structure. Output only the extracted text, nothing else.";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: String,

    pub ollama_base_url: String,
    pub ollama_model: String,
    pub ocr_timeout_secs: u64,
    pub ocr_retries: u32,

    pub render_dpi: u32,
    pub jpeg_quality: u8,

    pub ocr_workers: usize,
    pub render_queue_size: usize,
    pub pages_per_chapter: usize,

    pub job_ttl_hours: i64,
    pub pdf_ttl_hours: i64,
    pub cleanup_interval_secs: u64,

    pub sse_ring_buffer_size: usize,
    pub default_ocr_prompt: String,
    pub max_upload_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let host = env_or("VPPE_HOST", "0.0.0.0");
        let port = parse_env("VPPE_PORT", 8080u16)?;
        let data_dir = env_or("VPPE_DATA_DIR", "./data");

        let ollama_base_url = env_or("VPPE_OLLAMA_BASE_URL", "http://localhost:11434");
        let ollama_model = env_or("VPPE_OLLAMA_MODEL", "qwen2.5-vl:7b");
        let ocr_timeout_secs = parse_env("VPPE_OCR_TIMEOUT", 120u64)?;
        let ocr_retries = parse_env("VPPE_OCR_RETRIES", 3u32)?;

        let render_dpi = parse_env("VPPE_RENDER_DPI", 300u32)?;
        let jpeg_quality = parse_env("VPPE_JPEG_QUALITY", 85u8)?;

        let ocr_workers = parse_env("VPPE_OCR_WORKERS", 2usize)?;
        let render_queue_size = parse_env("VPPE_RENDER_QUEUE_SIZE", 4usize)?;
        let pages_per_chapter = parse_env("VPPE_PAGES_PER_CHAPTER", 20usize)?;

        let job_ttl_hours = parse_env("VPPE_JOB_TTL_HOURS", 24i64)?;
        let pdf_ttl_hours = parse_env("VPPE_PDF_TTL_HOURS", 1i64)?;
        let cleanup_interval_secs = parse_env("VPPE_CLEANUP_INTERVAL_SECS", 600u64)?;

        let sse_ring_buffer_size = parse_env("VPPE_SSE_RING_BUFFER_SIZE", 200usize)?;
        let default_ocr_prompt = env_or("VPPE_DEFAULT_OCR_PROMPT", DEFAULT_OCR_PROMPT);
        let max_upload_bytes = parse_env("VPPE_MAX_UPLOAD_BYTES", 536_870_912usize)?;

        Ok(Self {
            host,
            port,
            data_dir,
            ollama_base_url,
            ollama_model,
            ocr_timeout_secs,
            ocr_retries,
            render_dpi,
            jpeg_quality,
            ocr_workers,
            render_queue_size,
            pages_per_chapter,
            job_ttl_hours,
            pdf_ttl_hours,
            cleanup_interval_secs,
            sse_ring_buffer_size,
            default_ocr_prompt,
            max_upload_bytes,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| anyhow::anyhow!("{key} must be valid: {err}"))
            .context(format!("invalid value for {key}")),
        Err(_) => Ok(default),
    }
}
