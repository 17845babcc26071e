use std::sync::Arc;

use anyhow::{anyhow, Result};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;
use uuid::Uuid;

use vppe::config::AppConfig;
use vppe::event_bus::EventBusRegistry;
use vppe::pipeline::assembler::EpubAssembler;
use vppe::pipeline::ocr::FakeOcrClient;
use vppe::pipeline::render::FakeRenderer;
use vppe::pipeline::PipelineDeps;
use vppe::registry::JobRegistry;
use vppe::routes;
use vppe::state::AppState;

/// In-process test harness. Substitutes `FakeRenderer`/`FakeOcrClient` for
/// pdfium and the vision endpoint, matching spec §9's "explicit capability
/// interfaces ... makes the mock-based scenarios in §8 trivial".
#[allow(dead_code)]
pub struct TestApp {
    pub router: Router,
    pub data_dir: TempDir,
    pub ocr: Arc<FakeOcrClient>,
}

#[allow(dead_code)]
impl TestApp {
    pub async fn new(total_pages: usize) -> Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let config = Arc::new(AppConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: data_dir.path().to_string_lossy().to_string(),
            ollama_base_url: "http://unused.invalid".to_string(),
            ollama_model: "unused".to_string(),
            ocr_timeout_secs: 5,
            ocr_retries: 3,
            render_dpi: 300,
            jpeg_quality: 85,
            ocr_workers: 2,
            render_queue_size: 4,
            pages_per_chapter: 20,
            job_ttl_hours: 24,
            pdf_ttl_hours: 1,
            cleanup_interval_secs: 600,
            sse_ring_buffer_size: 200,
            default_ocr_prompt: "extract the text".to_string(),
            max_upload_bytes: 64 * 1024 * 1024,
        });

        let registry = Arc::new(JobRegistry::new(config.data_dir.clone()));
        registry.recover().await?;
        let buses = Arc::new(EventBusRegistry::new(config.sse_ring_buffer_size));
        let renderer = Arc::new(FakeRenderer {
            jpeg_bytes: vec![0xFF, 0xD8, 0xFF, 0xD9],
            total_pages,
        });
        let ocr = Arc::new(FakeOcrClient::new());
        let assembler = Arc::new(EpubAssembler::new());

        let deps = Arc::new(PipelineDeps {
            config,
            registry,
            buses,
            renderer,
            ocr_client: ocr.clone(),
            assembler,
        });

        let router = routes::create_router(AppState::new(deps));

        Ok(Self {
            router,
            data_dir,
            ocr,
        })
    }

    pub fn data_dir_path(&self) -> std::path::PathBuf {
        self.data_dir.path().to_path_buf()
    }

    pub async fn upload(&self, filename: &str, language: &str) -> Result<(StatusCode, Value)> {
        let boundary = format!("boundary-{}", Uuid::new_v4());
        let mut body = Vec::new();
        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n")
                .as_bytes(),
        );
        body.extend(b"Content-Type: application/pdf\r\n\r\n");
        body.extend(b"%PDF-1.4 fake test fixture");
        body.extend(b"\r\n");

        body.extend(format!("--{boundary}\r\n").as_bytes());
        body.extend(b"Content-Disposition: form-data; name=\"language\"\r\n\r\n");
        body.extend(language.as_bytes());
        body.extend(b"\r\n");

        body.extend(format!("--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/jobs")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))?;

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let body = response_body_json(response).await?;
        Ok((status, body))
    }

    pub async fn get_json(&self, path: &str) -> Result<(StatusCode, Value)> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let body = response_body_json(response).await?;
        Ok((status, body))
    }

    pub async fn post_empty(&self, path: &str) -> Result<(StatusCode, Value)> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let body = response_body_json(response).await?;
        Ok((status, body))
    }

    /// Events streams terminate after a terminal event (spec §6), so a
    /// oneshot request's body can be fully collected.
    pub async fn get_events(&self, path: &str, last_event_id: Option<u64>) -> Result<String> {
        let mut builder = Request::builder().method(Method::GET).uri(path);
        if let Some(id) = last_event_id {
            builder = builder.header("last-event-id", id.to_string());
        }
        let request = builder.body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    pub async fn get_bytes(&self, path: &str) -> Result<(StatusCode, Vec<u8>)> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())?;
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, bytes.to_vec()))
    }
}

async fn response_body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| anyhow!("invalid json body: {err}"))
}
