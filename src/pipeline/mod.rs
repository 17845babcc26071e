pub mod assembler;
pub mod error;
pub mod ocr;
pub mod render;

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::event_bus::EventBusRegistry;
use crate::models::{Job, JobStatus};
use crate::registry::{self, JobRegistry};
use crate::storage;

use self::assembler::{AssembleInput, Assembler};
use self::error::PipelineError;
use self::ocr::OcrClient;
use self::render::Renderer;

/// Capability bundle the orchestrator is built from. Grouping these as
/// narrow trait objects (rather than reaching for a concrete HTTP client or
/// pdfium handle directly) is what makes the end-to-end scenarios in the
/// test suite deterministic: tests swap in fakes for `renderer` and
/// `ocr_client` without touching the orchestration logic at all.
pub struct PipelineDeps {
    pub config: Arc<AppConfig>,
    pub registry: Arc<JobRegistry>,
    pub buses: Arc<EventBusRegistry>,
    pub renderer: Arc<dyn Renderer>,
    pub ocr_client: Arc<dyn OcrClient>,
    pub assembler: Arc<dyn Assembler>,
}

struct RenderedPage {
    index: usize,
    jpeg_bytes: Vec<u8>,
}

/// Runs the full pipeline for one job: mark processing, render + OCR every
/// selected page, assemble the EPUB, mark completed/failed. `pages_to_process`
/// restricts the producer to a subset (used by retry); `None` processes
/// every page, i.e. the initial run.
pub async fn run_job(deps: Arc<PipelineDeps>, job_id: String, pages_to_process: Option<Vec<usize>>) {
    let handle = match deps.registry.handle(&job_id).await {
        Some(handle) => handle,
        None => {
            error!(job_id = %job_id, "run_job invoked for unknown job");
            return;
        }
    };

    let bus = match deps.buses.get(&job_id) {
        Some(bus) => bus,
        None => {
            error!(job_id = %job_id, "run_job invoked with no event bus open");
            return;
        }
    };

    let (pdf_path, total_pages, language, ocr_prompt, data_dir) = {
        let job = handle.lock().await;
        (
            storage::input_pdf_path(&deps.config.data_dir, &job.id),
            job.total_pages,
            job.language,
            job.ocr_prompt
                .clone()
                .unwrap_or_else(|| deps.config.default_ocr_prompt.clone()),
            deps.config.data_dir.clone(),
        )
    };

    {
        let mut job = handle.lock().await;
        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        registry::persist(&data_dir, &job).await;
    }
    let _ = bus.emit(
        "job.started",
        json!({ "total_pages": total_pages, "status": "processing" }),
    );
    info!(job_id = %job_id, total_pages, "job started");

    let targets: Vec<usize> = pages_to_process
        .unwrap_or_else(|| (0..total_pages).collect())
        .into_iter()
        .filter(|idx| *idx < total_pages)
        .collect();

    if targets.is_empty() && total_pages > 0 {
        // Retry with an empty failed set: zero OCR calls, straight to assembly.
        finish_assembly(&deps, &handle, &bus, &job_id, &data_dir, total_pages, language).await;
        return;
    }

    let queue_size = deps.config.render_queue_size.max(1);
    let (tx, rx) = mpsc::channel::<RenderedPage>(queue_size);
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let producer = {
        let renderer = deps.renderer.clone();
        let pdf_path = pdf_path.clone();
        let targets = targets.clone();
        let tx = tx;
        let job_id = job_id.clone();
        let config = deps.config.clone();
        tokio::spawn(async move {
            for index in targets {
                match renderer
                    .render(&pdf_path, index, total_pages, config.render_dpi, config.jpeg_quality)
                    .await
                {
                    Ok(jpeg_bytes) => {
                        if tx.send(RenderedPage { index, jpeg_bytes }).await.is_err() {
                            // Every worker has exited (e.g. job aborted); stop producing.
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, page = index, error = %err, "page render failed");
                        // A render failure is page-level, not pipeline-level:
                        // record it directly since this page never reaches a worker.
                        if tx
                            .send(RenderedPage {
                                index,
                                jpeg_bytes: Vec::new(),
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            // Dropping `tx` here closes the channel; workers observe that as
            // the end-of-stream sentinel once the queue drains.
        })
    };

    let worker_count = deps.config.ocr_workers.max(1);
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let _ = cancel_tx;

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let deps = deps.clone();
        let handle = handle.clone();
        let bus = bus.clone();
        let rx = rx.clone();
        let semaphore = semaphore.clone();
        let cancel_rx = cancel_rx.clone();
        let ocr_prompt = ocr_prompt.clone();
        let job_id = job_id.clone();
        let data_dir = data_dir.clone();

        workers.push(tokio::spawn(async move {
            loop {
                let page = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(page) = page else {
                    break;
                };

                let _permit = semaphore.acquire().await.expect("semaphore never closed");

                if page.jpeg_bytes.is_empty() {
                    // Render failed upstream; record directly, no OCR call.
                    let mut job = handle.lock().await;
                    if let Some(result) = job.pages.get_mut(&page.index) {
                        result.mark_failed("render failed");
                    }
                    let snapshot = job.clone();
                    drop(job);
                    registry::persist(&data_dir, &snapshot).await;
                    let _ = bus.emit(
                        "page.completed",
                        json!({
                            "page": page.index,
                            "total_pages": total_pages,
                            "status": "failed",
                            "error": "render failed",
                        }),
                    );
                    continue;
                }

                {
                    let mut job = handle.lock().await;
                    if let Some(result) = job.pages.get_mut(&page.index) {
                        result.mark_processing();
                    }
                }

                let outcome = deps.ocr_client.ocr(&page.jpeg_bytes, &ocr_prompt, &cancel_rx).await;

                let mut job = handle.lock().await;
                let event_payload = match outcome {
                    Ok(text) => {
                        let page_path = storage::page_text_path(&data_dir, &job_id, page.index);
                        if let Err(err) = storage::atomic_write(&page_path, text.as_bytes()).await {
                            warn!(job_id = %job_id, page = page.index, error = %err, "failed to persist page text");
                        }
                        let preview: String = text.chars().take(200).collect();
                        if let Some(result) = job.pages.get_mut(&page.index) {
                            result.mark_success(text);
                        }
                        json!({
                            "page": page.index,
                            "total_pages": total_pages,
                            "status": "success",
                            "text_preview": preview,
                        })
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, page = page.index, error = %err, "page ocr failed permanently");
                        let message = err.to_string();
                        if let Some(result) = job.pages.get_mut(&page.index) {
                            result.mark_failed(message.clone());
                        }
                        json!({
                            "page": page.index,
                            "total_pages": total_pages,
                            "status": "failed",
                            "error": message,
                        })
                    }
                };
                let snapshot = job.clone();
                drop(job);
                registry::persist(&data_dir, &snapshot).await;
                let _ = bus.emit("page.completed", event_payload);
            }
        }));
    }

    if producer.await.is_err() {
        error!(job_id = %job_id, "render producer task panicked");
    }
    for worker in workers {
        if worker.await.is_err() {
            error!(job_id = %job_id, "ocr worker task panicked");
        }
    }

    finish_assembly(&deps, &handle, &bus, &job_id, &data_dir, total_pages, language).await;
}

async fn finish_assembly(
    deps: &Arc<PipelineDeps>,
    handle: &Arc<tokio::sync::Mutex<Job>>,
    bus: &Arc<crate::event_bus::EventBus>,
    job_id: &str,
    data_dir: &str,
    total_pages: usize,
    language: crate::models::Language,
) {
    let (succeeded, failed, source_filename) = {
        let mut job = handle.lock().await;
        job.status = JobStatus::Assembling;
        registry::persist(data_dir, &job).await;
        (job.pages_succeeded(), job.pages_failed(), job.source_filename.clone())
    };
    let _ = bus.emit(
        "job.assembling",
        json!({ "pages_succeeded": succeeded, "pages_failed": failed }),
    );
    info!(job_id = %job_id, succeeded, failed, "job assembling");

    let mut page_texts = Vec::with_capacity(total_pages);
    for index in 0..total_pages {
        let path = storage::page_text_path(data_dir, job_id, index);
        let text = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        page_texts.push(text);
    }

    let output_path = storage::output_epub_path(data_dir, job_id);
    let assemble_result = deps
        .assembler
        .assemble(
            AssembleInput {
                job_id: job_id.to_string(),
                source_filename,
                language,
                total_pages,
                pages_per_chapter: deps.config.pages_per_chapter,
                page_texts,
            },
            &output_path,
        )
        .await;

    match assemble_result {
        Ok(()) => {
            let mut job = handle.lock().await;
            job.status = JobStatus::Completed;
            job.completed_at = Some(Utc::now());
            let duration_seconds = match (job.started_at, job.completed_at) {
                (Some(start), Some(end)) => (end - start).num_seconds().max(0),
                _ => 0,
            };
            let failed_pages = job.failed_page_indices();
            let pages_succeeded = job.pages_succeeded();
            registry::persist(data_dir, &job).await;
            drop(job);

            let _ = bus.emit(
                "job.completed",
                json!({
                    "download_url": format!("/api/jobs/{job_id}/result"),
                    "duration_seconds": duration_seconds,
                    "pages_succeeded": pages_succeeded,
                    "failed_pages": failed_pages,
                }),
            );
            info!(job_id = %job_id, pages_succeeded, "job completed");
        }
        Err(err) => {
            error!(job_id = %job_id, error = %err, "pipeline-level assembly failure");
            let mut job = handle.lock().await;
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error = Some(PipelineError::from(err).to_string());
            registry::persist(data_dir, &job).await;
            drop(job);

            let _ = bus.emit("job.failed", json!({ "error": job_error_message(handle).await }));
        }
    }

    bus.close();
}

async fn job_error_message(handle: &Arc<tokio::sync::Mutex<Job>>) -> String {
    handle
        .lock()
        .await
        .error
        .clone()
        .unwrap_or_else(|| "unknown pipeline error".to_string())
}

/// Starting point for a retry: rewinds the failed pages to `Pending`,
/// transitions the job to `Processing`, opens a fresh event bus (the old
/// one is discarded), and re-enters `run_job` with the narrowed page set.
/// Preconditions (job terminal, `input.pdf` present) are enforced by the
/// caller (the retry route) before this is invoked.
pub async fn run_retry(deps: Arc<PipelineDeps>, job_id: String, failed_indices: Vec<usize>) {
    let data_dir = deps.config.data_dir.clone();
    let handle = match deps.registry.handle(&job_id).await {
        Some(handle) => handle,
        None => return,
    };

    {
        let mut job = handle.lock().await;
        for index in &failed_indices {
            if let Some(page) = job.pages.get_mut(index) {
                page.reset_to_pending();
            }
        }
        job.status = JobStatus::Processing;
        job.error = None;
        job.completed_at = None;
        registry::persist(&data_dir, &job).await;
    }

    deps.buses.open(&job_id);
    run_job(deps, job_id, Some(failed_indices)).await;
}

pub fn path_for_job_pdf(data_dir: &str, job_id: &str) -> std::path::PathBuf {
    storage::input_pdf_path(data_dir, job_id)
}

pub async fn pdf_exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}
