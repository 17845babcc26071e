use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use tracing::{error, info};

use crate::error::{AppError, AppResult};
use crate::models::{self, Job, JobSnapshot, JobSummary, Language, RetryResponse};
use crate::pipeline::{self, PipelineDeps};
use crate::registry;
use crate::state::AppState;
use crate::storage;

struct UploadRequest {
    file_bytes: Vec<u8>,
    source_filename: String,
    language: Language,
    ocr_prompt: Option<String>,
}

async fn parse_upload(multipart: &mut Multipart) -> AppResult<UploadRequest> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut source_filename: Option<String> = None;
    let mut language: Option<Language> = None;
    let mut ocr_prompt: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(format!("invalid multipart data: {err}"))
    })? {
        match field.name().map(|n| n.to_string()).as_deref() {
            Some("file") => {
                source_filename = field.file_name().map(|n| n.to_string());
                let data = field.bytes().await.map_err(|err| {
                    AppError::bad_request(format!("failed to read file bytes: {err}"))
                })?;
                file_bytes = Some(data.to_vec());
            }
            Some("language") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid language: {err}")))?;
                language = Some(
                    Language::parse(value.trim())
                        .ok_or_else(|| AppError::bad_request("language must be one of fa, ar, en"))?,
                );
            }
            Some("ocr_prompt") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::bad_request(format!("invalid ocr_prompt: {err}")))?;
                if !value.trim().is_empty() {
                    ocr_prompt = Some(value);
                }
            }
            _ => {}
        }
    }

    let file_bytes = file_bytes.ok_or_else(|| AppError::bad_request("file field is required"))?;
    if file_bytes.is_empty() {
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let source_filename =
        source_filename.ok_or_else(|| AppError::bad_request("filename is required"))?;
    let language = language.ok_or_else(|| AppError::bad_request("language field is required"))?;

    Ok(UploadRequest {
        file_bytes,
        source_filename,
        language,
        ocr_prompt,
    })
}

/// `POST /api/jobs` — accepts a PDF plus conversion options, sizes the job
/// from the real page count, and hands the pipeline off to a detached task
/// so the upload response returns immediately (spec §6).
pub async fn upload_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<JobSummary>)> {
    let request = parse_upload(&mut multipart).await?;

    let job_id = models::new_job_id();
    let data_dir = state.config.data_dir.clone();
    let pdf_path = storage::input_pdf_path(&data_dir, &job_id);
    storage::atomic_write(&pdf_path, &request.file_bytes).await?;

    let total_pages = state
        .renderer
        .page_count(&pdf_path)
        .await
        .map_err(|err| AppError::bad_request(format!("could not read PDF: {err}")))?;

    let job = Job::new(
        job_id.clone(),
        request.source_filename,
        request.language,
        request.ocr_prompt,
        total_pages,
    );
    registry::persist(&data_dir, &job).await;
    state.registry.create(job).await;
    state.buses.open(&job_id);

    let deps: std::sync::Arc<PipelineDeps> = state.deps();
    let spawned_job_id = job_id.clone();
    tokio::spawn(async move {
        pipeline::run_job(deps, spawned_job_id, None).await;
    });

    info!(job_id = %job_id, total_pages, "job accepted");
    Ok((
        StatusCode::ACCEPTED,
        Json(JobSummary { job_id, total_pages }),
    ))
}

/// `GET /api/jobs/{id}` — a full snapshot; authoritative once the SSE
/// stream has closed (spec §7).
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<JobSnapshot>> {
    let job = state.registry.get(&job_id).await.ok_or_else(AppError::not_found)?;
    Ok(Json(JobSnapshot::from(&job)))
}

/// `GET /api/jobs/{id}/result` — the assembled EPUB, or 400 if the job
/// hasn't completed.
pub async fn download_result(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job = state.registry.get(&job_id).await.ok_or_else(AppError::not_found)?;
    if job.status != crate::models::JobStatus::Completed {
        return Err(AppError::bad_request("job has not completed"));
    }

    let path = storage::output_epub_path(&state.config.data_dir, &job_id);
    let bytes = tokio::fs::read(&path).await?;
    let filename = format!("{}.epub", job.id);

    Ok((
        [
            (header::CONTENT_TYPE, "application/epub+zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

/// `POST /api/jobs/{id}/retry` — reprocesses only the failed pages of a
/// terminal job (spec §4.6 retry protocol).
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<Json<RetryResponse>> {
    let job = state.registry.get(&job_id).await.ok_or_else(AppError::not_found)?;

    if !job.status.is_terminal() {
        return Err(AppError::conflict("job is still running"));
    }

    let pdf_path = pipeline::path_for_job_pdf(&state.config.data_dir, &job_id);
    if !pipeline::pdf_exists(&pdf_path).await {
        return Err(AppError::gone("source pdf has been evicted"));
    }

    let retrying_pages = job.failed_page_indices();

    let deps = state.deps();
    let spawned_job_id = job_id.clone();
    let spawned_pages = retrying_pages.clone();
    tokio::spawn(async move {
        pipeline::run_retry(deps, spawned_job_id, spawned_pages).await;
    });

    Ok(Json(RetryResponse {
        job_id,
        retrying_pages,
    }))
}
