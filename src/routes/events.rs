use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;

use crate::error::{AppError, AppResult};
use crate::event_bus;
use crate::models::{Job, JobStatus};
use crate::state::AppState;

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
}

fn is_terminal_event(name: &str) -> bool {
    matches!(name, "job.completed" | "job.failed")
}

fn to_sse_event(event: &event_bus::Event) -> Event {
    Event::default()
        .id(event.id.to_string())
        .event(event.name)
        .data(event.data.to_string())
}

fn synthesize_terminal_event(job: &Job) -> Event {
    match job.status {
        JobStatus::Completed => Event::default().event("job.completed").data(
            serde_json::json!({
                "download_url": format!("/api/jobs/{}/result", job.id),
                "pages_succeeded": job.pages_succeeded(),
                "failed_pages": job.failed_page_indices(),
            })
            .to_string(),
        ),
        _ => Event::default().event("job.failed").data(
            serde_json::json!({
                "error": job
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown pipeline error".to_string()),
            })
            .to_string(),
        ),
    }
}

/// `GET /api/jobs/{id}/events` — replays buffered events newer than
/// `Last-Event-ID` then streams live ones, sending a `ping` keepalive every
/// 30s of silence and terminating after `job.completed`/`job.failed` (spec
/// §6 SSE framing). A job whose bus has already been replaced or closed (a
/// completed job nobody is actively watching) gets a synthesized one-shot
/// terminal event instead of an error, so a late subscriber still sees a
/// well-formed stream.
pub async fn job_events(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let after_id = last_event_id(&headers);

    if let Some(bus) = state.buses.get(&job_id) {
        let subscription = bus.subscribe(after_id);
        let stream = async_stream::stream! {
            for event in subscription.replay {
                let terminal = is_terminal_event(event.name);
                yield Ok(to_sse_event(&event));
                if terminal {
                    return;
                }
            }

            let mut live = subscription.live;
            loop {
                match tokio::time::timeout(Duration::from_secs(30), live.recv()).await {
                    Ok(Ok(event)) => {
                        let terminal = is_terminal_event(event.name);
                        yield Ok(to_sse_event(&event));
                        if terminal {
                            return;
                        }
                    }
                    Ok(Err(_)) => return,
                    Err(_) => yield Ok(Event::default().event("ping").data("")),
                }
            }
        };
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()));
    }

    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or_else(AppError::not_found)?;
    if !job.status.is_terminal() {
        return Err(AppError::internal(
            "job is running but has no open event stream",
        ));
    }

    let stream = async_stream::stream! {
        yield Ok(synthesize_terminal_event(&job));
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
