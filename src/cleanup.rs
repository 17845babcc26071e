use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::event_bus::EventBusRegistry;
use crate::registry::JobRegistry;
use crate::storage;

/// Background sweep per spec §4.7: every `cleanup_interval_secs`, terminal
/// jobs older than `job_ttl_hours` are deleted entirely; terminal jobs older
/// than `pdf_ttl_hours` (but not yet `job_ttl_hours`) have only their source
/// PDF removed. Any per-job I/O error is logged and swallowed — one job's
/// cleanup failure must never stop the sweep.
pub async fn run(registry: Arc<JobRegistry>, buses: Arc<EventBusRegistry>, config: Arc<AppConfig>) {
    let interval_secs = config.cleanup_interval_secs.max(1);
    let mut ticker = tokio::time::interval(StdDuration::from_secs(interval_secs));
    // The first tick fires immediately; skip it so a freshly started process
    // doesn't sweep before anything could possibly have expired.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        sweep(&registry, &buses, &config).await;
    }
}

async fn sweep(registry: &Arc<JobRegistry>, buses: &Arc<EventBusRegistry>, config: &Arc<AppConfig>) {
    let now = Utc::now();
    let job_deadline = now - Duration::hours(config.job_ttl_hours.max(0));
    let pdf_deadline = now - Duration::hours(config.pdf_ttl_hours.max(0));

    let expired_jobs = registry.list_terminal_older_than(job_deadline).await;
    let mut deleted_job_ids = std::collections::HashSet::new();
    for job in expired_jobs {
        let dir = storage::job_dir(&config.data_dir, &job.id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!(job_id = %job.id, "cleanup: deleted expired job directory"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(job_id = %job.id, error = %err, "cleanup: failed to delete job directory"),
        }
        registry.delete(&job.id).await;
        buses.remove(&job.id);
        deleted_job_ids.insert(job.id);
    }

    let pdf_candidates = registry.list_terminal_older_than(pdf_deadline).await;
    for job in pdf_candidates {
        if deleted_job_ids.contains(&job.id) {
            continue;
        }
        let pdf_path = storage::input_pdf_path(&config.data_dir, &job.id);
        match tokio::fs::remove_file(&pdf_path).await {
            Ok(()) => debug!(job_id = %job.id, "cleanup: deleted expired source pdf"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(job_id = %job.id, error = %err, "cleanup: failed to delete source pdf"),
        }
    }
}
