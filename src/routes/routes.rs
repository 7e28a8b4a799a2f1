//! Defines the HTTP surface over the sync scheduler and thumbnail service.
//!
//! ## Structure
//! - **Health**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Sync jobs**
//!   - `POST /sync/jobs`: enqueue `{job_type, folder_path?}`
//!   - `GET  /sync/jobs/active`: pending, running and recently finished jobs
//!   - `GET  /sync/jobs/current`: running job or `null`
//!   - `GET  /sync/status`: `{enabled, running, current}`
//!   - `POST /sync/start`, `POST /sync/stop`
//!
//! - **Thumbnails and originals**
//!   - `POST /thumbnails/generate`: `{bucket?, key, photo_id}`
//!   - `GET  /thumbnails/stats`
//!   - `GET  /photos/{id}/thumbnail`
//!   - `GET  /photos/{id}/original`: redirect to a signed URL or stream

use crate::handlers::{
    AppState,
    health_handlers::{healthz, readyz},
    photo_handlers::{generate_thumbnail, photo_original, photo_thumbnail, thumbnail_stats},
    sync_handlers::{active_jobs, create_job, current_job, start, status, stop},
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build the router. State is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // sync orchestration
        .route("/sync/jobs", post(create_job))
        .route("/sync/jobs/active", get(active_jobs))
        .route("/sync/jobs/current", get(current_job))
        .route("/sync/status", get(status))
        .route("/sync/start", post(start))
        .route("/sync/stop", post(stop))
        // thumbnails and originals
        .route("/thumbnails/generate", post(generate_thumbnail))
        .route("/thumbnails/stats", get(thumbnail_stats))
        .route("/photos/{id}/thumbnail", get(photo_thumbnail))
        .route("/photos/{id}/original", get(photo_original))
}
