//! Sync job endpoints.
//!
//! - POST /sync/jobs         -> enqueue a job
//! - GET  /sync/jobs/active  -> pending, running and recently finished jobs
//! - GET  /sync/jobs/current -> the running job or null
//! - GET  /sync/status       -> scheduler state
//! - POST /sync/start, /sync/stop

use crate::{
    errors::AppError,
    handlers::AppState,
    models::sync_job::{SyncJob, SyncJobType},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateJobReq {
    pub job_type: String,
    pub folder_path: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatus {
    pub enabled: bool,
    pub running: bool,
    pub current: Option<SyncJob>,
}

/// `POST /sync/jobs`
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobReq>,
) -> Result<impl IntoResponse, AppError> {
    let job_type: SyncJobType = req.job_type.parse().map_err(AppError::bad_request)?;
    let job = state
        .scheduler
        .enqueue(job_type, req.folder_path.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// `GET /sync/jobs/active`
pub async fn active_jobs(State(state): State<AppState>) -> Result<Json<Vec<SyncJob>>, AppError> {
    Ok(Json(state.scheduler.active_jobs().await?))
}

/// `GET /sync/jobs/current`
pub async fn current_job(State(state): State<AppState>) -> Result<Json<Option<SyncJob>>, AppError> {
    Ok(Json(state.scheduler.current().await?))
}

/// `GET /sync/status`
pub async fn status(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    Ok(Json(SyncStatus {
        enabled: state.scheduler.is_enabled(),
        running: state.scheduler.is_running(),
        current: state.scheduler.current().await?,
    }))
}

/// `POST /sync/start`
pub async fn start(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    state.scheduler.start().await?;
    status(State(state)).await
}

/// `POST /sync/stop`
pub async fn stop(State(state): State<AppState>) -> Result<Json<SyncStatus>, AppError> {
    state.scheduler.stop();
    status(State(state)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        routes::routes::routes,
        services::{
            artifact_store::ArtifactLocation,
            object_client::{ObjectClient, StoreConfig},
            scheduler::{SyncConfig, SyncScheduler},
            thumbnail_service::{ThumbnailConfig, ThumbnailService},
        },
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, header},
    };
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let db = db::connect_in_memory().await.unwrap();
        let client = ObjectClient::new(&StoreConfig::Memory, Duration::from_secs(5)).unwrap();
        let thumbnails = ThumbnailService::new(
            db.clone(),
            client.clone(),
            ThumbnailConfig {
                location: ArtifactLocation::Local {
                    dir: dir.path().to_path_buf(),
                },
                ..Default::default()
            },
        );
        let scheduler =
            SyncScheduler::new(db.clone(), client.clone(), thumbnails.clone(), SyncConfig::default());
        let state = AppState {
            db,
            client,
            scheduler,
            thumbnails,
            bucket: None,
        };
        (dir, routes().with_state(state))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn jobs_are_validated_and_listed() {
        let (_dir, router) = app().await;

        let response = router
            .clone()
            .oneshot(post_json("/sync/jobs", r#"{"job_type":"full_scan","folder_path":"a"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(post_json("/sync/jobs", r#"{"job_type":"rescan"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(post_json("/sync/jobs", r#"{"job_type":"folder_scan","folder_path":"/a/"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let job: SyncJob = serde_json::from_slice(&body).unwrap();
        assert_eq!(job.folder_path.as_deref(), Some("a"));

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/sync/jobs/active")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let jobs: Vec<SyncJob> = serde_json::from_slice(&body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[tokio::test]
    async fn status_reflects_start_and_stop() {
        let (_dir, router) = app().await;

        let response = router
            .clone()
            .oneshot(post_json("/sync/start", ""))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["enabled"], true);

        let response = router.oneshot(post_json("/sync/stop", "")).await.unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["enabled"], false);
    }
}
