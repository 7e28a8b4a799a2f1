//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and artifact storage

use crate::handlers::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness probe. Answers 200 while the process serves requests.
/// This endpoint should be cheap and never perform I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Writes, reads back and deletes a probe artifact in the thumbnail store.
///
/// Returns JSON describing each check. HTTP 200 when all checks pass,
/// HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&*state.db)
        .await
    {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let artifact_check = match state.thumbnails.artifacts().probe().await {
        Ok(()) => (true, None),
        Err(e) => (false, Some(e.to_string())),
    };

    // Build response JSON
    let sqlite_ok = sqlite_check.0;
    let artifacts_ok = artifact_check.0;
    let overall_ok = sqlite_ok && artifacts_ok;

    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_ok,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "artifacts",
        CheckStatus {
            ok: artifacts_ok,
            error: artifact_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
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
        body::{Body, to_bytes},
        http::Request,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    #[tokio::test]
    async fn readyz_checks_sqlite_and_artifacts() {
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
        let scheduler = SyncScheduler::new(
            db.clone(),
            client.clone(),
            thumbnails.clone(),
            SyncConfig::default(),
        );
        let router = routes().with_state(AppState {
            db,
            client,
            scheduler,
            thumbnails,
            bucket: None,
        });

        let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
        assert_eq!(body["checks"]["artifacts"]["ok"], true);

        let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
