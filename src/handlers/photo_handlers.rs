//! Thumbnail and original endpoints.
//!
//! Thumbnails are served from the artifact store, generated on first view.
//! Photos whose thumbnail was skipped get an SVG placeholder instead of an
//! error so gallery pages degrade gracefully.

use crate::{
    errors::AppError,
    handlers::{AppState, load_photo},
    models::photo::ThumbnailStatus,
    services::{
        object_client::ClientError,
        thumbnail_service::{ServeOutcome, ThumbnailOutcome, ThumbnailStats},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const THUMBNAIL_CACHE_CONTROL: &str = "public, max-age=86400";
const ORIGINAL_URL_TTL: Duration = Duration::from_secs(3600);

const X_THUMBNAIL_STATUS: &str = "x-thumbnail-status";

#[derive(Debug, Deserialize)]
pub struct GenerateThumbnailReq {
    pub bucket: Option<String>,
    pub key: String,
    pub photo_id: i64,
}

#[derive(Debug, Serialize)]
pub struct GenerateThumbnailResp {
    pub photo_id: i64,
    pub status: Option<ThumbnailStatus>,
    pub path: Option<String>,
    pub error: Option<String>,
}

/// `POST /thumbnails/generate`
pub async fn generate_thumbnail(
    State(state): State<AppState>,
    Json(req): Json<GenerateThumbnailReq>,
) -> Result<Json<GenerateThumbnailResp>, AppError> {
    if let (Some(requested), Some(mirrored)) = (req.bucket.as_deref(), state.bucket.as_deref()) {
        if requested != mirrored {
            return Err(AppError::bad_request(format!(
                "bucket `{}` is not mirrored here",
                requested
            )));
        }
    }
    let photo = load_photo(&state.db, req.photo_id).await?;
    if photo.s3_key != req.key {
        return Err(AppError::conflict(format!(
            "photo {} is backed by `{}`, not `{}`",
            photo.id, photo.s3_key, req.key
        )));
    }

    let outcome = state.thumbnails.generate(&photo).await;
    let (path, error) = match &outcome {
        ThumbnailOutcome::Generated { path, .. } => (Some(path.clone()), None),
        ThumbnailOutcome::Unavailable { message } => (None, Some(message.clone())),
        _ => (None, None),
    };
    Ok(Json(GenerateThumbnailResp {
        photo_id: photo.id,
        status: outcome.status(),
        path,
        error,
    }))
}

/// `GET /thumbnails/stats`
pub async fn thumbnail_stats(
    State(state): State<AppState>,
) -> Result<Json<ThumbnailStats>, AppError> {
    Ok(Json(state.thumbnails.stats().await?))
}

/// `GET /photos/{id}/thumbnail`
pub async fn photo_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let photo = load_photo(&state.db, id).await?;
    match state.thumbnails.serve(&photo).await {
        ServeOutcome::Ready {
            buffer,
            content_type,
        } => {
            let mut response = Response::new(Body::from(buffer));
            set_thumbnail_headers(
                response.headers_mut(),
                content_type,
                ThumbnailStatus::Generated,
            );
            Ok(response)
        }
        ServeOutcome::Placeholder { status } => {
            let mut response = Response::new(Body::from(placeholder_svg(status)));
            set_thumbnail_headers(response.headers_mut(), "image/svg+xml", status);
            Ok(response)
        }
        ServeOutcome::Failed { status, message } => Err(AppError::new(
            StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
            message,
        )),
    }
}

/// `GET /photos/{id}/original`
///
/// Redirects to a presigned URL when the bucket supports signing, otherwise
/// streams the object through this service.
pub async fn photo_original(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    let photo = load_photo(&state.db, id).await?;
    match state
        .client
        .sign_download_url(&photo.s3_key, ORIGINAL_URL_TTL)
        .await
    {
        Ok(url) => {
            let location = HeaderValue::from_str(&url)
                .map_err(|e| AppError::internal(format!("invalid signed url: {}", e)))?;
            Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
        }
        Err(ClientError::SigningUnsupported) => {
            let (entry, stream) = state.client.get_object_stream(&photo.s3_key).await?;
            let mut response = Response::new(Body::from_stream(stream));
            let headers = response.headers_mut();
            let content_type = photo
                .mime_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_str(content_type)
                    .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
            );
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(entry.size.max(0)));
            Ok(response)
        }
        Err(err) => Err(err.into()),
    }
}

fn set_thumbnail_headers(headers: &mut HeaderMap, content_type: &str, status: ThumbnailStatus) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(THUMBNAIL_CACHE_CONTROL),
    );
    headers.insert(
        HeaderName::from_static(X_THUMBNAIL_STATUS),
        HeaderValue::from_static(status.as_str()),
    );
}

fn placeholder_svg(status: ThumbnailStatus) -> String {
    let label = match status {
        ThumbnailStatus::SkippedSize => "Too large to preview",
        ThumbnailStatus::SkippedUnsupported => "Preview not supported",
        ThumbnailStatus::SkippedCorrupted => "Image could not be read",
        _ => "No preview",
    };
    format!(
        r##"<svg xmlns="http://www.w3.org/2000/svg" width="400" height="300" viewBox="0 0 400 300"><rect width="400" height="300" fill="#e5e7eb"/><text x="200" y="155" font-family="sans-serif" font-size="18" fill="#6b7280" text-anchor="middle">{}</text></svg>"##,
        label
    )
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
            test_support::{insert_photo, jpeg_bytes},
            thumbnail_service::{ThumbnailConfig, ThumbnailService},
        },
    };
    use axum::{Router, body::to_bytes, http::Request};
    use bytes::Bytes;
    use tower::ServiceExt;

    async fn app() -> (tempfile::TempDir, AppState, Router) {
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
                size_threshold: 1024 * 1024,
                ..Default::default()
            },
        );
        let scheduler = SyncScheduler::new(
            db.clone(),
            client.clone(),
            thumbnails.clone(),
            SyncConfig::default(),
        );
        let state = AppState {
            db,
            client,
            scheduler,
            thumbnails,
            bucket: None,
        };
        let router = routes().with_state(state.clone());
        (dir, state, router)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn thumbnail_is_generated_on_first_view() {
        let (_dir, state, router) = app().await;
        let original = jpeg_bytes(500, 250);
        state
            .client
            .put_object("a/p.jpg", Bytes::from(original.clone()), "image/jpeg")
            .await
            .unwrap();
        let photo = insert_photo(&state.db, "a/p.jpg", original.len() as i64).await;

        let response = router
            .oneshot(get(&format!("/photos/{}/thumbnail", photo.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        assert_eq!(response.headers()[header::CACHE_CONTROL], THUMBNAIL_CACHE_CONTROL);
        assert_eq!(response.headers()[X_THUMBNAIL_STATUS], "generated");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let thumb = image::load_from_memory(&body).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (400, 200));
    }

    #[tokio::test]
    async fn skipped_thumbnails_render_a_placeholder() {
        let (_dir, state, router) = app().await;
        let photo = insert_photo(&state.db, "huge.jpg", 10 * 1024 * 1024).await;

        let response = router
            .oneshot(get(&format!("/photos/{}/thumbnail", photo.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/svg+xml");
        assert_eq!(response.headers()[X_THUMBNAIL_STATUS], "skipped_size");
    }

    #[tokio::test]
    async fn missing_original_is_a_bad_gateway() {
        let (_dir, state, router) = app().await;
        let photo = insert_photo(&state.db, "gone.jpg", 10).await;

        let response = router
            .clone()
            .oneshot(get(&format!("/photos/{}/thumbnail", photo.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = router.oneshot(get("/photos/999/thumbnail")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn originals_stream_when_signing_is_unsupported() {
        let (_dir, state, router) = app().await;
        state
            .client
            .put_object("a/p.jpg", Bytes::from_static(b"original bytes"), "image/jpeg")
            .await
            .unwrap();
        let photo = insert_photo(&state.db, "a/p.jpg", 14).await;

        let response = router
            .oneshot(get(&format!("/photos/{}/original", photo.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/jpeg");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"original bytes");
    }

    #[tokio::test]
    async fn thumbnail_stats_count_artifacts_and_surface_storage_errors() {
        let (dir, mut state, router) = app().await;
        let original = jpeg_bytes(50, 50);
        state
            .client
            .put_object("a/p.jpg", Bytes::from(original.clone()), "image/jpeg")
            .await
            .unwrap();
        let photo = insert_photo(&state.db, "a/p.jpg", original.len() as i64).await;
        assert!(matches!(
            state.thumbnails.generate(&photo).await,
            ThumbnailOutcome::Generated { .. }
        ));

        let response = router.oneshot(get("/thumbnails/stats")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap())
                .unwrap();
        assert_eq!(body["count"], 1);

        let not_a_dir = dir.path().join("not-a-directory");
        std::fs::write(&not_a_dir, b"x").unwrap();
        state.thumbnails = ThumbnailService::new(
            state.db.clone(),
            state.client.clone(),
            ThumbnailConfig {
                location: ArtifactLocation::Local { dir: not_a_dir },
                ..Default::default()
            },
        );
        let response = routes()
            .with_state(state)
            .oneshot(get("/thumbnails/stats"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn generate_rejects_mismatched_keys() {
        let (_dir, state, router) = app().await;
        let photo = insert_photo(&state.db, "a/p.jpg", 10).await;

        let request = Request::builder()
            .method("POST")
            .uri("/thumbnails/generate")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!(
                r#"{{"key":"b/other.jpg","photo_id":{}}}"#,
                photo.id
            )))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
