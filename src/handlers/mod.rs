//! axum handlers and the state they share.

pub mod health_handlers;
pub mod photo_handlers;
pub mod sync_handlers;

use crate::{
    errors::AppError,
    models::photo::{PHOTO_COLUMNS, Photo},
    services::{
        object_client::ObjectClient, scheduler::SyncScheduler, thumbnail_service::ThumbnailService,
    },
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub client: ObjectClient,
    pub scheduler: SyncScheduler,
    pub thumbnails: ThumbnailService,
    /// Name of the mirrored bucket, when it has one.
    pub bucket: Option<String>,
}

pub(crate) async fn load_photo(db: &SqlitePool, id: i64) -> Result<Photo, AppError> {
    sqlx::query_as::<_, Photo>(&format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| AppError::not_found(format!("photo {} not found", id)))
}
