//! src/services/metadata_service.rs
//!
//! Fills `photos.metadata` for images whose `metadata_status` is `pending`.

use crate::{
    models::{
        folder::scope_prefix,
        photo::{MetadataStatus, PHOTO_COLUMNS, Photo, PhotoMetadata},
        sync_job::JobProgress,
    },
    services::object_client::ObjectClient,
};
use image::ImageReader;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{io::Cursor, sync::Arc};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataOutcome {
    Extracted(PhotoMetadata),
    SkippedSize,
    /// The original could not be read; the photo stays `pending`.
    Unavailable { message: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetadataReport {
    pub extracted: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
}

#[derive(Clone)]
pub struct MetadataService {
    db: Arc<SqlitePool>,
    client: ObjectClient,
    size_threshold: i64,
}

impl MetadataService {
    pub fn new(db: Arc<SqlitePool>, client: ObjectClient, size_threshold: i64) -> Self {
        Self {
            db,
            client,
            size_threshold,
        }
    }

    pub async fn extract(&self, photo: &Photo) -> Result<MetadataOutcome, sqlx::Error> {
        if photo.size > self.size_threshold {
            self.record(photo.id, MetadataStatus::SkippedSize, None).await?;
            return Ok(MetadataOutcome::SkippedSize);
        }

        let bytes = match self.client.get_object(&photo.s3_key).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return Ok(MetadataOutcome::Unavailable {
                    message: err.to_string(),
                });
            }
        };

        let size = bytes.len() as i64;
        let (format, dimensions) = tokio::task::spawn_blocking(move || read_header(&bytes))
            .await
            .unwrap_or((None, None));

        let metadata = PhotoMetadata {
            format,
            width: dimensions.map(|(w, _)| w),
            height: dimensions.map(|(_, h)| h),
            size,
            mime_type: photo.mime_type.clone(),
        };
        let encoded = serde_json::to_string(&metadata).ok();
        self.record(photo.id, MetadataStatus::Extracted, encoded.as_deref())
            .await?;
        debug!("extracted metadata for {}", photo.s3_key);
        Ok(MetadataOutcome::Extracted(metadata))
    }

    /// Extract every `pending` photo under `scope`, one at a time.
    pub async fn extract_scope(
        &self,
        scope: Option<&str>,
        progress: &JobProgress,
    ) -> Result<MetadataReport, sqlx::Error> {
        let prefix = scope_prefix(scope);
        let photos = sqlx::query_as::<_, Photo>(&format!(
            "SELECT {} FROM photos
             WHERE metadata_status = 'pending' AND substr(s3_key, 1, length(?1)) = ?1
             ORDER BY id",
            PHOTO_COLUMNS
        ))
        .bind(&prefix)
        .fetch_all(&*self.db)
        .await?;
        progress.add_total(photos.len() as i64);

        let mut report = MetadataReport::default();
        for photo in photos {
            match self.extract(&photo).await? {
                MetadataOutcome::Extracted(_) => report.extracted += 1,
                MetadataOutcome::SkippedSize => report.skipped += 1,
                MetadataOutcome::Unavailable { message } => {
                    warn!("metadata for {} unavailable: {}", photo.s3_key, message);
                    report.errors.push(format!("{}: {}", photo.s3_key, message));
                }
            }
            progress.advance(1);
        }
        Ok(report)
    }

    async fn record(
        &self,
        id: i64,
        status: MetadataStatus,
        metadata: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE photos SET metadata_status = ?, metadata = COALESCE(?, metadata) WHERE id = ?")
            .bind(status)
            .bind(metadata)
            .bind(id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }
}

/// Sniff the format and read dimensions without decoding pixel data.
fn read_header(bytes: &[u8]) -> (Option<String>, Option<(u32, u32)>) {
    let Ok(reader) = ImageReader::new(Cursor::new(bytes)).with_guessed_format() else {
        return (None, None);
    };
    let format = reader
        .format()
        .and_then(|f| f.extensions_str().first())
        .map(|ext| ext.to_string());
    let dimensions = reader.into_dimensions().ok();
    (format, dimensions)
}
