//! src/services/thumbnail_service.rs
//!
//! ThumbnailService: materializes, serves and evicts thumbnail artifacts.
//!
//! Generation never fails with an error: every attempt ends in a
//! [`ThumbnailOutcome`], and the terminal ones are written back to the photo
//! row as its `thumbnail_status`. Concurrent requests for the same photo share
//! a single fetch-and-decode.

use crate::{
    models::{
        folder::scope_prefix,
        photo::{PHOTO_COLUMNS, Photo, ThumbnailStatus},
    },
    services::{
        artifact_store::{ArtifactEntry, ArtifactLocation, ArtifactResult, ArtifactStore},
        object_client::{ClientError, ObjectClient},
    },
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    FutureExt, StreamExt,
    future::{BoxFuture, Shared},
    stream,
};
use image::{ImageError, ImageFormat, codecs::jpeg::JpegEncoder};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tracing::{debug, info, warn};

pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

/// Source formats the decoder accepts. Everything else is `skipped_unsupported`.
const SUPPORTED_FORMATS: [ImageFormat; 6] = [
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::Gif,
    ImageFormat::WebP,
    ImageFormat::Bmp,
    ImageFormat::Tiff,
];

#[derive(Debug, Clone)]
pub struct ThumbnailConfig {
    pub location: ArtifactLocation,
    /// Longest edge of a generated thumbnail, in pixels.
    pub max_dimension: u32,
    pub jpeg_quality: u8,
    /// Originals larger than this are `skipped_size`.
    pub size_threshold: i64,
    /// Artifacts older than this are removed by the sweep.
    pub retention: Duration,
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            location: ArtifactLocation::Local {
                dir: PathBuf::from("./data/thumbnails"),
            },
            max_dimension: 400,
            jpeg_quality: 80,
            size_threshold: 20 * 1024 * 1024,
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// Result of one generation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ThumbnailOutcome {
    Generated { path: String, bytes: Bytes },
    SkippedSize,
    SkippedUnsupported,
    SkippedCorrupted,
    /// The original or the artifact store could not be reached. The photo
    /// stays `pending` and a later attempt may succeed.
    Unavailable { message: String },
}

impl ThumbnailOutcome {
    /// Status recorded on the photo row, `None` when nothing was recorded.
    pub fn status(&self) -> Option<ThumbnailStatus> {
        match self {
            ThumbnailOutcome::Generated { .. } => Some(ThumbnailStatus::Generated),
            ThumbnailOutcome::SkippedSize => Some(ThumbnailStatus::SkippedSize),
            ThumbnailOutcome::SkippedUnsupported => Some(ThumbnailStatus::SkippedUnsupported),
            ThumbnailOutcome::SkippedCorrupted => Some(ThumbnailStatus::SkippedCorrupted),
            ThumbnailOutcome::Unavailable { .. } => None,
        }
    }
}

/// What `serve` hands to the HTTP layer.
#[derive(Debug, Clone)]
pub enum ServeOutcome {
    Ready {
        buffer: Bytes,
        content_type: &'static str,
    },
    /// No thumbnail will ever exist; render a placeholder.
    Placeholder { status: ThumbnailStatus },
    Failed { status: u16, message: String },
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ThumbnailStats {
    pub count: u64,
    pub total_bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub removed: u64,
    pub reset_photos: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BacklogReport {
    pub generated: u64,
    pub skipped: u64,
    pub unavailable: u64,
}

enum RenderError {
    Unsupported,
    Corrupted,
}

type InFlight = Shared<BoxFuture<'static, ThumbnailOutcome>>;

#[derive(Clone)]
pub struct ThumbnailService {
    db: Arc<SqlitePool>,
    client: ObjectClient,
    artifacts: ArtifactStore,
    config: Arc<ThumbnailConfig>,
    in_flight: Arc<Mutex<HashMap<i64, InFlight>>>,
    decodes: Arc<AtomicU64>,
}

impl ThumbnailService {
    pub fn new(db: Arc<SqlitePool>, client: ObjectClient, config: ThumbnailConfig) -> Self {
        let artifacts = ArtifactStore::new(&config.location, client.clone());
        Self {
            db,
            client,
            artifacts,
            config: Arc::new(config),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            decodes: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ThumbnailConfig {
        &self.config
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Number of decode attempts made since start.
    pub fn decode_count(&self) -> u64 {
        self.decodes.load(Ordering::Relaxed)
    }

    /// Materialize the thumbnail for `photo`.
    ///
    /// Callers that arrive while a generation for the same photo id is in
    /// flight receive that generation's outcome instead of starting another.
    /// The work runs on its own task, so it completes even if every caller
    /// goes away.
    pub async fn generate(&self, photo: &Photo) -> ThumbnailOutcome {
        let flight = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&photo.id) {
                Some(existing) => {
                    debug!("joining in-flight thumbnail generation for photo {}", photo.id);
                    existing.clone()
                }
                None => {
                    let this = self.clone();
                    let owned = photo.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = this.generate_once(&owned).await;
                        this.in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&owned.id);
                        outcome
                    });
                    let flight = handle
                        .map(|joined| {
                            joined.unwrap_or_else(|err| ThumbnailOutcome::Unavailable {
                                message: format!("thumbnail task failed: {}", err),
                            })
                        })
                        .boxed()
                        .shared();
                    in_flight.insert(photo.id, flight.clone());
                    flight
                }
            }
        };
        flight.await
    }

    /// Return the cached artifact, generating it on demand.
    pub async fn serve(&self, photo: &Photo) -> ServeOutcome {
        if photo.thumbnail_status == ThumbnailStatus::Generated {
            if let Some(path) = photo.thumbnail_path.as_deref() {
                match self.artifacts.read(path).await {
                    Ok(Some(buffer)) => {
                        return ServeOutcome::Ready {
                            buffer,
                            content_type: THUMBNAIL_CONTENT_TYPE,
                        };
                    }
                    Ok(None) => debug!("artifact {} evicted, regenerating", path),
                    Err(err) => {
                        return ServeOutcome::Failed {
                            status: 502,
                            message: err.to_string(),
                        };
                    }
                }
            }
        }
        if photo.thumbnail_status.is_skipped() {
            return ServeOutcome::Placeholder {
                status: photo.thumbnail_status,
            };
        }

        match self.generate(photo).await {
            ThumbnailOutcome::Generated { bytes, .. } => ServeOutcome::Ready {
                buffer: bytes,
                content_type: THUMBNAIL_CONTENT_TYPE,
            },
            ThumbnailOutcome::Unavailable { message } => ServeOutcome::Failed {
                status: 502,
                message,
            },
            skipped => ServeOutcome::Placeholder {
                status: skipped.status().unwrap_or(ThumbnailStatus::None),
            },
        }
    }

    /// Remove one artifact. Missing artifacts are ignored.
    pub async fn delete_thumbnail(&self, path: &str) -> bool {
        match self.artifacts.delete(path).await {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to delete thumbnail {}: {}", path, err);
                false
            }
        }
    }

    /// Remove artifacts older than the retention age and reset the photos
    /// that pointed at them back to `pending`.
    pub async fn sweep_stale(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let entries = match self.artifacts.list().await {
            Ok(entries) => entries,
            Err(err) => {
                report.errors.push(format!("listing artifacts: {}", err));
                return report;
            }
        };
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        for entry in entries.into_iter().filter(|e| e.modified < cutoff) {
            if let Err(err) = self.artifacts.delete(&entry.path).await {
                report.errors.push(format!("{}: {}", entry.path, err));
                continue;
            }
            report.removed += 1;
            match sqlx::query(
                "UPDATE photos SET thumbnail_status = 'pending', thumbnail_path = NULL
                 WHERE thumbnail_path = ?",
            )
            .bind(&entry.path)
            .execute(&*self.db)
            .await
            {
                Ok(result) => report.reset_photos += result.rows_affected(),
                Err(err) => report.errors.push(format!("{}: {}", entry.path, err)),
            }
        }

        info!(
            "thumbnail sweep removed {} artifacts, reset {} photos",
            report.removed, report.reset_photos
        );
        report
    }

    pub async fn stats(&self) -> ArtifactResult<ThumbnailStats> {
        let entries = self.artifacts.list().await?;
        Ok(summarize(&entries))
    }

    /// Generate every `pending` thumbnail under `scope` with bounded parallelism.
    pub async fn run_backlog(&self, scope: Option<&str>, concurrency: usize) -> BacklogReport {
        let prefix = scope_prefix(scope);
        let photos = match sqlx::query_as::<_, Photo>(&format!(
            "SELECT {} FROM photos
             WHERE thumbnail_status = 'pending' AND substr(s3_key, 1, length(?1)) = ?1
             ORDER BY id",
            PHOTO_COLUMNS
        ))
        .bind(&prefix)
        .fetch_all(&*self.db)
        .await
        {
            Ok(photos) => photos,
            Err(err) => {
                warn!("thumbnail backlog query failed: {}", err);
                return BacklogReport::default();
            }
        };

        let mut report = BacklogReport::default();
        let mut outcomes = stream::iter(photos)
            .map(|photo| async move { self.generate(&photo).await })
            .buffer_unordered(concurrency.max(1));
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                ThumbnailOutcome::Generated { .. } => report.generated += 1,
                ThumbnailOutcome::Unavailable { .. } => report.unavailable += 1,
                _ => report.skipped += 1,
            }
        }
        report
    }

    async fn generate_once(&self, requested: &Photo) -> ThumbnailOutcome {
        // Work from the current row: the caller's copy may predate a
        // reconciliation that changed the original.
        let photo = match self.load_photo(requested.id).await {
            Ok(Some(photo)) => photo,
            Ok(None) => {
                return ThumbnailOutcome::Unavailable {
                    message: format!("photo {} no longer exists", requested.id),
                };
            }
            Err(err) => {
                return ThumbnailOutcome::Unavailable {
                    message: format!("loading photo {}: {}", requested.id, err),
                };
            }
        };
        let photo = &photo;

        // A previous flight may already have produced the artifact.
        if photo.thumbnail_status == ThumbnailStatus::Generated {
            if let Some(path) = photo.thumbnail_path.as_deref() {
                if let Ok(Some(bytes)) = self.artifacts.read(path).await {
                    return ThumbnailOutcome::Generated {
                        path: path.to_string(),
                        bytes,
                    };
                }
            }
        }

        if photo.size > self.config.size_threshold {
            return self.finish(photo, ThumbnailOutcome::SkippedSize).await;
        }

        let original = match self.client.get_object(&photo.s3_key).await {
            Ok(bytes) => bytes,
            Err(ClientError::NotFound(key)) => {
                return ThumbnailOutcome::Unavailable {
                    message: format!("original `{}` no longer exists", key),
                };
            }
            Err(err) => {
                return ThumbnailOutcome::Unavailable {
                    message: err.to_string(),
                };
            }
        };
        if original.len() as i64 > self.config.size_threshold {
            return self.finish(photo, ThumbnailOutcome::SkippedSize).await;
        }

        self.decodes.fetch_add(1, Ordering::Relaxed);
        let max_dimension = self.config.max_dimension;
        let quality = self.config.jpeg_quality;
        let rendered = tokio::task::spawn_blocking(move || {
            render_thumbnail(&original, max_dimension, quality)
        })
        .await;

        let outcome = match rendered {
            Ok(Ok(encoded)) => {
                let path = ArtifactStore::artifact_path(&photo.s3_key, &artifact_name(photo));
                let bytes = Bytes::from(encoded);
                match self
                    .artifacts
                    .write(&path, bytes.clone(), THUMBNAIL_CONTENT_TYPE)
                    .await
                {
                    Ok(()) => ThumbnailOutcome::Generated { path, bytes },
                    Err(err) => ThumbnailOutcome::Unavailable {
                        message: format!("storing thumbnail: {}", err),
                    },
                }
            }
            Ok(Err(RenderError::Unsupported)) => ThumbnailOutcome::SkippedUnsupported,
            Ok(Err(RenderError::Corrupted)) => ThumbnailOutcome::SkippedCorrupted,
            Err(err) => ThumbnailOutcome::Unavailable {
                message: format!("decoder task failed: {}", err),
            },
        };
        self.finish(photo, outcome).await
    }

    /// Persist the outcome's status. The write only lands while the row still
    /// describes the original that was rendered; otherwise, or on a failed
    /// write, the outcome becomes `Unavailable` and the artifact is dropped so
    /// the row never claims an artifact it does not have.
    async fn finish(&self, photo: &Photo, outcome: ThumbnailOutcome) -> ThumbnailOutcome {
        let Some(status) = outcome.status() else {
            return outcome;
        };
        let path = match &outcome {
            ThumbnailOutcome::Generated { path, .. } => Some(path.as_str()),
            _ => None,
        };
        let result = sqlx::query(
            "UPDATE photos SET thumbnail_status = ?, thumbnail_path = ?
             WHERE id = ? AND size = ? AND modified_at = ?",
        )
        .bind(status)
        .bind(path)
        .bind(photo.id)
        .bind(photo.size)
        .bind(photo.modified_at)
        .execute(&*self.db)
        .await;

        let message = match result {
            Ok(done) if done.rows_affected() > 0 => {
                debug!("photo {} thumbnail -> {}", photo.id, status.as_str());
                return outcome;
            }
            Ok(_) => format!("photo {} changed while its thumbnail was generated", photo.id),
            Err(err) => format!("recording thumbnail status: {}", err),
        };
        if let Some(path) = path {
            if let Err(err) = self.artifacts.delete(path).await {
                warn!("failed to drop unrecorded thumbnail {}: {}", path, err);
            }
        }
        ThumbnailOutcome::Unavailable { message }
    }

    async fn load_photo(&self, id: i64) -> Result<Option<Photo>, sqlx::Error> {
        sqlx::query_as::<_, Photo>(&format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS))
            .bind(id)
            .fetch_optional(&*self.db)
            .await
    }
}

/// `{photo_id}-{modified_ms}.jpg`: a changed original never reuses the
/// artifact name of the version it replaced.
fn artifact_name(photo: &Photo) -> String {
    format!("{}-{}.jpg", photo.id, photo.modified_at.timestamp_millis())
}

fn summarize(entries: &[ArtifactEntry]) -> ThumbnailStats {
    let entries = entries.iter().filter(|e| !e.path.starts_with("readyz/"));
    let mut stats = ThumbnailStats::default();
    for entry in entries {
        stats.count += 1;
        stats.total_bytes += entry.size;
        stats.oldest = Some(stats.oldest.map_or(entry.modified, |o| o.min(entry.modified)));
        stats.newest = Some(stats.newest.map_or(entry.modified, |n| n.max(entry.modified)));
    }
    stats
}

/// Decode `bytes` and re-encode as a JPEG whose longest edge is at most
/// `max_dimension`. Smaller images are re-encoded at their own size.
fn render_thumbnail(bytes: &[u8], max_dimension: u32, quality: u8) -> Result<Vec<u8>, RenderError> {
    let format = image::guess_format(bytes).map_err(|_| RenderError::Unsupported)?;
    if !SUPPORTED_FORMATS.contains(&format) {
        return Err(RenderError::Unsupported);
    }
    let img = image::load_from_memory_with_format(bytes, format).map_err(|err| match err {
        ImageError::Unsupported(_) => RenderError::Unsupported,
        _ => RenderError::Corrupted,
    })?;

    let img = if img.width() > max_dimension || img.height() > max_dimension {
        img.thumbnail(max_dimension, max_dimension)
    } else {
        img
    };

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode_image(&rgb)
        .map_err(|_| RenderError::Corrupted)?;
    Ok(out)
}
