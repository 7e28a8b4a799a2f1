//! Represents one media object of the bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Progress of metadata extraction for a photo.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MetadataStatus {
    None,
    Pending,
    Extracted,
    SkippedSize,
}

/// Progress of thumbnail materialization for a photo.
///
/// `thumbnail_path` is set if and only if the status is `Generated`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ThumbnailStatus {
    None,
    Pending,
    Generated,
    SkippedSize,
    SkippedUnsupported,
    SkippedCorrupted,
}

impl ThumbnailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThumbnailStatus::None => "none",
            ThumbnailStatus::Pending => "pending",
            ThumbnailStatus::Generated => "generated",
            ThumbnailStatus::SkippedSize => "skipped_size",
            ThumbnailStatus::SkippedUnsupported => "skipped_unsupported",
            ThumbnailStatus::SkippedCorrupted => "skipped_corrupted",
        }
    }

    /// True for the `skipped_*` outcomes that will never be retried.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            ThumbnailStatus::SkippedSize
                | ThumbnailStatus::SkippedUnsupported
                | ThumbnailStatus::SkippedCorrupted
        )
    }
}

/// A media object mirrored from the bucket.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Photo {
    pub id: i64,

    /// Owning folder, `None` for objects at the bucket root.
    pub folder_id: Option<i64>,

    pub filename: String,

    /// Object-store identity. Never changes once the row exists.
    pub s3_key: String,

    /// Size of the original object in bytes.
    pub size: i64,

    pub mime_type: Option<String>,

    /// Last-modified timestamp reported by the store.
    pub modified_at: DateTime<Utc>,

    pub metadata_status: MetadataStatus,

    pub thumbnail_status: ThumbnailStatus,

    /// Identity of the derived artifact in the artifact store.
    pub thumbnail_path: Option<String>,

    /// JSON-encoded [`PhotoMetadata`].
    pub metadata: Option<String>,

    pub is_favorite: bool,
}

impl Photo {
    pub fn parsed_metadata(&self) -> Option<PhotoMetadata> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Structured fields recorded by the metadata extractor.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct PhotoMetadata {
    pub format: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size: i64,
    pub mime_type: Option<String>,
}

pub(crate) const PHOTO_COLUMNS: &str = "id, folder_id, filename, s3_key, size, mime_type, \
     modified_at, metadata_status, thumbnail_status, thumbnail_path, metadata, is_favorite";

/// Media classification derived from the object key's extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Classify a key as image or video media. Anything else is not mirrored.
pub fn media_kind(key: &str) -> Option<(MediaKind, String)> {
    let mime = mime_guess::from_path(key).first()?;
    let kind = match mime.type_().as_str() {
        "image" => MediaKind::Image,
        "video" => MediaKind::Video,
        _ => return None,
    };
    Some((kind, mime.essence_str().to_string()))
}
