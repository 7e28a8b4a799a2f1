//! Fixtures shared by the service tests.

use crate::models::photo::{PHOTO_COLUMNS, Photo, media_kind};
use chrono::Utc;
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use sqlx::SqlitePool;

/// A gradient JPEG of the given size.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, 90)
        .encode_image(&img)
        .unwrap();
    out
}

/// Insert a root-less photo row with both statuses `pending`.
pub async fn insert_photo(db: &SqlitePool, key: &str, size: i64) -> Photo {
    let filename = key.rsplit('/').next().unwrap_or(key);
    let mime = media_kind(key).map(|(_, mime)| mime);
    sqlx::query_as::<_, Photo>(&format!(
        "INSERT INTO photos (folder_id, filename, s3_key, size, mime_type, modified_at,
                             metadata_status, thumbnail_status)
         VALUES (NULL, ?, ?, ?, ?, ?, 'pending', 'pending')
         RETURNING {}",
        PHOTO_COLUMNS
    ))
    .bind(filename)
    .bind(key)
    .bind(size)
    .bind(mime)
    .bind(Utc::now())
    .fetch_one(db)
    .await
    .unwrap()
}

/// Seed a directory bucket with `a/good.jpg`, `a/other.jpg` and a file whose
/// name is not valid UTF-8.
#[cfg(target_os = "linux")]
pub fn seed_bucket_with_invalid_name(root: &std::path::Path) {
    use std::{ffi::OsStr, os::unix::ffi::OsStrExt};

    let folder = root.join("a");
    std::fs::create_dir_all(&folder).unwrap();
    std::fs::write(folder.join("good.jpg"), jpeg_bytes(8, 8)).unwrap();
    std::fs::write(folder.join("other.jpg"), jpeg_bytes(8, 8)).unwrap();
    std::fs::write(folder.join(OsStr::from_bytes(b"bad\xff.jpg")), b"x").unwrap();
}
