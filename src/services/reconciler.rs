//! src/services/reconciler.rs
//!
//! Reconciler: makes the folder/photo mirror match the bucket listing.
//!
//! A pass pages through the listing under a scope, upserts the folder chain
//! and photo row for every media key, and then deletes mirrored photos whose
//! keys were not listed. Per-object failures are collected in the report; a
//! failed listing aborts the pass before anything is deleted.

use crate::{
    models::{
        folder::{folder_chain, normalize_scope, scope_prefix, split_key},
        photo::{MediaKind, MetadataStatus, ThumbnailStatus, media_kind},
        sync_job::JobProgress,
    },
    services::object_client::{ClientError, ObjectClient, ObjectEntry},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("listing `{prefix}` failed: {source}")]
    Listing {
        prefix: String,
        #[source]
        source: ClientError,
    },
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub thumbnail_size_threshold: i64,
    pub metadata_size_threshold: i64,
    /// Key prefixes that are never mirrored (e.g. in-bucket thumbnails).
    pub ignored_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub created: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub removed: u64,
    pub errors: Vec<String>,
    /// Artifacts whose photo was removed or whose original changed.
    #[serde(skip)]
    pub orphaned_thumbnails: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PurgeReport {
    pub photos_removed: u64,
    pub folders_removed: u64,
    pub errors: Vec<String>,
    #[serde(skip)]
    pub orphaned_thumbnails: Vec<String>,
}

#[derive(sqlx::FromRow)]
struct MirroredPhoto {
    id: i64,
    folder_id: Option<i64>,
    size: i64,
    modified_at: DateTime<Utc>,
    thumbnail_path: Option<String>,
}

#[derive(Clone)]
pub struct Reconciler {
    db: Arc<SqlitePool>,
    client: ObjectClient,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(db: Arc<SqlitePool>, client: ObjectClient, config: ReconcileConfig) -> Self {
        Self { db, client, config }
    }

    /// Reconcile the subtree under `scope` (`None` = whole bucket).
    pub async fn reconcile(
        &self,
        scope: Option<&str>,
        progress: &JobProgress,
    ) -> ReconcileResult<ReconcileReport> {
        let scope = scope.and_then(normalize_scope);
        let prefix = scope_prefix(scope.as_deref());
        let synced_at = Utc::now();
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        let mut folders = HashMap::new();

        info!("reconciling prefix `{}`", prefix);

        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(&prefix, token.as_deref())
                .await
                .map_err(|source| ReconcileError::Listing {
                    prefix: prefix.clone(),
                    source,
                })?;
            progress.add_total(page.objects.len() as i64);
            for rejected in &page.rejected {
                warn!("skipping unreadable listing entry under `{}`: {}", prefix, rejected);
                report.errors.push(rejected.clone());
            }

            for entry in &page.objects {
                if !self.is_ignored(&entry.key) {
                    seen.insert(entry.key.clone());
                    if let Err(err) = self
                        .reconcile_object(entry, &mut folders, synced_at, &mut report)
                        .await
                    {
                        warn!("failed to reconcile {}: {}", entry.key, err);
                        report.errors.push(format!("{}: {}", entry.key, err));
                    }
                }
                progress.advance(1);
            }

            match (page.is_truncated, page.next_token) {
                (true, Some(next)) => token = Some(next),
                _ => break,
            }
        }

        self.remove_unseen(&prefix, &seen, &mut report).await?;
        self.refresh_folders(&prefix, Some(synced_at)).await?;

        info!(
            "reconciled `{}`: {} created, {} updated, {} unchanged, {} removed, {} errors",
            prefix,
            report.created,
            report.updated,
            report.unchanged,
            report.removed,
            report.errors.len()
        );
        Ok(report)
    }

    /// Drop mirrored photos whose object is confirmed absent, then empty
    /// folders whose prefix lists nothing, deepest first.
    pub async fn purge_missing(
        &self,
        scope: Option<&str>,
        progress: &JobProgress,
    ) -> ReconcileResult<PurgeReport> {
        let prefix = scope_prefix(scope);
        let mut report = PurgeReport::default();

        let photos: Vec<(i64, String, Option<String>)> = sqlx::query_as(
            "SELECT id, s3_key, thumbnail_path FROM photos
             WHERE substr(s3_key, 1, length(?1)) = ?1 ORDER BY id",
        )
        .bind(&prefix)
        .fetch_all(&*self.db)
        .await?;
        progress.add_total(photos.len() as i64);

        for (id, key, thumbnail_path) in photos {
            match self.client.head_object(&key).await {
                Ok(_) => {}
                Err(ClientError::NotFound(_)) => {
                    sqlx::query("DELETE FROM photos WHERE id = ?")
                        .bind(id)
                        .execute(&*self.db)
                        .await?;
                    debug!("purged photo {} ({})", id, key);
                    report.photos_removed += 1;
                    report.orphaned_thumbnails.extend(thumbnail_path);
                }
                Err(err) => report.errors.push(format!("{}: {}", key, err)),
            }
            progress.advance(1);
        }

        let folders: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, path FROM folders
             WHERE substr(path || '/', 1, length(?1)) = ?1
             ORDER BY length(path) DESC, path",
        )
        .bind(&prefix)
        .fetch_all(&*self.db)
        .await?;

        for (id, path) in folders {
            let (children, photos): (i64, i64) = sqlx::query_as(
                "SELECT (SELECT COUNT(*) FROM folders WHERE parent_id = ?1),
                        (SELECT COUNT(*) FROM photos WHERE folder_id = ?1)",
            )
            .bind(id)
            .fetch_one(&*self.db)
            .await?;
            if children > 0 || photos > 0 {
                continue;
            }
            match self.client.list_objects(&format!("{}/", path), None).await {
                Ok(page) if page.objects.is_empty() && page.rejected.is_empty() => {
                    sqlx::query("DELETE FROM folders WHERE id = ?")
                        .bind(id)
                        .execute(&*self.db)
                        .await?;
                    debug!("purged empty folder {}", path);
                    report.folders_removed += 1;
                }
                Ok(_) => {}
                Err(err) => report.errors.push(format!("{}: {}", path, err)),
            }
        }

        self.refresh_folders(&prefix, None).await?;
        info!(
            "purge of `{}` removed {} photos and {} folders",
            prefix, report.photos_removed, report.folders_removed
        );
        Ok(report)
    }

    fn is_ignored(&self, key: &str) -> bool {
        self.config
            .ignored_prefixes
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }

    async fn reconcile_object(
        &self,
        entry: &ObjectEntry,
        folders: &mut HashMap<String, i64>,
        synced_at: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> ReconcileResult<()> {
        let Some((kind, mime)) = media_kind(&entry.key) else {
            return Ok(());
        };
        let (folder_path, filename) = split_key(&entry.key);
        if filename.is_empty() {
            return Ok(());
        }
        let folder_id = self.ensure_folder_chain(folder_path, folders, synced_at).await?;
        let (metadata_status, thumbnail_status) = self.initial_statuses(kind, entry.size);

        let existing = sqlx::query_as::<_, MirroredPhoto>(
            "SELECT id, folder_id, size, modified_at, thumbnail_path FROM photos WHERE s3_key = ?",
        )
        .bind(&entry.key)
        .fetch_optional(&*self.db)
        .await?;

        match existing {
            None => {
                sqlx::query(
                    "INSERT INTO photos (folder_id, filename, s3_key, size, mime_type, modified_at,
                                         metadata_status, thumbnail_status)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(folder_id)
                .bind(filename)
                .bind(&entry.key)
                .bind(entry.size)
                .bind(&mime)
                .bind(entry.last_modified)
                .bind(metadata_status)
                .bind(thumbnail_status)
                .execute(&*self.db)
                .await?;
                report.created += 1;
            }
            Some(row)
                if row.size == entry.size
                    && row.modified_at.timestamp_millis()
                        == entry.last_modified.timestamp_millis()
                    && row.folder_id == folder_id =>
            {
                report.unchanged += 1;
            }
            Some(row) => {
                // Bytes changed: derived state is stale.
                sqlx::query(
                    "UPDATE photos SET folder_id = ?, filename = ?, size = ?, mime_type = ?,
                            modified_at = ?, metadata_status = ?, thumbnail_status = ?,
                            thumbnail_path = NULL, metadata = NULL
                     WHERE id = ?",
                )
                .bind(folder_id)
                .bind(filename)
                .bind(entry.size)
                .bind(&mime)
                .bind(entry.last_modified)
                .bind(metadata_status)
                .bind(thumbnail_status)
                .bind(row.id)
                .execute(&*self.db)
                .await?;
                report.orphaned_thumbnails.extend(row.thumbnail_path);
                report.updated += 1;
            }
        }
        Ok(())
    }

    /// Size gating is applied to every media kind. Below the thresholds,
    /// images wait for deferred work and videos get none.
    fn initial_statuses(&self, kind: MediaKind, size: i64) -> (MetadataStatus, ThumbnailStatus) {
        let metadata = if size > self.config.metadata_size_threshold {
            MetadataStatus::SkippedSize
        } else if kind == MediaKind::Image {
            MetadataStatus::Pending
        } else {
            MetadataStatus::None
        };
        let thumbnail = if size > self.config.thumbnail_size_threshold {
            ThumbnailStatus::SkippedSize
        } else if kind == MediaKind::Image {
            ThumbnailStatus::Pending
        } else {
            ThumbnailStatus::None
        };
        (metadata, thumbnail)
    }

    /// Upsert every folder from the root down to `path`, parents first.
    /// Returns the id of the deepest folder, `None` for the bucket root.
    async fn ensure_folder_chain(
        &self,
        path: &str,
        cache: &mut HashMap<String, i64>,
        synced_at: DateTime<Utc>,
    ) -> ReconcileResult<Option<i64>> {
        let mut parent_id = None;
        for folder_path in folder_chain(path) {
            if let Some(id) = cache.get(&folder_path) {
                parent_id = Some(*id);
                continue;
            }
            let name = folder_path.rsplit('/').next().unwrap_or(&folder_path);
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO folders (path, name, parent_id, last_synced) VALUES (?, ?, ?, ?)
                 ON CONFLICT(path) DO UPDATE SET parent_id = excluded.parent_id,
                                                 last_synced = excluded.last_synced
                 RETURNING id",
            )
            .bind(&folder_path)
            .bind(name)
            .bind(parent_id)
            .bind(synced_at)
            .fetch_one(&*self.db)
            .await?;
            cache.insert(folder_path, id);
            parent_id = Some(id);
        }
        Ok(parent_id)
    }

    async fn remove_unseen(
        &self,
        prefix: &str,
        seen: &HashSet<String>,
        report: &mut ReconcileReport,
    ) -> ReconcileResult<()> {
        let mirrored: Vec<(i64, String, Option<String>)> = sqlx::query_as(
            "SELECT id, s3_key, thumbnail_path FROM photos WHERE substr(s3_key, 1, length(?1)) = ?1",
        )
        .bind(prefix)
        .fetch_all(&*self.db)
        .await?;

        let stale: Vec<_> = mirrored
            .into_iter()
            .filter(|(_, key, _)| !seen.contains(key))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.begin().await?;
        for (id, key, thumbnail_path) in stale {
            sqlx::query("DELETE FROM photos WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            debug!("removed photo {} no longer in the bucket", key);
            report.orphaned_thumbnails.extend(thumbnail_path);
            report.removed += 1;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Recompute denormalized counts for folders inside the prefix and their
    /// ancestors. `synced_at` stamps the folders inside the prefix.
    async fn refresh_folders(
        &self,
        prefix: &str,
        synced_at: Option<DateTime<Utc>>,
    ) -> ReconcileResult<()> {
        sqlx::query(
            "UPDATE folders SET
                photo_count = (SELECT COUNT(*) FROM photos p WHERE p.folder_id = folders.id),
                subfolder_count = (SELECT COUNT(*) FROM folders c WHERE c.parent_id = folders.id)
             WHERE substr(path || '/', 1, length(?1)) = ?1
                OR substr(?1, 1, length(path) + 1) = path || '/'",
        )
        .bind(prefix)
        .execute(&*self.db)
        .await?;

        if let Some(synced_at) = synced_at {
            sqlx::query(
                "UPDATE folders SET last_synced = ?2 WHERE substr(path || '/', 1, length(?1)) = ?1",
            )
            .bind(prefix)
            .bind(synced_at)
            .execute(&*self.db)
            .await?;
        }
        Ok(())
    }
}
