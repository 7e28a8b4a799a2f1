//! Represents a unit of reconciliation work and its lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SyncJobType {
    FullScan,
    FolderScan,
    MetadataScan,
    Cleanup,
}

impl SyncJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncJobType::FullScan => "full_scan",
            SyncJobType::FolderScan => "folder_scan",
            SyncJobType::MetadataScan => "metadata_scan",
            SyncJobType::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for SyncJobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncJobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_scan" => Ok(SyncJobType::FullScan),
            "folder_scan" => Ok(SyncJobType::FolderScan),
            "metadata_scan" => Ok(SyncJobType::MetadataScan),
            "cleanup" => Ok(SyncJobType::Cleanup),
            other => Err(format!("unknown sync job type `{}`", other)),
        }
    }
}

/// Job lifecycle: `pending → running → {completed | failed}`, never backwards.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// A row of the append-only `sync_jobs` table.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SyncJob {
    pub id: i64,

    pub job_type: SyncJobType,

    pub status: JobStatus,

    /// Subtree restriction. Always `None` for `full_scan`.
    pub folder_path: Option<String>,

    pub created_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub completed_at: Option<DateTime<Utc>>,

    pub error_message: Option<String>,

    /// Kept on failure so partial progress stays observable.
    pub processed_items: i64,

    pub total_items: i64,
}

pub(crate) const JOB_COLUMNS: &str = "id, job_type, status, folder_path, created_at, started_at, \
     completed_at, error_message, processed_items, total_items";

/// Live counters for the running job, flushed to the job row periodically.
#[derive(Debug, Default)]
pub struct JobProgress {
    processed: AtomicI64,
    total: AtomicI64,
}

impl JobProgress {
    pub fn add_total(&self, n: i64) {
        self.total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn advance(&self, n: i64) {
        self.processed.fetch_add(n, Ordering::Relaxed);
    }

    /// `(processed_items, total_items)`
    pub fn snapshot(&self) -> (i64, i64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}
