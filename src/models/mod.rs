//! Rows of the bucket mirror and the sync job audit trail.
//!
//! These entities map directly to the SQLite tables via `sqlx::FromRow` and
//! serialize as JSON for the API layer via `serde`.

pub mod folder;
pub mod photo;
pub mod sync_job;
