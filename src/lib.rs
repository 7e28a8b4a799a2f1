//! Mirror of an object-store bucket into SQLite folders and photos, with a
//! single-flight sync job queue and on-demand thumbnail materialization.

pub mod config;
pub mod db;
pub mod errors;
pub mod fetch_queue;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
