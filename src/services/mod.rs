pub mod artifact_store;
pub mod metadata_service;
pub mod object_client;
pub mod reconciler;
pub mod scheduler;
pub mod thumbnail_service;

#[cfg(test)]
pub(crate) mod test_support;
