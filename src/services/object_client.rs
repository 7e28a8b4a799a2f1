//! src/services/object_client.rs
//!
//! ObjectClient: the bucket-facing adapter. Wraps an `object_store` backend
//! (S3/MinIO, a local directory, or memory) behind the small contract the sync
//! core consumes: paged listing, get, head, put, delete and URL signing.
//!
//! Every call carries its own timeout so an unresponsive store cannot wedge
//! the single running job, and every call is recorded in the audit log
//! (`target: "audit"`) and the per-operation counters.

use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use object_store::{
    Attribute, Attributes, ObjectStore, PutOptions, PutPayload,
    aws::{AmazonS3, AmazonS3Builder},
    local::LocalFileSystem,
    memory::InMemory,
    path::Path as ObjectPath,
    signer::Signer,
};
use serde::Serialize;
use std::{
    future::Future,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;

/// Which bucket the mirror reflects.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// In-memory bucket (tests and demos)
    Memory,

    /// A local directory treated as the bucket
    Local { path: PathBuf },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        endpoint: String,
        bucket: String,
        access_key: String,
        secret_key: String,
        /// Defaults to "us-east-1"
        region: Option<String>,
    },
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("{op} on `{key}` timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        key: String,
        timeout: Duration,
    },
    #[error("signed URLs are not supported by this bucket backend")]
    SigningUnsupported,
    #[error("invalid bucket configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Store(#[from] object_store::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// One entry of a bucket listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectEntry {
    pub key: String,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

/// One page of a bucket listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub is_truncated: bool,
    /// Pass back to `list_objects` to continue after this page.
    pub next_token: Option<String>,
    /// Entries the store listed but could not turn into a key.
    pub rejected: Vec<String>,
}

/// Call counters, one per operation.
#[derive(Debug, Default)]
pub struct ClientAudit {
    pub list_calls: AtomicU64,
    pub get_calls: AtomicU64,
    pub head_calls: AtomicU64,
    pub put_calls: AtomicU64,
    pub delete_calls: AtomicU64,
    pub sign_calls: AtomicU64,
    pub failures: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ClientAudit {
    fn counter(&self, op: &str) -> Option<&AtomicU64> {
        match op {
            "list_objects" => Some(&self.list_calls),
            "get_object" => Some(&self.get_calls),
            "head_object" => Some(&self.head_calls),
            "put_object" => Some(&self.put_calls),
            "delete_object" => Some(&self.delete_calls),
            "sign_download_url" => Some(&self.sign_calls),
            _ => None,
        }
    }
}

/// Shared handle to the bucket. Cheap to clone.
#[derive(Clone)]
pub struct ObjectClient {
    inner: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    audit: Arc<ClientAudit>,
    io_timeout: Duration,
    page_size: usize,
    /// Whether the backend lists keys in lexicographic order (S3, memory).
    sorted_listing: bool,
}

const DEFAULT_PAGE_SIZE: usize = 1000;

impl ObjectClient {
    /// Build a client from configuration.
    pub fn new(config: &StoreConfig, io_timeout: Duration) -> ClientResult<Self> {
        match config {
            StoreConfig::Memory => Ok(Self::from_store(Arc::new(InMemory::new()), io_timeout)),
            StoreConfig::Local { path } => {
                std::fs::create_dir_all(path)
                    .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .map_err(|e| ClientError::InvalidConfig(e.to_string()))?;
                let mut client = Self::from_store(Arc::new(store), io_timeout);
                client.sorted_listing = false;
                Ok(client)
            }
            StoreConfig::S3 {
                endpoint,
                bucket,
                access_key,
                secret_key,
                region,
            } => {
                let s3: Arc<AmazonS3> = Arc::new(
                    AmazonS3Builder::new()
                        .with_endpoint(endpoint)
                        .with_access_key_id(access_key)
                        .with_secret_access_key(secret_key)
                        .with_bucket_name(bucket)
                        .with_region(region.as_deref().unwrap_or("us-east-1"))
                        .with_allow_http(endpoint.starts_with("http://"))
                        .build()
                        .map_err(|e| ClientError::InvalidConfig(e.to_string()))?,
                );
                let mut client = Self::from_store(s3.clone(), io_timeout);
                client.signer = Some(s3);
                Ok(client)
            }
        }
    }

    /// Wrap an existing store. No signing support.
    pub fn from_store(store: Arc<dyn ObjectStore>, io_timeout: Duration) -> Self {
        Self {
            inner: store,
            signer: None,
            audit: Arc::new(ClientAudit::default()),
            io_timeout,
            page_size: DEFAULT_PAGE_SIZE,
            sorted_listing: true,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn audit(&self) -> &ClientAudit {
        &self.audit
    }

    /// List up to one page of objects under `prefix`, resuming after
    /// `continuation_token` when given. An empty prefix lists the whole bucket.
    pub async fn list_objects(
        &self,
        prefix: &str,
        continuation_token: Option<&str>,
    ) -> ClientResult<ListPage> {
        let prefix_path = (!prefix.is_empty()).then(|| object_path(prefix));
        let offset = continuation_token.map(decode_continuation_token);
        let fetch_limit = self.page_size + 1;

        let store = self.inner.clone();
        let sorted_listing = self.sorted_listing;
        // Unordered backends yield rejected entries on every page, so they
        // are reported with the first one only.
        let report_rejected = sorted_listing || offset.is_none();
        let (page, rejected) = self
            .instrument("list_objects", prefix, async move {
                let mut stream = match &offset {
                    Some(offset) => {
                        store.list_with_offset(prefix_path.as_ref(), &object_path(offset))
                    }
                    None => store.list(prefix_path.as_ref()),
                };
                let mut metas = Vec::new();
                let mut rejected = Vec::new();
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(meta) => {
                            metas.push(meta);
                            // Unordered backends must be read in full before a
                            // page boundary can be chosen.
                            if sorted_listing && metas.len() >= fetch_limit {
                                break;
                            }
                        }
                        Err(err @ object_store::Error::InvalidPath { .. }) => {
                            if report_rejected {
                                rejected.push(err.to_string());
                            }
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                metas.sort_by(|a, b| a.location.cmp(&b.location));
                metas.truncate(fetch_limit);
                Ok((metas, rejected))
            })
            .await?;
        for entry in &rejected {
            tracing::warn!(
                target: "audit",
                op = "list_objects",
                key = prefix,
                "rejected entry: {}",
                entry
            );
        }

        let mut objects: Vec<ObjectEntry> = page
            .into_iter()
            .map(|meta| ObjectEntry {
                key: meta.location.to_string(),
                size: meta.size as i64,
                last_modified: meta.last_modified,
            })
            .collect();

        let mut is_truncated = false;
        let mut next_token = None;
        if objects.len() == fetch_limit {
            objects.pop();
            if let Some(last) = objects.last() {
                next_token = Some(encode_continuation_token(&last.key));
            }
            is_truncated = true;
        }

        Ok(ListPage {
            objects,
            is_truncated,
            next_token,
            rejected,
        })
    }

    /// Read a whole object into memory.
    pub async fn get_object(&self, key: &str) -> ClientResult<Bytes> {
        let store = self.inner.clone();
        let path = object_path(key);
        let bytes = self
            .instrument("get_object", key, async move {
                let result = store.get(&path).await.map_err(not_found_as(key))?;
                Ok(result.bytes().await?)
            })
            .await?;
        self.audit
            .bytes_read
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(bytes)
    }

    /// Open an object as a byte stream. The timeout covers opening only.
    pub async fn get_object_stream(
        &self,
        key: &str,
    ) -> ClientResult<(ObjectEntry, BoxStream<'static, ClientResult<Bytes>>)> {
        let store = self.inner.clone();
        let path = object_path(key);
        let result = self
            .instrument("get_object", key, async move {
                Ok(store.get(&path).await.map_err(not_found_as(key))?)
            })
            .await?;
        let entry = ObjectEntry {
            key: key.to_string(),
            size: result.meta.size as i64,
            last_modified: result.meta.last_modified,
        };
        let audit = self.audit.clone();
        let stream = result
            .into_stream()
            .map(move |chunk| {
                if let Ok(bytes) = &chunk {
                    audit
                        .bytes_read
                        .fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                chunk.map_err(ClientError::from)
            })
            .boxed();
        Ok((entry, stream))
    }

    pub async fn head_object(&self, key: &str) -> ClientResult<ObjectEntry> {
        let store = self.inner.clone();
        let path = object_path(key);
        let meta = self
            .instrument("head_object", key, async move {
                Ok(store.head(&path).await.map_err(not_found_as(key))?)
            })
            .await?;
        Ok(ObjectEntry {
            key: key.to_string(),
            size: meta.size as i64,
            last_modified: meta.last_modified,
        })
    }

    pub async fn put_object(&self, key: &str, bytes: Bytes, content_type: &str) -> ClientResult<()> {
        let store = self.inner.clone();
        let path = object_path(key);
        let len = bytes.len() as u64;
        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let opts = PutOptions {
            attributes,
            ..Default::default()
        };
        self.instrument("put_object", key, async move {
            store.put_opts(&path, PutPayload::from(bytes), opts).await?;
            Ok(())
        })
        .await?;
        self.audit.bytes_written.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    /// Delete an object. Deleting a missing object succeeds.
    pub async fn delete_object(&self, key: &str) -> ClientResult<()> {
        let store = self.inner.clone();
        let path = object_path(key);
        self.instrument("delete_object", key, async move {
            match store.delete(&path).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// Presigned GET URL valid for `ttl`.
    pub async fn sign_download_url(&self, key: &str, ttl: Duration) -> ClientResult<String> {
        let signer = self.signer.clone().ok_or(ClientError::SigningUnsupported)?;
        let path = object_path(key);
        self.instrument("sign_download_url", key, async move {
            let url = signer
                .signed_url(axum::http::Method::GET, &path, ttl)
                .await?;
            Ok(url.to_string())
        })
        .await
    }

    /// Apply the I/O timeout, then record duration/status in the audit log.
    async fn instrument<T, F>(&self, op: &'static str, key: &str, fut: F) -> ClientResult<T>
    where
        F: Future<Output = ClientResult<T>>,
    {
        if let Some(counter) = self.audit.counter(op) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        let started = Instant::now();
        let result = match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                op,
                key: key.to_string(),
                timeout: self.io_timeout,
            }),
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::debug!(target: "audit", op, key, duration_ms, status = "ok"),
            Err(ClientError::NotFound(_)) => {
                tracing::debug!(target: "audit", op, key, duration_ms, status = "not_found")
            }
            Err(err) => {
                self.audit.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "audit", op, key, duration_ms, status = "error", error = %err)
            }
        }
        result
    }
}

/// Keys coming from listings are already valid paths; anything else is
/// encoded part by part.
fn object_path(key: &str) -> ObjectPath {
    ObjectPath::parse(key).unwrap_or_else(|_| ObjectPath::from(key))
}

fn not_found_as(key: &str) -> impl FnOnce(object_store::Error) -> ClientError + '_ {
    move |err| match err {
        object_store::Error::NotFound { .. } => ClientError::NotFound(key.to_string()),
        other => ClientError::Store(other),
    }
}

fn encode_continuation_token(key: &str) -> String {
    general_purpose::STANDARD.encode(key)
}

fn decode_continuation_token(token: &str) -> String {
    general_purpose::STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| token.to_string())
}
