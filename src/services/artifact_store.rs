//! src/services/artifact_store.rs
//!
//! ArtifactStore: durable storage for derived thumbnail bytes, keyed by an
//! opaque `thumbnail_path`. Artifacts live either on local disk, sharded
//! beneath `dir/{aa}/{bb}/{name}`, or in the bucket under a dedicated prefix.
//! Only the thumbnail materializer writes or deletes through this type.

use crate::services::object_client::{ClientError, ObjectClient};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Where artifacts are kept.
#[derive(Debug, Clone)]
pub enum ArtifactLocation {
    /// Local directory root
    Local { dir: PathBuf },
    /// Bucket prefix, e.g. `.thumbnails/`
    Bucket { prefix: String },
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("invalid artifact path `{0}`")]
    InvalidPath(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("artifact `{0}` read back different bytes")]
    Mismatch(String),
}

pub type ArtifactResult<T> = Result<T, ArtifactError>;

/// One stored artifact as seen by sweeps and stats.
#[derive(Debug, Clone)]
pub struct ArtifactEntry {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ArtifactStore {
    backend: Backend,
}

#[derive(Clone)]
enum Backend {
    Local { base_path: PathBuf },
    Bucket { client: ObjectClient, prefix: String },
}

impl ArtifactStore {
    pub fn new(location: &ArtifactLocation, client: ObjectClient) -> Self {
        let backend = match location {
            ArtifactLocation::Local { dir } => Backend::Local {
                base_path: dir.clone(),
            },
            ArtifactLocation::Bucket { prefix } => {
                let mut prefix = prefix.trim_start_matches('/').to_string();
                if !prefix.is_empty() && !prefix.ends_with('/') {
                    prefix.push('/');
                }
                Backend::Bucket { client, prefix }
            }
        };
        Self { backend }
    }

    /// Bucket prefix holding artifacts, if they share the mirrored bucket.
    pub fn bucket_prefix(&self) -> Option<&str> {
        match &self.backend {
            Backend::Bucket { prefix, .. } if !prefix.is_empty() => Some(prefix),
            _ => None,
        }
    }

    /// Artifact identity for a source key: `{aa}/{bb}/{name}`.
    ///
    /// Uses MD5(source_key) and takes the first two bytes as lowercase hex
    /// (00–ff) to keep directory fan-out bounded.
    pub fn artifact_path(source_key: &str, name: &str) -> String {
        let digest = md5::compute(source_key);
        format!("{:02x}/{:02x}/{}", digest[0], digest[1], name)
    }

    /// Create the local root directory. No-op for bucket storage.
    pub async fn ensure_ready(&self) -> ArtifactResult<()> {
        if let Backend::Local { base_path } = &self.backend {
            fs::create_dir_all(base_path).await?;
        }
        Ok(())
    }

    /// Read an artifact. `Ok(None)` if it does not exist.
    pub async fn read(&self, path: &str) -> ArtifactResult<Option<Bytes>> {
        ensure_path_safe(path)?;
        match &self.backend {
            Backend::Local { base_path } => match fs::read(base_path.join(path)).await {
                Ok(bytes) => Ok(Some(Bytes::from(bytes))),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            },
            Backend::Bucket { client, prefix } => {
                match client.get_object(&format!("{}{}", prefix, path)).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(ClientError::NotFound(_)) => Ok(None),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Write an artifact, replacing any previous version.
    ///
    /// Local writes go to a temporary file which is synced and then renamed
    /// into place, so readers never observe a partial artifact.
    pub async fn write(&self, path: &str, bytes: Bytes, content_type: &str) -> ArtifactResult<()> {
        ensure_path_safe(path)?;
        match &self.backend {
            Backend::Local { base_path } => {
                let file_path = base_path.join(path);
                let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
                    ArtifactError::InvalidPath(path.to_string())
                })?;
                fs::create_dir_all(&parent).await?;
                let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

                if let Err(err) = write_synced(&tmp_path, &bytes).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err.into());
                }
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err.into());
                }
                Ok(())
            }
            Backend::Bucket { client, prefix } => {
                client
                    .put_object(&format!("{}{}", prefix, path), bytes, content_type)
                    .await?;
                Ok(())
            }
        }
    }

    /// Delete an artifact. Idempotent: a missing artifact is not an error.
    pub async fn delete(&self, path: &str) -> ArtifactResult<()> {
        ensure_path_safe(path)?;
        match &self.backend {
            Backend::Local { base_path } => {
                let file_path = base_path.join(path);
                match fs::remove_file(&file_path).await {
                    Ok(_) => debug!("removed artifact {}", file_path.display()),
                    Err(err) if err.kind() == ErrorKind::NotFound => {
                        debug!("artifact {} already missing", file_path.display());
                    }
                    Err(err) => return Err(err.into()),
                }
                if let Some(parent) = file_path.parent() {
                    prune_empty_dirs(parent, base_path).await;
                }
                Ok(())
            }
            Backend::Bucket { client, prefix } => {
                client.delete_object(&format!("{}{}", prefix, path)).await?;
                Ok(())
            }
        }
    }

    /// Every stored artifact with its size and modification time.
    pub async fn list(&self) -> ArtifactResult<Vec<ArtifactEntry>> {
        match &self.backend {
            Backend::Local { base_path } => {
                let mut entries = Vec::new();
                let mut stack = vec![base_path.clone()];
                while let Some(dir) = stack.pop() {
                    let mut read_dir = match fs::read_dir(&dir).await {
                        Ok(read_dir) => read_dir,
                        Err(err) if err.kind() == ErrorKind::NotFound => continue,
                        Err(err) => return Err(err.into()),
                    };
                    while let Some(entry) = read_dir.next_entry().await? {
                        let file_type = entry.file_type().await?;
                        if file_type.is_dir() {
                            stack.push(entry.path());
                            continue;
                        }
                        let name = entry.file_name();
                        if name.to_string_lossy().starts_with(".tmp-") {
                            continue;
                        }
                        let meta = entry.metadata().await?;
                        let modified = meta
                            .modified()
                            .map(DateTime::<Utc>::from)
                            .unwrap_or_else(|_| Utc::now());
                        let relative = entry
                            .path()
                            .strip_prefix(base_path)
                            .map(|p| p.to_string_lossy().replace('\\', "/"))
                            .unwrap_or_default();
                        entries.push(ArtifactEntry {
                            path: relative,
                            size: meta.len(),
                            modified,
                        });
                    }
                }
                Ok(entries)
            }
            Backend::Bucket { client, prefix } => {
                let mut entries = Vec::new();
                let mut token: Option<String> = None;
                loop {
                    let page = client
                        .list_objects(prefix.trim_end_matches('/'), token.as_deref())
                        .await?;
                    for object in page.objects {
                        let Some(relative) = object.key.strip_prefix(prefix.as_str()) else {
                            continue;
                        };
                        entries.push(ArtifactEntry {
                            path: relative.to_string(),
                            size: object.size.max(0) as u64,
                            modified: object.last_modified,
                        });
                    }
                    if !page.is_truncated {
                        break;
                    }
                    token = page.next_token;
                }
                Ok(entries)
            }
        }
    }

    /// Write, read back and delete a probe artifact.
    pub async fn probe(&self) -> ArtifactResult<()> {
        let path = format!("readyz/{}", Uuid::new_v4());
        let payload = Bytes::from_static(b"readyz");
        self.write(&path, payload.clone(), "text/plain").await?;
        let read = self.read(&path).await;
        if let Err(err) = self.delete(&path).await {
            warn!("failed to remove readiness artifact {}: {}", path, err);
        }
        match read? {
            Some(bytes) if bytes == payload => Ok(()),
            _ => Err(ArtifactError::Mismatch(path)),
        }
    }
}

/// Reject paths that could escape the artifact root.
fn ensure_path_safe(path: &str) -> ArtifactResult<()> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains("..")
        || path.bytes().any(|b| b.is_ascii_control() || b == b'\\')
    {
        return Err(ArtifactError::InvalidPath(path.to_string()));
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await
}

/// Recursively remove empty directories up to the artifact root.
///
/// Stops when:
/// - directory not empty
/// - directory not found
/// - reached root
/// - encountered unexpected I/O errors
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}
