use crate::services::{
    artifact_store::ArtifactLocation, object_client::StoreConfig,
    scheduler::SyncConfig, thumbnail_service::ThumbnailConfig,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub store: StoreConfig,
    pub thumbnails: ThumbnailConfig,
    pub sync: SyncConfig,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Bucket mirror and thumbnail service for photo galleries")]
pub struct Args {
    /// Host to bind to (overrides PHOTO_SYNC_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PHOTO_SYNC_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides PHOTO_SYNC_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// S3 endpoint, e.g. http://localhost:9000 (overrides PHOTO_SYNC_S3_ENDPOINT)
    #[arg(long)]
    pub s3_endpoint: Option<String>,

    /// Bucket to mirror (overrides PHOTO_SYNC_S3_BUCKET)
    #[arg(long)]
    pub s3_bucket: Option<String>,

    /// Access key id (overrides PHOTO_SYNC_S3_ACCESS_KEY)
    #[arg(long)]
    pub s3_access_key: Option<String>,

    /// Secret access key (overrides PHOTO_SYNC_S3_SECRET_KEY)
    #[arg(long)]
    pub s3_secret_key: Option<String>,

    /// Region (overrides PHOTO_SYNC_S3_REGION)
    #[arg(long)]
    pub s3_region: Option<String>,

    /// Mirror a local directory instead of S3 (overrides PHOTO_SYNC_LOCAL_BUCKET_DIR)
    #[arg(long)]
    pub local_bucket_dir: Option<String>,

    /// Directory for thumbnail artifacts (overrides PHOTO_SYNC_THUMBNAIL_DIR)
    #[arg(long)]
    pub thumbnail_dir: Option<String>,

    /// Store thumbnails in the bucket under this prefix instead of on disk
    /// (overrides PHOTO_SYNC_THUMBNAIL_PREFIX)
    #[arg(long)]
    pub thumbnail_prefix: Option<String>,

    /// Longest thumbnail edge in pixels (overrides PHOTO_SYNC_THUMBNAIL_MAX_DIMENSION)
    #[arg(long)]
    pub thumbnail_max_dimension: Option<u32>,

    /// Originals above this size are never thumbnailed (overrides PHOTO_SYNC_THUMBNAIL_SIZE_THRESHOLD)
    #[arg(long)]
    pub thumbnail_size_threshold: Option<i64>,

    /// Thumbnails older than this many days are swept (overrides PHOTO_SYNC_THUMBNAIL_RETENTION_DAYS)
    #[arg(long)]
    pub thumbnail_retention_days: Option<u64>,

    /// Originals above this size skip metadata extraction (overrides PHOTO_SYNC_METADATA_SIZE_THRESHOLD)
    #[arg(long)]
    pub metadata_size_threshold: Option<i64>,

    /// Seconds between automatic full scans, 0 disables (overrides PHOTO_SYNC_INTERVAL_SECS)
    #[arg(long)]
    pub sync_interval_secs: Option<u64>,

    /// Timeout for each object-store call (overrides PHOTO_SYNC_IO_TIMEOUT_SECS)
    #[arg(long)]
    pub io_timeout_secs: Option<u64>,

    /// Parallel thumbnail generations in backlog passes (overrides PHOTO_SYNC_BACKLOG_CONCURRENCY)
    #[arg(long)]
    pub backlog_concurrency: Option<usize>,

    /// Do not generate thumbnails after scans (overrides PHOTO_SYNC_BACKLOG_THUMBNAILS=false)
    #[arg(long)]
    pub no_backlog_thumbnails: bool,

    /// Start with the job queue disabled (overrides PHOTO_SYNC_AUTOSTART=false)
    #[arg(long)]
    pub no_autostart: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge already-parsed args with the environment.
    pub fn from_args(args: Args) -> Result<Self> {
        let store = match (
            args.local_bucket_dir.or_else(|| env_opt("PHOTO_SYNC_LOCAL_BUCKET_DIR")),
            args.s3_bucket.or_else(|| env_opt("PHOTO_SYNC_S3_BUCKET")),
        ) {
            (Some(path), _) => StoreConfig::Local {
                path: PathBuf::from(path),
            },
            (None, Some(bucket)) => StoreConfig::S3 {
                endpoint: args
                    .s3_endpoint
                    .or_else(|| env_opt("PHOTO_SYNC_S3_ENDPOINT"))
                    .context("PHOTO_SYNC_S3_ENDPOINT is required with an S3 bucket")?,
                bucket,
                access_key: args
                    .s3_access_key
                    .or_else(|| env_opt("PHOTO_SYNC_S3_ACCESS_KEY"))
                    .unwrap_or_default(),
                secret_key: args
                    .s3_secret_key
                    .or_else(|| env_opt("PHOTO_SYNC_S3_SECRET_KEY"))
                    .unwrap_or_default(),
                region: args.s3_region.or_else(|| env_opt("PHOTO_SYNC_S3_REGION")),
            },
            (None, None) => bail!(
                "no bucket configured: set PHOTO_SYNC_S3_BUCKET or PHOTO_SYNC_LOCAL_BUCKET_DIR"
            ),
        };

        let thumbnail_location = match args
            .thumbnail_prefix
            .or_else(|| env_opt("PHOTO_SYNC_THUMBNAIL_PREFIX"))
        {
            Some(prefix) => ArtifactLocation::Bucket { prefix },
            None => ArtifactLocation::Local {
                dir: PathBuf::from(
                    args.thumbnail_dir
                        .or_else(|| env_opt("PHOTO_SYNC_THUMBNAIL_DIR"))
                        .unwrap_or_else(|| "./data/thumbnails".into()),
                ),
            },
        };

        let thumbnail_defaults = ThumbnailConfig::default();
        let thumbnails = ThumbnailConfig {
            location: thumbnail_location,
            max_dimension: merge(
                args.thumbnail_max_dimension,
                "PHOTO_SYNC_THUMBNAIL_MAX_DIMENSION",
                thumbnail_defaults.max_dimension,
            )?,
            jpeg_quality: thumbnail_defaults.jpeg_quality,
            size_threshold: merge(
                args.thumbnail_size_threshold,
                "PHOTO_SYNC_THUMBNAIL_SIZE_THRESHOLD",
                thumbnail_defaults.size_threshold,
            )?,
            retention: match merge::<u64>(
                args.thumbnail_retention_days,
                "PHOTO_SYNC_THUMBNAIL_RETENTION_DAYS",
                0,
            )? {
                0 => thumbnail_defaults.retention,
                days => Duration::from_secs(days * 24 * 60 * 60),
            },
        };

        let sync_defaults = SyncConfig::default();
        let sync = SyncConfig {
            metadata_size_threshold: merge(
                args.metadata_size_threshold,
                "PHOTO_SYNC_METADATA_SIZE_THRESHOLD",
                sync_defaults.metadata_size_threshold,
            )?,
            interval: Duration::from_secs(merge(
                args.sync_interval_secs,
                "PHOTO_SYNC_INTERVAL_SECS",
                0,
            )?),
            io_timeout: Duration::from_secs(merge(
                args.io_timeout_secs,
                "PHOTO_SYNC_IO_TIMEOUT_SECS",
                sync_defaults.io_timeout.as_secs(),
            )?),
            backlog_concurrency: merge(
                args.backlog_concurrency,
                "PHOTO_SYNC_BACKLOG_CONCURRENCY",
                sync_defaults.backlog_concurrency,
            )?
            .max(1),
            backlog_thumbnails: !args.no_backlog_thumbnails
                && merge(None, "PHOTO_SYNC_BACKLOG_THUMBNAILS", true)?,
            autostart: !args.no_autostart && merge(None, "PHOTO_SYNC_AUTOSTART", true)?,
            list_page_size: sync_defaults.list_page_size,
        };

        Ok(Self {
            host: args
                .host
                .or_else(|| env_opt("PHOTO_SYNC_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: merge(args.port, "PHOTO_SYNC_PORT", 3000)?,
            database_url: args
                .database_url
                .or_else(|| env_opt("PHOTO_SYNC_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/photo_sync.db".into()),
            store,
            thumbnails,
            sync,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

/// CLI value, else parsed environment variable, else `default`.
fn merge<T>(cli: Option<T>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_bucket_args_build_a_complete_config() {
        let args = Args {
            local_bucket_dir: Some("/srv/photos".into()),
            thumbnail_dir: Some("/srv/thumbs".into()),
            thumbnail_size_threshold: Some(1024),
            port: Some(8080),
            ..Default::default()
        };
        let cfg = AppConfig::from_args(args).unwrap();

        assert!(matches!(cfg.store, StoreConfig::Local { ref path } if path == &PathBuf::from("/srv/photos")));
        assert!(matches!(
            cfg.thumbnails.location,
            ArtifactLocation::Local { ref dir } if dir == &PathBuf::from("/srv/thumbs")
        ));
        assert_eq!(cfg.thumbnails.size_threshold, 1024);
        assert_eq!(cfg.port, 8080);
        assert!(cfg.sync.backlog_concurrency >= 1);
    }

    #[test]
    fn thumbnail_prefix_selects_bucket_storage() {
        let args = Args {
            local_bucket_dir: Some("/srv/photos".into()),
            thumbnail_prefix: Some(".thumbnails/".into()),
            ..Default::default()
        };
        let cfg = AppConfig::from_args(args).unwrap();
        assert!(matches!(
            cfg.thumbnails.location,
            ArtifactLocation::Bucket { ref prefix } if prefix == ".thumbnails/"
        ));
    }
}
