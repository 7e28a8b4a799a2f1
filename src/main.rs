use anyhow::{Context, Result};
use axum::Router;
use photo_sync::{
    config::AppConfig,
    db,
    handlers::AppState,
    routes::routes::routes,
    services::{
        object_client::{ObjectClient, StoreConfig},
        scheduler::SyncScheduler,
        thumbnail_service::ThumbnailService,
    },
};
use std::io::ErrorKind;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        "Starting photo-sync on {} (store: {}, thumbnails: {:?})",
        cfg.addr(),
        describe_store(&cfg.store),
        cfg.thumbnails.location
    );

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url)
        .await
        .with_context(|| format!("opening database {}", cfg.database_url))?;

    // --- Handle migration mode ---
    db::run_migrations(&db).await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let client = ObjectClient::new(&cfg.store, cfg.sync.io_timeout)?
        .with_page_size(cfg.sync.list_page_size);
    let thumbnails = ThumbnailService::new(db.clone(), client.clone(), cfg.thumbnails.clone());
    thumbnails
        .artifacts()
        .ensure_ready()
        .await
        .context("preparing thumbnail storage")?;

    let scheduler = SyncScheduler::new(
        db.clone(),
        client.clone(),
        thumbnails.clone(),
        cfg.sync.clone(),
    );
    scheduler.recover().await?;
    if cfg.sync.autostart {
        scheduler.start().await?;
    }

    let bucket = match &cfg.store {
        StoreConfig::S3 { bucket, .. } => Some(bucket.clone()),
        _ => None,
    };
    let state = AppState {
        db,
        client,
        scheduler: scheduler.clone(),
        thumbnails,
        bucket,
    };

    // --- Build router ---
    let app: Router = routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop();
    Ok(())
}

fn describe_store(store: &StoreConfig) -> String {
    match store {
        StoreConfig::Memory => "memory".into(),
        StoreConfig::Local { path } => format!("local {}", path.display()),
        StoreConfig::S3 {
            endpoint, bucket, ..
        } => format!("s3 {}/{}", endpoint, bucket),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("could not listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
