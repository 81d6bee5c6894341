//! The roomcast server binary.
use std::sync::Arc;

use anyhow::Context;
use roomcast_lib::{
    handlers, AppState, Hub, LogNotifier, MemoryStore, Notifier, RoomRateLimiters, Settings,
    Store, UploadStore,
};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    info!("starting roomcast server...");

    let cfg = match Settings::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!(%err, "no usable config file, falling back to defaults");
            Settings::default()
        }
    };
    cfg.validate().context("invalid configuration")?;
    let cfg = Arc::new(cfg);
    debug!(?cfg, "configuration loaded");

    let store: Arc<dyn Store> = match cfg.server.storage.as_str() {
        "memory" => MemoryStore::new(),
        other => anyhow::bail!("server.storage must be \"memory\", got {other:?}"),
    };
    info!("storage initialized: {}", cfg.server.storage);

    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let hub = Hub::new(cfg.clone(), store, Some(notifier));

    for rc in &cfg.rooms {
        hub.add_predefined_room(rc)
            .await
            .map_err(|err| anyhow::anyhow!("error creating predefined room {}: {err}", rc.id))?;
    }
    if !cfg.rooms.is_empty() {
        info!("{} predefined room(s) ready", cfg.rooms.len());
    }

    let uploads = UploadStore::new(cfg.upload.clone());
    let upload_limiters = RoomRateLimiters::new(&cfg.upload);
    let state = AppState::new(hub, uploads, upload_limiters)?;

    let app = handlers::router(state);
    let listener = TcpListener::bind(&cfg.server.address)
        .await
        .with_context(|| format!("couldn't bind {}", cfg.server.address))?;
    info!("listening on http://{}", cfg.server.address);

    axum::serve(listener, app).await?;
    Ok(())
}
