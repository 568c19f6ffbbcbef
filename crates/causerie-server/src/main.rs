//! # causerie-server
//!
//! Causerie node daemon.
//!
//! This binary provides:
//! - **Event routing** over the replicated graph: every chat, group, call,
//!   and inbox namespace is watched and funneled into one handling loop
//! - **Web Push delivery** with per-device fan-out, bounded retry, and
//!   automatic pruning of dead subscriptions
//! - **Call signaling** for a locally hosted alias (WebRTC offer/answer
//!   relay through the graph), when `LOCAL_ALIAS` is set
//! - **REST API** (axum) for health checks and the VAPID public key

mod api;
mod config;
mod router;

use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::{mpsc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

use causerie_notify::{
    spawn_dispatch_worker, DebounceCoalescer, DeviceRegistry, Dispatcher, HttpPushGateway,
    IdempotencyCache, RetryPolicy,
};
use causerie_shared::constants::{
    CHANNEL_CAPACITY, DEDUPE_PURGE_INTERVAL_SECS, DISPATCH_MAX_IN_FLIGHT,
};
use causerie_shared::VapidKeys;
use causerie_signal::{spawn_engine, EngineConfig, RtcMediaFactory};
use causerie_store::{MemoryStore, ReplicatedStore};

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,causerie_server=debug")),
        )
        .init();

    info!("Starting Causerie node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Key material (fatal when unusable: rotating it silently would
    //    strand every existing push subscription)
    // -----------------------------------------------------------------------
    let keys = Arc::new(
        VapidKeys::load_or_generate(&config.vapid_key_path).with_context(|| {
            format!(
                "VAPID key material at {} is unusable",
                config.vapid_key_path.display()
            )
        })?,
    );
    info!(key = %keys.public_key_b64(), "VAPID key pair ready");

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let store: Arc<dyn ReplicatedStore> = Arc::new(MemoryStore::new());
    let cache = Arc::new(Mutex::new(IdempotencyCache::with_defaults()));
    let registry = DeviceRegistry::new(Arc::clone(&store));
    let gateway = Arc::new(HttpPushGateway::new(
        Arc::clone(&keys),
        config.vapid_subject.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(registry, gateway, RetryPolicy::default()));

    // Delivery pipeline: router -> bounded queue -> dispatch worker
    let (delivery_tx, delivery_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let _dispatch = spawn_dispatch_worker(
        delivery_rx,
        dispatcher,
        Arc::clone(&store),
        DISPATCH_MAX_IN_FLIGHT,
    );
    let coalescer = DebounceCoalescer::new(delivery_tx.clone(), config.debounce_window());

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic dedupe cache sweep (every minute, drop expired ids)
    {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(
                DEDUPE_PURGE_INTERVAL_SECS,
            ));
            loop {
                interval.tick().await;
                let dropped = cache.lock().await.purge_stale();
                if dropped > 0 {
                    tracing::debug!(dropped, "Purged stale dedupe entries");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // 6. Call engine, when this node hosts an alias
    // -----------------------------------------------------------------------
    let engine = match &config.local_alias {
        Some(alias) => {
            let media = Arc::new(RtcMediaFactory);
            let (commands, mut events) = spawn_engine(
                alias.clone(),
                Arc::clone(&store),
                media,
                EngineConfig::default(),
            );
            // Surface the call lifecycle in the logs; an operator frontend
            // would consume this stream instead.
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    info!(?event, "Call engine event");
                }
            });
            info!(alias = %alias, "Call engine started");
            Some(commands)
        }
        None => {
            info!("No LOCAL_ALIAS configured, running as a pure notification relay");
            None
        }
    };

    // -----------------------------------------------------------------------
    // 7. Event router over the replicated graph
    // -----------------------------------------------------------------------
    let _router = router::spawn_router(
        Arc::clone(&store),
        cache,
        coalescer,
        delivery_tx,
        config.local_alias.clone(),
        engine,
    )
    .await;

    // -----------------------------------------------------------------------
    // 8. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let app_state = AppState {
        vapid_public_key: keys.public_key_b64(),
    };
    tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
