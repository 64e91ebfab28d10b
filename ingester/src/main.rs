//! WeSense Meshtastic ingester entry point.
//!
//! Wires the pipeline together and owns the process lifecycle:
//!   1. Per-source MQTT tasks decode packets and enqueue events
//!   2. One correlation task joins positions with telemetry and emits rows
//!   3. The batched writer flushes to ClickHouse on size and on a timer
//!   4. SIGINT/SIGTERM runs the ordered shutdown: stop sources → drain the
//!      queue → flush the writer → persist caches → disconnect

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use mesh_proto::PacketDecoder;
use wesense_ingester::clock::system_clock;
use wesense_ingester::config::{
    community_source, load_sources, ClickHouseSettings, Mode, PublisherSettings, Settings,
    SourceConfig, LOCAL_SOURCE,
};
use wesense_ingester::correlator::{Correlator, SourceShard};
use wesense_ingester::geocode::OfflineGeocoder;
use wesense_ingester::pending::PendingBuffer;
use wesense_ingester::publisher::MqttPublisher;
use wesense_ingester::sources::spawn_source;
use wesense_ingester::store::NodeStore;
use wesense_ingester::writer::{BatchWriter, ClickHouseSink};

// ─── Global startup time (for uptime reporting) ──────────────────────────────
static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

// ─── Health Endpoint ──────────────────────────────────────────────────────────
// GET /health → { status, version, mode, uptimeSecs }

async fn health_check() -> axum::Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    let mode = std::env::var("MESHTASTIC_MODE").unwrap_or_else(|_| "community".into());
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": mode,
        "uptimeSecs": uptime_secs,
    }))
}

async fn serve_health(port: u16) {
    let app = Router::new().route("/health", get(health_check));
    let addr = format!("0.0.0.0:{port}");
    match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => {
            info!("Health endpoint on {addr}");
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Health endpoint stopped: {e}");
            }
        }
        Err(e) => {
            // Another instance on the port must not block ingestion
            warn!("Could not bind health endpoint {addr}: {e}");
        }
    }
}

// ─── Logging ──────────────────────────────────────────────────────────────────

/// Console logging plus a dedicated daily-rotating file for rejected future
/// timestamps (`target: "future_timestamps"`). The guard must stay alive for
/// the life of the process.
fn init_logging() -> tracing_appender::non_blocking::WorkerGuard {
    let ft_appender = tracing_appender::rolling::daily("logs", "future_timestamps.log");
    let (ft_writer, ft_guard) = tracing_appender::non_blocking(ft_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(filter_fn(|meta| meta.target() != "future_timestamps"))
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "wesense_ingester=info".into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(ft_writer)
                .with_ansi(false)
                .with_filter(filter_fn(|meta| meta.target() == "future_timestamps")),
        )
        .init();

    ft_guard
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
                    _ = sigterm.recv() => info!("SIGTERM received"),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                info!("SIGINT received");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("SIGINT received");
    }
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    STARTUP_MS.store(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64,
        Ordering::Relaxed,
    );
    let _ft_guard = init_logging();

    let settings = Settings::from_env();
    info!(
        "WeSense Meshtastic ingester v{} starting (data_source: {}, node: {})",
        env!("CARGO_PKG_VERSION"),
        settings.mode.data_source(),
        settings.ingestion_node_id,
    );

    // Source registry: community mode is a single env-configured LOCAL
    // source; downlink modes fan in from the region config file. A missing
    // or unparseable registry is the one fatal startup error.
    let sources: BTreeMap<String, SourceConfig> = match settings.mode {
        Mode::Community => BTreeMap::from([(LOCAL_SOURCE.to_string(), community_source())]),
        Mode::Downlink | Mode::DownlinkLegacy => {
            load_sources(&settings.sources_config_path).context("loading source registry")?
        }
    };

    let clock = system_clock();
    let decoder = Arc::new(PacketDecoder::new(&settings.channel_psk));
    let key_preview: String = settings.channel_psk.chars().take(8).collect();
    info!("Decryption enabled (key: {key_preview}...)");

    // Analytical write path
    let ch = ClickHouseSettings::from_env();
    let writer = BatchWriter::new(Arc::new(ClickHouseSink::new(&ch)), ch.batch_size);
    let flush_task = writer
        .clone()
        .spawn_flush_task(Duration::from_secs(ch.flush_interval_secs.max(1)));
    info!(
        "Analytical store: {} db={} table={} (batch {}, flush every {}s)",
        ch.url(),
        ch.database,
        ch.table,
        ch.batch_size,
        ch.flush_interval_secs
    );

    // Downstream publisher
    let mode_tag = match settings.mode {
        Mode::Community => "community",
        Mode::Downlink | Mode::DownlinkLegacy => "downlink",
    };
    let (publisher, publisher_task) = MqttPublisher::connect(
        &PublisherSettings::from_env(),
        &format!("meshtastic_{mode_tag}_publisher"),
    );
    let publisher = Arc::new(publisher);

    // Per-source clients + correlation shards
    let (tx, rx) = mpsc::channel(1024);
    let mut shards = BTreeMap::new();
    let mut source_handles = Vec::new();
    for (label, cfg) in &sources {
        if !cfg.enabled {
            info!("[{label}] disabled, skipping");
            continue;
        }
        let now = clock.now();
        let nodes = NodeStore::load(&cfg.cache_file, now).await;
        let pending = PendingBuffer::load(cfg.pending_cache_file(), now).await;
        let handle = spawn_source(label, cfg, decoder.clone(), tx.clone());
        shards.insert(
            label.clone(),
            SourceShard::new(cfg.clone(), nodes, pending, handle.counters.clone()),
        );
        source_handles.push(handle);
    }
    drop(tx);
    if source_handles.is_empty() {
        warn!("No enabled sources in the registry — nothing to ingest");
    }

    let correlator = Correlator::new(
        settings.mode,
        settings.ingestion_node_id.clone(),
        shards,
        writer.clone(),
        publisher.clone(),
        Arc::new(OfflineGeocoder::new()),
        clock,
    );
    let stats_every = Duration::from_secs(settings.stats_interval_secs.max(1));
    let correlator_task = tokio::spawn(correlator.run(rx, stats_every));

    tokio::spawn(serve_health(settings.health_port));

    info!("All decoders running");
    shutdown_signal().await;
    info!("Shutting down gracefully...");

    // 1. Stop accepting new events
    for handle in source_handles {
        info!("[{}] disconnecting", handle.label);
        handle.shutdown().await;
    }
    // 2. Drain the inbound queue to quiescence
    let correlator = correlator_task.await.context("correlation task failed")?;
    // 3+4. Flush the writer, then stop the flush timer
    writer.drain().await;
    flush_task.abort();
    // 5. Persist correlation state for every enabled source
    correlator.save_all().await;
    // 6. Disconnect the downstream publisher
    publisher.disconnect().await;
    publisher_task.abort();

    info!("Shutdown complete");
    Ok(())
}
