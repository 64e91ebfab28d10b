//! Per-source MQTT fan-in.
//!
//! Every enabled source gets its own rumqttc client and event-loop task:
//! subscribe on ConnAck, decode each publish, and hand the decoded event to
//! the single correlation task over the shared channel. One broker being
//! down never blocks the others — the task logs, backs off, and lets the
//! client reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_proto::{DecodedEvent, PacketDecoder};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;

/// One decoded mesh event tagged with the source it came in on.
pub struct SourceEvent {
    pub source: String,
    pub event: DecodedEvent,
}

/// Counters shared between a source task and the stats reporter.
#[derive(Clone, Default)]
pub struct SourceCounters {
    /// Raw broker messages seen, decodable or not.
    pub messages: Arc<AtomicU64>,
    /// Connection-level errors (isolated per source).
    pub connect_errors: Arc<AtomicU64>,
}

pub struct SourceHandle {
    pub label: String,
    pub client: AsyncClient,
    pub task: tokio::task::JoinHandle<()>,
    pub counters: SourceCounters,
}

impl SourceHandle {
    /// Stop accepting events from this source (shutdown step 1).
    pub async fn shutdown(self) {
        let _ = self.client.disconnect().await;
        self.task.abort();
    }
}

/// Spawn the subscription task for one source.
pub fn spawn_source(
    label: &str,
    config: &SourceConfig,
    decoder: Arc<PacketDecoder>,
    tx: mpsc::Sender<SourceEvent>,
) -> SourceHandle {
    let mut opts = MqttOptions::new(
        format!("meshtastic_{}", label.to_lowercase()),
        &config.broker,
        config.port,
    );
    opts.set_keep_alive(Duration::from_secs(60));
    if !config.username.is_empty() {
        opts.set_credentials(&config.username, &config.password);
    }
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    let counters = SourceCounters::default();
    let task = {
        let label = label.to_string();
        let topic = config.topic.clone();
        let broker = config.broker.clone();
        let subscribe_client = client.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("[{label}] Connected to {broker}, subscribing to {topic}");
                        if let Err(e) = subscribe_client.subscribe(&topic, QoS::AtMostOnce).await {
                            warn!("[{label}] Subscribe failed: {e}");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        counters.messages.fetch_add(1, Ordering::Relaxed);
                        if let Some(event) = decoder.decode(&publish.payload) {
                            if tx
                                .send(SourceEvent {
                                    source: label.clone(),
                                    event,
                                })
                                .await
                                .is_err()
                            {
                                // Correlator gone: shutdown in progress.
                                return;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        counters.connect_errors.fetch_add(1, Ordering::Relaxed);
                        debug!("[{label}] Connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        })
    };

    SourceHandle {
        label: label.to_string(),
        client,
        task,
        counters,
    }
}
