//! Downstream publisher: one fire-and-forget MQTT publish per committed
//! reading, on a deterministic topic consumers can subscribe to by country
//! or subdivision.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PublisherSettings;

/// JSON payload published for every committed reading. Optional fields
/// serialize as `null` — consumers rely on a fixed field set.
#[derive(Debug, Clone, Serialize)]
pub struct ReadingPayload {
    pub timestamp: u32,
    pub device_id: String,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub country: String,
    pub subdivision: String,
    pub data_source: String,
    pub reading_type: String,
    pub value: f64,
    pub unit: String,
    pub board_model: Option<String>,
}

/// `wesense/decoded/<source-label>/<country>/<subdivision>/<node-id>`
pub fn reading_topic(
    mqtt_source: &str,
    country_code: &str,
    subdivision_code: &str,
    node_id: &str,
) -> String {
    format!("wesense/decoded/{mqtt_source}/{country_code}/{subdivision_code}/{node_id}")
}

/// Publisher seam; tests capture publishes in memory.
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &ReadingPayload);
}

pub struct MqttPublisher {
    client: AsyncClient,
}

impl MqttPublisher {
    /// Connect and spawn the event-loop driver task. Publishing is best
    /// effort from the first moment; rumqttc queues while reconnecting.
    pub fn connect(
        settings: &PublisherSettings,
        client_id: &str,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let mut opts = MqttOptions::new(client_id, &settings.broker, settings.port);
        opts.set_keep_alive(Duration::from_secs(60));
        if !settings.username.is_empty() {
            opts.set_credentials(&settings.username, &settings.password);
        }
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let broker = settings.broker.clone();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Publisher connected to {broker}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Publisher connection error: {e}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        (Self { client }, task)
    }

    pub async fn disconnect(&self) {
        let _ = self.client.disconnect().await;
    }
}

#[async_trait]
impl ReadingPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &ReadingPayload) {
        let body = match serde_json::to_string(payload) {
            Ok(b) => b,
            Err(e) => {
                warn!("Failed to serialize reading payload: {e}");
                return;
            }
        };
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, body)
            .await
        {
            debug!("Downstream publish to {topic} dropped: {e}");
        }
    }
}
