//! main.rs — mesh-monitor
//!
//! Exploratory tool: subscribe to one Meshtastic broker, decode every packet
//! with the same wire crate the ingester uses, and print what the mesh is
//! saying. Handy for checking a region's traffic and channel key before
//! enabling it in the ingester registry.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use mesh_proto::{DecodedEvent, PacketDecoder, TelemetryMetrics};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mesh-monitor", about = "Decode and print Meshtastic MQTT traffic")]
struct Args {
    /// Broker host
    #[arg(long, default_value = "mqtt.meshtastic.org")]
    broker: String,
    /// Broker port
    #[arg(long, default_value = "1883")]
    port: u16,
    /// Username
    #[arg(long, default_value = "meshdev")]
    username: String,
    /// Password
    #[arg(long, default_value = "large4cats")]
    password: String,
    /// Subscription pattern
    #[arg(long, default_value = "msh/+/2/e/#")]
    topic: String,
    /// Base64 channel PSK for encrypted payloads
    #[arg(long, default_value = "AQ==")]
    channel_key: String,
    /// Only print events from this node id (e.g. !000000a1)
    #[arg(long)]
    node: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mesh_monitor=info".into()),
        )
        .init();

    let args = Args::parse();
    let decoder = PacketDecoder::new(&args.channel_key);

    let mut opts = MqttOptions::new("mesh_monitor", &args.broker, args.port);
    opts.set_keep_alive(Duration::from_secs(60));
    if !args.username.is_empty() {
        opts.set_credentials(&args.username, &args.password);
    }
    let (client, mut eventloop) = AsyncClient::new(opts, 64);

    info!("Monitoring {}:{} pattern {}", args.broker, args.port, args.topic);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Connected, subscribing to {}", args.topic);
                client.subscribe(&args.topic, QoS::AtMostOnce).await?;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(event) = decoder.decode(&publish.payload) else {
                    continue;
                };
                if let Some(only) = &args.node {
                    if event.node_id() != only {
                        continue;
                    }
                }
                print_event(&publish.topic, &event);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Connection error: {e}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

fn print_event(topic: &str, event: &DecodedEvent) {
    match event {
        DecodedEvent::Position(ev) => match &ev.coords {
            Some(c) => info!(
                "POSITION  {} lat={:.5} lon={:.5} alt={:?} ({topic})",
                ev.node_id, c.lat, c.lon, c.alt
            ),
            None => info!("POSITION  {} (no fix) ({topic})", ev.node_id),
        },
        DecodedEvent::NodeInfo(ev) => info!(
            "NODEINFO  {} name={:?} hw={:?}",
            ev.node_id, ev.name, ev.hardware
        ),
        DecodedEvent::Telemetry(ev) => match &ev.metrics {
            TelemetryMetrics::Device {
                battery_level,
                voltage,
            } => info!(
                "DEVICE    {} t={} battery={battery_level}% voltage={voltage}V",
                ev.node_id, ev.time
            ),
            TelemetryMetrics::Environment {
                temperature,
                humidity,
                pressure,
            } => info!(
                "ENV       {} t={} temp={temperature}°C hum={humidity}% pres={pressure}hPa",
                ev.node_id, ev.time
            ),
        },
    }
}
