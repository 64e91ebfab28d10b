//! Envelope walk: raw broker bytes → [`DecodedEvent`].

use prost::Message;

use crate::crypto::ChannelKey;
use crate::hardware::hardware_model_name;
use crate::wire::{
    mesh_packet, telemetry, Data, MeshPacket, PortNum, Position, ServiceEnvelope, Telemetry, User,
};

/// A valid position fix. Either coordinate at exactly zero means "no fix"
/// and never produces one of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
    pub alt: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionEvent {
    pub node_id: String,
    /// `None` when the broadcast carried no usable fix.
    pub coords: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeInfoEvent {
    pub node_id: String,
    pub name: Option<String>,
    pub hardware: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMetrics {
    Device {
        battery_level: u32,
        voltage: f32,
    },
    Environment {
        /// °C; zero = not reported
        temperature: f32,
        /// %; zero = not reported
        humidity: f32,
        /// hPa; zero = not reported
        pressure: f32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryEvent {
    pub node_id: String,
    /// Sensor clock, epoch seconds. Always nonzero — packets without it are
    /// dropped in the decoder.
    pub time: u32,
    pub metrics: TelemetryMetrics,
}

/// One decoded mesh event, tagged by application port.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedEvent {
    Position(PositionEvent),
    NodeInfo(NodeInfoEvent),
    Telemetry(TelemetryEvent),
}

impl DecodedEvent {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Position(e) => &e.node_id,
            Self::NodeInfo(e) => &e.node_id,
            Self::Telemetry(e) => &e.node_id,
        }
    }
}

/// Canonical node id: bang-prefixed lowercase hex of the 32-bit node number.
pub fn format_node_id(from: u32) -> String {
    format!("!{from:08x}")
}

/// Stateless-per-packet decoder holding the derived channel key.
pub struct PacketDecoder {
    key: ChannelKey,
}

impl PacketDecoder {
    pub fn new(channel_psk_b64: &str) -> Self {
        Self {
            key: ChannelKey::from_psk(channel_psk_b64),
        }
    }

    /// Decode one raw broker payload. `None` covers every kind of drop:
    /// malformed envelope, missing packet, undecryptable payload,
    /// unrecognized port, telemetry without a sensor timestamp.
    pub fn decode(&self, raw: &[u8]) -> Option<DecodedEvent> {
        let envelope = ServiceEnvelope::decode(raw).ok()?;
        let packet = envelope.packet?;
        let node_id = format_node_id(packet.from);

        let data = self.payload_data(&packet)?;
        match PortNum::try_from(data.portnum) {
            Ok(PortNum::PositionApp) => decode_position(node_id, &data.payload),
            Ok(PortNum::NodeinfoApp) => decode_node_info(node_id, &data.payload),
            Ok(PortNum::TelemetryApp) => decode_telemetry(node_id, &data.payload),
            _ => None,
        }
    }

    fn payload_data(&self, packet: &MeshPacket) -> Option<Data> {
        match packet.payload_variant.as_ref()? {
            mesh_packet::PayloadVariant::Decoded(data) => Some(data.clone()),
            mesh_packet::PayloadVariant::Encrypted(blob) => {
                let plain = self.key.decrypt(packet.id, packet.from, blob);
                // Wrong key or corrupted payload shows up here as a parse
                // failure; drop without raising.
                Data::decode(plain.as_slice()).ok()
            }
        }
    }
}

fn decode_position(node_id: String, payload: &[u8]) -> Option<DecodedEvent> {
    let position = Position::decode(payload).ok()?;
    let coords = if position.latitude_i == 0 || position.longitude_i == 0 {
        None
    } else {
        Some(Coordinates {
            lat: position.latitude_i as f64 / 1e7,
            lon: position.longitude_i as f64 / 1e7,
            alt: (position.altitude != 0).then(|| position.altitude as f64),
        })
    };
    Some(DecodedEvent::Position(PositionEvent { node_id, coords }))
}

fn decode_node_info(node_id: String, payload: &[u8]) -> Option<DecodedEvent> {
    let user = User::decode(payload).ok()?;
    Some(DecodedEvent::NodeInfo(NodeInfoEvent {
        node_id,
        name: (!user.long_name.is_empty()).then(|| user.long_name),
        hardware: hardware_model_name(user.hw_model),
    }))
}

fn decode_telemetry(node_id: String, payload: &[u8]) -> Option<DecodedEvent> {
    let t = Telemetry::decode(payload).ok()?;
    if t.time == 0 {
        return None;
    }
    let metrics = match t.variant? {
        telemetry::Variant::DeviceMetrics(dm) => TelemetryMetrics::Device {
            battery_level: dm.battery_level,
            voltage: dm.voltage,
        },
        telemetry::Variant::EnvironmentMetrics(em) => TelemetryMetrics::Environment {
            temperature: em.temperature,
            humidity: em.relative_humidity,
            pressure: em.barometric_pressure,
        },
    };
    Some(DecodedEvent::Telemetry(TelemetryEvent {
        node_id,
        time: t.time,
        metrics,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{DeviceMetrics, EnvironmentMetrics};
    use base64::Engine;

    fn envelope(from: u32, id: u32, variant: mesh_packet::PayloadVariant) -> Vec<u8> {
        ServiceEnvelope {
            packet: Some(MeshPacket {
                from,
                to: 0xffff_ffff,
                channel: 0,
                payload_variant: Some(variant),
                id,
                rx_time: 0,
                rx_snr: 0.0,
                hop_limit: 3,
            }),
            channel_id: "LongFast".into(),
            gateway_id: "!deadbeef".into(),
        }
        .encode_to_vec()
    }

    fn plaintext(portnum: PortNum, payload: Vec<u8>) -> mesh_packet::PayloadVariant {
        mesh_packet::PayloadVariant::Decoded(Data {
            portnum: portnum as i32,
            payload,
        })
    }

    #[test]
    fn decodes_position() {
        let raw = envelope(
            0xa1,
            7,
            plaintext(
                PortNum::PositionApp,
                Position {
                    latitude_i: 400_000_000,
                    longitude_i: -740_000_000,
                    altitude: 12,
                    time: 0,
                }
                .encode_to_vec(),
            ),
        );
        let decoder = PacketDecoder::new("AQ==");
        match decoder.decode(&raw) {
            Some(DecodedEvent::Position(ev)) => {
                assert_eq!(ev.node_id, "!000000a1");
                let coords = ev.coords.expect("valid fix");
                assert_eq!(coords.lat, 40.0);
                assert_eq!(coords.lon, -74.0);
                assert_eq!(coords.alt, Some(12.0));
            }
            other => panic!("expected position event, got {other:?}"),
        }
    }

    #[test]
    fn zero_latitude_or_longitude_is_no_fix() {
        let decoder = PacketDecoder::new("AQ==");
        for (lat_i, lon_i) in [(0, -740_000_000), (400_000_000, 0), (0, 0)] {
            let raw = envelope(
                1,
                1,
                plaintext(
                    PortNum::PositionApp,
                    Position {
                        latitude_i: lat_i,
                        longitude_i: lon_i,
                        altitude: 0,
                        time: 0,
                    }
                    .encode_to_vec(),
                ),
            );
            match decoder.decode(&raw) {
                Some(DecodedEvent::Position(ev)) => assert!(ev.coords.is_none()),
                other => panic!("expected position event, got {other:?}"),
            }
        }
    }

    #[test]
    fn decodes_node_info() {
        let raw = envelope(
            0xbeef,
            1,
            plaintext(
                PortNum::NodeinfoApp,
                User {
                    id: "!0000beef".into(),
                    long_name: "WS-Rooftop".into(),
                    short_name: "WSRT".into(),
                    hw_model: 4,
                }
                .encode_to_vec(),
            ),
        );
        let decoder = PacketDecoder::new("AQ==");
        match decoder.decode(&raw) {
            Some(DecodedEvent::NodeInfo(ev)) => {
                assert_eq!(ev.name.as_deref(), Some("WS-Rooftop"));
                assert_eq!(ev.hardware.as_deref(), Some("TBEAM"));
            }
            other => panic!("expected nodeinfo event, got {other:?}"),
        }
    }

    #[test]
    fn telemetry_without_time_is_dropped() {
        let raw = envelope(
            1,
            1,
            plaintext(
                PortNum::TelemetryApp,
                Telemetry {
                    time: 0,
                    variant: Some(telemetry::Variant::EnvironmentMetrics(
                        EnvironmentMetrics {
                            temperature: 18.5,
                            relative_humidity: 0.0,
                            barometric_pressure: 0.0,
                        },
                    )),
                }
                .encode_to_vec(),
            ),
        );
        assert!(PacketDecoder::new("AQ==").decode(&raw).is_none());
    }

    #[test]
    fn decodes_device_telemetry() {
        let raw = envelope(
            2,
            1,
            plaintext(
                PortNum::TelemetryApp,
                Telemetry {
                    time: 1000,
                    variant: Some(telemetry::Variant::DeviceMetrics(DeviceMetrics {
                        battery_level: 87,
                        voltage: 3.9,
                    })),
                }
                .encode_to_vec(),
            ),
        );
        match PacketDecoder::new("AQ==").decode(&raw) {
            Some(DecodedEvent::Telemetry(ev)) => {
                assert_eq!(ev.time, 1000);
                assert!(matches!(
                    ev.metrics,
                    TelemetryMetrics::Device { battery_level: 87, .. }
                ));
            }
            other => panic!("expected telemetry event, got {other:?}"),
        }
    }

    #[test]
    fn decrypts_encrypted_payloads() {
        let decoder = PacketDecoder::new("AQ==");
        let key = ChannelKey::from_psk("AQ==");
        let data = Data {
            portnum: PortNum::TelemetryApp as i32,
            payload: Telemetry {
                time: 1234,
                variant: Some(telemetry::Variant::EnvironmentMetrics(
                    EnvironmentMetrics {
                        temperature: 21.0,
                        relative_humidity: 40.0,
                        barometric_pressure: 1013.0,
                    },
                )),
            }
            .encode_to_vec(),
        }
        .encode_to_vec();

        let (packet_id, from) = (0x0102_0304, 0x00a1);
        let encrypted = key.decrypt(packet_id, from, &data);
        let raw = envelope(from, packet_id, mesh_packet::PayloadVariant::Encrypted(encrypted));

        match decoder.decode(&raw) {
            Some(DecodedEvent::Telemetry(ev)) => {
                assert_eq!(ev.node_id, "!000000a1");
                assert_eq!(ev.time, 1234);
            }
            other => panic!("expected telemetry event, got {other:?}"),
        }
    }

    #[test]
    fn wrong_key_drops_silently() {
        let good = ChannelKey::from_psk("AQ==");
        let data = Data {
            portnum: PortNum::PositionApp as i32,
            payload: Position {
                latitude_i: 400_000_000,
                longitude_i: -740_000_000,
                altitude: 0,
                time: 0,
            }
            .encode_to_vec(),
        }
        .encode_to_vec();
        let encrypted = good.decrypt(9, 9, &data);
        let raw = envelope(9, 9, mesh_packet::PayloadVariant::Encrypted(encrypted));

        let other_key = base64::engine::general_purpose::STANDARD.encode([0x55u8; 16]);
        let decoder = PacketDecoder::new(&other_key);
        assert!(decoder.decode(&raw).is_none());
    }

    #[test]
    fn unknown_ports_are_ignored() {
        let raw = envelope(
            1,
            1,
            mesh_packet::PayloadVariant::Decoded(Data {
                portnum: 1, // TEXT_MESSAGE_APP
                payload: b"hello mesh".to_vec(),
            }),
        );
        assert!(PacketDecoder::new("AQ==").decode(&raw).is_none());
    }

    #[test]
    fn garbage_input_is_dropped() {
        assert!(PacketDecoder::new("AQ==").decode(b"not protobuf").is_none());
    }
}
