//! # mesh-proto
//!
//! Wire-level types and decoding for the Meshtastic MQTT uplink.
//!
//! A region gateway republishes every mesh packet it hears as a protobuf
//! `ServiceEnvelope` on its broker. This crate owns the walk from those raw
//! bytes down to a [`DecodedEvent`]:
//!   1. Parse the envelope and inner `MeshPacket`
//!   2. If the payload is encrypted, derive the channel key from the
//!      configured PSK and decrypt (AES-CTR, nonce from packet id + sender)
//!   3. Dispatch on port number to Position / NodeInfo / Telemetry decoders
//!
//! Everything that fails to parse or decrypt is dropped silently — mesh
//! traffic is full of packets on ports and channels we do not carry, and the
//! ingester must never stall on one of them.

mod crypto;
mod decode;
mod hardware;
mod wire;

pub use crypto::ChannelKey;
pub use decode::{
    Coordinates, DecodedEvent, NodeInfoEvent, PacketDecoder, PositionEvent, TelemetryEvent,
    TelemetryMetrics,
};
pub use hardware::hardware_model_name;
pub use wire::{
    mesh_packet, telemetry, Data, DeviceMetrics, EnvironmentMetrics, MeshPacket, PortNum,
    Position, ServiceEnvelope, Telemetry, User,
};
