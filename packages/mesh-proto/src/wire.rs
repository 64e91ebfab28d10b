//! Protobuf messages for the Meshtastic MQTT uplink.
//!
//! Hand-maintained prost derives covering the subset of the published schema
//! this pipeline consumes. Field numbers and wire types must match the radio
//! firmware exactly; unknown fields are skipped by prost on decode.

/// Outer envelope published by a gateway for every packet it hears.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ServiceEnvelope {
    #[prost(message, optional, tag = "1")]
    pub packet: ::core::option::Option<MeshPacket>,
    /// Global channel name the packet was heard on (e.g. "LongFast").
    #[prost(string, tag = "2")]
    pub channel_id: ::prost::alloc::string::String,
    /// Node id of the gateway that uplinked this packet.
    #[prost(string, tag = "3")]
    pub gateway_id: ::prost::alloc::string::String,
}

/// One radio packet. The payload is either already-decoded `Data` (gateway
/// had the channel key) or an encrypted blob we must decrypt ourselves.
#[derive(Clone, PartialEq, prost::Message)]
pub struct MeshPacket {
    /// Sender node number.
    #[prost(fixed32, tag = "1")]
    pub from: u32,
    /// Destination node number (0xffffffff = broadcast).
    #[prost(fixed32, tag = "2")]
    pub to: u32,
    /// Channel index on the sending node; selects the PSK table entry.
    #[prost(uint32, tag = "3")]
    pub channel: u32,
    #[prost(oneof = "mesh_packet::PayloadVariant", tags = "4, 5")]
    pub payload_variant: ::core::option::Option<mesh_packet::PayloadVariant>,
    /// Per-sender packet id; half of the decryption nonce.
    #[prost(fixed32, tag = "6")]
    pub id: u32,
    #[prost(fixed32, tag = "7")]
    pub rx_time: u32,
    #[prost(float, tag = "8")]
    pub rx_snr: f32,
    #[prost(uint32, tag = "9")]
    pub hop_limit: u32,
}

pub mod mesh_packet {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum PayloadVariant {
        #[prost(message, tag = "4")]
        Decoded(super::Data),
        #[prost(bytes, tag = "5")]
        Encrypted(::prost::alloc::vec::Vec<u8>),
    }
}

/// Decrypted application payload: a port number plus opaque bytes whose
/// schema is selected by that port.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Data {
    #[prost(enumeration = "PortNum", tag = "1")]
    pub portnum: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

/// Application ports this pipeline recognizes. All other port numbers decode
/// but are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PortNum {
    UnknownApp = 0,
    PositionApp = 3,
    NodeinfoApp = 4,
    TelemetryApp = 67,
}

/// Position broadcast. Coordinates are degrees scaled by 1e7; zero means
/// "no fix" on either axis.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Position {
    #[prost(sfixed32, tag = "1")]
    pub latitude_i: i32,
    #[prost(sfixed32, tag = "2")]
    pub longitude_i: i32,
    /// Meters above MSL; zero means unreported.
    #[prost(int32, tag = "3")]
    pub altitude: i32,
    #[prost(fixed32, tag = "4")]
    pub time: u32,
}

/// Node self-description broadcast (NODEINFO_APP).
#[derive(Clone, PartialEq, prost::Message)]
pub struct User {
    #[prost(string, tag = "1")]
    pub id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub long_name: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub short_name: ::prost::alloc::string::String,
    /// Hardware model enum value; kept raw so unknown boards survive as
    /// `UNKNOWN_<n>` (see [`crate::hardware_model_name`]).
    #[prost(int32, tag = "5")]
    pub hw_model: i32,
}

/// Telemetry broadcast (TELEMETRY_APP). `time` is the sensor's own clock in
/// epoch seconds and is mandatory for ingestion.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Telemetry {
    #[prost(fixed32, tag = "1")]
    pub time: u32,
    #[prost(oneof = "telemetry::Variant", tags = "2, 3")]
    pub variant: ::core::option::Option<telemetry::Variant>,
}

pub mod telemetry {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Variant {
        #[prost(message, tag = "2")]
        DeviceMetrics(super::DeviceMetrics),
        #[prost(message, tag = "3")]
        EnvironmentMetrics(super::EnvironmentMetrics),
    }
}

/// Radio health metrics. Logged, never committed as rows.
#[derive(Clone, PartialEq, prost::Message)]
pub struct DeviceMetrics {
    /// Battery percentage (101 = powered).
    #[prost(uint32, tag = "1")]
    pub battery_level: u32,
    #[prost(float, tag = "2")]
    pub voltage: f32,
}

/// Environmental sensor metrics. A zero value on any field means the sensor
/// did not report it.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EnvironmentMetrics {
    /// °C
    #[prost(float, tag = "1")]
    pub temperature: f32,
    /// Relative humidity, percent
    #[prost(float, tag = "2")]
    pub relative_humidity: f32,
    /// hPa
    #[prost(float, tag = "3")]
    pub barometric_pressure: f32,
}
