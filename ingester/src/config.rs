//! Startup configuration: the source registry (JSON file or env-synthesized)
//! plus env-driven settings for the analytical store, the downstream
//! publisher, and the process itself.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Env var with a string default.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Env var parsed with a fallback default.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// First env var that is set, else the default.
fn env_first(keys: &[&str], default: &str) -> String {
    keys.iter()
        .find_map(|k| std::env::var(k).ok())
        .unwrap_or_else(|| default.to_string())
}

// ── Source registry ───────────────────────────────────────────────────────────

/// One ingestion endpoint: a broker + subscription pattern pair, labeled for
/// provenance, with its own on-disk cache path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub broker: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub topic: String,
    pub cache_file: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub publish_to_wesense: bool,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_true() -> bool {
    true
}

impl SourceConfig {
    /// Sibling cache path for the pending-telemetry buffer.
    pub fn pending_cache_file(&self) -> String {
        match self.cache_file.strip_suffix(".json") {
            Some(stem) => format!("{stem}_pending.json"),
            None => format!("{}_pending.json", self.cache_file),
        }
    }
}

/// Startup-fatal configuration failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {path} not found")]
    Missing { path: String },
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Load the source registry from a JSON file keyed by source label.
///
/// Labels carrying the `untested_` staging prefix are normalized to their
/// bare form so operators can promote a region without renaming cache files.
pub fn load_sources(path: &str) -> Result<BTreeMap<String, SourceConfig>, ConfigError> {
    if !Path::new(path).exists() {
        return Err(ConfigError::Missing {
            path: path.to_string(),
        });
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    let parsed: BTreeMap<String, SourceConfig> =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;
    Ok(parsed
        .into_iter()
        .map(|(label, cfg)| {
            let label = label
                .strip_prefix("untested_")
                .map(str::to_string)
                .unwrap_or(label);
            (label, cfg)
        })
        .collect())
}

/// Distinguished label for the env-configured community source.
pub const LOCAL_SOURCE: &str = "LOCAL";

/// The single LOCAL source used in community mode, built from env vars.
pub fn community_source() -> SourceConfig {
    SourceConfig {
        broker: env_first(&["MQTT_BROKER", "LOCAL_MQTT_HOST"], "localhost"),
        port: env_parse("MQTT_PORT", 1883),
        username: env_first(&["MQTT_USERNAME", "LOCAL_MQTT_USER"], ""),
        password: env_first(&["MQTT_PASSWORD", "LOCAL_MQTT_PASSWORD"], ""),
        topic: env_or("MQTT_SUBSCRIBE_TOPIC", "msh/+/2/e/#"),
        cache_file: "cache/meshtastic_cache_local.json".to_string(),
        enabled: true,
        publish_to_wesense: true,
    }
}

// ── Mode & process settings ───────────────────────────────────────────────────

/// Network mode. Community listens to the single local broker; downlink fans
/// in from the region registry. The legacy variant keeps the old downstream
/// topic label for consumers that predate the rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Community,
    Downlink,
    DownlinkLegacy,
}

impl Mode {
    pub fn from_env() -> Self {
        match env_or("MESHTASTIC_MODE", "community").to_lowercase().as_str() {
            "downlink" => Self::Downlink,
            "public" => Self::DownlinkLegacy,
            _ => Self::Community,
        }
    }

    /// Value of the `data_source` column.
    pub fn data_source(self) -> &'static str {
        match self {
            Self::Community => "MESHTASTIC_COMMUNITY",
            Self::Downlink | Self::DownlinkLegacy => "MESHTASTIC_DOWNLINK",
        }
    }

    /// Downstream topic label for a given source.
    pub fn mqtt_source_label(self, source: &str) -> &'static str {
        match self {
            Self::Community => "meshtastic-community",
            Self::Downlink if source == LOCAL_SOURCE => "meshtastic-community",
            Self::Downlink => "meshtastic-downlink",
            Self::DownlinkLegacy if source == LOCAL_SOURCE => "meshtastic-community",
            Self::DownlinkLegacy => "meshtastic-public",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    /// Base64 channel PSK for encrypted payloads.
    pub channel_psk: String,
    /// Recorded in every row for provenance; defaults to the host name.
    pub ingestion_node_id: String,
    pub stats_interval_secs: u64,
    pub health_port: u16,
    pub sources_config_path: String,
}

impl Settings {
    pub fn from_env() -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            mode: Mode::from_env(),
            channel_psk: env_or("MESHTASTIC_CHANNEL_KEY", "AQ=="),
            ingestion_node_id: env_or("INGESTION_NODE_ID", &host),
            stats_interval_secs: env_parse("STATS_INTERVAL", 10),
            health_port: env_parse("HEALTH_PORT", 3001),
            sources_config_path: env_or("MQTT_REGIONS_CONFIG", "config/mqtt_regions.json"),
        }
    }
}

// ── Analytical store ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ClickHouseSettings {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub table: String,
    pub user: String,
    pub password: String,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
}

impl ClickHouseSettings {
    pub fn from_env() -> Self {
        Self {
            host: env_or("CLICKHOUSE_HOST", "localhost"),
            port: env_parse("CLICKHOUSE_PORT", 8123),
            database: env_or("CLICKHOUSE_DATABASE", "wesense"),
            table: env_or("CLICKHOUSE_TABLE", "sensor_readings"),
            user: env_or("CLICKHOUSE_USER", "default"),
            password: env_or("CLICKHOUSE_PASSWORD", ""),
            batch_size: env_parse("CLICKHOUSE_BATCH_SIZE", 100),
            flush_interval_secs: env_parse("CLICKHOUSE_FLUSH_INTERVAL", 10),
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

// ── Downstream publisher ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PublisherSettings {
    pub broker: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl PublisherSettings {
    /// `WESENSE_OUTPUT_*` with fallback to the plain `MQTT_*` names kept for
    /// older deployments.
    pub fn from_env() -> Self {
        Self {
            broker: env_first(&["WESENSE_OUTPUT_BROKER", "MQTT_BROKER"], "localhost"),
            port: env_first(&["WESENSE_OUTPUT_PORT", "MQTT_PORT"], "1883")
                .parse()
                .unwrap_or(1883),
            username: env_first(&["WESENSE_OUTPUT_USERNAME", "MQTT_USERNAME"], ""),
            password: env_first(&["WESENSE_OUTPUT_PASSWORD", "MQTT_PASSWORD"], ""),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_sources_and_strips_staging_prefix() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "US": {{"broker": "us.example.net", "port": 1883, "topic": "msh/US/2/e/#",
                        "cache_file": "cache/us.json", "enabled": true}},
                "untested_EU_868": {{"broker": "eu.example.net", "topic": "msh/EU_868/2/e/#",
                        "cache_file": "cache/eu.json", "publish_to_wesense": false}}
            }}"#
        )
        .unwrap();

        let sources = load_sources(file.path().to_str().unwrap()).unwrap();
        assert_eq!(sources.len(), 2);
        assert!(sources.contains_key("EU_868"));
        let us = &sources["US"];
        assert!(us.enabled);
        assert!(us.publish_to_wesense); // defaulted
        let eu = &sources["EU_868"];
        assert!(!eu.enabled); // defaulted
        assert!(!eu.publish_to_wesense);
        assert_eq!(eu.port, 1883); // defaulted
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(matches!(
            load_sources("/nonexistent/mqtt_regions.json"),
            Err(ConfigError::Missing { .. })
        ));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            load_sources(file.path().to_str().unwrap()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn pending_cache_path_is_a_sibling() {
        let cfg = SourceConfig {
            broker: "b".into(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            topic: "t".into(),
            cache_file: "cache/meshtastic_cache_us.json".into(),
            enabled: true,
            publish_to_wesense: true,
        };
        assert_eq!(
            cfg.pending_cache_file(),
            "cache/meshtastic_cache_us_pending.json"
        );
    }

    #[test]
    fn mode_labels() {
        assert_eq!(Mode::Community.data_source(), "MESHTASTIC_COMMUNITY");
        assert_eq!(Mode::Downlink.data_source(), "MESHTASTIC_DOWNLINK");
        assert_eq!(Mode::Downlink.mqtt_source_label("US"), "meshtastic-downlink");
        assert_eq!(
            Mode::Downlink.mqtt_source_label(LOCAL_SOURCE),
            "meshtastic-community"
        );
        assert_eq!(
            Mode::DownlinkLegacy.mqtt_source_label("US"),
            "meshtastic-public"
        );
        assert_eq!(Mode::Community.mqtt_source_label("US"), "meshtastic-community");
    }
}
