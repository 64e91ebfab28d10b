//! Correlation engine: the single consumer of decoded mesh events.
//!
//! All mutable ingestion state — node stores, pending buffers, the dedup
//! window — is owned by this one task; MQTT source tasks only enqueue. That
//! keeps ordering per source explicit and the hot path lock-free. The only
//! shared object is the batched writer, which has its own mutex.
//!
//! The flow for an environmental reading: dedup → position join (buffer if
//! the node has no position yet) → monotonic `last_env_time` update →
//! reverse geocode → one downstream publish + one analytical row.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::TimeZone;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mesh_proto::{DecodedEvent, NodeInfoEvent, PositionEvent, TelemetryEvent, TelemetryMetrics};

use crate::clock::Clock;
use crate::config::{Mode, SourceConfig};
use crate::dedup::DedupWindow;
use crate::geocode::{topic_codes, ReverseGeocode};
use crate::pending::{self, PendingBuffer, PendingReading};
use crate::publisher::{reading_topic, ReadingPayload, ReadingPublisher};
use crate::sources::{SourceCounters, SourceEvent};
use crate::store::{NodeRecord, NodeStore};
use crate::writer::{AnalyticalRow, BatchWriter};

/// Node-store save amortization: persist after this many
/// `last_env_time`-only updates per source.
const STORE_SAVE_EVERY: u32 = 10;

/// Name/hardware learned before the node's first position. In-memory only —
/// nodeinfo rebroadcasts arrive often enough that losing these on restart
/// costs nothing.
#[derive(Debug, Clone, Default)]
pub struct PendingNodeInfo {
    pub name: Option<String>,
    pub hardware: Option<String>,
}

struct ShardStats {
    counters: SourceCounters,
    nodes_seen: HashSet<String>,
    environmental: u64,
    device_telemetry: u64,
    started: Instant,
}

/// Per-source ingestion state, owned by the correlation task.
pub struct SourceShard {
    config: SourceConfig,
    nodes: NodeStore,
    pending: PendingBuffer,
    pending_info: HashMap<String, PendingNodeInfo>,
    save_counter: u32,
    stats: ShardStats,
}

impl SourceShard {
    pub fn new(
        config: SourceConfig,
        nodes: NodeStore,
        pending: PendingBuffer,
        counters: SourceCounters,
    ) -> Self {
        Self {
            config,
            nodes,
            pending,
            pending_info: HashMap::new(),
            save_counter: 0,
            stats: ShardStats {
                counters,
                nodes_seen: HashSet::new(),
                environmental: 0,
                device_telemetry: 0,
                started: Instant::now(),
            },
        }
    }

    pub fn nodes(&self) -> &NodeStore {
        &self.nodes
    }

    pub fn pending(&self) -> &PendingBuffer {
        &self.pending
    }
}

pub struct Correlator {
    mode: Mode,
    ingestion_node_id: String,
    shards: BTreeMap<String, SourceShard>,
    dedup: DedupWindow,
    writer: Arc<BatchWriter>,
    publisher: Arc<dyn ReadingPublisher>,
    geocoder: Arc<dyn ReverseGeocode>,
    clock: Arc<dyn Clock>,
}

impl Correlator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: Mode,
        ingestion_node_id: String,
        shards: BTreeMap<String, SourceShard>,
        writer: Arc<BatchWriter>,
        publisher: Arc<dyn ReadingPublisher>,
        geocoder: Arc<dyn ReverseGeocode>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            mode,
            ingestion_node_id,
            shards,
            dedup: DedupWindow::new(),
            writer,
            publisher,
            geocoder,
            clock,
        }
    }

    pub fn shard(&self, source: &str) -> Option<&SourceShard> {
        self.shards.get(source)
    }

    /// Consume events until every sender is gone (shutdown), reporting stats
    /// on the side. Returns self so the caller can flush and persist in the
    /// required order.
    pub async fn run(mut self, mut rx: mpsc::Receiver<SourceEvent>, stats_every: Duration) -> Self {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + stats_every, stats_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(ev) => self.handle_event(&ev.source, ev.event).await,
                    None => break,
                },
                _ = ticker.tick() => self.report_stats(),
            }
        }
        // Drain anything that raced the channel close
        while let Ok(ev) = rx.try_recv() {
            self.handle_event(&ev.source, ev.event).await;
        }
        self
    }

    pub async fn handle_event(&mut self, source: &str, event: DecodedEvent) {
        match self.shards.get_mut(source) {
            Some(shard) => {
                shard
                    .stats
                    .nodes_seen
                    .insert(event.node_id().to_string());
            }
            None => {
                debug!("Dropping event for unknown source {source}");
                return;
            }
        }
        match event {
            DecodedEvent::Position(ev) => self.handle_position(source, ev).await,
            DecodedEvent::NodeInfo(ev) => self.handle_node_info(source, ev).await,
            DecodedEvent::Telemetry(ev) => self.handle_telemetry(source, ev).await,
        }
    }

    // ── Position ──────────────────────────────────────────────────────────────

    async fn handle_position(&mut self, source: &str, ev: PositionEvent) {
        let Some(coords) = ev.coords else { return };
        let now = self.clock.now();
        let node_id = ev.node_id;

        {
            let Some(shard) = self.shards.get_mut(source) else { return };
            let existing = shard.nodes.get(&node_id).cloned();
            let is_new = existing.is_none();

            // Carry prior metadata and correlation progress into the rewrite
            let mut name = existing.as_ref().and_then(|r| r.name.clone());
            let mut hardware = existing.as_ref().and_then(|r| r.hardware.clone());
            let last_env_time = existing.as_ref().and_then(|r| r.last_env_time);

            if let Some(info) = shard.pending_info.remove(&node_id) {
                name = name.or(info.name);
                hardware = hardware.or(info.hardware);
            }

            let changed = existing.as_ref().is_some_and(|r| {
                r.lat != coords.lat || r.lon != coords.lon || r.alt != coords.alt
            });

            if is_new || changed {
                shard.nodes.insert(
                    node_id.clone(),
                    NodeRecord {
                        lat: coords.lat,
                        lon: coords.lon,
                        alt: coords.alt,
                        name: name.clone(),
                        hardware,
                        last_env_time,
                    },
                );
                shard.nodes.save(now).await;
            }

            let action = if is_new {
                "NEW"
            } else if changed {
                "CHANGED"
            } else {
                "UNCHANGED"
            };
            let display_name = name.unwrap_or_else(|| node_id.clone());
            info!(
                "POSITION_BROADCAST | node={display_name} | source={source} | action={action} | lat={} | lon={}",
                coords.lat, coords.lon
            );
        }

        // Commit readings that were waiting on this position, oldest first
        let queued = match self.shards.get_mut(source) {
            Some(shard) => shard.pending.take(&node_id),
            None => None,
        };
        if let Some(queued) = queued {
            let live: Vec<PendingReading> = queued
                .into_iter()
                .filter(|(_, _, _, ts)| pending::is_live(*ts, now))
                .collect();
            if !live.is_empty() {
                info!(
                    "Position arrived | source={source} | node={node_id} | committing {} pending readings",
                    live.len()
                );
                for (reading_type, value, unit, ts) in live {
                    self.commit_reading(source, &node_id, &reading_type, value, &unit, ts)
                        .await;
                }
                if let Some(shard) = self.shards.get_mut(source) {
                    shard.nodes.save(now).await;
                }
            }
            if let Some(shard) = self.shards.get_mut(source) {
                shard.pending.save(now).await;
            }
        }
    }

    // ── NodeInfo ──────────────────────────────────────────────────────────────

    async fn handle_node_info(&mut self, source: &str, ev: NodeInfoEvent) {
        let now = self.clock.now();
        let Some(shard) = self.shards.get_mut(source) else { return };
        if shard.nodes.contains(&ev.node_id) {
            let mut updated = false;
            if let Some(record) = shard.nodes.get_mut(&ev.node_id) {
                if ev.name.is_some() {
                    record.name = ev.name.clone();
                    updated = true;
                }
                if ev.hardware.is_some() {
                    record.hardware = ev.hardware.clone();
                    updated = true;
                }
            }
            if updated {
                shard.nodes.save(now).await;
            }
        } else if ev.name.is_some() || ev.hardware.is_some() {
            let entry = shard.pending_info.entry(ev.node_id).or_default();
            if ev.name.is_some() {
                entry.name = ev.name;
            }
            if ev.hardware.is_some() {
                entry.hardware = ev.hardware;
            }
        }
    }

    // ── Telemetry ─────────────────────────────────────────────────────────────

    async fn handle_telemetry(&mut self, source: &str, ev: TelemetryEvent) {
        let now = self.clock.now();
        match ev.metrics {
            TelemetryMetrics::Device {
                battery_level,
                voltage,
            } => {
                let Some(shard) = self.shards.get_mut(source) else { return };
                shard.stats.device_telemetry += 1;
                let display_name = shard
                    .nodes
                    .get(&ev.node_id)
                    .and_then(|r| r.name.clone())
                    .unwrap_or_else(|| ev.node_id.clone());
                info!(
                    "DEVICE_TELEMETRY | node={display_name} | source={source} | battery={battery_level}% | voltage={voltage}V"
                );
            }
            TelemetryMetrics::Environment {
                temperature,
                humidity,
                pressure,
            } => {
                {
                    let Some(shard) = self.shards.get_mut(source) else { return };
                    if !shard.config.publish_to_wesense {
                        return;
                    }
                    shard.stats.environmental += 1;

                    let ahead = ev.time as i64 - now as i64;
                    if ahead > pending::FUTURE_TOLERANCE_SECS {
                        let display_name = shard
                            .nodes
                            .get(&ev.node_id)
                            .and_then(|r| r.name.clone())
                            .unwrap_or_else(|| ev.node_id.clone());
                        warn!(
                            target: "future_timestamps",
                            "FUTURE_TIMESTAMP | node={display_name} | node_id={} | source={source} | ahead={}",
                            ev.node_id,
                            format_ahead(ahead)
                        );
                        return;
                    }

                    info!(
                        "ENVIRONMENT_TELEMETRY | node={} | source={source} | temp={temperature} | humidity={humidity} | pressure={pressure} | has_position={}",
                        ev.node_id,
                        shard.nodes.contains(&ev.node_id)
                    );
                }

                if temperature != 0.0 {
                    self.handle_reading(source, &ev.node_id, "temperature", temperature as f64, "°C", ev.time)
                        .await;
                }
                if humidity != 0.0 {
                    self.handle_reading(source, &ev.node_id, "humidity", humidity as f64, "%", ev.time)
                        .await;
                }
                if pressure != 0.0 {
                    self.handle_reading(source, &ev.node_id, "pressure", pressure as f64, "hPa", ev.time)
                        .await;
                }
            }
        }
    }

    /// Dedup gate in front of the commit path. Only first sightings pass;
    /// position-triggered drains bypass this (the reading was recorded when
    /// it was first seen).
    async fn handle_reading(
        &mut self,
        source: &str,
        node_id: &str,
        reading_type: &str,
        value: f64,
        unit: &str,
        sensor_timestamp: u32,
    ) {
        let now = self.clock.now();
        if self
            .dedup
            .is_duplicate(node_id, reading_type, sensor_timestamp, now)
        {
            debug!(
                "DUPLICATE_SKIPPED | source={source} | node={node_id} | type={reading_type} | value={value}"
            );
            return;
        }
        self.commit_reading(source, node_id, reading_type, value, unit, sensor_timestamp)
            .await;
    }

    /// Position join onward: buffer without a position, otherwise enrich and
    /// emit one row + one downstream publish.
    async fn commit_reading(
        &mut self,
        source: &str,
        node_id: &str,
        reading_type: &str,
        value: f64,
        unit: &str,
        sensor_timestamp: u32,
    ) {
        let now = self.clock.now();
        let (lat, lon, alt, name, hardware, cache_updated) = {
            let Some(shard) = self.shards.get_mut(source) else { return };
            let record = match shard.nodes.get_mut(node_id) {
                Some(record) => record,
                None => {
                    let queued = shard.pending.append(
                        node_id,
                        (
                            reading_type.to_string(),
                            value,
                            unit.to_string(),
                            sensor_timestamp,
                        ),
                    );
                    shard.pending.save(now).await;
                    warn!(
                        "WAITING_FOR_POSITION | source={source} | node={node_id} | type={reading_type} | pending={queued}"
                    );
                    return;
                }
            };

            // Records only exist with a valid fix; a hand-edited cache file
            // is the one way this can trip.
            if record.lat == 0.0 || record.lon == 0.0 {
                return;
            }

            let cache_updated = record.last_env_time.is_none_or(|t| sensor_timestamp > t);
            if cache_updated {
                record.last_env_time = Some(sensor_timestamp);
            }
            let snapshot = (
                record.lat,
                record.lon,
                record.alt,
                record.name.clone(),
                record.hardware.clone(),
                cache_updated,
            );

            if cache_updated {
                shard.save_counter += 1;
                if shard.save_counter >= STORE_SAVE_EVERY {
                    shard.save_counter = 0;
                    shard.nodes.save(now).await;
                }
            }
            snapshot
        };

        let (country, subdivision) = topic_codes(self.geocoder.reverse(lat, lon));
        let mqtt_source = self.mode.mqtt_source_label(source);

        let topic = reading_topic(mqtt_source, &country, &subdivision, node_id);
        let payload = ReadingPayload {
            timestamp: sensor_timestamp,
            device_id: node_id.to_string(),
            name: name.clone(),
            latitude: lat,
            longitude: lon,
            altitude: alt,
            country: country.clone(),
            subdivision: subdivision.clone(),
            data_source: mqtt_source.to_string(),
            reading_type: reading_type.to_string(),
            value,
            unit: unit.to_string(),
            board_model: hardware.clone(),
        };
        self.publisher.publish(&topic, &payload).await;

        let Some(timestamp) = Utc.timestamp_opt(sensor_timestamp as i64, 0).single() else {
            return;
        };
        self.writer
            .append(AnalyticalRow {
                timestamp,
                device_id: node_id.to_string(),
                data_source: self.mode.data_source().to_string(),
                network_source: source.to_string(),
                ingestion_node_id: self.ingestion_node_id.clone(),
                reading_type: reading_type.to_string(),
                value,
                unit: unit.to_string(),
                latitude: lat,
                longitude: lon,
                altitude: alt,
                geo_country: country,
                geo_subdivision: subdivision,
                board_model: hardware.unwrap_or_default(),
                deployment_type: deployment_type(name.as_deref()).to_string(),
                transport_type: "LORA".to_string(),
                location_source: "gps".to_string(),
                node_name: name,
            })
            .await;

        let status = if cache_updated {
            "CACHE_UPDATED"
        } else {
            "CACHE_NOT_UPDATED"
        };
        info!(
            "CLICKHOUSE_BUFFERED_{status} | source={source} | node={node_id} | type={reading_type} | value={value} | lat={lat} | lon={lon}"
        );
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Persist every enabled source's node store and pending buffer
    /// (shutdown, after the writer drain).
    pub async fn save_all(&self) {
        let now = self.clock.now();
        for (label, shard) in &self.shards {
            if !shard.config.enabled {
                continue;
            }
            if !shard.nodes.is_empty() {
                info!("Saving {label} node cache ({} nodes)", shard.nodes.len());
            }
            shard.nodes.save(now).await;
            shard.pending.save(now).await;
        }
    }

    fn report_stats(&self) {
        let now = self.clock.now();
        let mut active_total = 0usize;
        let mut counted: HashSet<&str> = HashSet::new();
        for (label, shard) in &self.shards {
            if !shard.config.enabled {
                continue;
            }
            let messages = shard.stats.counters.messages.load(Ordering::Relaxed);
            let conn_errors = shard.stats.counters.connect_errors.load(Ordering::Relaxed);
            let elapsed = shard.stats.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                messages as f64 / elapsed
            } else {
                0.0
            };
            // Rolling count of nodes whose latest committed reading is less
            // than an hour old, deduplicated across sources.
            let mut active = 0usize;
            for (node_id, record) in shard.nodes.iter() {
                if let Some(t) = record.last_env_time {
                    let age = now as i64 - t as i64;
                    if (0..=3600).contains(&age) && counted.insert(node_id.as_str()) {
                        active += 1;
                    }
                }
            }
            active_total += active;
            info!(
                "[{label}] msgs: {messages} | nodes: {} | pos: {} | names: {} | env: {} | env/hr: {active} | dev: {} | pending: {} | conn errs: {conn_errors} | rate: {rate:.1}/s",
                shard.stats.nodes_seen.len(),
                shard.nodes.len(),
                shard.nodes.named_count(),
                shard.stats.environmental,
                shard.stats.device_telemetry,
                shard.pending.reading_count(),
            );
        }
        let blocked = self.dedup.duplicates_blocked;
        let unique = self.dedup.unique_processed;
        let total = blocked + unique;
        let block_rate = if total > 0 {
            blocked as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        info!(
            "TOTALS | env nodes last hour: {active_total} | dedup: {total} ({blocked} dups, {block_rate:.1}%) | rows written: {} | buffered: {} | window: {}",
            self.writer.total_written(),
            self.writer.buffered(),
            self.dedup.len(),
        );
    }
}

/// `WS-` prefixed names are the official outdoor fleet; everything else is
/// left blank for the downstream deployment classifier.
fn deployment_type(node_name: Option<&str>) -> &'static str {
    match node_name {
        Some(name) if name.to_uppercase().starts_with("WS-") => "OUTDOOR",
        _ => "",
    }
}

/// Human-scale rendering of how far ahead of wall clock a timestamp is.
fn format_ahead(secs: i64) -> String {
    if secs > 86_400 {
        format!("{:.1} days", secs as f64 / 86_400.0)
    } else if secs > 3_600 {
        format!("{:.1} hours", secs as f64 / 3_600.0)
    } else if secs > 60 {
        format!("{:.1} minutes", secs as f64 / 60.0)
    } else {
        format!("{secs} seconds")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_type_matches_ws_prefix_case_insensitively() {
        assert_eq!(deployment_type(Some("WS-Rooftop")), "OUTDOOR");
        assert_eq!(deployment_type(Some("ws-balcony")), "OUTDOOR");
        assert_eq!(deployment_type(Some("Backyard")), "");
        assert_eq!(deployment_type(None), "");
    }

    #[test]
    fn format_ahead_scales_units() {
        assert_eq!(format_ahead(45), "45 seconds");
        assert_eq!(format_ahead(90), "1.5 minutes");
        assert_eq!(format_ahead(7_200), "2.0 hours");
        assert_eq!(format_ahead(172_800), "2.0 days");
    }
}
