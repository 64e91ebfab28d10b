//! Pending-telemetry buffer: readings that arrived before any position was
//! known for their node, persisted per source so a restart does not lose
//! them. Entries expire by age (7 days) and by the future-timestamp rule.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Readings older than this are never committed, so keeping them is pointless.
pub const MAX_AGE_SECS: i64 = 7 * 24 * 3600;

/// Sensor clocks drift; anything further ahead of wall clock than this is
/// rejected outright.
pub const FUTURE_TOLERANCE_SECS: i64 = 30;

/// Legacy on-disk tuple layout: `[reading_type, value, unit, sensor_timestamp]`.
pub type PendingReading = (String, f64, String, u32);

/// Whether a sensor timestamp is still worth keeping: strictly younger than
/// the age limit and at most the tolerance into the future.
pub fn is_live(sensor_timestamp: u32, now: u64) -> bool {
    let delta = now as i64 - sensor_timestamp as i64;
    delta < MAX_AGE_SECS && -delta <= FUTURE_TOLERANCE_SECS
}

#[derive(Default, Serialize, Deserialize)]
struct PendingCacheFile {
    #[serde(default)]
    pending_telemetry: HashMap<String, Vec<PendingReading>>,
    #[serde(default)]
    saved_at: u64,
}

pub struct PendingBuffer {
    path: PathBuf,
    pending: HashMap<String, Vec<PendingReading>>,
}

impl PendingBuffer {
    /// Load from disk, dropping entries that no longer pass the age/future
    /// rules. Missing file and parse failure both yield an empty buffer.
    pub async fn load(path: impl Into<PathBuf>, now: u64) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if !Path::new(&path).exists() {
            return Self {
                path,
                pending: HashMap::new(),
            };
        }
        let pending = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<PendingCacheFile>(&raw) {
                Ok(file) => {
                    let mut valid = 0usize;
                    let mut expired = 0usize;
                    let mut kept: HashMap<String, Vec<PendingReading>> = HashMap::new();
                    for (node_id, readings) in file.pending_telemetry {
                        let total = readings.len();
                        let live: Vec<PendingReading> = readings
                            .into_iter()
                            .filter(|(_, _, _, ts)| is_live(*ts, now))
                            .collect();
                        expired += total - live.len();
                        if !live.is_empty() {
                            valid += live.len();
                            kept.insert(node_id, live);
                        }
                    }
                    if valid > 0 || expired > 0 {
                        info!(
                            "Loaded pending telemetry {} (valid: {valid}, expired: {expired}, nodes: {})",
                            path.display(),
                            kept.len()
                        );
                    }
                    kept
                }
                Err(e) => {
                    warn!("Failed to parse pending cache {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!("Failed to read pending cache {}: {e}", path.display());
                HashMap::new()
            }
        };
        Self { path, pending }
    }

    /// Best-effort save. I/O errors are logged and swallowed.
    pub async fn save(&self, now: u64) {
        let file = PendingCacheFile {
            pending_telemetry: self.pending.clone(),
            saved_at: now,
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(j) => j,
            Err(e) => {
                warn!(
                    "Failed to serialize pending cache {}: {e}",
                    self.path.display()
                );
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            warn!("Failed to write pending cache {}: {e}", self.path.display());
        }
    }

    pub fn append(&mut self, node_id: &str, reading: PendingReading) -> usize {
        let queue = self.pending.entry(node_id.to_string()).or_default();
        queue.push(reading);
        queue.len()
    }

    /// Remove and return a node's whole queue (position arrived).
    pub fn take(&mut self, node_id: &str) -> Option<Vec<PendingReading>> {
        self.pending.remove(node_id)
    }

    pub fn queued_for(&self, node_id: &str) -> usize {
        self.pending.get(node_id).map_or(0, Vec::len)
    }

    pub fn node_count(&self) -> usize {
        self.pending.len()
    }

    pub fn reading_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}
