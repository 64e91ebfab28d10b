//! Per-source node state store with JSON persistence.
//!
//! A [`NodeRecord`] exists only once a valid position has been observed for
//! the node, and is the join target for telemetry. The on-disk layout
//! (`nodes_with_position` + `saved_at`) is a compatibility boundary with
//! operator tooling and older cache files — do not change it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Correlated per-node state. `lat`/`lon` are always nonzero once a record
/// exists; `last_env_time` is the most recent sensor timestamp committed for
/// this node and only ever moves forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_env_time: Option<u32>,
}

#[derive(Default, Serialize, Deserialize)]
struct NodeCacheFile {
    #[serde(default)]
    nodes_with_position: HashMap<String, NodeRecord>,
    #[serde(default)]
    saved_at: u64,
}

pub struct NodeStore {
    path: PathBuf,
    nodes: HashMap<String, NodeRecord>,
}

impl NodeStore {
    /// Load the store from disk. Missing file or parse failure both yield an
    /// empty store — cache staleness is tolerable, ingestion is not.
    pub async fn load(path: impl Into<PathBuf>, now: u64) -> Self {
        let path = path.into();
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if !Path::new(&path).exists() {
            return Self {
                path,
                nodes: HashMap::new(),
            };
        }
        let nodes = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<NodeCacheFile>(&raw) {
                Ok(file) => {
                    let age = now.saturating_sub(file.saved_at);
                    info!(
                        "Loaded node cache {} (age: {age}s, {} nodes)",
                        path.display(),
                        file.nodes_with_position.len()
                    );
                    file.nodes_with_position
                }
                Err(e) => {
                    warn!("Failed to parse node cache {}: {e}", path.display());
                    HashMap::new()
                }
            },
            Err(e) => {
                warn!("Failed to read node cache {}: {e}", path.display());
                HashMap::new()
            }
        };
        Self { path, nodes }
    }

    /// Best-effort save. I/O errors are logged and swallowed.
    pub async fn save(&self, now: u64) {
        let file = NodeCacheFile {
            nodes_with_position: self.nodes.clone(),
            saved_at: now,
        };
        let json = match serde_json::to_string_pretty(&file) {
            Ok(j) => j,
            Err(e) => {
                warn!("Failed to serialize node cache {}: {e}", self.path.display());
                return;
            }
        };
        if let Err(e) = tokio::fs::write(&self.path, json).await {
            warn!("Failed to write node cache {}: {e}", self.path.display());
        }
    }

    pub fn get(&self, node_id: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_id)
    }

    pub fn get_mut(&mut self, node_id: &str) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn insert(&mut self, node_id: String, record: NodeRecord) {
        self.nodes.insert(node_id, record);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NodeRecord)> {
        self.nodes.iter()
    }

    /// Records carrying a human-readable name (stats).
    pub fn named_count(&self) -> usize {
        self.nodes.values().filter(|n| n.name.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(lat: f64, lon: f64) -> NodeRecord {
        NodeRecord {
            lat,
            lon,
            alt: Some(120.0),
            name: Some("WS-Rooftop".into()),
            hardware: Some("TBEAM".into()),
            last_env_time: Some(1000),
        }
    }

    #[tokio::test]
    async fn save_load_save_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");

        let mut store = NodeStore::load(&path, 50_000).await;
        store.insert("!000000a1".into(), record(40.0, -74.0));
        store.insert(
            "!000000a2".into(),
            NodeRecord {
                lat: -36.85,
                lon: 174.76,
                alt: None,
                name: None,
                hardware: None,
                last_env_time: None,
            },
        );
        store.save(50_001).await;

        let loaded = NodeStore::load(&path, 50_002).await;
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("!000000a1"), store.get("!000000a1"));
        assert_eq!(loaded.get("!000000a2"), store.get("!000000a2"));

        loaded.save(50_003).await;
        let again = NodeStore::load(&path, 50_004).await;
        assert_eq!(again.get("!000000a1"), store.get("!000000a1"));
        assert_eq!(again.len(), 2);
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeStore::load(dir.path().join("absent.json"), 0).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        tokio::fs::write(&path, "{ definitely not json").await.unwrap();
        let store = NodeStore::load(&path, 0).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn legacy_null_fields_load_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.json");
        tokio::fs::write(
            &path,
            r#"{"nodes_with_position": {"!000000a1": {"lat": 1.0, "lon": 2.0,
                "alt": null, "name": null, "hardware": null}}, "saved_at": 123}"#,
        )
        .await
        .unwrap();
        let store = NodeStore::load(&path, 200).await;
        let rec = store.get("!000000a1").unwrap();
        assert_eq!(rec.alt, None);
        assert_eq!(rec.name, None);
        assert_eq!(rec.last_env_time, None);
    }
}
