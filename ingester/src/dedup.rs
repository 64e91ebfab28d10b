//! Cross-source deduplication window.
//!
//! Mesh flooding and multi-gateway uplinks deliver the same reading many
//! times, often through different region brokers. The window keys on
//! `(node_id, reading_type, sensor_timestamp)` — deliberately without the
//! source label — and the first observation wins.

use std::collections::HashMap;

/// Entry lifetime: anything older has aged out of the rebroadcast horizon.
const MAX_AGE_SECS: u64 = 3600;

/// How often the window is rebuilt to drop aged entries.
const GC_INTERVAL_SECS: u64 = 300;

pub struct DedupWindow {
    seen: HashMap<(String, String, u32), u64>,
    last_gc: u64,
    pub duplicates_blocked: u64,
    pub unique_processed: u64,
}

impl DedupWindow {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            last_gc: 0,
            duplicates_blocked: 0,
            unique_processed: 0,
        }
    }

    /// Check-and-record. Returns true if this reading was already seen
    /// (caller drops it); otherwise records it and returns false.
    pub fn is_duplicate(
        &mut self,
        node_id: &str,
        reading_type: &str,
        sensor_timestamp: u32,
        now: u64,
    ) -> bool {
        if now.saturating_sub(self.last_gc) > GC_INTERVAL_SECS {
            self.gc(now);
            self.last_gc = now;
        }

        let key = (node_id.to_string(), reading_type.to_string(), sensor_timestamp);
        if self.seen.contains_key(&key) {
            self.duplicates_blocked += 1;
            return true;
        }
        self.seen.insert(key, now);
        self.unique_processed += 1;
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Rebuild retaining only entries inserted within the last hour.
    fn gc(&mut self, now: u64) {
        let cutoff = now.saturating_sub(MAX_AGE_SECS);
        self.seen.retain(|_, inserted| *inserted > cutoff);
    }
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_wins() {
        let mut w = DedupWindow::new();
        assert!(!w.is_duplicate("!00a1", "temperature", 1000, 10_000));
        assert!(w.is_duplicate("!00a1", "temperature", 1000, 10_001));
        assert_eq!(w.unique_processed, 1);
        assert_eq!(w.duplicates_blocked, 1);
    }

    #[test]
    fn key_is_node_type_and_timestamp() {
        let mut w = DedupWindow::new();
        assert!(!w.is_duplicate("!00a1", "temperature", 1000, 10_000));
        assert!(!w.is_duplicate("!00a1", "humidity", 1000, 10_000));
        assert!(!w.is_duplicate("!00a2", "temperature", 1000, 10_000));
        assert!(!w.is_duplicate("!00a1", "temperature", 1001, 10_000));
    }

    #[test]
    fn entries_age_out_after_an_hour() {
        let mut w = DedupWindow::new();
        assert!(!w.is_duplicate("!00a1", "temperature", 1000, 10_000));
        // Past the GC interval and past the entry lifetime: window rebuilt,
        // same reading accepted again.
        assert!(!w.is_duplicate("!00a1", "temperature", 1000, 10_000 + 3601));
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn gc_is_lazy_between_intervals() {
        let mut w = DedupWindow::new();
        assert!(!w.is_duplicate("!00a1", "temperature", 1000, 10_000));
        // Only 4 minutes elapsed — no GC yet, entry still present.
        assert!(w.is_duplicate("!00a1", "temperature", 1000, 10_000 + 240));
    }
}
