//! Batched analytical write path.
//!
//! Rows accumulate in a single mutex-guarded buffer and are flushed either
//! when the buffer reaches the configured batch size or by the periodic
//! flush task. A failed insert puts the batch back at the front of the
//! buffer — rows are never dropped on a transient outage; a persistent
//! outage grows the buffer without bound (visible in the stats line).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ClickHouseSettings;

/// One committed reading. Field order is the table's column order — the
/// RowBinary insert serializes fields positionally.
#[derive(Debug, Clone, PartialEq, Serialize, clickhouse::Row)]
pub struct AnalyticalRow {
    #[serde(with = "clickhouse::serde::chrono::datetime")]
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub data_source: String,
    pub network_source: String,
    pub ingestion_node_id: String,
    pub reading_type: String,
    pub value: f64,
    pub unit: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub geo_country: String,
    pub geo_subdivision: String,
    pub board_model: String,
    pub deployment_type: String,
    pub transport_type: String,
    pub location_source: String,
    pub node_name: Option<String>,
}

/// Destination seam: the real implementation speaks to ClickHouse, tests
/// substitute an in-memory fake.
#[async_trait]
pub trait AnalyticalSink: Send + Sync {
    async fn insert(&self, rows: &[AnalyticalRow]) -> anyhow::Result<()>;
}

pub struct ClickHouseSink {
    client: clickhouse::Client,
    table: String,
}

impl ClickHouseSink {
    pub fn new(settings: &ClickHouseSettings) -> Self {
        let client = clickhouse::Client::default()
            .with_url(settings.url())
            .with_database(&settings.database)
            .with_user(&settings.user)
            .with_password(&settings.password);
        Self {
            client,
            table: settings.table.clone(),
        }
    }
}

#[async_trait]
impl AnalyticalSink for ClickHouseSink {
    async fn insert(&self, rows: &[AnalyticalRow]) -> anyhow::Result<()> {
        let mut insert = self.client.insert(&self.table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }
}

pub struct BatchWriter {
    sink: Arc<dyn AnalyticalSink>,
    buffer: Mutex<Vec<AnalyticalRow>>,
    batch_size: usize,
    total_written: AtomicU64,
}

impl BatchWriter {
    pub fn new(sink: Arc<dyn AnalyticalSink>, batch_size: usize) -> Arc<Self> {
        Arc::new(Self {
            sink,
            buffer: Mutex::new(Vec::new()),
            batch_size: batch_size.max(1),
            total_written: AtomicU64::new(0),
        })
    }

    /// Append one row; flushes inline when the buffer reaches the batch size.
    pub async fn append(&self, row: AnalyticalRow) {
        let len = {
            let mut buf = self.buffer.lock().await;
            buf.push(row);
            buf.len()
        };
        if len >= self.batch_size {
            self.flush().await;
        }
    }

    /// Swap the buffer out and insert it. On failure the batch goes back to
    /// the front of the buffer, order preserved, for the next flush.
    /// Returns false if the sink refused the batch.
    pub async fn flush(&self) -> bool {
        let batch = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return true;
            }
            std::mem::take(&mut *buf)
        };
        let count = batch.len();
        match self.sink.insert(&batch).await {
            Ok(()) => {
                self.total_written.fetch_add(count as u64, Ordering::Relaxed);
                debug!("Flushed {count} rows to the analytical store");
                true
            }
            Err(e) => {
                warn!("Analytical flush failed ({count} rows kept for retry): {e}");
                let mut buf = self.buffer.lock().await;
                let tail = std::mem::take(&mut *buf);
                *buf = batch;
                buf.extend(tail);
                false
            }
        }
    }

    /// Periodic flush task; aborted at shutdown after the final drain.
    pub fn spawn_flush_task(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.flush().await;
            }
        })
    }

    /// Shutdown drain: flush until the buffer is empty or the store refuses.
    pub async fn drain(&self) -> bool {
        loop {
            if self.buffered() == 0 {
                return true;
            }
            if !self.flush().await {
                warn!(
                    "Analytical store refused the final flush; {} rows abandoned",
                    self.buffered()
                );
                return false;
            }
        }
    }

    pub fn total_written(&self) -> u64 {
        self.total_written.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> usize {
        // try_lock is fine for observability; contention just reports 0
        self.buffer.try_lock().map(|b| b.len()).unwrap_or(0)
    }
}
