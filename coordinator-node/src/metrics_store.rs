//! Node metrics ingestion and query: latest, bounded history, aggregates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use veilmesh_common::HeartbeatMetrics;

/// Retained samples per node
const HISTORY_DEPTH: usize = 360;

/// One metrics submission from a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub node_id: Uuid,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub metrics: HeartbeatMetrics,
}

/// Aggregate view over a node's retained history
#[derive(Debug, Clone, Serialize)]
pub struct MetricsAggregate {
    pub node_id: Uuid,
    pub samples: usize,
    pub avg_cpu_usage: f64,
    pub avg_memory_usage: f64,
    pub avg_packet_loss: f64,
    pub peak_active_connections: u64,
    pub total_bytes_forwarded: u64,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MetricsStore {
    history: DashMap<Uuid, VecDeque<MetricsSample>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sample, evicting the oldest past the retention depth
    pub fn ingest(&self, sample: MetricsSample) {
        let mut entry = self.history.entry(sample.node_id).or_default();
        if entry.len() >= HISTORY_DEPTH {
            entry.pop_front();
        }
        entry.push_back(sample);
    }

    pub fn latest(&self, node_id: Uuid) -> Option<MetricsSample> {
        self.history
            .get(&node_id)
            .and_then(|entry| entry.back().cloned())
    }

    /// Newest-first history, capped at `limit`
    pub fn history(&self, node_id: Uuid, limit: usize) -> Vec<MetricsSample> {
        self.history
            .get(&node_id)
            .map(|entry| entry.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn aggregated(&self, node_id: Uuid) -> Option<MetricsAggregate> {
        let entry = self.history.get(&node_id)?;
        if entry.is_empty() {
            return None;
        }

        let samples = entry.len();
        let avg = |f: fn(&HeartbeatMetrics) -> f64| {
            entry.iter().map(|s| f(&s.metrics)).sum::<f64>() / samples as f64
        };

        Some(MetricsAggregate {
            node_id,
            samples,
            avg_cpu_usage: avg(|m| m.cpu_usage),
            avg_memory_usage: avg(|m| m.memory_usage),
            avg_packet_loss: avg(|m| m.packet_loss),
            peak_active_connections: entry
                .iter()
                .map(|s| s.metrics.active_connections)
                .max()
                .unwrap_or(0),
            total_bytes_forwarded: entry.iter().map(|s| s.metrics.bytes_forwarded).sum(),
            window_start: entry.front().map(|s| s.timestamp),
            window_end: entry.back().map(|s| s.timestamp),
        })
    }

    /// Forget a node's history; called when the registry purges it
    pub fn forget(&self, node_id: Uuid) {
        self.history.remove(&node_id);
    }
}
