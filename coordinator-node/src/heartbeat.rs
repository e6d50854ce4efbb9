//! Heartbeat processing and the registry liveness sweeper.

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::NodeRegistry;
use veilmesh_common::{
    HeartbeatMetrics, HeartbeatRequest, HeartbeatResponse, NodeAction, NodeStatus,
};

/// Heartbeat cadence asked of online nodes, seconds
const NEXT_HEARTBEAT_ONLINE: u64 = 30;
/// Heartbeat cadence asked of degraded nodes, seconds
const NEXT_HEARTBEAT_DEGRADED: u64 = 10;

const CPU_DEGRADED_PCT: f64 = 90.0;
const MEM_DEGRADED_PCT: f64 = 90.0;
const LOSS_DEGRADED_PCT: f64 = 10.0;

pub struct HeartbeatManager {
    registry: Arc<NodeRegistry>,
    /// Actions queued for delivery on a node's next heartbeat
    pending_actions: DashMap<Uuid, Vec<NodeAction>>,
}

impl HeartbeatManager {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            pending_actions: DashMap::new(),
        }
    }

    /// Status hint from reported metrics; resource pressure or loss above
    /// thresholds degrades the node.
    pub fn derive_status(metrics: &HeartbeatMetrics) -> NodeStatus {
        if metrics.cpu_usage > CPU_DEGRADED_PCT
            || metrics.memory_usage > MEM_DEGRADED_PCT
            || metrics.packet_loss > LOSS_DEGRADED_PCT
        {
            NodeStatus::Degraded
        } else {
            NodeStatus::Online
        }
    }

    /// Process one heartbeat: derive status (explicit status wins), advance
    /// the node's heartbeat clock, and hand back cadence plus queued actions.
    pub async fn process(
        &self,
        node_id: Uuid,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse> {
        let derived = request
            .metrics
            .as_ref()
            .map(Self::derive_status)
            .unwrap_or(NodeStatus::Online);
        let status = request.status.unwrap_or(derived);

        let node = self.registry.touch_heartbeat(node_id, status).await?;

        counter!("coordinator_heartbeats_received_total", 1);
        debug!(
            node_id = %node_id,
            status = ?node.status,
            cpu = request.metrics.as_ref().map(|m| m.cpu_usage).unwrap_or(0.0),
            "Heartbeat processed"
        );

        let next_heartbeat = match node.status {
            NodeStatus::Degraded => NEXT_HEARTBEAT_DEGRADED,
            _ => NEXT_HEARTBEAT_ONLINE,
        };

        let actions = self
            .pending_actions
            .remove(&node_id)
            .map(|(_, actions)| actions)
            .unwrap_or_default();

        Ok(HeartbeatResponse {
            status: "ok".to_string(),
            next_heartbeat,
            actions,
        })
    }

    /// Queue an action for delivery on the node's next heartbeat
    pub fn queue_action(&self, node_id: Uuid, action: NodeAction) {
        info!(node_id = %node_id, action = %action.action, "Action queued for node");
        self.pending_actions
            .entry(node_id)
            .or_default()
            .push(action);
    }

    /// Spawn the liveness sweeper: every `interval`, overdue nodes go
    /// offline first, then nodes silent past the purge threshold are
    /// removed. Both steps invalidate cache entries for the affected nodes.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        offline_threshold: ChronoDuration,
        purge_threshold: ChronoDuration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once(offline_threshold, purge_threshold).await;
            }
        })
    }

    /// One offline-then-purge pass. Failures are logged, never propagated.
    pub async fn sweep_once(
        &self,
        offline_threshold: ChronoDuration,
        purge_threshold: ChronoDuration,
    ) {
        match self.registry.mark_inactive_offline(offline_threshold).await {
            Ok(offline) if !offline.is_empty() => {
                info!(count = offline.len(), "Sweeper marked nodes offline");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Sweeper offline pass failed"),
        }

        match self.registry.remove_inactive(purge_threshold).await {
            Ok(removed) => {
                for node_id in &removed {
                    self.pending_actions.remove(node_id);
                }
                if !removed.is_empty() {
                    info!(count = removed.len(), "Sweeper purged inactive nodes");
                }
            }
            Err(e) => error!(error = %e, "Sweeper purge pass failed"),
        }
    }
}
