//! Node registry: the authoritative view of the egress fleet.
//!
//! All node mutation flows through here. The durable store is written first;
//! the cache is refreshed (or invalidated) afterwards, so cache staleness is
//! bounded by the node cache TTL.

use chrono::{Duration as ChronoDuration, Utc};
use metrics::{counter, gauge};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::store::{Cache, Store};
use veilmesh_common::{NodeRecord, NodeStatus, RegisterRequest};

pub struct NodeRegistry {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
    liveness_window: ChronoDuration,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
        liveness_window: ChronoDuration,
    ) -> Self {
        Self {
            store,
            cache,
            cache_ttl,
            liveness_window,
        }
    }

    /// Upsert a node registration.
    ///
    /// `registered_at` is preserved across re-registrations; every mutable
    /// field is replaced, the heartbeat clock restarts, and the node comes
    /// back online.
    pub async fn register(&self, request: RegisterRequest) -> Result<NodeRecord> {
        let now = Utc::now();
        let registered_at = self
            .store
            .get_node(request.node_id)
            .await?
            .map(|existing| existing.registered_at)
            .unwrap_or(now);

        let node = NodeRecord {
            node_id: request.node_id,
            public_key: request.public_key,
            network_info: request.network_info,
            capabilities: request.capabilities,
            location: request.location,
            status: NodeStatus::Online,
            last_heartbeat: now,
            registered_at,
        };

        self.store.put_node(&node).await?;
        self.cache.put_node(&node, self.cache_ttl).await;

        counter!("coordinator_nodes_registered_total", 1);
        info!(
            node_id = %node.node_id,
            country = %node.location.country,
            nat_type = ?node.network_info.nat_type,
            "Node registered"
        );

        Ok(node)
    }

    /// Cache-then-store lookup
    pub async fn get(&self, node_id: Uuid) -> Result<NodeRecord> {
        if let Some(node) = self.cache.get_node(node_id).await {
            return Ok(node);
        }

        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", node_id)))?;

        self.cache.put_node(&node, self.cache_ttl).await;
        Ok(node)
    }

    /// All registered nodes, regardless of status
    pub async fn list_all(&self) -> Result<Vec<NodeRecord>> {
        self.store.list_nodes().await
    }

    /// Nodes that are online or degraded with a heartbeat inside the
    /// liveness window, freshest heartbeat first.
    pub async fn list_active(&self) -> Result<Vec<NodeRecord>> {
        let now = Utc::now();
        let mut active: Vec<NodeRecord> = self
            .store
            .list_nodes()
            .await?
            .into_iter()
            .filter(|node| node.is_active(now, self.liveness_window))
            .collect();
        active.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));
        Ok(active)
    }

    /// Advance a node's heartbeat clock and status
    pub async fn touch_heartbeat(&self, node_id: Uuid, status: NodeStatus) -> Result<NodeRecord> {
        let mut node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("node {}", node_id)))?;

        node.last_heartbeat = Utc::now();
        node.status = status;

        self.store.put_node(&node).await?;
        self.cache.put_node(&node, self.cache_ttl).await;
        Ok(node)
    }

    /// Record a node's observed public IP. Public-IP drift is best-effort:
    /// failures are logged and swallowed, and an unchanged address is a no-op.
    pub async fn update_public_ip(&self, node_id: Uuid, public_ip: IpAddr) {
        let node = match self.store.get_node(node_id).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                debug!(node_id = %node_id, "Public IP update for unknown node");
                return;
            }
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Public IP lookup failed");
                return;
            }
        };

        if node.network_info.public_ip == Some(public_ip) {
            return;
        }

        let mut updated = node;
        updated.network_info.public_ip = Some(public_ip);
        if let Err(e) = self.store.put_node(&updated).await {
            warn!(node_id = %node_id, error = %e, "Public IP update failed");
            return;
        }
        self.cache.invalidate_node(node_id).await;
        debug!(node_id = %node_id, public_ip = %public_ip, "Public IP updated");
    }

    pub async fn delete(&self, node_id: Uuid) -> Result<bool> {
        let removed = self.store.delete_node(node_id).await?;
        self.cache.invalidate_node(node_id).await;
        if removed {
            info!(node_id = %node_id, "Node deleted");
        }
        Ok(removed)
    }

    /// Transition nodes silent past `threshold` to offline, returning the
    /// affected ids. Cache entries are invalidated for each.
    pub async fn mark_inactive_offline(&self, threshold: ChronoDuration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut transitioned = Vec::new();

        for mut node in self.store.list_nodes().await? {
            if node.status != NodeStatus::Offline && now - node.last_heartbeat >= threshold {
                node.status = NodeStatus::Offline;
                self.store.put_node(&node).await?;
                self.cache.invalidate_node(node.node_id).await;
                transitioned.push(node.node_id);

                warn!(
                    node_id = %node.node_id,
                    silent_for = %(now - node.last_heartbeat),
                    "Node marked offline"
                );
                counter!("coordinator_nodes_marked_offline_total", 1);
            }
        }

        Ok(transitioned)
    }

    /// Remove nodes silent past `threshold`, returning the removed ids
    pub async fn remove_inactive(&self, threshold: ChronoDuration) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let mut removed = Vec::new();

        for node in self.store.list_nodes().await? {
            if now - node.last_heartbeat >= threshold {
                self.store.delete_node(node.node_id).await?;
                self.cache.invalidate_node(node.node_id).await;
                removed.push(node.node_id);

                warn!(node_id = %node.node_id, "Inactive node removed");
                counter!("coordinator_nodes_purged_total", 1);
            }
        }

        gauge!(
            "coordinator_total_nodes",
            self.store.list_nodes().await?.len() as f64
        );
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, TtlCache};
    use veilmesh_common::{Capabilities, Location, NatType, NetworkInfo};

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            Arc::new(MemStore::new()),
            Arc::new(TtlCache::new()),
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        )
    }

    fn register_request(node_id: Uuid) -> RegisterRequest {
        RegisterRequest {
            node_id,
            public_key: "pk".to_string(),
            network_info: NetworkInfo {
                ipv4: "192.0.2.1".parse().unwrap(),
                ipv6: None,
                nat_type: NatType::FullCone,
                stun_mapped_addr: None,
                local_port: 51820,
                public_ip: None,
            },
            capabilities: Capabilities {
                max_connections: 50,
                bandwidth_up: 50,
                bandwidth_down: 200,
                routing: true,
                natting: true,
            },
            location: Location {
                country: "NL".to_string(),
                region: "eu-west".to_string(),
                coords: None,
            },
            heartbeat_interval: None,
        }
    }

    #[tokio::test]
    async fn test_register_preserves_registered_at() {
        let registry = registry();
        let node_id = Uuid::new_v4();

        let first = registry.register(register_request(node_id)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = registry.register(register_request(node_id)).await.unwrap();

        assert_eq!(first.registered_at, second.registered_at);
        assert!(second.last_heartbeat >= first.last_heartbeat);
        assert_eq!(second.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_get_unknown_node_is_not_found() {
        let registry = registry();
        let err = registry.get(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_active_excludes_stale_and_orders_by_freshness() {
        let store = Arc::new(MemStore::new());
        let registry = NodeRegistry::new(
            store.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        );

        let fresh = Uuid::new_v4();
        let fresher = Uuid::new_v4();
        let stale = Uuid::new_v4();

        registry.register(register_request(fresh)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.register(register_request(fresher)).await.unwrap();

        // Stale node: registered then back-dated past the liveness window
        registry.register(register_request(stale)).await.unwrap();
        let mut stale_node = store.get_node(stale).await.unwrap().unwrap();
        stale_node.last_heartbeat = Utc::now() - ChronoDuration::minutes(3);
        store.put_node(&stale_node).await.unwrap();

        let active = registry.list_active().await.unwrap();
        let ids: Vec<Uuid> = active.iter().map(|n| n.node_id).collect();
        assert_eq!(ids, vec![fresher, fresh]);
    }

    #[tokio::test]
    async fn test_update_public_ip_is_idempotent() {
        let store = Arc::new(MemStore::new());
        let registry = NodeRegistry::new(
            store.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        );
        let node_id = Uuid::new_v4();
        registry.register(register_request(node_id)).await.unwrap();

        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        registry.update_public_ip(node_id, ip).await;
        registry.update_public_ip(node_id, ip).await;

        let node = store.get_node(node_id).await.unwrap().unwrap();
        assert_eq!(node.network_info.public_ip, Some(ip));

        // Unknown node never panics or propagates
        registry.update_public_ip(Uuid::new_v4(), ip).await;
    }

    #[tokio::test]
    async fn test_offline_then_purge_sweep_steps() {
        let store = Arc::new(MemStore::new());
        let registry = NodeRegistry::new(
            store.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        );
        let node_id = Uuid::new_v4();
        registry.register(register_request(node_id)).await.unwrap();

        let mut node = store.get_node(node_id).await.unwrap().unwrap();
        node.last_heartbeat = Utc::now() - ChronoDuration::minutes(3);
        store.put_node(&node).await.unwrap();

        let offline = registry
            .mark_inactive_offline(ChronoDuration::minutes(2))
            .await
            .unwrap();
        assert_eq!(offline, vec![node_id]);
        assert_eq!(
            store.get_node(node_id).await.unwrap().unwrap().status,
            NodeStatus::Offline
        );

        // Not yet silent long enough to purge
        let removed = registry
            .remove_inactive(ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert!(removed.is_empty());

        let mut node = store.get_node(node_id).await.unwrap().unwrap();
        node.last_heartbeat = Utc::now() - ChronoDuration::minutes(11);
        store.put_node(&node).await.unwrap();

        let removed = registry
            .remove_inactive(ChronoDuration::minutes(10))
            .await
            .unwrap();
        assert_eq!(removed, vec![node_id]);
        assert!(store.get_node(node_id).await.unwrap().is_none());
    }
}
