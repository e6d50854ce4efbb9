//! Load balancing and route selection.
//!
//! Scoring and feasibility are pure functions over the candidate set so the
//! same inputs always produce the same path and type; only route ids are
//! freshly generated per request.

use chrono::{Duration as ChronoDuration, Utc};
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::registry::NodeRegistry;
use crate::store::Store;
use veilmesh_common::{
    ClientNetworkInfo, NodeRecord, RouteKind, RouteRecord, RouteRequest, RouteRequirements,
};

/// Direct route estimate constants
const DIRECT_LATENCY_MS: u32 = 50;
const DIRECT_COST: u32 = 1;
const DIRECT_PRIORITY: u32 = 100;

/// Relay route estimate constants
const RELAY_LATENCY_MS: u32 = 100;
const RELAY_BANDWIDTH_CAP_MBPS: u64 = 100;
const RELAY_COST: u32 = 2;
const RELAY_PRIORITY: u32 = 50;

/// Per-node selection score: capacity raises it, degradation lowers it
pub fn score_node(node: &NodeRecord) -> i64 {
    let mut score: i64 = 100;
    if node.status == veilmesh_common::NodeStatus::Degraded {
        score -= 20;
    }
    score += ((node.capabilities.bandwidth_down / 100) as i64).min(50);
    score += ((node.capabilities.max_connections / 10) as i64).min(30);
    score
}

/// Narrow candidates by requirements; an empty result falls back to the
/// unfiltered set so requirements never strand a client entirely.
pub fn filter_candidates<'a>(
    nodes: &'a [NodeRecord],
    requirements: Option<&RouteRequirements>,
) -> Vec<&'a NodeRecord> {
    let Some(requirements) = requirements else {
        return nodes.iter().collect();
    };

    let filtered: Vec<&NodeRecord> = nodes
        .iter()
        .filter(|node| {
            if let Some(min_bandwidth) = requirements.min_bandwidth {
                if node.capabilities.bandwidth_down < min_bandwidth {
                    return false;
                }
            }
            if let Some(country) = &requirements.preferred_country {
                if !node.location.country.eq_ignore_ascii_case(country) {
                    return false;
                }
            }
            if let Some(location) = &requirements.preferred_location {
                if !node.location.region.eq_ignore_ascii_case(location) {
                    return false;
                }
            }
            true
        })
        .collect();

    if filtered.is_empty() {
        nodes.iter().collect()
    } else {
        filtered
    }
}

/// Pick the best candidate: highest score, ties broken by heartbeat freshness
pub fn pick_candidate<'a>(candidates: &[&'a NodeRecord]) -> Option<&'a NodeRecord> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            score_node(a)
                .cmp(&score_node(b))
                .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        })
}

/// Whether a direct client-node path is feasible
pub fn direct_feasible(client: &ClientNetworkInfo, node: &NodeRecord) -> bool {
    client.permits_direct(node.network_info.nat_type)
}

pub struct RouteSelector {
    registry: Arc<NodeRegistry>,
    store: Arc<dyn Store>,
    route_ttl: ChronoDuration,
}

/// Outcome of a selection: the considered plans, the chosen one, and the
/// node it terminates at.
#[derive(Debug)]
pub struct Selection {
    pub routes: Vec<RouteRecord>,
    pub selected: RouteRecord,
    pub node: NodeRecord,
}

impl RouteSelector {
    pub fn new(registry: Arc<NodeRegistry>, store: Arc<dyn Store>, route_ttl: ChronoDuration) -> Self {
        Self {
            registry,
            store,
            route_ttl,
        }
    }

    /// Select a route for the request and persist the chosen plan.
    ///
    /// An explicit `target_node_id` short-circuits scoring when the target
    /// passes direct feasibility; otherwise the highest-scored active node
    /// is taken, direct if feasible, relayed if not.
    pub async fn select(&self, request: &RouteRequest) -> Result<Selection> {
        let active = self.registry.list_active().await?;
        if active.is_empty() {
            counter!("coordinator_route_requests_failed_total", 1);
            return Err(CoordinatorError::Unavailable("no active nodes".to_string()));
        }

        if let Some(target_id) = request.target_node_id {
            if let Some(target) = active.iter().find(|n| n.node_id == target_id) {
                if direct_feasible(&request.client_network_info, target) {
                    let selected = self.materialize(target, RouteKind::Direct).await?;
                    return Ok(Selection {
                        routes: vec![selected.clone()],
                        selected,
                        node: target.clone(),
                    });
                }
                debug!(
                    node_id = %target_id,
                    "Requested target fails direct feasibility, falling back to selection"
                );
            }
        }

        let candidates = filter_candidates(&active, request.requirements.as_ref());
        let best = pick_candidate(&candidates).ok_or_else(|| {
            counter!("coordinator_route_requests_failed_total", 1);
            CoordinatorError::Unavailable("no suitable route".to_string())
        })?;

        let kind = if direct_feasible(&request.client_network_info, best) {
            RouteKind::Direct
        } else {
            RouteKind::Relay
        };

        let selected = self.materialize(best, kind).await?;
        counter!("coordinator_routes_selected_total", 1);
        info!(
            client_id = %request.client_id,
            node_id = %best.node_id,
            kind = ?kind,
            "Route selected"
        );

        Ok(Selection {
            routes: vec![selected.clone()],
            selected,
            node: best.clone(),
        })
    }

    /// Build and persist a route plan for the given node
    async fn materialize(&self, node: &NodeRecord, kind: RouteKind) -> Result<RouteRecord> {
        let route = match kind {
            RouteKind::Direct => RouteRecord {
                id: format!("direct-{}", Uuid::new_v4()),
                kind,
                path: vec![node.node_id],
                estimated_latency_ms: DIRECT_LATENCY_MS,
                estimated_bandwidth_mbps: node.capabilities.bandwidth_down,
                cost: DIRECT_COST,
                priority: DIRECT_PRIORITY,
                expires_at: Utc::now() + self.route_ttl,
            },
            RouteKind::Relay => RouteRecord {
                id: format!("relay-{}", Uuid::new_v4()),
                kind,
                path: vec![node.node_id],
                estimated_latency_ms: RELAY_LATENCY_MS,
                estimated_bandwidth_mbps: node
                    .capabilities
                    .bandwidth_down
                    .min(RELAY_BANDWIDTH_CAP_MBPS),
                cost: RELAY_COST,
                priority: RELAY_PRIORITY,
                expires_at: Utc::now() + self.route_ttl,
            },
            // Cascade routes are declared in the model but never materialized
            RouteKind::Cascade => {
                return Err(CoordinatorError::Unavailable(
                    "cascade routes are not materialized".to_string(),
                ))
            }
        };

        self.store.put_route(&route).await?;
        Ok(route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, TtlCache};
    use proptest::prelude::*;
    use std::time::Duration;
    use veilmesh_common::{
        Capabilities, Location, NatType, NetworkInfo, NodeStatus, RegisterRequest,
    };

    fn node(nat: NatType, bandwidth_down: u64, max_connections: u32) -> NodeRecord {
        NodeRecord {
            node_id: Uuid::new_v4(),
            public_key: "pk".to_string(),
            network_info: NetworkInfo {
                ipv4: "192.0.2.3".parse().unwrap(),
                ipv6: None,
                nat_type: nat,
                stun_mapped_addr: None,
                local_port: 51820,
                public_ip: None,
            },
            capabilities: Capabilities {
                max_connections,
                bandwidth_up: bandwidth_down,
                bandwidth_down,
                routing: true,
                natting: true,
            },
            location: Location {
                country: "DE".to_string(),
                region: "eu-central".to_string(),
                coords: None,
            },
            status: NodeStatus::Online,
            last_heartbeat: Utc::now(),
            registered_at: Utc::now(),
        }
    }

    fn symmetric_client() -> ClientNetworkInfo {
        ClientNetworkInfo {
            ipv4: "10.0.0.5".parse().unwrap(),
            nat_type: NatType::Symmetric,
            stun_mapped_address: None,
        }
    }

    #[test]
    fn test_score_components() {
        let mut n = node(NatType::FullCone, 200, 100);
        assert_eq!(score_node(&n), 100 + 2 + 10);

        n.status = NodeStatus::Degraded;
        assert_eq!(score_node(&n), 100 - 20 + 2 + 10);

        // Caps apply: 10 Gbps and huge connection counts saturate at +50/+30
        let big = node(NatType::FullCone, 10_000, 10_000);
        assert_eq!(score_node(&big), 100 + 50 + 30);
    }

    #[test]
    fn test_filter_falls_back_when_empty() {
        let nodes = vec![node(NatType::FullCone, 50, 10)];
        let requirements = RouteRequirements {
            min_bandwidth: Some(500),
            preferred_country: None,
            preferred_location: None,
        };
        let filtered = filter_candidates(&nodes, Some(&requirements));
        assert_eq!(filtered.len(), 1);
    }

    #[test]
    fn test_filter_by_country() {
        let mut eu = node(NatType::FullCone, 100, 10);
        eu.location.country = "DE".to_string();
        let mut us = node(NatType::FullCone, 100, 10);
        us.location.country = "US".to_string();
        let nodes = vec![eu.clone(), us];

        let requirements = RouteRequirements {
            min_bandwidth: None,
            preferred_country: Some("de".to_string()),
            preferred_location: None,
        };
        let filtered = filter_candidates(&nodes, Some(&requirements));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].node_id, eu.node_id);
    }

    #[test]
    fn test_tie_breaks_on_heartbeat_freshness() {
        let mut older = node(NatType::FullCone, 100, 10);
        older.last_heartbeat = Utc::now() - ChronoDuration::seconds(30);
        let fresher = node(NatType::FullCone, 100, 10);

        let nodes = vec![older, fresher.clone()];
        let candidates: Vec<&NodeRecord> = nodes.iter().collect();
        assert_eq!(pick_candidate(&candidates).unwrap().node_id, fresher.node_id);
    }

    async fn selector_with(nodes: Vec<NodeRecord>) -> RouteSelector {
        let store = Arc::new(MemStore::new());
        let registry = Arc::new(NodeRegistry::new(
            store.clone(),
            Arc::new(TtlCache::new()),
            Duration::from_secs(60),
            ChronoDuration::minutes(2),
        ));
        for n in nodes {
            registry
                .register(RegisterRequest {
                    node_id: n.node_id,
                    public_key: n.public_key.clone(),
                    network_info: n.network_info.clone(),
                    capabilities: n.capabilities.clone(),
                    location: n.location.clone(),
                    heartbeat_interval: None,
                })
                .await
                .unwrap();
        }
        RouteSelector::new(registry, store, ChronoDuration::hours(1))
    }

    #[tokio::test]
    async fn test_no_nodes_is_unavailable() {
        let selector = selector_with(vec![]).await;
        let request = RouteRequest {
            client_id: Uuid::new_v4(),
            target_node_id: None,
            requirements: None,
            client_network_info: symmetric_client(),
        };
        let err = selector.select(&request).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_symmetric_client_falls_back_to_relay() {
        // A symmetric client with no STUN mapping gets no direct path; the
        // best-scored node (B, more downlink) carries a relay route instead.
        let a = node(NatType::Symmetric, 50, 10);
        let b = node(NatType::FullCone, 100, 10);
        let b_id = b.node_id;
        let selector = selector_with(vec![a, b]).await;

        let request = RouteRequest {
            client_id: Uuid::new_v4(),
            target_node_id: None,
            requirements: None,
            client_network_info: symmetric_client(),
        };
        let selection = selector.select(&request).await.unwrap();

        assert_eq!(selection.node.node_id, b_id);
        assert_eq!(selection.selected.kind, RouteKind::Relay);
        assert!(selection.selected.id.starts_with("relay-"));
        assert_eq!(selection.selected.path, vec![b_id]);
        assert_eq!(selection.selected.estimated_latency_ms, 100);
        assert_eq!(selection.selected.estimated_bandwidth_mbps, 100);
        assert_eq!(selection.selected.cost, 2);
        assert_eq!(selection.selected.priority, 50);
    }

    #[tokio::test]
    async fn test_target_node_direct_when_feasible() {
        let target = node(NatType::FullCone, 50, 10);
        let other = node(NatType::FullCone, 1000, 1000);
        let target_id = target.node_id;
        let selector = selector_with(vec![target, other]).await;

        let request = RouteRequest {
            client_id: Uuid::new_v4(),
            target_node_id: Some(target_id),
            requirements: None,
            client_network_info: ClientNetworkInfo {
                ipv4: "10.0.0.5".parse().unwrap(),
                nat_type: NatType::FullCone,
                stun_mapped_address: None,
            },
        };
        let selection = selector.select(&request).await.unwrap();

        // The lower-scored target wins because it was explicitly requested
        assert_eq!(selection.node.node_id, target_id);
        assert_eq!(selection.selected.kind, RouteKind::Direct);
        assert_eq!(selection.selected.estimated_latency_ms, 50);
        assert_eq!(selection.selected.cost, 1);
        assert_eq!(selection.selected.priority, 100);
        assert_eq!(selection.selected.estimated_bandwidth_mbps, 50);
    }

    proptest! {
        /// Identical candidate sets and requirements always yield the same
        /// path and route type.
        #[test]
        fn prop_selection_deterministic(
            bandwidths in prop::collection::vec(1u64..1000, 1..8),
            client_symmetric in any::<bool>(),
        ) {
            let nodes: Vec<NodeRecord> = bandwidths
                .iter()
                .map(|bw| node(NatType::FullCone, *bw, 10))
                .collect();
            let candidates: Vec<&NodeRecord> = nodes.iter().collect();

            let first = pick_candidate(&candidates).map(|n| n.node_id);
            let second = pick_candidate(&candidates).map(|n| n.node_id);
            prop_assert_eq!(first, second);

            let client = ClientNetworkInfo {
                ipv4: "10.0.0.5".parse().unwrap(),
                nat_type: if client_symmetric { NatType::Symmetric } else { NatType::FullCone },
                stun_mapped_address: None,
            };
            let chosen = pick_candidate(&candidates).unwrap();
            prop_assert_eq!(
                direct_feasible(&client, chosen),
                direct_feasible(&client, chosen)
            );
        }

        /// A direct route is never feasible when both ends are symmetric
        /// without a STUN-discovered mapping.
        #[test]
        fn prop_no_direct_between_symmetric(bw in 1u64..1000) {
            let n = node(NatType::Symmetric, bw, 10);
            let client = ClientNetworkInfo {
                ipv4: "10.0.0.5".parse().unwrap(),
                nat_type: NatType::Symmetric,
                stun_mapped_address: None,
            };
            prop_assert!(!direct_feasible(&client, &n));
        }
    }
}
