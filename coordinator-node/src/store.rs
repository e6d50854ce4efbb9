//! Durable store and TTL cache seams.
//!
//! The relational store the platform runs against is an external
//! collaborator; the coordinator only talks to these traits. `MemStore` and
//! `TtlCache` are the in-process reference implementations and back the test
//! suites. A relational adapter implements the same traits over the
//! conceptual `nodes` / `sessions` / `routes` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::error::Result;
use veilmesh_common::{NodeRecord, RouteRecord, SessionRecord};

/// Durable persistence for nodes, sessions, and routes
#[async_trait]
pub trait Store: Send + Sync {
    async fn put_node(&self, node: &NodeRecord) -> Result<()>;
    async fn get_node(&self, node_id: Uuid) -> Result<Option<NodeRecord>>;
    async fn list_nodes(&self) -> Result<Vec<NodeRecord>>;
    async fn delete_node(&self, node_id: Uuid) -> Result<bool>;

    async fn put_session(&self, session: &SessionRecord) -> Result<()>;
    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;
    async fn delete_session(&self, session_id: Uuid) -> Result<bool>;
    /// Delete sessions with `expires_at < now`, returning the removed ids
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn put_route(&self, route: &RouteRecord) -> Result<()>;
    async fn get_route(&self, route_id: &str) -> Result<Option<RouteRecord>>;
    /// Delete routes with `expires_at < now`, returning the removed ids
    async fn delete_expired_routes(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}

/// Best-effort cache for node and session records
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_node(&self, node_id: Uuid) -> Option<NodeRecord>;
    async fn put_node(&self, node: &NodeRecord, ttl: Duration);
    async fn invalidate_node(&self, node_id: Uuid);

    async fn get_session(&self, session_id: Uuid) -> Option<SessionRecord>;
    async fn put_session(&self, session: &SessionRecord, ttl: Duration);
    async fn invalidate_session(&self, session_id: Uuid);
}

/// In-memory store over concurrent maps
#[derive(Debug, Default)]
pub struct MemStore {
    nodes: DashMap<Uuid, NodeRecord>,
    sessions: DashMap<Uuid, SessionRecord>,
    routes: DashMap<String, RouteRecord>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn put_node(&self, node: &NodeRecord) -> Result<()> {
        self.nodes.insert(node.node_id, node.clone());
        Ok(())
    }

    async fn get_node(&self, node_id: Uuid) -> Result<Option<NodeRecord>> {
        Ok(self.nodes.get(&node_id).map(|entry| entry.value().clone()))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self
            .nodes
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_node(&self, node_id: Uuid) -> Result<bool> {
        Ok(self.nodes.remove(&node_id).is_some())
    }

    async fn put_session(&self, session: &SessionRecord) -> Result<()> {
        self.sessions.insert(session.session_id, session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>> {
        Ok(self
            .sessions
            .get(&session_id)
            .map(|entry| entry.value().clone()))
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete_session(&self, session_id: Uuid) -> Result<bool> {
        Ok(self.sessions.remove(&session_id).is_some())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let expired: Vec<Uuid> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().expires_at < now)
            .map(|entry| *entry.key())
            .collect();
        for session_id in &expired {
            self.sessions.remove(session_id);
        }
        Ok(expired)
    }

    async fn put_route(&self, route: &RouteRecord) -> Result<()> {
        self.routes.insert(route.id.clone(), route.clone());
        Ok(())
    }

    async fn get_route(&self, route_id: &str) -> Result<Option<RouteRecord>> {
        Ok(self.routes.get(route_id).map(|entry| entry.value().clone()))
    }

    async fn delete_expired_routes(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let expired: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| entry.value().expires_at < now)
            .map(|entry| entry.key().clone())
            .collect();
        for route_id in &expired {
            self.routes.remove(route_id);
        }
        Ok(expired)
    }
}

/// A single TTL-stamped cache entry
#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// In-memory TTL cache over concurrent maps.
///
/// Entries are checked lazily on read and reaped by `purge_expired`, which
/// the owning process runs on its sweep cadence.
#[derive(Debug, Default)]
pub struct TtlCache {
    nodes: DashMap<Uuid, Entry<NodeRecord>>,
    sessions: DashMap<Uuid, Entry<SessionRecord>>,
}

impl TtlCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries past their deadline
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.nodes.retain(|_, entry| entry.expires_at > now);
        self.sessions.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.sessions.is_empty()
    }
}

#[async_trait]
impl Cache for TtlCache {
    async fn get_node(&self, node_id: Uuid) -> Option<NodeRecord> {
        let entry = self.nodes.get(&node_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.nodes.remove(&node_id);
            return None;
        }
        Some(entry.value.clone())
    }

    async fn put_node(&self, node: &NodeRecord, ttl: Duration) {
        self.nodes.insert(
            node.node_id,
            Entry {
                value: node.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn invalidate_node(&self, node_id: Uuid) {
        self.nodes.remove(&node_id);
    }

    async fn get_session(&self, session_id: Uuid) -> Option<SessionRecord> {
        let entry = self.sessions.get(&session_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.sessions.remove(&session_id);
            return None;
        }
        Some(entry.value.clone())
    }

    async fn put_session(&self, session: &SessionRecord, ttl: Duration) {
        self.sessions.insert(
            session.session_id,
            Entry {
                value: session.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    async fn invalidate_session(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }
}
