//! Session lifecycle: create, tiered lookup, close, and expiry sweep.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::{CoordinatorError, Result};
use crate::store::{Cache, Store};
use veilmesh_common::{SessionRecord, SessionStatus};

pub struct SessionStore {
    store: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
    /// Hot tier consulted before cache and store
    memory: DashMap<Uuid, SessionRecord>,
    cache_ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn Cache>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache,
            memory: DashMap::new(),
            cache_ttl,
        }
    }

    /// Create (or idempotently re-create) a session keyed by `session_id`
    pub async fn create(
        &self,
        session_id: Uuid,
        node_id: Uuid,
        client_id: Uuid,
        route_id: Option<String>,
        expires_at: DateTime<Utc>,
        relay_endpoint: Option<String>,
    ) -> Result<SessionRecord> {
        let session = SessionRecord {
            session_id,
            node_id,
            client_id,
            route_id,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            expires_at,
            relay_endpoint,
        };

        self.store.put_session(&session).await?;
        self.memory.insert(session_id, session.clone());
        self.cache.put_session(&session, self.cache_ttl).await;

        counter!("coordinator_sessions_created_total", 1);
        gauge!("coordinator_active_sessions", self.memory.len() as f64);
        info!(
            session_id = %session_id,
            node_id = %node_id,
            client_id = %client_id,
            "Session created"
        );
        Ok(session)
    }

    /// Tiered lookup: memory, cache, then store; hits warm the faster tiers.
    /// Expired records answer NotFound regardless of tier.
    pub async fn get(&self, session_id: Uuid) -> Result<SessionRecord> {
        let now = Utc::now();

        if let Some(session) = self.memory.get(&session_id).map(|e| e.value().clone()) {
            if session.is_expired(now) {
                return Err(CoordinatorError::NotFound(format!(
                    "session {} expired",
                    session_id
                )));
            }
            return Ok(session);
        }

        if let Some(session) = self.cache.get_session(session_id).await {
            if session.is_expired(now) {
                return Err(CoordinatorError::NotFound(format!(
                    "session {} expired",
                    session_id
                )));
            }
            self.memory.insert(session_id, session.clone());
            return Ok(session);
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("session {}", session_id)))?;
        if session.is_expired(now) {
            return Err(CoordinatorError::NotFound(format!(
                "session {} expired",
                session_id
            )));
        }

        self.cache.put_session(&session, self.cache_ttl).await;
        self.memory.insert(session_id, session.clone());
        Ok(session)
    }

    /// Durable status update; the hot tiers follow
    pub async fn update_status(&self, session_id: Uuid, status: SessionStatus) -> Result<()> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("session {}", session_id)))?;

        if session.status == SessionStatus::Closed {
            // Closed is terminal
            return Ok(());
        }

        session.status = status;
        self.store.put_session(&session).await?;

        if status == SessionStatus::Closed {
            self.memory.remove(&session_id);
            self.cache.invalidate_session(session_id).await;
        } else {
            self.memory.insert(session_id, session.clone());
            self.cache.put_session(&session, self.cache_ttl).await;
        }
        Ok(())
    }

    /// Close a session. Closing an already-closed or missing session is a
    /// no-op so relay teardown paths can race safely.
    pub async fn close(&self, session_id: Uuid) -> Result<()> {
        match self.update_status(session_id, SessionStatus::Closed).await {
            Ok(()) => {
                counter!("coordinator_sessions_closed_total", 1);
                gauge!("coordinator_active_sessions", self.memory.len() as f64);
                debug!(session_id = %session_id, "Session closed");
                Ok(())
            }
            Err(CoordinatorError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Sessions currently in the hot tier (attached or recently touched)
    pub fn resident(&self) -> Vec<SessionRecord> {
        self.memory.iter().map(|e| e.value().clone()).collect()
    }

    /// Spawn the expiry sweeper: deletes expired sessions and routes, then
    /// invalidates the evicted ids from the faster tiers.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_once().await;
            }
        })
    }

    /// One expiry pass. Failures are logged, never propagated.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        match self.store.delete_expired_sessions(now).await {
            Ok(expired) => {
                for session_id in &expired {
                    self.memory.remove(session_id);
                    self.cache.invalidate_session(*session_id).await;
                }
                if !expired.is_empty() {
                    info!(count = expired.len(), "Expired sessions swept");
                    counter!("coordinator_sessions_expired_total", expired.len() as u64);
                }
            }
            Err(e) => error!(error = %e, "Session sweep failed"),
        }

        match self.store.delete_expired_routes(now).await {
            Ok(expired) if !expired.is_empty() => {
                debug!(count = expired.len(), "Expired routes swept");
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Route sweep failed"),
        }
    }
}
