//! Periodic self-checks with automatic remediation.
//!
//! Overall health = NAT enabled AND (routing verifiable OR relay attached).
//! Three consecutive failures trigger recovery: the NAT path is cycled and
//! routing re-verified.

use metrics::{counter, gauge};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::nat::NatManager;
use crate::relay_link::RelayLink;
use crate::shutdown::ShutdownSignal;

pub struct HealthCheck {
    nat: Arc<NatManager>,
    link: Arc<RelayLink>,
    failure_threshold: u32,
    consecutive_failures: AtomicU32,
}

/// One health snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub nat_ok: bool,
    pub routing_ok: bool,
    pub relay_attached: bool,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.nat_ok && (self.routing_ok || self.relay_attached)
    }
}

impl HealthCheck {
    pub fn new(nat: Arc<NatManager>, link: Arc<RelayLink>, failure_threshold: u32) -> Arc<Self> {
        Arc::new(Self {
            nat,
            link,
            failure_threshold,
            consecutive_failures: AtomicU32::new(0),
        })
    }

    /// Compose the sub-checks
    pub async fn check_health(&self) -> HealthReport {
        let nat_ok = self.nat.is_enabled();
        let routing_ok = self.nat.verify().await;
        let relay_attached = self.link.is_attached();

        HealthReport {
            nat_ok,
            routing_ok,
            relay_attached,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Cycle the NAT path and re-verify routing
    pub async fn attempt_recovery(&self) {
        warn!("Attempting automatic recovery");
        counter!("egress_recoveries_attempted_total", 1);

        if let Err(e) = self.nat.disable().await {
            warn!(error = %e, "NAT disable during recovery failed");
        }
        if let Err(e) = self.nat.enable().await {
            error!(error = %e, "NAT re-enable during recovery failed");
            return;
        }
        if self.nat.verify().await {
            info!("Recovery restored the forwarding path");
            self.consecutive_failures.store(0, Ordering::Release);
        } else {
            warn!("Recovery did not restore routing");
        }
    }

    /// One check cycle with the three-strikes recovery policy
    pub async fn run_once(&self) -> HealthReport {
        let report = self.check_health().await;
        gauge!(
            "egress_healthy",
            if report.healthy() { 1.0 } else { 0.0 }
        );

        if report.healthy() {
            self.consecutive_failures.store(0, Ordering::Release);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
            warn!(
                failures,
                nat = report.nat_ok,
                routing = report.routing_ok,
                relay = report.relay_attached,
                "Health check failed"
            );
            counter!("egress_health_failures_total", 1);

            if failures >= self.failure_threshold {
                self.attempt_recovery().await;
            }
        }
        report
    }

    /// Spawn the periodic checker
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.is_requested() {
                    break;
                }
                self.run_once().await;
            }
        })
    }
}
