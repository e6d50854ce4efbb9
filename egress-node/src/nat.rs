//! OS-level NAT and forwarding control.
//!
//! On Linux this drives `sysctl` and `iptables` for the masquerade path the
//! gateway depends on. Everywhere else the operations are no-ops so the rest
//! of the agent stays testable.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

use crate::error::Result;

pub struct NatManager {
    interface: String,
    /// Configuration skipped: verification reports enabled unconditionally
    skip_setup: bool,
    enabled: AtomicBool,
}

impl NatManager {
    pub fn new(interface: &str, skip_setup: bool) -> Self {
        Self {
            interface: interface.to_string(),
            skip_setup,
            enabled: AtomicBool::new(false),
        }
    }

    /// Enable IP forwarding and the masquerade rule. Startup treats a
    /// failure here as fatal.
    pub async fn enable(&self) -> Result<()> {
        if self.skip_setup {
            info!("NAT setup skipped by configuration");
            self.enabled.store(true, Ordering::Release);
            return Ok(());
        }

        self.enable_os().await?;
        self.enabled.store(true, Ordering::Release);
        info!(interface = %self.interface, "NAT and forwarding enabled");
        Ok(())
    }

    /// Tear the masquerade rule down (recovery path)
    pub async fn disable(&self) -> Result<()> {
        if !self.skip_setup {
            self.disable_os().await?;
        }
        self.enabled.store(false, Ordering::Release);
        info!("NAT disabled");
        Ok(())
    }

    /// Whether the forwarding path is currently believed healthy
    pub async fn verify(&self) -> bool {
        if self.skip_setup {
            return self.enabled.load(Ordering::Acquire);
        }
        self.verify_os().await
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[cfg(target_os = "linux")]
    async fn enable_os(&self) -> Result<()> {
        use crate::error::EgressError;
        use tokio::process::Command;

        let sysctl = Command::new("sysctl")
            .args(["-w", "net.ipv4.ip_forward=1"])
            .output()
            .await?;
        if !sysctl.status.success() {
            return Err(EgressError::Nat(format!(
                "sysctl failed: {}",
                String::from_utf8_lossy(&sysctl.stderr)
            )));
        }

        // Idempotent: check before append
        let check = Command::new("iptables")
            .args([
                "-t", "nat", "-C", "POSTROUTING", "-o", &self.interface, "-j", "MASQUERADE",
            ])
            .output()
            .await?;
        if !check.status.success() {
            let append = Command::new("iptables")
                .args([
                    "-t", "nat", "-A", "POSTROUTING", "-o", &self.interface, "-j", "MASQUERADE",
                ])
                .output()
                .await?;
            if !append.status.success() {
                return Err(EgressError::Nat(format!(
                    "iptables masquerade failed: {}",
                    String::from_utf8_lossy(&append.stderr)
                )));
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn disable_os(&self) -> Result<()> {
        use tokio::process::Command;

        let delete = Command::new("iptables")
            .args([
                "-t", "nat", "-D", "POSTROUTING", "-o", &self.interface, "-j", "MASQUERADE",
            ])
            .output()
            .await?;
        if !delete.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&delete.stderr),
                "Masquerade rule removal failed"
            );
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    async fn verify_os(&self) -> bool {
        use tokio::process::Command;

        let forwarding = tokio::fs::read_to_string("/proc/sys/net/ipv4/ip_forward")
            .await
            .map(|text| text.trim() == "1")
            .unwrap_or(false);
        if !forwarding {
            return false;
        }

        Command::new("iptables")
            .args([
                "-t", "nat", "-C", "POSTROUTING", "-o", &self.interface, "-j", "MASQUERADE",
            ])
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    async fn enable_os(&self) -> Result<()> {
        warn!("NAT configuration is Linux-only; continuing without it");
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn disable_os(&self) -> Result<()> {
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    async fn verify_os(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_skip_setup_lifecycle() {
        let nat = NatManager::new("eth0", true);
        assert!(!nat.is_enabled());
        assert!(!nat.verify().await);

        nat.enable().await.unwrap();
        assert!(nat.is_enabled());
        assert!(nat.verify().await);

        nat.disable().await.unwrap();
        assert!(!nat.is_enabled());
        assert!(!nat.verify().await);
    }
}
