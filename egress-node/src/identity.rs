//! Long-term node identity: a stable node id and an opaque key pair.
//!
//! The VPN handshake itself happens outside this process; the key pair here
//! is the identity material advertised to the coordinator. It is loaded from
//! disk when present and generated once otherwise.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

use crate::error::{EgressError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: Uuid,
    pub private_key: String,
    pub public_key: String,
}

impl NodeIdentity {
    /// Generate a fresh identity
    pub fn generate(node_id: Option<Uuid>) -> Self {
        let mut private = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut private);

        let mut hasher = Sha256::new();
        hasher.update(private);
        let public = hasher.finalize();

        Self {
            node_id: node_id.unwrap_or_else(Uuid::new_v4),
            private_key: BASE64.encode(private),
            public_key: BASE64.encode(public),
        }
    }

    /// Load the identity from `path`, generating and persisting one when the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path, node_id: Option<Uuid>) -> Result<Self> {
        if path.exists() {
            let text = std::fs::read_to_string(path)?;
            let identity: NodeIdentity = toml::from_str(&text)
                .map_err(|e| EgressError::Identity(format!("unreadable identity file: {}", e)))?;
            info!(node_id = %identity.node_id, "Loaded node identity");
            return Ok(identity);
        }

        let identity = Self::generate(node_id);
        let text = toml::to_string_pretty(&identity)
            .map_err(|e| EgressError::Identity(e.to_string()))?;
        std::fs::write(path, text)?;
        info!(node_id = %identity.node_id, path = %path.display(), "Generated node identity");
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_is_unique() {
        let a = NodeIdentity::generate(None);
        let b = NodeIdentity::generate(None);
        assert_ne!(a.node_id, b.node_id);
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.public_key, b.public_key);
    }

    #[test]
    fn test_fixed_node_id_respected() {
        let node_id = Uuid::new_v4();
        let identity = NodeIdentity::generate(Some(node_id));
        assert_eq!(identity.node_id, node_id);
    }

    #[test]
    fn test_load_or_generate_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");

        let first = NodeIdentity::load_or_generate(&path, None).unwrap();
        let second = NodeIdentity::load_or_generate(&path, None).unwrap();

        assert_eq!(first.node_id, second.node_id);
        assert_eq!(first.private_key, second.private_key);
    }

    #[test]
    fn test_corrupt_identity_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, "not valid toml [").unwrap();

        let err = NodeIdentity::load_or_generate(&path, None).unwrap_err();
        assert!(matches!(err, EgressError::Identity(_)));
    }
}
