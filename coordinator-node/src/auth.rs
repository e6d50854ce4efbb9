//! Bearer session tokens.
//!
//! Tokens are `subject.expiry.nonce.mac` where the MAC is SHA-256 over the
//! secret and the first three fields. Verification is subject-bound, so a
//! token minted for one node never authorizes another.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64URL, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub struct TokenAuthority {
    secret: Vec<u8>,
    expiry_seconds: i64,
}

impl TokenAuthority {
    pub fn new(secret: &str, expiry_seconds: u64) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            expiry_seconds: expiry_seconds as i64,
        }
    }

    fn mac(&self, subject: Uuid, expiry: i64, nonce: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(subject.as_bytes());
        hasher.update(expiry.to_be_bytes());
        hasher.update(nonce.as_bytes());
        BASE64URL.encode(hasher.finalize())
    }

    /// Mint a token for `subject`, returning it with its expiry instant
    pub fn mint(&self, subject: Uuid) -> (String, DateTime<Utc>) {
        let expiry = Utc::now().timestamp() + self.expiry_seconds;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = BASE64URL.encode(nonce_bytes);

        let mac = self.mac(subject, expiry, &nonce);
        let token = format!("{}.{}.{}.{}", subject, expiry, nonce, mac);
        let expires_at = Utc
            .timestamp_opt(expiry, 0)
            .single()
            .unwrap_or_else(Utc::now);
        (token, expires_at)
    }

    /// Verify a token against the subject it must have been minted for
    pub fn verify(&self, subject: Uuid, token: &str) -> bool {
        let mut parts = token.splitn(4, '.');
        let (Some(sub), Some(exp), Some(nonce), Some(mac)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return false;
        };

        let Ok(token_subject) = sub.parse::<Uuid>() else {
            return false;
        };
        let Ok(expiry) = exp.parse::<i64>() else {
            return false;
        };

        if token_subject != subject || expiry < Utc::now().timestamp() {
            return false;
        }

        constant_time_eq(self.mac(subject, expiry, nonce).as_bytes(), mac.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_then_verify() {
        let authority = TokenAuthority::new("secret", 3600);
        let subject = Uuid::new_v4();
        let (token, expires_at) = authority.mint(subject);

        assert!(authority.verify(subject, &token));
        assert!(expires_at > Utc::now());
    }

    #[test]
    fn test_wrong_subject_rejected() {
        let authority = TokenAuthority::new("secret", 3600);
        let (token, _) = authority.mint(Uuid::new_v4());
        assert!(!authority.verify(Uuid::new_v4(), &token));
    }

    #[test]
    fn test_expired_token_rejected() {
        let authority = TokenAuthority::new("secret", 0);
        let subject = Uuid::new_v4();
        let (token, _) = authority.mint(subject);
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(!authority.verify(subject, &token));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let authority = TokenAuthority::new("secret", 3600);
        let subject = Uuid::new_v4();
        let (token, _) = authority.mint(subject);

        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(!authority.verify(subject, &tampered));

        assert!(!authority.verify(subject, "garbage"));
        assert!(!authority.verify(subject, ""));
    }

    #[test]
    fn test_different_secret_rejected() {
        let minting = TokenAuthority::new("secret-a", 3600);
        let verifying = TokenAuthority::new("secret-b", 3600);
        let subject = Uuid::new_v4();
        let (token, _) = minting.mint(subject);
        assert!(!verifying.verify(subject, &token));
    }
}
