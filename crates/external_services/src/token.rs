//! HMAC bearer-token verifier.
//!
//! Token format: `v1.<base64url payload>.<base64url HMAC-SHA256 signature>`
//! where the payload is a JSON claims object. The signature covers the
//! base64url payload bytes. Comparison is constant-time.

use crate::error::{ProviderError, Result};
use crate::traits::TokenVerifier;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use common::{Identity, Role};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Deserialize)]
struct Claims {
    /// Stable user id.
    sub: String,
    /// Display name.
    name: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    /// Expiry, seconds since the epoch.
    exp: u64,
}

/// Verifies `v1` HMAC-SHA256 tokens with a shared secret.
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn sign(&self, payload_b64: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret).expect("hmac key");
        mac.update(payload_b64);
        mac.finalize().into_bytes().to_vec()
    }

    /// Mint a token for the given claims. Used by tests and the dev tooling;
    /// production tokens are issued by the account service with the same
    /// shape.
    pub fn mint(&self, sub: &str, name: &str, role: &str, ttl_secs: u64) -> String {
        let exp = now_secs() + ttl_secs;
        let payload = serde_json::json!({
            "sub": sub,
            "name": name,
            "role": role,
            "exp": exp,
        });
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string());
        let sig = self.sign(payload_b64.as_bytes());
        format!("v1.{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(sig))
    }
}

#[async_trait]
impl TokenVerifier for HmacTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<Identity> {
        let parts: Vec<&str> = bearer.split('.').collect();
        if parts.len() != 3 || parts[0] != "v1" {
            return Err(ProviderError::CredentialMalformed);
        }

        let payload_b64 = parts[1];
        let provided_sig = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| ProviderError::CredentialMalformed)?;
        let expected_sig = self.sign(payload_b64.as_bytes());

        if !constant_time_eq(&expected_sig, &provided_sig) {
            return Err(ProviderError::CredentialRejected(
                "invalid signature".to_string(),
            ));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| ProviderError::CredentialMalformed)?;
        let claims: Claims = serde_json::from_slice(&payload)?;

        if claims.exp <= now_secs() {
            return Err(ProviderError::CredentialRejected("expired".to_string()));
        }

        Ok(Identity {
            id: claims.sub,
            username: claims.name,
            role: claims
                .role
                .as_deref()
                .map(Role::from_claim)
                .unwrap_or_default(),
            avatar: claims.avatar,
        })
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_round_trip() {
        let verifier = HmacTokenVerifier::new(b"test-secret".to_vec());
        let token = verifier.mint("u1", "alice", "user", 60);
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.id, "u1");
        assert_eq!(identity.username, "alice");
        assert_eq!(identity.role, Role::User);
    }

    #[tokio::test]
    async fn test_rejects_wrong_secret() {
        let minter = HmacTokenVerifier::new(b"secret-a".to_vec());
        let verifier = HmacTokenVerifier::new(b"secret-b".to_vec());
        let token = minter.mint("u1", "alice", "user", 60);
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_expired() {
        let verifier = HmacTokenVerifier::new(b"test-secret".to_vec());
        let token = verifier.mint("u1", "alice", "user", 0);
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, ProviderError::CredentialRejected(_)));
    }

    #[tokio::test]
    async fn test_rejects_malformed() {
        let verifier = HmacTokenVerifier::new(b"test-secret".to_vec());
        assert!(verifier.verify("not-a-token").await.is_err());
        assert!(verifier.verify("v2.abc.def").await.is_err());
        assert!(verifier.verify("").await.is_err());
    }

    #[tokio::test]
    async fn test_admin_role_claim() {
        let verifier = HmacTokenVerifier::new(b"test-secret".to_vec());
        let token = verifier.mint("u2", "bob", "admin", 60);
        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.role, Role::Admin);
    }
}
