//! Handshake authentication gate.
//!
//! A single chokepoint in front of the session router: extract the bearer
//! credential, verify it, and enforce the per-identity connection cap. The
//! gateway never issues or refreshes tokens.

use crate::client::ConnectionRegistry;
use axum::http::HeaderMap;
use common::{ErrorCode, Identity};
use external_services::{ProviderError, TokenVerifier};
use std::sync::Arc;
use tracing::debug;

/// Handshake rejection, mapped straight onto the wire taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDenied {
    /// Credential absent or structurally malformed.
    Required,
    /// Bad signature or expired.
    Invalid,
    /// The identity already holds its connection quota.
    TooManyConnections,
}

impl AuthDenied {
    pub fn wire_code(self) -> ErrorCode {
        match self {
            AuthDenied::Required => ErrorCode::AuthRequired,
            AuthDenied::Invalid => ErrorCode::AuthInvalid,
            AuthDenied::TooManyConnections => ErrorCode::TooManyConnections,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            AuthDenied::Required => "authentication required",
            AuthDenied::Invalid => "invalid or expired credential",
            AuthDenied::TooManyConnections => "connection limit reached for this account",
        }
    }
}

pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
    max_connections_per_identity: usize,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>, max_connections_per_identity: usize) -> Self {
        Self {
            verifier,
            max_connections_per_identity,
        }
    }

    /// Verify the handshake credential and enforce the connection cap.
    pub async fn authenticate(
        &self,
        registry: &ConnectionRegistry,
        token: Option<&str>,
    ) -> Result<Identity, AuthDenied> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthDenied::Required)?;

        let identity = self.verifier.verify(token).await.map_err(|err| {
            debug!(%err, "token verification failed");
            match err {
                ProviderError::CredentialMalformed => AuthDenied::Required,
                _ => AuthDenied::Invalid,
            }
        })?;

        if registry.sockets_of(&identity.id).len() >= self.max_connections_per_identity {
            return Err(AuthDenied::TooManyConnections);
        }
        Ok(identity)
    }
}

/// Bearer extraction: `?token=` query parameter first, then the
/// `Authorization: Bearer` header.
pub fn extract_token(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=") {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}
