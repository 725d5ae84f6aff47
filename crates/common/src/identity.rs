//! Authenticated identity model.
//!
//! Identities are produced by the token verifier on connect and are
//! read-only inside the engine.

use serde::{Deserialize, Serialize};

/// Capability level carried by a verified token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Moderator,
    Admin,
}

impl Role {
    /// Parse a role claim, falling back to the lowest capability.
    pub fn from_claim(claim: &str) -> Self {
        match claim {
            "admin" => Role::Admin,
            "moderator" => Role::Moderator,
            _ => Role::User,
        }
    }
}

/// A stable, verified user identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user id (opaque string, assigned by the account system).
    pub id: String,
    /// Display name.
    pub username: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Identity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            role: Role::User,
            avatar: None,
        }
    }
}

/// Self-reported presence shown to friends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
    /// Appears offline to friends; no presence events are emitted.
    Invisible,
}

impl PresenceStatus {
    /// Whether friends should see this user as reachable.
    pub fn visible(self) -> bool {
        !matches!(self, PresenceStatus::Invisible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_from_claim() {
        assert_eq!(Role::from_claim("admin"), Role::Admin);
        assert_eq!(Role::from_claim("moderator"), Role::Moderator);
        assert_eq!(Role::from_claim("user"), Role::User);
        assert_eq!(Role::from_claim("garbage"), Role::User);
    }

    #[test]
    fn test_invisible_is_not_visible() {
        assert!(PresenceStatus::Online.visible());
        assert!(PresenceStatus::Away.visible());
        assert!(!PresenceStatus::Invisible.visible());
    }
}
