//! Friend-graph implementations.

use crate::traits::FriendGraph;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;

/// In-memory, symmetric friend graph.
#[derive(Default)]
pub struct StaticFriendGraph {
    edges: DashMap<String, HashSet<String>>,
}

impl StaticFriendGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutual friendship.
    pub fn befriend(&self, a: &str, b: &str) {
        self.edges
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.edges
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }
}

#[async_trait]
impl FriendGraph for StaticFriendGraph {
    async fn friends_of(&self, identity_id: &str) -> HashSet<String> {
        self.edges
            .get(identity_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}
