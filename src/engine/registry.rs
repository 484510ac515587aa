//! Match Registry
//!
//! Explicit per-match ownership: every match lives behind its own
//! `Arc<RwLock<MatchState>>`, and all joins, moves, timeout checks, and
//! settlement for that match serialize through that lock. Independent matches
//! never contend.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::core::ids::{MatchId, UserId};
use crate::game::state::MatchState;

/// Shared handle to one match's serialized state.
pub type MatchHandle = Arc<RwLock<MatchState>>;

/// Registry of live matches plus a user-to-match index.
pub struct MatchRegistry {
    matches: RwLock<BTreeMap<MatchId, MatchHandle>>,
    user_matches: RwLock<BTreeMap<UserId, MatchId>>,
}

impl MatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            matches: RwLock::new(BTreeMap::new()),
            user_matches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Insert a freshly created match.
    pub async fn insert(&self, state: MatchState) -> MatchHandle {
        let id = state.id;
        let handle = Arc::new(RwLock::new(state));
        let mut matches = self.matches.write().await;
        matches.insert(id, handle.clone());
        handle
    }

    /// Get a match handle by id.
    pub async fn get(&self, id: &MatchId) -> Option<MatchHandle> {
        let matches = self.matches.read().await;
        matches.get(id).cloned()
    }

    /// Get the match a user is currently registered in.
    pub async fn match_of(&self, user: &UserId) -> Option<MatchHandle> {
        let match_id = {
            let user_matches = self.user_matches.read().await;
            user_matches.get(user).copied()
        }?;
        self.get(&match_id).await
    }

    /// Index a user into a match.
    pub async fn register_user(&self, user: UserId, match_id: MatchId) {
        let mut user_matches = self.user_matches.write().await;
        user_matches.insert(user, match_id);
    }

    /// Drop a user's match index entry.
    pub async fn unregister_user(&self, user: &UserId) {
        let mut user_matches = self.user_matches.write().await;
        user_matches.remove(user);
    }

    /// Remove a match from the registry.
    pub async fn remove(&self, id: &MatchId) {
        let mut matches = self.matches.write().await;
        matches.remove(id);
    }

    /// Snapshot of all live match handles.
    pub async fn handles(&self) -> Vec<MatchHandle> {
        let matches = self.matches.read().await;
        matches.values().cloned().collect()
    }

    /// Number of live matches.
    pub async fn len(&self) -> usize {
        let matches = self.matches.read().await;
        matches.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove terminal, settled matches and their user index entries.
    pub async fn cleanup(&self) -> usize {
        let mut to_remove = Vec::new();
        {
            let matches = self.matches.read().await;
            for (id, handle) in matches.iter() {
                let state = handle.read().await;
                if state.status.is_terminal() && state.settled {
                    to_remove.push((*id, state.participants.iter().map(|p| p.user).collect::<Vec<_>>()));
                }
            }
        }

        let removed = to_remove.len();
        for (id, users) in to_remove {
            {
                let mut matches = self.matches.write().await;
                matches.remove(&id);
            }
            let mut user_matches = self.user_matches.write().await;
            for user in users {
                if user_matches.get(&user) == Some(&id) {
                    user_matches.remove(&user);
                }
            }
        }
        removed
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}
