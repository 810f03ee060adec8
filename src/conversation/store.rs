//! `ConversationStateStore`: per-user state with an explicit lifecycle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::conversation::state::{ConversationState, FlowData, Step, SubState};
use crate::error::DatabaseError;

/// Partial update applied atomically by [`ConversationStateStore::update`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatePatch {
    pub step: Option<Step>,
    pub sub_state: Option<SubState>,
    /// Fields to overlay on the stored data.
    pub data: Option<FlowData>,
    /// Drop stored data before overlaying `data`.
    pub replace_data: bool,
}

impl StatePatch {
    pub fn apply(self, state: &mut ConversationState) {
        if let Some(step) = self.step {
            state.step = step;
        }
        if let Some(sub_state) = self.sub_state {
            state.sub_state = sub_state;
        }
        if self.replace_data {
            state.data = FlowData::new();
        }
        if let Some(data) = self.data {
            state.data.merge(data);
        }
        state.touch();
    }
}

/// Per-user conversation state storage.
///
/// `get` never returns a state that has been cleared or has gone stale.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>, DatabaseError>;

    /// Create or replace the user's state.
    async fn set(&self, user_id: &str, state: ConversationState) -> Result<(), DatabaseError>;

    /// Apply `patch` to the stored state in one step. Returns the new state,
    /// or `None` if the user has no live state.
    async fn update(
        &self,
        user_id: &str,
        patch: StatePatch,
    ) -> Result<Option<ConversationState>, DatabaseError>;

    async fn clear(&self, user_id: &str) -> Result<(), DatabaseError>;

    /// Remove every state idle past the TTL. Returns how many were removed.
    async fn purge_stale(&self) -> Result<usize, DatabaseError>;
}

/// HashMap-backed store with idle expiry.
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, ConversationState>>,
    ttl: Duration,
}

impl InMemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl ConversationStateStore for InMemoryStateStore {
    async fn get(&self, user_id: &str) -> Result<Option<ConversationState>, DatabaseError> {
        {
            let states = self.states.read().await;
            match states.get(user_id) {
                None => return Ok(None),
                Some(state) if !state.is_stale(self.ttl, Utc::now()) => {
                    return Ok(Some(state.clone()));
                }
                Some(_) => {}
            }
        }
        let mut states = self.states.write().await;
        if let Some(state) = states.get(user_id)
            && state.is_stale(self.ttl, Utc::now())
        {
            debug!(user_id = %user_id, flow = %state.flow, "Dropping stale conversation");
            states.remove(user_id);
            return Ok(None);
        }
        Ok(states.get(user_id).cloned())
    }

    async fn set(&self, user_id: &str, mut state: ConversationState) -> Result<(), DatabaseError> {
        state.user_id = user_id.to_string();
        state.touch();
        self.states.write().await.insert(user_id.to_string(), state);
        Ok(())
    }

    async fn update(
        &self,
        user_id: &str,
        patch: StatePatch,
    ) -> Result<Option<ConversationState>, DatabaseError> {
        let mut states = self.states.write().await;
        let stale = match states.get(user_id) {
            None => return Ok(None),
            Some(state) => state.is_stale(self.ttl, Utc::now()),
        };
        if stale {
            states.remove(user_id);
            return Ok(None);
        }
        let Some(state) = states.get_mut(user_id) else {
            return Ok(None);
        };
        patch.apply(state);
        Ok(Some(state.clone()))
    }

    async fn clear(&self, user_id: &str) -> Result<(), DatabaseError> {
        self.states.write().await.remove(user_id);
        Ok(())
    }

    async fn purge_stale(&self) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| !s.is_stale(self.ttl, now));
        Ok(before - states.len())
    }
}

/// Spawn a background task that periodically purges abandoned conversations.
pub fn spawn_sweep_task(
    store: Arc<dyn ConversationStateStore>,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match store.purge_stale().await {
                Ok(0) => {}
                Ok(n) => info!(purged = n, "Purged abandoned conversations"),
                Err(e) => warn!("Conversation sweep failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::conversation::state::{FieldValue, FlowName};

    fn browse_state(user: &str) -> ConversationState {
        ConversationState::new(user, FlowName::Browse, Step::CollectingCriteria)
    }

    #[tokio::test]
    async fn get_after_clear_is_absent() {
        let store = InMemoryStateStore::new(Duration::from_secs(600));
        store.set("u1", browse_state("u1")).await.unwrap();
        assert!(store.get("u1").await.unwrap().is_some());
        store.clear("u1").await.unwrap();
        assert!(store.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_merges_data_and_moves_step() {
        let store = InMemoryStateStore::new(Duration::from_secs(600));
        let mut state = browse_state("u1");
        state.data.insert("brand", FieldValue::Text("Tata".into()));
        store.set("u1", state).await.unwrap();

        let mut data = FlowData::new();
        data.insert("budget", FieldValue::Amount(dec!(800000)));
        let updated = store
            .update(
                "u1",
                StatePatch {
                    step: Some(Step::ShowingResults),
                    sub_state: Some(SubState::None),
                    data: Some(data),
                    replace_data: false,
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.step, Step::ShowingResults);
        assert_eq!(updated.sub_state, SubState::None);
        assert_eq!(updated.data.text("brand"), Some("Tata"));
        assert_eq!(updated.data.amount("budget"), Some(dec!(800000)));
    }

    #[tokio::test]
    async fn update_without_state_is_none() {
        let store = InMemoryStateStore::new(Duration::from_secs(600));
        let result = store.update("ghost", StatePatch::default()).await.unwrap();
        assert!(result.is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn stale_state_reads_as_absent() {
        let store = InMemoryStateStore::new(Duration::from_secs(60));
        store.set("u1", browse_state("u1")).await.unwrap();
        {
            let mut states = store.states.write().await;
            let s = states.get_mut("u1").unwrap();
            s.last_activity = Utc::now() - chrono::Duration::minutes(10);
        }
        assert!(store.get("u1").await.unwrap().is_none());
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn purge_removes_only_stale() {
        let store = InMemoryStateStore::new(Duration::from_secs(60));
        store.set("fresh", browse_state("fresh")).await.unwrap();
        store.set("old", browse_state("old")).await.unwrap();
        {
            let mut states = store.states.write().await;
            states.get_mut("old").unwrap().last_activity = Utc::now() - chrono::Duration::hours(1);
        }
        assert_eq!(store.purge_stale().await.unwrap(), 1);
        assert!(store.get("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_updates_are_not_lost() {
        let store = Arc::new(InMemoryStateStore::new(Duration::from_secs(600)));
        store.set("u1", browse_state("u1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut data = FlowData::new();
                data.insert(format!("field_{i}"), FieldValue::Integer(i));
                store
                    .update(
                        "u1",
                        StatePatch {
                            data: Some(data),
                            ..Default::default()
                        },
                    )
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let state = store.get("u1").await.unwrap().unwrap();
        assert_eq!(state.data.len(), 20);
    }
}
