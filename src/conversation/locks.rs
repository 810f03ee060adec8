//! Keyed mutex serializing message handling per user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Entries above this count trigger a prune of idle locks.
const PRUNE_THRESHOLD: usize = 1024;

/// One async mutex per user id. Distinct users never contend.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `user_id`. Released when the guard drops.
    pub async fn lock(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, l| Arc::strong_count(l) > 1);
            }
            Arc::clone(locks.entry(user_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
