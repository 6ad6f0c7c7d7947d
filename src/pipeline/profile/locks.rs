use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per user id. Writers for different users never contend.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, user_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(lock) = locks.get(user_id) {
            return Arc::clone(lock);
        }
        // Entries nobody holds or waits on can go.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = Arc::new(AsyncMutex::new(()));
        locks.insert(user_id.to_string(), Arc::clone(&lock));
        lock
    }

    /// Wait for exclusive access to `user_id`'s profile.
    pub async fn acquire(&self, user_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(user_id).lock_owned().await
    }

    pub fn tracked(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }
}
