//! In-memory guard against dispatching the same record twice.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::RecordId;

/// Records currently owned by an upload or resolution, shared by the full
/// run and quick syncs.
#[derive(Debug, Clone, Default)]
pub struct ClaimSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`, or `None` if someone else holds it.
    pub fn try_claim(&self, id: &RecordId) -> Option<ItemClaim> {
        let key = id.as_str().to_string();
        if self.inner.lock().insert(key.clone()) {
            Some(ItemClaim {
                set: Arc::clone(&self.inner),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_claimed(&self, id: &RecordId) -> bool {
        self.inner.lock().contains(id.as_str())
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct ItemClaim {
    set: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ItemClaim {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}
