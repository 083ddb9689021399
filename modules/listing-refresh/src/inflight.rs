use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use listing_common::PropertyId;

/// Properties with a reconciliation currently running in this process.
///
/// At most one guard exists per property at any time; the entry is removed
/// when the guard drops, however the reconciliation ended.
#[derive(Clone, Default)]
pub struct InFlightSet {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    ids: Mutex<HashSet<PropertyId>>,
    released: Notify,
}

impl Inner {
    fn ids(&self) -> MutexGuard<'_, HashSet<PropertyId>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` if nobody holds it.
    pub fn try_acquire(&self, id: PropertyId) -> Option<InFlightGuard> {
        if self.inner.ids().insert(id) {
            Some(InFlightGuard {
                id,
                inner: Arc::clone(&self.inner),
            })
        } else {
            None
        }
    }

    /// Claim `id`, waiting for the current holder to finish.
    pub async fn acquire(&self, id: PropertyId) -> InFlightGuard {
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(guard) = self.try_acquire(id) {
                return guard;
            }
            released.await;
        }
    }

    pub fn contains(&self, id: PropertyId) -> bool {
        self.inner.ids().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InFlightGuard {
    id: PropertyId,
    inner: Arc<Inner>,
}

impl InFlightGuard {
    pub fn id(&self) -> PropertyId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.ids().remove(&self.id);
        self.inner.released.notify_waiters();
    }
}
