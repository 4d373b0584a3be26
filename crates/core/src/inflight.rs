//! Per-request exclusion for decisions that span an await.
//!
//! Approving a request reseals records before the decision is written. While that runs, a
//! second decision on the same request (a deny, a second approve) must not interleave. Holding an
//! [`InFlightGuard`] marks the request busy; the mark is process-local and never persisted.

use crate::error::{ConsentError, ConsentResult};
use std::collections::HashSet;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Mutex;

#[derive(Debug)]
pub(crate) struct InFlight<K> {
    keys: Mutex<HashSet<K>>,
}

impl<K> Default for InFlight<K> {
    fn default() -> Self {
        Self {
            keys: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Eq + Hash + Clone + Display> InFlight<K> {
    /// Mark `key` busy until the returned guard drops.
    ///
    /// # Errors
    ///
    /// [`ConsentError::RequestBusy`] if another caller holds the key.
    pub(crate) fn acquire(&self, key: K) -> ConsentResult<InFlightGuard<'_, K>> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| ConsentError::LockPoisoned("in-flight requests"))?;
        if !keys.insert(key.clone()) {
            return Err(ConsentError::RequestBusy(key.to_string()));
        }
        Ok(InFlightGuard { owner: self, key })
    }
}

pub(crate) struct InFlightGuard<'a, K: Eq + Hash> {
    owner: &'a InFlight<K>,
    key: K,
}

impl<K: Eq + Hash> Drop for InFlightGuard<'_, K> {
    fn drop(&mut self) {
        let mut keys = match self.owner.keys.lock() {
            Ok(keys) => keys,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_refused_until_release() {
        let inflight: InFlight<String> = InFlight::default();
        let guard = inflight.acquire("r1".to_string()).unwrap();
        assert!(matches!(
            inflight.acquire("r1".to_string()),
            Err(ConsentError::RequestBusy(_))
        ));
        assert!(inflight.acquire("r2".to_string()).is_ok());
        drop(guard);
        assert!(inflight.acquire("r1".to_string()).is_ok());
    }
}
