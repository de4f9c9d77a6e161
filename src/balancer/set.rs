//! Shared healthy-set maintenance for load-balancing policies.

use crate::backend::{Backend, BackendState, Update};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// The subset of backends currently eligible for selection.
///
/// An ordered list plus an address-to-index map, so membership updates
/// are O(1) via swap-with-last removal. An address is in the map iff its
/// backend is in the list.
#[derive(Default)]
pub(crate) struct HealthySet {
    inner: RwLock<HealthyList>,
}

#[derive(Default)]
struct HealthyList {
    list: Vec<Arc<Backend>>,
    index: HashMap<String, usize>,
}

impl HealthySet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply a registry update to the membership.
    ///
    /// Re-reported states are no-ops, so delivery is idempotent.
    pub(crate) fn apply(&self, update: &Update) {
        match update {
            Update::Joined(backend) | Update::Health(backend) => {
                self.apply_state(backend, backend.state())
            }
            Update::Removed(backend) => {
                // The backend is gone no matter what state it carried.
                if self.remove(backend.addr()) {
                    info!(backend = %backend.addr(), "loadbalancer: removed departed backend");
                }
            }
        }
    }

    fn apply_state(&self, backend: &Arc<Backend>, state: BackendState) {
        match state {
            BackendState::Healthy => {
                let mut inner = self.inner.write();
                if !inner.index.contains_key(backend.addr()) {
                    info!(backend = %backend.addr(), "loadbalancer: added HEALTHY backend");
                    inner.list.push(Arc::clone(backend));
                    let idx = inner.list.len() - 1;
                    inner.index.insert(backend.addr().to_string(), idx);
                }
            }
            BackendState::Unhealthy => {
                if self.remove(backend.addr()) {
                    info!(backend = %backend.addr(), "loadbalancer: removed UNHEALTHY backend");
                }
            }
        }
    }

    fn remove(&self, addr: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(idx) = inner.index.remove(addr) else {
            return false;
        };
        inner.list.swap_remove(idx);
        if idx < inner.list.len() {
            let moved = inner.list[idx].addr().to_string();
            inner.index.insert(moved, idx);
        }
        true
    }

    /// Run `pick` against the current membership under the read lock.
    pub(crate) fn with_list<T>(&self, pick: impl FnOnce(&[Arc<Backend>]) -> T) -> T {
        let inner = self.inner.read();
        pick(&inner.list)
    }

    #[cfg(test)]
    pub(crate) fn addrs(&self) -> Vec<String> {
        self.inner
            .read()
            .list
            .iter()
            .map(|b| b.addr().to_string())
            .collect()
    }
}
