//! A single upstream endpoint.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Observable health of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BackendState {
    Healthy = 1,
    Unhealthy = 2,
}

impl BackendState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => BackendState::Healthy,
            _ => BackendState::Unhealthy,
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendState::Healthy => write!(f, "HEALTHY"),
            BackendState::Unhealthy => write!(f, "UNHEALTHY"),
        }
    }
}

/// An upstream TCP endpoint the proxy may forward to.
///
/// State and the active-connection count are plain atomics so that the
/// monitor, the load balancer, and every connection handler can touch
/// them without locking.
#[derive(Debug)]
pub struct Backend {
    addr: String,
    state: AtomicU32,
    active_conns: AtomicU64,
}

impl Backend {
    pub fn new(addr: impl Into<String>, state: BackendState) -> Self {
        Self {
            addr: addr.into(),
            state: AtomicU32::new(state as u32),
            active_conns: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> BackendState {
        BackendState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Set the state, returning whether the value changed.
    pub fn set_state(&self, state: BackendState) -> bool {
        let prev = self.state.swap(state as u32, Ordering::AcqRel);
        prev != state as u32
    }

    /// Increment the active-connection count, returning the new value.
    pub fn incr_active_conns(&self) -> u64 {
        self.active_conns.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement the active-connection count, returning the new value.
    /// Every increment must be paired with exactly one decrement.
    pub fn decr_active_conns(&self) -> u64 {
        self.active_conns.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn active_conns(&self) -> u64 {
        self.active_conns.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_state_reports_change() {
        let backend = Backend::new("127.0.0.1:8001", BackendState::Healthy);

        assert_eq!(backend.state(), BackendState::Healthy);
        assert!(!backend.set_state(BackendState::Healthy));
        assert!(backend.set_state(BackendState::Unhealthy));
        assert_eq!(backend.state(), BackendState::Unhealthy);
        assert!(!backend.set_state(BackendState::Unhealthy));
    }

    #[test]
    fn test_active_conns_counting() {
        let backend = Backend::new("127.0.0.1:8001", BackendState::Healthy);

        assert_eq!(backend.active_conns(), 0);
        assert_eq!(backend.incr_active_conns(), 1);
        assert_eq!(backend.incr_active_conns(), 2);
        assert_eq!(backend.decr_active_conns(), 1);
        assert_eq!(backend.decr_active_conns(), 0);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(BackendState::Healthy.to_string(), "HEALTHY");
        assert_eq!(BackendState::Unhealthy.to_string(), "UNHEALTHY");
    }
}
