//! Session ID generation for connection tracing.
//!
//! Tags every proxied connection with a process-local identifier so a
//! session can be followed through the logs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter backing session IDs.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identifier for one proxied connection.
///
/// Unique within a single process; format `conn-{counter}` with the
/// counter in zero-padded hex.
#[derive(Clone, Debug)]
pub struct SessionId(String);

impl SessionId {
    /// Allocate the next session ID.
    pub fn next() -> Self {
        let count = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("conn-{:08x}", count))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_ids_are_unique() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = SessionId::next();
            assert!(ids.insert(id.as_str().to_string()), "duplicate ID generated");
        }
    }

    #[test]
    fn test_session_id_format() {
        let id = SessionId::next();
        assert!(id.as_str().starts_with("conn-"));
        assert_eq!(format!("{}", id), id.as_str());
    }
}
