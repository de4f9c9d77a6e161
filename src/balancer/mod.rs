//! Load balancing over the healthy backend set.
//!
//! Policies share membership maintenance (driven by registry updates)
//! and differ only in how they pick the next backend.

mod p2c;
mod random;
mod set;

pub use p2c::P2C;
pub use random::Random;

use crate::backend::{Backend, Update};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no healthy backends available")]
    NoHealthyBackends,
}

/// A load-balancing policy.
pub trait LoadBalancer: Send + Sync {
    /// Push a backend-set change into the policy's membership.
    fn update_backend(&self, update: &Update);

    /// Pick a backend for a new connection.
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError>;
}

/// Selection policy, as named on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Random,
    P2C,
}

impl Policy {
    /// Build the load balancer implementing this policy.
    pub fn build(self) -> Arc<dyn LoadBalancer> {
        match self {
            Policy::Random => Arc::new(Random::new()),
            Policy::P2C => Arc::new(P2C::new()),
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Random => write!(f, "RANDOM"),
            Policy::P2C => write!(f, "P2C"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid load balancer policy '{0}'")]
pub struct ParsePolicyError(String);

impl FromStr for Policy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RANDOM" => Ok(Policy::Random),
            "P2C" => Ok(Policy::P2C),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("RANDOM".parse::<Policy>().unwrap(), Policy::Random);
        assert_eq!("P2C".parse::<Policy>().unwrap(), Policy::P2C);
    }

    #[test]
    fn test_policy_parse_is_case_sensitive() {
        assert!("p2c".parse::<Policy>().is_err());
        assert!("random".parse::<Policy>().is_err());
        assert!("LEAST_CONN".parse::<Policy>().is_err());
    }

    #[test]
    fn test_policy_display_round_trips() {
        for policy in [Policy::Random, Policy::P2C] {
            assert_eq!(policy.to_string().parse::<Policy>().unwrap(), policy);
        }
    }
}
