//! Uniform random load balancing.

use crate::backend::{Backend, Update};
use crate::balancer::set::HealthySet;
use crate::balancer::{BalancerError, LoadBalancer};
use rand::Rng;
use std::sync::Arc;

/// Picks a healthy backend uniformly at random.
#[derive(Default)]
pub struct Random {
    pub(crate) set: HealthySet,
}

impl Random {
    pub fn new() -> Self {
        Self {
            set: HealthySet::new(),
        }
    }
}

impl LoadBalancer for Random {
    fn update_backend(&self, update: &Update) {
        self.set.apply(update);
    }

    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        self.set.with_list(|list| {
            if list.is_empty() {
                return Err(BalancerError::NoHealthyBackends);
            }
            let idx = rand::rng().random_range(0..list.len());
            Ok(Arc::clone(&list[idx]))
        })
    }
}
