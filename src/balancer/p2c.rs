//! Power-of-two-choices load balancing.

use crate::backend::{Backend, Update};
use crate::balancer::{BalancerError, LoadBalancer, Random};
use rand::Rng;
use std::sync::Arc;

/// Samples two distinct healthy backends and picks the one with fewer
/// active connections.
///
/// Composes [`Random`] for membership maintenance; only the selection
/// step differs. The connection-count reads race with the proxy's
/// increments, which is fine: the bias only needs to hold statistically.
#[derive(Default)]
pub struct P2C {
    random: Random,
}

impl P2C {
    pub fn new() -> Self {
        Self {
            random: Random::new(),
        }
    }
}

impl LoadBalancer for P2C {
    fn update_backend(&self, update: &Update) {
        self.random.update_backend(update);
    }

    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        self.random.set.with_list(|list| {
            if list.is_empty() {
                return Err(BalancerError::NoHealthyBackends);
            }
            if list.len() == 1 {
                return Ok(Arc::clone(&list[0]));
            }

            let mut rng = rand::rng();
            loop {
                let first = rng.random_range(0..list.len());
                let second = rng.random_range(0..list.len());
                if first == second {
                    continue;
                }

                let a = &list[first];
                let b = &list[second];
                // Ties go to the first draw.
                return if a.active_conns() > b.active_conns() {
                    Ok(Arc::clone(b))
                } else {
                    Ok(Arc::clone(a))
                };
            }
        })
    }
}
