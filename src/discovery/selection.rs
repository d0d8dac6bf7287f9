use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rand::seq::SliceRandom;

use crate::config::SelectionType;

use super::ServiceInstance;

/// Picks one instance among those registered under the requested name.
pub trait SelectionStrategy: Send + Sync {
    fn select<'a>(&self, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance>;
}

pub fn build_strategy(selection: SelectionType) -> Arc<dyn SelectionStrategy> {
    match selection {
        SelectionType::FirstMatch => Arc::new(FirstMatch),
        SelectionType::RoundRobin => Arc::new(RoundRobin::default()),
        SelectionType::Random => Arc::new(Random),
    }
}

/// Registry order, first entry wins. No balancing across instances.
pub struct FirstMatch;

impl SelectionStrategy for FirstMatch {
    fn select<'a>(&self, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        candidates.first()
    }
}

#[derive(Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl SelectionStrategy for RoundRobin {
    fn select<'a>(&self, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(index % candidates.len())
    }
}

pub struct Random;

impl SelectionStrategy for Random {
    fn select<'a>(&self, candidates: &'a [ServiceInstance]) -> Option<&'a ServiceInstance> {
        candidates.choose(&mut rand::thread_rng())
    }
}
