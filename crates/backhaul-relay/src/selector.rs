//! Backend selection among the usable connections of a domain

use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::Connection;

/// Picks the connection that serves the next request for a domain
///
/// `candidates` only holds usable connections and is never reordered
/// between calls made against an unchanged registry.
pub trait BackendSelector: Send + Sync {
    fn select<'a>(&self, candidates: &'a [Arc<Connection>]) -> Option<&'a Arc<Connection>>;
}

/// Uniform random choice
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSelector;

impl BackendSelector for RandomSelector {
    fn select<'a>(&self, candidates: &'a [Arc<Connection>]) -> Option<&'a Arc<Connection>> {
        candidates.choose(&mut rand::thread_rng())
    }
}

/// Cycles through candidates in registry order
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BackendSelector for RoundRobinSelector {
    fn select<'a>(&self, candidates: &'a [Arc<Connection>]) -> Option<&'a Arc<Connection>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::test_connection;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_random_selector_is_roughly_uniform() {
        let candidates: Vec<_> = (0..4).map(|_| test_connection("cetacean.club").0).collect();
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..4000 {
            let picked = RandomSelector.select(&candidates).unwrap();
            *counts.entry(picked.id().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            assert!((700..=1300).contains(count), "skewed count {}", count);
        }
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let candidates: Vec<_> = (0..3).map(|_| test_connection("cetacean.club").0).collect();
        let selector = RoundRobinSelector::new();

        let picks: Vec<_> = (0..6)
            .map(|_| selector.select(&candidates).unwrap().id().to_string())
            .collect();
        assert_eq!(picks[0], picks[3]);
        assert_eq!(picks[1], picks[4]);
        assert_ne!(picks[0], picks[1]);
    }

    #[test]
    fn test_empty_candidates() {
        assert!(RandomSelector.select(&[]).is_none());
        assert!(RoundRobinSelector::new().select(&[]).is_none());
    }
}
