//! Least-loaded bucket selection.
//!
//! A [`Balancer`] holds a fixed set of buckets (AZs, usually) with integer
//! loads and yields a bucket with minimum load. It never changes loads on its
//! own: callers report each placement through [`Balancer::record`]. Ties
//! between equally loaded buckets go to a pluggable [`TieBreak`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Chooses among two or more equally loaded buckets.
///
/// Implementations are only ever called with at least two candidates.
pub trait TieBreak<K>: Send {
    /// Returns a position into `candidates`.
    fn choose(&mut self, candidates: &[K]) -> usize;
}

/// Picks the first candidate in declaration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstDeclared;

impl<K> TieBreak<K> for FirstDeclared {
    fn choose(&mut self, _candidates: &[K]) -> usize {
        0
    }
}

/// Picks uniformly at random.
pub struct RandomTieBreak<R = StdRng> {
    rng: R,
}

impl RandomTieBreak {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Default for RandomTieBreak {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng + Send> RandomTieBreak<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }
}

impl<K, R: Rng + Send> TieBreak<K> for RandomTieBreak<R> {
    fn choose(&mut self, candidates: &[K]) -> usize {
        self.rng.random_range(0..candidates.len())
    }
}

/// Tracks per-bucket load and yields the least-loaded bucket.
pub struct Balancer<K> {
    buckets: Vec<(K, usize)>,
    tie_break: Box<dyn TieBreak<K>>,
}

impl<K: Clone + PartialEq> Balancer<K> {
    /// Buckets start with zero load; ties go to the first declared bucket.
    pub fn new(keys: impl IntoIterator<Item = K>) -> Self {
        Self::with_tie_break(keys, Box::new(FirstDeclared))
    }

    pub fn with_tie_break(keys: impl IntoIterator<Item = K>, tie_break: Box<dyn TieBreak<K>>) -> Self {
        let mut buckets: Vec<(K, usize)> = Vec::new();
        for key in keys {
            if !buckets.iter().any(|(k, _)| *k == key) {
                buckets.push((key, 0));
            }
        }
        Self { buckets, tie_break }
    }

    /// Overwrite the load of a bucket. Unknown keys are ignored.
    pub fn set_load(&mut self, key: &K, load: usize) {
        if let Some((_, l)) = self.buckets.iter_mut().find(|(k, _)| k == key) {
            *l = load;
        }
    }

    /// Report one more unit of load on `key`. Unknown keys are ignored.
    pub fn record(&mut self, key: &K) {
        if let Some((_, l)) = self.buckets.iter_mut().find(|(k, _)| k == key) {
            *l += 1;
        }
    }

    pub fn load(&self, key: &K) -> Option<usize> {
        self.buckets.iter().find(|(k, _)| k == key).map(|(_, l)| *l)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.buckets.iter().any(|(k, _)| k == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.buckets.iter().map(|(k, _)| k)
    }

    /// All buckets sharing the minimum load, in declaration order.
    pub fn least_loaded(&self) -> Vec<K> {
        Self::minimal(self.buckets.iter())
    }

    /// A bucket with minimum load. `None` only when there are no buckets.
    pub fn pop(&mut self) -> Option<K> {
        let candidates = self.least_loaded();
        self.decide(candidates)
    }

    /// Like [`pop`](Self::pop) but only considers buckets in `allowed`.
    pub fn pop_among(&mut self, allowed: &[K]) -> Option<K> {
        let candidates = Self::minimal(self.buckets.iter().filter(|(k, _)| allowed.contains(k)));
        self.decide(candidates)
    }

    fn minimal<'a>(buckets: impl Iterator<Item = &'a (K, usize)> + Clone) -> Vec<K>
    where
        K: 'a,
    {
        let Some(min) = buckets.clone().map(|(_, l)| *l).min() else {
            return Vec::new();
        };
        buckets
            .filter(|(_, l)| *l == min)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn decide(&mut self, mut candidates: Vec<K>) -> Option<K> {
        match candidates.len() {
            0 => None,
            1 => candidates.pop(),
            n => {
                let pick = self.tie_break.choose(&candidates).min(n - 1);
                Some(candidates.swap_remove(pick))
            }
        }
    }
}
