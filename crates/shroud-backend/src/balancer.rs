//! Weighted round-robin scheduling.

use crate::error::BackendError;
use rand::Rng;
use rand::seq::SliceRandom;

/// Proportional schedule over weighted endpoints plus a rotating cursor.
///
/// Each endpoint index appears `weight / gcd(weights)` times in the
/// schedule, so one full cycle returns every endpoint exactly in proportion
/// to its weight. The schedule is shuffled once so that a cold start does
/// not favour index 0.
#[derive(Debug, Clone)]
pub struct Balancer {
    schedule: Vec<usize>,
    cursor: usize,
}

impl Balancer {
    pub fn new(weights: &[u32]) -> Self {
        Self::with_rng(weights, &mut rand::rng())
    }

    /// Build with an explicit source of randomness for the initial shuffle.
    pub fn with_rng<R: Rng + ?Sized>(weights: &[u32], rng: &mut R) -> Self {
        let mut schedule = build_schedule(weights);
        if schedule.len() > 1 {
            schedule.shuffle(rng);
        }
        Self {
            schedule,
            cursor: 0,
        }
    }

    /// Next endpoint index, checked against the live endpoint count.
    pub fn next(&mut self, endpoints: usize) -> Result<usize, BackendError> {
        let len = self.schedule.len();
        if len == 0 {
            return Err(BackendError::NoBackend);
        }
        let position = self.cursor % len;
        self.cursor = (position + 1) % len;

        let index = self.schedule[position];
        if index >= endpoints {
            return Err(BackendError::NoBackend);
        }
        Ok(index)
    }

    /// One full cycle of endpoint indexes.
    pub fn schedule(&self) -> &[usize] {
        &self.schedule
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 { a } else { gcd(b, a % b) }
}

fn build_schedule(weights: &[u32]) -> Vec<usize> {
    let divisor = weights.iter().copied().fold(0, gcd);
    if divisor == 0 {
        return Vec::new();
    }
    weights
        .iter()
        .enumerate()
        .flat_map(|(index, weight)| std::iter::repeat_n(index, (weight / divisor) as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn frequencies(balancer: &mut Balancer, endpoints: usize, calls: usize) -> Vec<usize> {
        let mut counts = vec![0; endpoints];
        for _ in 0..calls {
            counts[balancer.next(endpoints).unwrap()] += 1;
        }
        counts
    }

    #[test]
    fn test_schedule_reduced_by_gcd() {
        let balancer = Balancer::new(&[4, 6, 2]);
        assert_eq!(balancer.schedule().len(), 6);
        let mut sorted = balancer.schedule().to_vec();
        sorted.sort();
        assert_eq!(sorted, vec![0, 0, 1, 1, 1, 2]);
    }

    #[test]
    fn test_full_cycle_matches_weights() {
        let weight_vectors: [&[u32]; 5] = [&[1], &[1, 1], &[3, 1], &[5, 3, 2], &[7, 7, 14, 1]];
        for weights in weight_vectors {
            let mut rng = StdRng::seed_from_u64(7);
            let mut balancer = Balancer::with_rng(weights, &mut rng);
            let divisor = weights.iter().copied().fold(0, gcd);
            let cycle: usize = weights.iter().map(|w| (w / divisor) as usize).sum();

            let counts = frequencies(&mut balancer, weights.len(), cycle);
            let expected: Vec<usize> = weights.iter().map(|w| (w / divisor) as usize).collect();
            assert_eq!(counts, expected, "weights {weights:?}");
        }
    }

    #[test]
    fn test_many_cycles_stay_proportional() {
        let mut balancer = Balancer::new(&[2, 3]);
        assert_eq!(frequencies(&mut balancer, 2, 500), vec![200, 300]);
    }

    #[test]
    fn test_single_endpoint_never_fails() {
        let mut balancer = Balancer::new(&[9]);
        assert_eq!(balancer.schedule(), &[0]);
        for _ in 0..10 {
            assert_eq!(balancer.next(1).unwrap(), 0);
        }
    }

    #[test]
    fn test_empty_fails_with_no_backend() {
        let mut balancer = Balancer::new(&[]);
        assert!(balancer.is_empty());
        assert!(matches!(balancer.next(0), Err(BackendError::NoBackend)));
    }

    #[test]
    fn test_stale_index_fails_instead_of_panicking() {
        let mut balancer = Balancer::new(&[1, 1, 1]);
        let mut failures = 0;
        for _ in 0..3 {
            if balancer.next(1).is_err() {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_shuffle_is_not_fixed() {
        // Over many seeds every index must reach the head of the schedule.
        let mut heads = [false; 4];
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let balancer = Balancer::with_rng(&[1, 1, 1, 1], &mut rng);
            heads[balancer.schedule()[0]] = true;
        }
        assert_eq!(heads, [true; 4]);
    }
}
