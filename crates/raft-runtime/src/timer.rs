//! # timer
//!
//! why: followers and candidates need a randomized election deadline that is redrawn on every reset
//! relations: owned by the node lock in node.rs, polled by the election loop
//! what: ElectionTimer

use std::time::Duration;

use rand::Rng;
use raft_core::RaftConfig;
use tokio::time::Instant;

#[derive(Debug)]
pub struct ElectionTimer {
    min_ms: u64,
    max_ms: u64,
    deadline: Instant,
}

impl ElectionTimer {
    /// Armed timer with a fresh random deadline
    pub fn new(config: &RaftConfig) -> Self {
        let mut timer = Self {
            min_ms: config.election_timeout_min,
            max_ms: config.election_timeout_max,
            deadline: Instant::now(),
        };
        timer.reset();
        timer
    }

    /// Push the deadline out by a newly drawn timeout in `[min, max]`
    pub fn reset(&mut self) -> Duration {
        let timeout = if self.min_ms >= self.max_ms {
            Duration::from_millis(self.min_ms)
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(self.min_ms..=self.max_ms))
        };
        self.deadline = Instant::now() + timeout;
        timeout
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: u64, max: u64) -> RaftConfig {
        RaftConfig {
            election_timeout_min: min,
            election_timeout_max: max,
            ..RaftConfig::default()
        }
    }

    #[test]
    fn timeouts_stay_inside_the_range() {
        let mut timer = ElectionTimer::new(&config(150, 300));
        for _ in 0..200 {
            let timeout = timer.reset();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn timeouts_are_redrawn() {
        let mut timer = ElectionTimer::new(&config(150, 300));
        let draws: std::collections::HashSet<Duration> = (0..50).map(|_| timer.reset()).collect();
        assert!(draws.len() > 1, "every reset should draw a new timeout");
    }

    #[test]
    fn degenerate_range_is_fixed() {
        let mut timer = ElectionTimer::new(&config(200, 200));
        assert_eq!(timer.reset(), Duration::from_millis(200));
    }

    #[test]
    fn fresh_timer_is_not_expired() {
        let timer = ElectionTimer::new(&config(150, 300));
        assert!(!timer.is_expired());
        assert!(timer.deadline() > Instant::now());
    }
}
