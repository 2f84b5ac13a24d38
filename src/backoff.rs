// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff with jitter and an overall elapsed-time budget.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_RANDOMIZATION: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_interval: Duration,
    budget: Duration,
    multiplier: f64,
    randomization: f64,
    current: Duration,
    started: Instant,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_interval: Duration, budget: Duration) -> Self {
        ExponentialBackoff {
            max_interval,
            budget,
            multiplier: DEFAULT_MULTIPLIER,
            randomization: DEFAULT_RANDOMIZATION,
            current: initial,
            started: Instant::now(),
        }
    }

    /// Spread of the jitter around each interval, `0.0` disables it.
    pub fn with_randomization(mut self, factor: f64) -> Self {
        self.randomization = factor.clamp(0.0, 1.0);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Next wait, or `None` once waiting would overrun the budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.jittered(self.current);
        if self.elapsed() + delay > self.budget {
            return None;
        }

        let grown = self.current.as_nanos() as f64 * self.multiplier;
        self.current = Duration::from_nanos(grown as u64).min(self.max_interval);

        Some(delay)
    }

    fn jittered(&self, interval: Duration) -> Duration {
        if self.randomization == 0.0 {
            return interval;
        }

        let delta = interval.as_secs_f64() * self.randomization;
        let low = (interval.as_secs_f64() - delta).max(0.0);
        let high = interval.as_secs_f64() + delta;
        Duration::from_secs_f64(rand::rng().random_range(low..=high))
    }
}
