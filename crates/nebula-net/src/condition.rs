//! Artificial network conditions for incoming datagrams.
//!
//! Every datagram read off the socket first passes through a
//! [`NetConditioner`]. It may be dropped outright (before any parsing, so a
//! simulated loss costs nothing downstream) or held back for a random delay
//! drawn uniformly from the configured latency range. Held datagrams are
//! released once their simulated arrival time has passed.
//!
//! With zero loss and zero latency every datagram is released in the same
//! call that received it.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::address::NetAddress;

/// Loss and latency applied to incoming traffic.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ConditionerConfig {
    /// Chance of a datagram being dropped, clamped to `0.0..=1.0`.
    pub loss_rate: f32,
    /// Smallest injected delay.
    pub min_latency: Duration,
    /// Largest injected delay. Values below `min_latency` are raised to it.
    pub max_latency: Duration,
}

impl ConditionerConfig {
    fn normalized(self) -> Self {
        Self {
            loss_rate: if self.loss_rate.is_nan() {
                0.0
            } else {
                self.loss_rate.clamp(0.0, 1.0)
            },
            min_latency: self.min_latency,
            max_latency: self.max_latency.max(self.min_latency),
        }
    }

    /// Whether datagrams pass through untouched.
    pub fn is_passthrough(&self) -> bool {
        self.loss_rate <= 0.0 && self.max_latency.is_zero()
    }
}

/// A datagram waiting for its simulated arrival.
#[derive(Debug)]
struct Delayed {
    arrive_at: Instant,
    order: u64,
    from: NetAddress,
    bytes: Vec<u8>,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    // Reversed so the max-heap pops the earliest arrival first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .arrive_at
            .cmp(&self.arrive_at)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Drops and delays incoming datagrams.
#[derive(Debug)]
pub struct NetConditioner {
    config: ConditionerConfig,
    rng: StdRng,
    queue: BinaryHeap<Delayed>,
    next_order: u64,
    dropped: u64,
    received: u64,
}

impl NetConditioner {
    pub fn new(config: ConditionerConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    /// Deterministic conditioner for tests.
    pub fn with_seed(config: ConditionerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: ConditionerConfig, rng: StdRng) -> Self {
        Self {
            config: config.normalized(),
            rng,
            queue: BinaryHeap::new(),
            next_order: 0,
            dropped: 0,
            received: 0,
        }
    }

    pub fn config(&self) -> ConditionerConfig {
        self.config
    }

    /// Replace the conditions. Datagrams already held keep their arrival time.
    pub fn set_config(&mut self, config: ConditionerConfig) {
        self.config = config.normalized();
    }

    pub fn set_loss(&mut self, loss_rate: f32) {
        self.set_config(ConditionerConfig {
            loss_rate,
            ..self.config
        });
    }

    pub fn set_latency(&mut self, min: Duration, max: Duration) {
        self.set_config(ConditionerConfig {
            min_latency: min,
            max_latency: max,
            ..self.config
        });
    }

    /// Accept a datagram. Returns `false` if it was dropped.
    pub fn push(&mut self, from: NetAddress, bytes: Vec<u8>, now: Instant) -> bool {
        self.received += 1;
        if self.config.loss_rate > 0.0 && self.rng.random::<f32>() < self.config.loss_rate {
            self.dropped += 1;
            return false;
        }

        let (min, max) = (self.config.min_latency, self.config.max_latency);
        let delay = if max > min {
            self.rng.random_range(min..=max)
        } else {
            min
        };

        self.queue.push(Delayed {
            arrive_at: now + delay,
            order: self.next_order,
            from,
            bytes,
        });
        self.next_order += 1;
        true
    }

    /// Remove and return every datagram whose arrival time has passed,
    /// earliest first.
    pub fn release(&mut self, now: Instant) -> Vec<(NetAddress, Vec<u8>)> {
        let mut ready = Vec::new();
        while self.queue.peek().is_some_and(|next| next.arrive_at <= now) {
            if let Some(next) = self.queue.pop() {
                ready.push((next.from, next.bytes));
            }
        }
        ready
    }

    /// Datagrams currently held back.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Datagrams discarded by simulated loss.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Datagrams offered to the conditioner.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Discard held datagrams.
    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

impl Default for NetConditioner {
    fn default() -> Self {
        Self::new(ConditionerConfig::default())
    }
}
