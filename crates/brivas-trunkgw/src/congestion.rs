//! Trunk group congestion back-off

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::warn;

const MIN_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 10;

/// Trunk groups the gateway reported as out of circuits
#[derive(Debug, Default)]
pub struct CongestionTable {
    until: DashMap<u8, Instant>,
}

impl CongestionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back-off for a trunk group given the span's channels in use:
    /// two seconds per hundred, between one and ten seconds
    pub fn backoff_for(in_use: usize) -> Duration {
        let secs = (in_use as u64 / 100 * 2).clamp(MIN_BACKOFF_SECS, MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }

    /// Put `trunk_group` in back-off
    pub fn mark(&self, trunk_group: u8, in_use: usize) -> Duration {
        let delay = Self::backoff_for(in_use);
        warn!(trunk_group, delay_secs = delay.as_secs(), "Trunk group congested");
        self.until.insert(trunk_group, Instant::now() + delay);
        delay
    }

    /// Whether `trunk_group` is still backing off; expired entries are cleared
    pub fn is_congested(&self, trunk_group: u8) -> bool {
        let expired = match self.until.get(&trunk_group) {
            None => return false,
            Some(until) => Instant::now() >= *until,
        };
        if expired {
            self.until.remove(&trunk_group);
            return false;
        }
        true
    }

    pub fn clear(&self) {
        self.until.clear();
    }
}
