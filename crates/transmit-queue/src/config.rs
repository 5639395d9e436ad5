//! Queue configuration

use serde::{Deserialize, Serialize};

/// Default ring capacity in bytes (64 KiB)
pub const DEFAULT_CAPACITY: u32 = 64 * 1024;

/// Default drain threshold: queue level at which the transport should
/// start draining, sized so a typical UDP segment is ~80 % filled.
pub const DEFAULT_DRAIN_THRESHOLD: u32 = (1400 * 100) / 80;

/// Transmit queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Ring capacity in bytes
    pub capacity: u32,

    /// Queue level in bytes above which `needs_drain` reports true
    pub drain_threshold: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            drain_threshold: DEFAULT_DRAIN_THRESHOLD,
        }
    }
}

impl QueueConfig {
    /// Config for latency-critical streams: drain whenever non-empty
    pub fn low_latency() -> Self {
        Self {
            drain_threshold: 0,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
        assert_eq!(config.drain_threshold, DEFAULT_DRAIN_THRESHOLD);
    }

    #[test]
    fn test_low_latency_drains_immediately() {
        let config = QueueConfig::low_latency();
        assert_eq!(config.drain_threshold, 0);
        assert_eq!(config.capacity, DEFAULT_CAPACITY);
    }
}
