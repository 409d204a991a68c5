//! Runtime configuration with presets for common environments
//!
//! Every knob is a validated domain value, so an out-of-range setting fails
//! at construction instead of misbehaving at runtime.

use serde::{Deserialize, Serialize};

use crate::domain_types::{DedupCacheCapacity, MaxHops, StreamCapacity};

/// Configuration of one agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Capacity of each per-agent stream.
    pub stream_capacity: StreamCapacity,
    /// Bound of each per-agent dedup cache.
    pub dedup_cache_capacity: DedupCacheCapacity,
    /// Hop budget for publishers that do not override it.
    pub default_max_hops: MaxHops,
    /// Whether deactivation drains queued envelopes before teardown; when
    /// false the tail is discarded after the in-flight dispatch.
    pub drain_on_deactivate: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream_capacity: StreamCapacity::default(),
            dedup_cache_capacity: DedupCacheCapacity::default(),
            default_max_hops: MaxHops::default(),
            drain_on_deactivate: false,
        }
    }
}

impl RuntimeConfig {
    /// Development preset: small queues so misbehaviour surfaces quickly.
    ///
    /// # Panics
    ///
    /// Panics if a hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn development() -> Self {
        Self {
            stream_capacity: StreamCapacity::try_new(128).unwrap(),
            dedup_cache_capacity: DedupCacheCapacity::try_new(1_024).unwrap(),
            default_max_hops: MaxHops::default(),
            drain_on_deactivate: true,
        }
    }

    /// Production preset: defaults sized for steady throughput.
    #[must_use]
    pub fn production() -> Self {
        Self::default()
    }

    /// Testing preset: room for bursty fan-outs without backpressure noise.
    ///
    /// # Panics
    ///
    /// Panics if a hardcoded value is out of range for its domain type.
    #[must_use]
    pub fn testing() -> Self {
        Self {
            stream_capacity: StreamCapacity::try_new(1_024).unwrap(),
            dedup_cache_capacity: DedupCacheCapacity::try_new(1_024).unwrap(),
            default_max_hops: MaxHops::default(),
            drain_on_deactivate: true,
        }
    }

    /// Starts a builder seeded with the defaults.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder over [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Sets the per-agent stream capacity.
    #[must_use]
    pub fn stream_capacity(mut self, capacity: StreamCapacity) -> Self {
        self.config.stream_capacity = capacity;
        self
    }

    /// Sets the per-agent dedup cache bound.
    #[must_use]
    pub fn dedup_cache_capacity(mut self, capacity: DedupCacheCapacity) -> Self {
        self.config.dedup_cache_capacity = capacity;
        self
    }

    /// Sets the default hop budget.
    #[must_use]
    pub fn default_max_hops(mut self, hops: MaxHops) -> Self {
        self.config.default_max_hops = hops;
        self
    }

    /// Sets drain-on-deactivate behaviour.
    #[must_use]
    pub fn drain_on_deactivate(mut self, drain: bool) -> Self {
        self.config.drain_on_deactivate = drain;
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_constructible() {
        assert_eq!(RuntimeConfig::development().stream_capacity.as_usize(), 128);
        assert_eq!(RuntimeConfig::production().stream_capacity.as_usize(), 1000);
        assert!(RuntimeConfig::testing().drain_on_deactivate);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = RuntimeConfig::builder()
            .stream_capacity(StreamCapacity::try_new(64).unwrap())
            .drain_on_deactivate(true)
            .build();
        assert_eq!(config.stream_capacity.as_usize(), 64);
        assert!(config.drain_on_deactivate);
        assert_eq!(config.default_max_hops.as_u32(), 50);
    }
}
