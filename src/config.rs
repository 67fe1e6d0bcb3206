//! # Configuration
//!
//! Typed, validated settings for the pool, the tracker and the unified
//! manager. Construction goes through [`ResourceConfig::validated`] (or a
//! preset), so an instance that exists is an instance that passed
//! validation.

use crate::error::{ResourceError, Result};
use crate::types::EvictionPolicy;
use crate::utils::is_power_of_two;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Explicit capacity discipline for the buffer pool
///
/// Resolved once from the configured caps; the pool never switches modes
/// silently. A configured byte cap wins over a count cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolCapacity {
    /// Cap the sum of pooled-but-idle region sizes
    Bytes(usize),
    /// Cap the total pooled region count
    Count(usize),
}

/// Settings block for the resource manager
///
/// Every knob the subsystem honors, with the semantics listed field by
/// field. Validation rules: `0 < low_water < high_water <= 1.0`, all size
/// and count caps positive, alignment a power of two, and
/// `min_buffer_size <= max_buffer_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Byte cap for idle pooled regions; selects byte-capacity mode
    pub max_pool_size_bytes: Option<usize>,

    /// Count cap for pooled regions; used when no byte cap is set
    pub max_pool_size_count: Option<usize>,

    /// Per-size-class cap on idle regions
    pub max_buffers_per_class: usize,

    /// Fraction of the cap that triggers an eviction sweep
    pub high_water: f64,

    /// Fraction of the cap an eviction sweep drains down to
    pub low_water: f64,

    /// Ordering used when the pool sheds idle regions
    pub eviction_policy: EvictionPolicy,

    /// Base idle TTL for Small/Medium regions; XLarge gets 5x, Batch 10x
    pub max_idle: Duration,

    /// Absolute cap on active handles
    pub max_resource_count: usize,

    /// Enables the tracker's background age scan
    pub leak_detection_enabled: bool,

    /// Cadence of the tracker age scan
    pub leak_scan_interval: Duration,

    /// Enables background pool maintenance workers
    pub async_cleanup_enabled: bool,

    /// Number of background maintenance workers
    pub cleanup_thread_count: usize,

    /// Cadence of background maintenance
    pub cleanup_interval: Duration,

    /// Force aligned native allocation for pooled regions
    pub align_buffers: bool,

    /// Alignment used when `align_buffers` is set; power of two
    pub alignment: usize,

    /// Sizes below this bypass pooling entirely
    pub min_buffer_size: usize,

    /// Sizes above this bypass pooling entirely
    pub max_buffer_size: usize,
}

impl Default for ResourceConfig {
    /// The `default` preset: 512 MiB pool, 0.90/0.70 watermarks, LRU,
    /// 5 minute idle TTL, 10 000 handles, leak scan every 30 s, two
    /// cleanup workers at a 10 s cadence.
    fn default() -> Self {
        Self {
            max_pool_size_bytes: Some(512 * 1024 * 1024),
            max_pool_size_count: None,
            max_buffers_per_class: 32,
            high_water: 0.90,
            low_water: 0.70,
            eviction_policy: EvictionPolicy::LRU,
            max_idle: Duration::from_secs(300),
            max_resource_count: 10_000,
            leak_detection_enabled: true,
            leak_scan_interval: Duration::from_secs(30),
            async_cleanup_enabled: true,
            cleanup_thread_count: 2,
            cleanup_interval: Duration::from_secs(10),
            align_buffers: false,
            alignment: 64,
            min_buffer_size: 64,
            max_buffer_size: 256 * 1024 * 1024,
        }
    }
}

impl ResourceConfig {
    /// Validate and return the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` naming the offending parameter.
    pub fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Check every validation rule without consuming the value
    pub fn validate(&self) -> Result<()> {
        if self.low_water <= 0.0 || self.low_water >= self.high_water {
            return Err(ResourceError::config_error(
                "low_water",
                format!(
                    "must satisfy 0 < low_water < high_water, got low={} high={}",
                    self.low_water, self.high_water
                ),
            ));
        }
        if self.high_water > 1.0 {
            return Err(ResourceError::config_error(
                "high_water",
                format!("must be <= 1.0, got {}", self.high_water),
            ));
        }
        if let Some(bytes) = self.max_pool_size_bytes {
            if bytes == 0 {
                return Err(ResourceError::config_error(
                    "max_pool_size_bytes",
                    "must be positive",
                ));
            }
        }
        if let Some(count) = self.max_pool_size_count {
            if count == 0 {
                return Err(ResourceError::config_error(
                    "max_pool_size_count",
                    "must be positive",
                ));
            }
        }
        if self.max_buffers_per_class == 0 {
            return Err(ResourceError::config_error(
                "max_buffers_per_class",
                "must be positive",
            ));
        }
        if self.max_resource_count == 0 {
            return Err(ResourceError::config_error(
                "max_resource_count",
                "must be positive",
            ));
        }
        if !is_power_of_two(self.alignment) {
            return Err(ResourceError::config_error(
                "alignment",
                format!("must be a power of two, got {}", self.alignment),
            ));
        }
        if self.min_buffer_size > self.max_buffer_size {
            return Err(ResourceError::config_error(
                "min_buffer_size",
                format!(
                    "must not exceed max_buffer_size ({} > {})",
                    self.min_buffer_size, self.max_buffer_size
                ),
            ));
        }
        if self.async_cleanup_enabled && self.cleanup_thread_count == 0 {
            return Err(ResourceError::config_error(
                "cleanup_thread_count",
                "must be positive when async cleanup is enabled",
            ));
        }
        Ok(())
    }

    /// Resolve the explicit pool capacity mode
    pub fn pool_capacity(&self) -> PoolCapacity {
        match (self.max_pool_size_bytes, self.max_pool_size_count) {
            (Some(bytes), _) => PoolCapacity::Bytes(bytes),
            (None, Some(count)) => PoolCapacity::Count(count),
            (None, None) => PoolCapacity::Bytes(512 * 1024 * 1024),
        }
    }

    /// Smallest useful preset: tiny pool, no background work
    ///
    /// Suited to unit tests and short-lived tools where deterministic,
    /// foreground-only behavior matters more than reuse.
    pub fn minimal() -> Self {
        Self {
            max_pool_size_bytes: Some(64 * 1024 * 1024),
            max_buffers_per_class: 8,
            max_resource_count: 1_000,
            leak_detection_enabled: false,
            async_cleanup_enabled: false,
            cleanup_thread_count: 0,
            ..Self::default()
        }
    }

    /// Preset tuned for long-running services
    pub fn production() -> Self {
        Self {
            max_pool_size_bytes: Some(2 * 1024 * 1024 * 1024),
            max_buffers_per_class: 64,
            max_idle: Duration::from_secs(600),
            max_resource_count: 100_000,
            leak_scan_interval: Duration::from_secs(60),
            cleanup_thread_count: 4,
            cleanup_interval: Duration::from_secs(30),
            align_buffers: true,
            alignment: 4096,
            ..Self::default()
        }
    }
}
