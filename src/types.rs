//! # Core Types and Data Structures
//!
//! This module defines the shared vocabulary of the resource manager: the
//! handle lifecycle states, resource type tags, pool size categories,
//! eviction policies and the statistics structures reported by the pool,
//! the tracker and the unified manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Lifecycle state of a resource handle
///
/// The happy path is `Allocated -> Closing -> Closed`. Cleanup failure
/// diverts `Closing -> Leaked`; a tracker shutdown audit moves an untouched
/// handle straight to `Leaked`. `Closed` and `Leaked` are terminal and no
/// path returns to `Allocated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HandleState {
    /// The handle owns its native value and may be used
    Allocated = 0,
    /// A close is in flight; the native value is no longer accessible
    Closing = 1,
    /// Cleanup completed; terminal
    Closed = 2,
    /// Cleanup failed or the handle survived a shutdown audit; terminal
    Leaked = 3,
}

impl HandleState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Allocated,
            1 => Self::Closing,
            2 => Self::Closed,
            _ => Self::Leaked,
        }
    }

    /// String form used in log lines and state-mismatch errors
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allocated => "Allocated",
            Self::Closing => "Closing",
            Self::Closed => "Closed",
            Self::Leaked => "Leaked",
        }
    }

    /// Whether the state admits no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Leaked)
    }
}

/// Type tag carried by every tracked resource
///
/// Tags drive per-type byte accounting in the manager and per-type grouping
/// in tracker snapshots and leak reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    /// Pooled host byte buffer issued by the unified manager
    Buffer,
    /// Host-mapped, device-visible DMA buffer
    PinnedBuffer,
    /// Device texture
    Texture,
    /// Compiled shader program
    ShaderProgram,
    /// Compute kernel
    Kernel,
    /// Synchronization event
    Event,
    /// Texture sampler
    Sampler,
    /// Command queue
    CommandQueue,
}

impl ResourceType {
    /// Number of distinct tags; sizes the per-type counter arrays
    pub const COUNT: usize = 8;

    /// Dense index for counter arrays
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// All tags in declaration order
    pub fn all() -> [ResourceType; Self::COUNT] {
        [
            Self::Buffer,
            Self::PinnedBuffer,
            Self::Texture,
            Self::ShaderProgram,
            Self::Kernel,
            Self::Event,
            Self::Sampler,
            Self::CommandQueue,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buffer => "Buffer",
            Self::PinnedBuffer => "PinnedBuffer",
            Self::Texture => "Texture",
            Self::ShaderProgram => "ShaderProgram",
            Self::Kernel => "Kernel",
            Self::Event => "Event",
            Self::Sampler => "Sampler",
            Self::CommandQueue => "CommandQueue",
        }
    }

    /// Short prefix used when minting handle IDs
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Buffer => "buf",
            Self::PinnedBuffer => "pin",
            Self::Texture => "tex",
            Self::ShaderProgram => "prg",
            Self::Kernel => "krn",
            Self::Event => "evt",
            Self::Sampler => "smp",
            Self::CommandQueue => "quu",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size category of a pooled region
///
/// Categories scale the idle TTL during eviction: Small and Medium use the
/// base TTL, XLarge 5x and Batch 10x. Regions never migrate between
/// categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SizeCategory {
    /// Up to 64 KiB
    Small,
    /// Up to 10 MiB
    Medium,
    /// Up to 100 MiB
    XLarge,
    /// Above 100 MiB
    Batch,
}

impl SizeCategory {
    pub const SMALL_LIMIT: usize = 64 * 1024;
    pub const MEDIUM_LIMIT: usize = 10 * 1024 * 1024;
    pub const XLARGE_LIMIT: usize = 100 * 1024 * 1024;

    /// Classify a region size
    pub fn of(size: usize) -> Self {
        if size <= Self::SMALL_LIMIT {
            Self::Small
        } else if size <= Self::MEDIUM_LIMIT {
            Self::Medium
        } else if size <= Self::XLARGE_LIMIT {
            Self::XLarge
        } else {
            Self::Batch
        }
    }

    /// TTL multiplier applied to the configured base idle time
    pub fn ttl_factor(&self) -> u32 {
        match self {
            Self::Small | Self::Medium => 1,
            Self::XLarge => 5,
            Self::Batch => 10,
        }
    }
}

/// Ordering applied when the pool must shed idle regions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently used first (default)
    LRU,
    /// Least frequently used first
    LFU,
    /// Oldest insertion first
    FIFO,
    /// Largest region first
    LargestFirst,
    /// LRU order, ties broken by larger size
    Hybrid,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::LRU
    }
}

/// Access mode requested for a pinned DMA region
///
/// Maps onto the device-side memory-access flags the GPU driver consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemoryAccess {
    /// Raw flag bits handed to the driver
    pub fn driver_flags(&self) -> u32 {
        match self {
            Self::ReadOnly => 0b01,
            Self::WriteOnly => 0b10,
            Self::ReadWrite => 0b11,
        }
    }
}

/// Snapshot of buffer pool activity
///
/// Produced by [`crate::pool::BufferPool::stats`]. All counts are
/// cumulative since pool creation except `idle_regions`, `idle_bytes` and
/// `outstanding`, which describe the current instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of non-empty size-class buckets
    pub buckets: usize,

    /// Idle regions currently parked in buckets
    pub idle_regions: usize,

    /// Sum of idle region sizes in bytes
    pub idle_bytes: usize,

    /// Total allocation requests served
    pub allocations: u64,

    /// Requests satisfied from a bucket
    pub hits: u64,

    /// Requests that required a fresh native allocation
    pub misses: u64,

    /// hits / (hits + misses), 0.0 when no traffic
    pub hit_rate: f64,

    /// Regions currently handed out and not yet returned
    pub outstanding: usize,

    /// Regions dropped by TTL or watermark eviction
    pub evictions: u64,

    /// Timestamp when these stats were collected
    pub collected_at: SystemTime,
}

impl Default for PoolStats {
    fn default() -> Self {
        Self {
            buckets: 0,
            idle_regions: 0,
            idle_bytes: 0,
            allocations: 0,
            hits: 0,
            misses: 0,
            hit_rate: 0.0,
            outstanding: 0,
            evictions: 0,
            collected_at: SystemTime::now(),
        }
    }
}

/// Activity counters for the pinned DMA pool
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PinnedPoolStats {
    /// Blocks currently parked for reuse
    pub idle_regions: usize,
    /// Requests satisfied from a parked block
    pub hits: u64,
    /// Requests that created a fresh device buffer
    pub misses: u64,
}

/// Monotonic totals maintained by the resource tracker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerTotals {
    /// Handles ever registered
    pub allocated: u64,
    /// Handles closed and unregistered
    pub freed: u64,
    /// Handles that leaked (cleanup failure or shutdown audit)
    pub leaked: u64,
}

impl TrackerTotals {
    /// Handles still live: allocated - freed - leaked
    pub fn active(&self) -> u64 {
        self.allocated - self.freed - self.leaked
    }
}

/// Aggregate statistics reported by the unified manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Handles currently owned by the manager
    pub active_resources: usize,

    /// Sum of all per-type byte counters
    pub total_bytes: u64,

    /// Byte subtotal per resource type (tag name -> bytes)
    pub bytes_by_type: HashMap<String, u64>,

    /// Live handle count per resource type (tag name -> count)
    pub count_by_type: HashMap<String, u64>,

    /// Pool activity snapshot
    pub pool: PoolStats,

    /// Active handle count as seen by the tracker
    pub tracker_active: usize,

    /// Tracker lifetime totals
    pub tracker_totals: TrackerTotals,

    /// Timestamp when these stats were collected
    pub collected_at: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_terminal() {
        assert!(!HandleState::Allocated.is_terminal());
        assert!(!HandleState::Closing.is_terminal());
        assert!(HandleState::Closed.is_terminal());
        assert!(HandleState::Leaked.is_terminal());
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            HandleState::Allocated,
            HandleState::Closing,
            HandleState::Closed,
            HandleState::Leaked,
        ] {
            assert_eq!(HandleState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_size_category_boundaries() {
        assert_eq!(SizeCategory::of(0), SizeCategory::Small);
        assert_eq!(SizeCategory::of(64 * 1024), SizeCategory::Small);
        assert_eq!(SizeCategory::of(64 * 1024 + 1), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(10 * 1024 * 1024), SizeCategory::Medium);
        assert_eq!(SizeCategory::of(10 * 1024 * 1024 + 1), SizeCategory::XLarge);
        assert_eq!(SizeCategory::of(100 * 1024 * 1024), SizeCategory::XLarge);
        assert_eq!(SizeCategory::of(100 * 1024 * 1024 + 1), SizeCategory::Batch);
    }

    #[test]
    fn test_ttl_factors() {
        assert_eq!(SizeCategory::Small.ttl_factor(), 1);
        assert_eq!(SizeCategory::Medium.ttl_factor(), 1);
        assert_eq!(SizeCategory::XLarge.ttl_factor(), 5);
        assert_eq!(SizeCategory::Batch.ttl_factor(), 10);
    }

    #[test]
    fn test_resource_type_indices_dense() {
        for (i, tag) in ResourceType::all().iter().enumerate() {
            assert_eq!(tag.index(), i);
        }
    }

    #[test]
    fn test_tracker_totals_active() {
        let totals = TrackerTotals {
            allocated: 10,
            freed: 6,
            leaked: 1,
        };
        assert_eq!(totals.active(), 3);
    }
}
