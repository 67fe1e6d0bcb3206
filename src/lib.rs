//! # GPU Resource Manager
//!
//! A unified lifecycle manager for GPU-adjacent resources: size-classed
//! pooling of native byte buffers, leak-detecting handle tracking, strict
//! RAII handle lifecycles and transactional composites with LIFO
//! rollback.
//!
//! ## Architecture
//!
//! The subsystem is built from a handful of cooperating components:
//!
//! 1. **NativeAllocator**: aligned and unaligned raw byte regions
//! 2. **BufferPool**: power-of-two size-class pooling with TTL and
//!    watermark eviction, keep-warm overrides and hit/miss metrics
//! 3. **ResourceTracker**: per-handle registry with snapshots, leak
//!    reports and a background age scan
//! 4. **HandleCore / TrackedResource**: the shared RAII state machine
//!    every handle kind builds on
//! 5. **CompositeResource**: all-or-nothing allocation groups with
//!    reverse-order teardown
//! 6. **ResourceManager**: the façade uniting the above, with identity
//!    keyed buffer release and per-type byte accounting
//!
//! ## Quick start
//!
//! ```rust
//! use gpu_resource_manager::{ResourceConfig, ResourceManager};
//!
//! let manager = ResourceManager::new(ResourceConfig::minimal())?;
//!
//! let mut buffer = manager.allocate_memory(4096)?;
//! buffer.as_mut_slice()[..4].copy_from_slice(&[1, 2, 3, 4]);
//! manager.release_memory(buffer)?;
//!
//! let stats = manager.get_statistics();
//! assert_eq!(stats.active_resources, 0);
//! manager.close()?;
//! # Ok::<(), gpu_resource_manager::ResourceError>(())
//! ```

pub mod composite;
pub mod config;
pub mod error;
pub mod gpu;
pub mod handle;
pub mod maintenance;
pub mod manager;
pub mod native;
pub mod pinned;
pub mod pool;
pub mod tracker;
pub mod types;
pub mod utils;

// Re-export commonly used types and functions
pub use composite::{CompositeResource, CompositeState};
pub use config::{PoolCapacity, ResourceConfig};
pub use error::{ResourceError, Result};
pub use gpu::{is_ci, set_ci_probe, GpuDriver, MockGpuDriver};
pub use handle::{GpuResourceHandle, HandleCore, MemoryHandle, TrackedResource};
pub use manager::{HostBuffer, ResourceManager};
pub use pinned::{PinnedBufferPool, PinnedRegion};
pub use pool::{BufferPool, PoolBlock, PooledBuffer};
pub use tracker::{
    global_tracker, install_global_tracker, shutdown_global_tracker, LeakReport, ResourceTracker,
    Snapshot,
};
pub use types::{
    EvictionPolicy, HandleState, ManagerStats, MemoryAccess, PoolStats, ResourceType,
    SizeCategory, TrackerTotals,
};

/// Initialize the global resource manager with default configuration
///
/// Sets up the process-wide manager instance with the `default` preset.
/// Call once at application start. When the process runs under CI the
/// headless GPU driver is installed automatically so pinned allocations
/// work without hardware.
///
/// # Returns
///
/// Returns `true` if initialization was successful, `false` otherwise.
pub fn init_resource_manager() -> bool {
    init_resource_manager_with_config(ResourceConfig::default())
}

/// Initialize the global resource manager with a custom configuration
pub fn init_resource_manager_with_config(config: ResourceConfig) -> bool {
    match ResourceManager::initialize_with_config(config) {
        Ok(()) => {
            if is_ci() {
                ResourceManager::instance().install_gpu_driver(std::sync::Arc::new(MockGpuDriver::new()));
                log::info!("CI environment detected; headless GPU driver installed");
            }
            log::info!("Resource manager initialized successfully");
            true
        }
        Err(e) => {
            log::error!("Failed to initialize resource manager: {}", e);
            false
        }
    }
}

/// Get the global resource manager instance
///
/// # Panics
///
/// Panics if the resource manager has not been initialized.
pub fn resource_manager() -> &'static std::sync::Arc<ResourceManager> {
    ResourceManager::instance()
}

/// Shutdown the global resource manager and cleanup all resources
///
/// Call when the application is shutting down so every outstanding handle
/// is closed and leak reports reach the log.
pub fn shutdown_resource_manager() {
    ResourceManager::shutdown();
    log::info!("Resource manager shutdown complete");
}
