//! # Unified Resource Manager
//!
//! The façade uniting pool, tracker, handles and background maintenance:
//! host buffer issuance with an identity-keyed release path, registration
//! of foreign GPU-typed handles, per-type byte accounting, periodic
//! maintenance and aggregate statistics. A process-wide instance is
//! available through [`ResourceManager::initialize`] and
//! [`ResourceManager::instance`].

use crate::config::ResourceConfig;
use crate::error::{ResourceError, Result};
use crate::gpu::GpuDriver;
use crate::handle::{MemoryHandle, TrackedResource};
use crate::maintenance::MaintenanceScheduler;
use crate::pinned::{PinnedBufferPool, PinnedRegion};
use crate::pool::BufferPool;
use crate::tracker::ResourceTracker;
use crate::types::{ManagerStats, MemoryAccess, ResourceType};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

/// A host byte buffer issued by [`ResourceManager::allocate_memory`]
///
/// Identity is the base address of the underlying region; the read/write
/// cursor is view state and never affects identity or release. The bytes
/// stay valid until the buffer is released or the manager closes.
pub struct HostBuffer {
    ptr: *mut u8,
    len: usize,
    capacity: usize,
    addr: usize,
    handle_id: String,
    /// Backing handle, retained so a release the manager has lost track
    /// of can still hand the region back to the pool
    handle: Option<Arc<MemoryHandle>>,
    position: usize,
}

// The buffer views memory owned by the manager's handle map; the pointer
// is unique per live buffer.
unsafe impl Send for HostBuffer {}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("addr", &self.addr)
            .field("handle_id", &self.handle_id)
            .field("position", &self.position)
            .finish()
    }
}

impl HostBuffer {
    fn empty() -> Self {
        Self {
            ptr: std::ptr::null_mut(),
            len: 0,
            capacity: 0,
            addr: 0,
            handle_id: String::new(),
            handle: None,
            position: 0,
        }
    }

    /// Requested length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Full capacity of the backing region (the size class)
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Base address of the backing region; the identity key
    pub fn base_addr(&self) -> usize {
        self.addr
    }

    /// ID of the handle backing this buffer
    pub fn handle_id(&self) -> &str {
        &self.handle_id
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.position
    }

    /// Move the cursor; cursor state never affects identity
    pub fn set_position(&mut self, position: usize) -> Result<()> {
        if position > self.len {
            return Err(ResourceError::invalid_argument(
                "position",
                format!("{} past end of {}-byte buffer", position, self.len),
            ));
        }
        self.position = position;
        Ok(())
    }

    /// Bytes between the cursor and the end
    pub fn remaining(&self) -> usize {
        self.len - self.position
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.len == 0 {
            &[]
        } else {
            unsafe { slice::from_raw_parts(self.ptr, self.len) }
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.len == 0 {
            &mut []
        } else {
            unsafe { slice::from_raw_parts_mut(self.ptr, self.len) }
        }
    }
}

/// Central coordinator for every resource the subsystem issues or tracks
///
/// Holds the handle map and the identity map behind separate locks,
/// always acquired handle-map first. Per-type byte and count counters are
/// atomics indexed by [`ResourceType`].
pub struct ResourceManager {
    config: ResourceConfig,
    pool: Arc<BufferPool>,
    tracker: Arc<ResourceTracker>,
    driver: RwLock<Option<Arc<dyn GpuDriver>>>,
    pinned: RwLock<Option<Arc<PinnedBufferPool>>>,
    /// Handle ID -> owning handle
    handles: Mutex<HashMap<String, Arc<dyn TrackedResource>>>,
    /// Region base address -> handle ID; the identity map
    buffer_ids: Mutex<HashMap<usize, String>>,
    bytes_by_type: [AtomicU64; ResourceType::COUNT],
    count_by_type: [AtomicU64; ResourceType::COUNT],
    maintenance: Mutex<Option<MaintenanceScheduler>>,
    closed: AtomicBool,
}

/// Global manager instance
static RESOURCE_MANAGER: OnceCell<Arc<ResourceManager>> = OnceCell::new();

impl ResourceManager {
    /// Create a standalone manager
    pub fn new(config: ResourceConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = Arc::new(BufferPool::new(&config));
        let tracker = Arc::new(ResourceTracker::new(config.max_idle));

        if config.leak_detection_enabled && !config.max_idle.is_zero() {
            tracker.start_periodic_scan(config.leak_scan_interval);
        }

        let manager = Arc::new(Self {
            pool,
            tracker,
            driver: RwLock::new(None),
            pinned: RwLock::new(None),
            handles: Mutex::new(HashMap::new()),
            buffer_ids: Mutex::new(HashMap::new()),
            bytes_by_type: std::array::from_fn(|_| AtomicU64::new(0)),
            count_by_type: std::array::from_fn(|_| AtomicU64::new(0)),
            maintenance: Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        if manager.config.async_cleanup_enabled {
            let weak: Weak<ResourceManager> = Arc::downgrade(&manager);
            let scheduler = MaintenanceScheduler::start(
                "resource-maintenance",
                manager.config.cleanup_thread_count,
                manager.config.cleanup_interval,
                Arc::new(move || {
                    if let Some(manager) = weak.upgrade() {
                        manager.perform_maintenance();
                    }
                }),
            );
            *manager.maintenance.lock() = Some(scheduler);
        }

        log::info!("Resource manager created");
        Ok(manager)
    }

    /// Initialize the global manager with the default configuration
    pub fn initialize() -> Result<()> {
        Self::initialize_with_config(ResourceConfig::default())
    }

    /// Initialize the global manager with a custom configuration
    pub fn initialize_with_config(config: ResourceConfig) -> Result<()> {
        let manager = Self::new(config)?;
        RESOURCE_MANAGER
            .set(manager)
            .map_err(|_| ResourceError::AlreadyInitialized)?;
        log::info!("Global resource manager initialized");
        Ok(())
    }

    /// The global manager instance
    ///
    /// # Panics
    ///
    /// Panics when the manager has not been initialized.
    pub fn instance() -> &'static Arc<ResourceManager> {
        RESOURCE_MANAGER
            .get()
            .expect("Resource manager not initialized. Call ResourceManager::initialize() first.")
    }

    /// The global manager instance, if initialized
    pub fn try_instance() -> Option<&'static Arc<ResourceManager>> {
        RESOURCE_MANAGER.get()
    }

    /// Shut down the global manager
    pub fn shutdown() {
        if let Some(manager) = RESOURCE_MANAGER.get() {
            if let Err(e) = manager.close() {
                log::error!("Error during resource manager shutdown: {}", e);
            }
        }
    }

    /// Install the GPU driver and bring up the pinned pool
    pub fn install_gpu_driver(&self, driver: Arc<dyn GpuDriver>) {
        *self.pinned.write() = Some(Arc::new(PinnedBufferPool::new(
            driver.clone(),
            self.config.max_buffers_per_class,
        )));
        *self.driver.write() = Some(driver);
        log::info!("GPU driver installed; pinned pool available");
    }

    /// The installed GPU driver, if any
    pub fn gpu_driver(&self) -> Option<Arc<dyn GpuDriver>> {
        self.driver.read().clone()
    }

    /// Allocate a host byte buffer of at least `size` bytes
    ///
    /// Zero-size requests yield an empty, untracked buffer. Everything
    /// else checks out a pooled region, wraps it in a handle, registers
    /// with the tracker and records the region's identity.
    pub fn allocate_memory(&self, size: usize) -> Result<HostBuffer> {
        self.check_open("allocate_memory")?;
        if size == 0 {
            return Ok(HostBuffer::empty());
        }
        self.check_resource_cap()?;

        let block = self.pool.allocate(size)?;
        let addr = block.addr();
        let handle = Arc::new(MemoryHandle::new(block, size, self.pool.clone()));
        let id = handle.id().to_string();
        let (ptr, capacity) = handle.raw_parts()?;

        {
            let mut handles = self.handles.lock();
            let mut buffer_ids = self.buffer_ids.lock();

            // A lingering identity entry means this region was released
            // behind the manager's back (direct handle close) and the pool
            // has reissued it. Retire the stale handle without double
            // counting.
            if let Some(stale_id) = buffer_ids.remove(&addr) {
                if let Some(stale) = handles.remove(&stale_id) {
                    log::warn!(
                        "Region {:#x} reissued while handle '{}' was still mapped; retiring it",
                        addr,
                        stale_id
                    );
                    let _ = stale.close();
                    self.sub_counters(stale.type_tag(), stale.size_bytes());
                }
            }

            let dyn_handle: Arc<dyn TrackedResource> = handle.clone();
            self.tracker.register(&dyn_handle);
            handles.insert(id.clone(), dyn_handle);
            buffer_ids.insert(addr, id.clone());
        }
        self.add_counters(ResourceType::Buffer, size);

        Ok(HostBuffer {
            ptr,
            len: size,
            capacity,
            addr,
            handle_id: id,
            handle: Some(handle),
            position: 0,
        })
    }

    /// Release a buffer by identity
    ///
    /// Empty buffers are a no-op. An unknown identity (double release or
    /// a release the manager lost track of) logs a warning and still
    /// offers the region back to the pool by closing the buffer's backing
    /// handle; for an already-closed handle that close is a no-op.
    pub fn release_memory(&self, buffer: HostBuffer) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }

        let handle = {
            let mut handles = self.handles.lock();
            let mut buffer_ids = self.buffer_ids.lock();
            match buffer_ids.remove(&buffer.addr) {
                Some(id) => handles.remove(&id),
                None => None,
            }
        };

        match handle {
            Some(handle) => {
                let tag = handle.type_tag();
                let size = handle.size_bytes();
                let result = handle.close();
                // The handle left the maps either way; accounting follows.
                self.sub_counters(tag, size);
                result
            }
            None => {
                log::warn!(
                    "Release of untracked buffer at {:#x} ({} bytes)",
                    buffer.addr,
                    buffer.len
                );
                // Defensive: the backing handle may still own the region.
                // Closing it hands the region to the pool; on a genuine
                // double release the handle is already closed and nothing
                // happens.
                if let Some(backing) = buffer.handle {
                    if backing.is_valid() {
                        log::warn!(
                            "Orphaned handle '{}' still owned region {:#x}; returning it to the pool",
                            backing.id(),
                            buffer.addr
                        );
                    }
                    if let Err(e) = backing.close() {
                        log::error!(
                            "Defensive close of '{}' failed: {}",
                            backing.id(),
                            e
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Adopt a foreign typed handle into tracking and accounting
    pub fn register(&self, handle: Arc<dyn TrackedResource>) -> Result<()> {
        self.check_open("register")?;
        self.check_resource_cap()?;

        let tag = handle.type_tag();
        let size = handle.size_bytes();
        {
            let mut handles = self.handles.lock();
            self.tracker.register(&handle);
            handles.insert(handle.id().to_string(), handle);
        }
        self.add_counters(tag, size);
        Ok(())
    }

    /// Close a registered handle and drop it from accounting
    pub fn unregister(&self, handle: &Arc<dyn TrackedResource>) -> Result<()> {
        let removed = {
            let mut handles = self.handles.lock();
            let mut buffer_ids = self.buffer_ids.lock();
            let removed = handles.remove(handle.id());
            if removed.is_some() {
                buffer_ids.retain(|_, id| id != handle.id());
            }
            removed
        };

        match removed {
            Some(owned) => {
                let tag = owned.type_tag();
                let size = owned.size_bytes();
                let result = owned.close();
                self.sub_counters(tag, size);
                result
            }
            None => {
                log::warn!("Unregister of unknown handle '{}'", handle.id());
                Ok(())
            }
        }
    }

    /// Allocate a pinned DMA region
    ///
    /// Fails with `GpuNotConfigured` until a driver is installed.
    pub fn allocate_pinned(&self, size: usize, access: MemoryAccess) -> Result<PinnedRegion> {
        self.check_open("allocate_pinned")?;
        let pinned = self
            .pinned
            .read()
            .clone()
            .ok_or(ResourceError::GpuNotConfigured)?;
        pinned.allocate(size, access)
    }

    /// Live handles carrying the given tag
    pub fn get_resources_by_type(&self, tag: ResourceType) -> Vec<Arc<dyn TrackedResource>> {
        self.handles
            .lock()
            .values()
            .filter(|handle| handle.type_tag() == tag)
            .cloned()
            .collect()
    }

    /// Byte subtotal for one resource type
    pub fn get_allocated_bytes(&self, tag: ResourceType) -> u64 {
        self.bytes_by_type[tag.index()].load(Ordering::Relaxed)
    }

    /// Sum of all per-type byte counters
    pub fn get_total_allocated_bytes(&self) -> u64 {
        self.bytes_by_type
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .sum()
    }

    /// Close every handle older than `max_age`; returns the count closed
    pub fn cleanup_unused(&self, max_age: Duration) -> usize {
        let victims: Vec<Arc<dyn TrackedResource>> = {
            let handles = self.handles.lock();
            handles
                .values()
                .filter(|handle| handle.age() > max_age)
                .cloned()
                .collect()
        };

        let mut closed = 0;
        for victim in victims {
            let removed = {
                let mut handles = self.handles.lock();
                let mut buffer_ids = self.buffer_ids.lock();
                let removed = handles.remove(victim.id());
                if removed.is_some() {
                    buffer_ids.retain(|_, id| id != victim.id());
                }
                removed
            };
            if let Some(handle) = removed {
                let tag = handle.type_tag();
                let size = handle.size_bytes();
                match handle.close() {
                    Ok(()) => closed += 1,
                    Err(e) => log::error!("Cleanup close of '{}' failed: {}", handle.id(), e),
                }
                self.sub_counters(tag, size);
            }
        }

        if closed > 0 {
            log::info!("Cleanup closed {} stale handle(s)", closed);
        }
        closed
    }

    /// One maintenance pass: pool eviction plus stale-handle cleanup
    pub fn perform_maintenance(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.pool.evict_expired();
        self.cleanup_unused(self.config.max_idle);
    }

    /// Aggregate statistics snapshot
    pub fn get_statistics(&self) -> ManagerStats {
        let mut bytes_by_type = HashMap::new();
        let mut count_by_type = HashMap::new();
        for tag in ResourceType::all() {
            let bytes = self.bytes_by_type[tag.index()].load(Ordering::Relaxed);
            let count = self.count_by_type[tag.index()].load(Ordering::Relaxed);
            if bytes > 0 || count > 0 {
                bytes_by_type.insert(tag.as_str().to_string(), bytes);
                count_by_type.insert(tag.as_str().to_string(), count);
            }
        }

        ManagerStats {
            active_resources: self.handles.lock().len(),
            total_bytes: self.get_total_allocated_bytes(),
            bytes_by_type,
            count_by_type,
            pool: self.pool.stats(),
            tracker_active: self.tracker.active_count(),
            tracker_totals: self.tracker.totals(),
            collected_at: SystemTime::now(),
        }
    }

    /// Aggregate statistics rendered as JSON
    pub fn get_statistics_json(&self) -> String {
        match serde_json::to_string_pretty(&self.get_statistics()) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize statistics: {}", e);
                String::from("{}")
            }
        }
    }

    /// The tracker backing this manager
    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// The pool backing this manager
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The effective configuration
    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// Close every outstanding handle, clear the pool, shut the tracker
    /// down and join background workers; idempotent
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Resource manager closing");

        if let Some(scheduler) = self.maintenance.lock().take() {
            scheduler.shutdown();
        }

        let drained: Vec<Arc<dyn TrackedResource>> = {
            let mut handles = self.handles.lock();
            let mut buffer_ids = self.buffer_ids.lock();
            buffer_ids.clear();
            handles.drain().map(|(_, handle)| handle).collect()
        };

        let mut causes = Vec::new();
        for handle in drained {
            let tag = handle.type_tag();
            let size = handle.size_bytes();
            if let Err(e) = handle.close() {
                causes.push(format!("{}: {}", handle.id(), e));
            }
            self.sub_counters(tag, size);
        }

        if let Some(pinned) = self.pinned.write().take() {
            pinned.close();
        }
        self.pool.close();
        self.tracker.shutdown();

        if causes.is_empty() {
            Ok(())
        } else {
            Err(ResourceError::CloseFailed { causes })
        }
    }

    fn check_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ResourceError::invalid_state(
                "resource-manager",
                operation,
                "open",
                "closed",
            ))
        } else {
            Ok(())
        }
    }

    fn check_resource_cap(&self) -> Result<()> {
        let active = self.tracker.active_count();
        if active >= self.config.max_resource_count {
            return Err(ResourceError::alloc_failed(format!(
                "active resource cap reached ({} of {})",
                active, self.config.max_resource_count
            )));
        }
        Ok(())
    }

    fn add_counters(&self, tag: ResourceType, bytes: usize) {
        self.bytes_by_type[tag.index()].fetch_add(bytes as u64, Ordering::Relaxed);
        self.count_by_type[tag.index()].fetch_add(1, Ordering::Relaxed);
    }

    fn sub_counters(&self, tag: ResourceType, bytes: usize) {
        self.bytes_by_type[tag.index()].fetch_sub(bytes as u64, Ordering::Relaxed);
        self.count_by_type[tag.index()].fetch_sub(1, Ordering::Relaxed);
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(e) = self.close() {
                log::error!("Resource manager close on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::MockGpuDriver;
    use crate::handle::GpuResourceHandle;

    fn test_manager() -> Arc<ResourceManager> {
        ResourceManager::new(ResourceConfig::minimal()).unwrap()
    }

    #[test]
    fn test_allocate_release_round_trip() {
        let manager = test_manager();

        let buffer = manager.allocate_memory(4096).unwrap();
        assert_eq!(buffer.len(), 4096);
        assert!(buffer.as_slice().iter().all(|&b| b == 0));

        let stats = manager.get_statistics();
        assert_eq!(stats.active_resources, 1);
        assert_eq!(stats.pool.misses, 1);
        assert_eq!(stats.pool.hits, 0);
        assert_eq!(manager.get_allocated_bytes(ResourceType::Buffer), 4096);

        let addr = buffer.base_addr();
        manager.release_memory(buffer).unwrap();
        assert_eq!(manager.get_allocated_bytes(ResourceType::Buffer), 0);

        let again = manager.allocate_memory(4096).unwrap();
        assert_eq!(again.base_addr(), addr);
        let stats = manager.get_statistics();
        assert_eq!(stats.pool.hits, 1);
        assert_eq!(stats.active_resources, 1);

        manager.release_memory(again).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_zero_size_allocation() {
        let manager = test_manager();
        let buffer = manager.allocate_memory(0).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(manager.get_statistics().active_resources, 0);
        manager.release_memory(buffer).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_double_release_is_warned_noop() {
        let manager = test_manager();
        let buffer = manager.allocate_memory(1024).unwrap();

        // Fabricate a second view of the same identity, sharing the same
        // backing handle the way a duplicated buffer reference would.
        let ghost = HostBuffer {
            ptr: std::ptr::null_mut(),
            len: 1024,
            capacity: 1024,
            addr: buffer.base_addr(),
            handle_id: buffer.handle_id().to_string(),
            handle: buffer.handle.clone(),
            position: 0,
        };

        manager.release_memory(buffer).unwrap();
        assert_eq!(manager.pool().idle_in_class(1024), 1);

        // The second release warns, finds the handle already closed and
        // must not park the region twice.
        manager.release_memory(ghost).unwrap();
        assert_eq!(manager.pool().idle_in_class(1024), 1);
        assert_eq!(manager.get_statistics().active_resources, 0);
        manager.close().unwrap();
    }

    #[test]
    fn test_lost_release_still_returns_region_to_pool() {
        let manager = test_manager();
        let buffer = manager.allocate_memory(1024).unwrap();
        let addr = buffer.base_addr();

        // Simulate a lost release: the bookkeeping entries vanish while
        // the handle stays open and keeps owning its region.
        {
            let mut handles = manager.handles.lock();
            let mut buffer_ids = manager.buffer_ids.lock();
            buffer_ids.remove(&addr).unwrap();
            let orphan = handles.remove(buffer.handle_id()).unwrap();
            manager.sub_counters(orphan.type_tag(), orphan.size_bytes());
        }
        assert_eq!(manager.pool().idle_in_class(1024), 0);

        // The identity lookup misses, but the defensive path closes the
        // orphaned handle and its region lands back in the pool.
        manager.release_memory(buffer).unwrap();
        assert_eq!(manager.pool().idle_in_class(1024), 1);
        assert_eq!(manager.tracker().active_count(), 0);

        let reused = manager.allocate_memory(1024).unwrap();
        assert_eq!(reused.base_addr(), addr);
        assert_eq!(manager.get_statistics().pool.hits, 1);
        manager.release_memory(reused).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_cursor_does_not_affect_identity() {
        let manager = test_manager();
        let mut buffer = manager.allocate_memory(4096).unwrap();
        buffer.set_position(1024).unwrap();
        assert_eq!(buffer.remaining(), 3072);

        manager.release_memory(buffer).unwrap();

        let again = manager.allocate_memory(4096).unwrap();
        assert_eq!(manager.get_statistics().pool.hits, 1);
        manager.release_memory(again).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_foreign_handle_registration() {
        let manager = test_manager();
        let driver = Arc::new(MockGpuDriver::new());

        let device = driver.create_buffer(2048, MemoryAccess::ReadWrite).unwrap();
        let handle: Arc<dyn TrackedResource> = Arc::new(GpuResourceHandle::new(
            ResourceType::Texture,
            2048,
            device,
            driver.clone(),
        ));
        manager.register(handle.clone()).unwrap();

        assert_eq!(manager.get_allocated_bytes(ResourceType::Texture), 2048);
        assert_eq!(manager.get_resources_by_type(ResourceType::Texture).len(), 1);
        assert_eq!(manager.get_total_allocated_bytes(), 2048);

        manager.unregister(&handle).unwrap();
        assert_eq!(manager.get_allocated_bytes(ResourceType::Texture), 0);
        assert_eq!(driver.live_buffers(), 0);
        manager.close().unwrap();
    }

    #[test]
    fn test_resource_cap_enforced() {
        let mut config = ResourceConfig::minimal();
        config.max_resource_count = 2;
        let manager = ResourceManager::new(config).unwrap();

        let a = manager.allocate_memory(128).unwrap();
        let b = manager.allocate_memory(128).unwrap();
        let err = manager.allocate_memory(128).unwrap_err();
        assert!(matches!(err, ResourceError::AllocFailed { .. }));

        manager.release_memory(a).unwrap();
        manager.release_memory(b).unwrap();
        manager.close().unwrap();
    }

    #[test]
    fn test_pinned_requires_gpu() {
        let manager = test_manager();
        let err = manager
            .allocate_pinned(1024, MemoryAccess::ReadWrite)
            .unwrap_err();
        assert!(matches!(err, ResourceError::GpuNotConfigured));

        manager.install_gpu_driver(Arc::new(MockGpuDriver::new()));
        let region = manager
            .allocate_pinned(1024, MemoryAccess::ReadWrite)
            .unwrap();
        assert_eq!(region.capacity(), 1024);
        drop(region);
        manager.close().unwrap();
    }

    #[test]
    fn test_cleanup_unused_closes_old_handles() {
        let manager = test_manager();
        let _buffer = manager.allocate_memory(512).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(manager.cleanup_unused(Duration::from_millis(5)), 1);
        assert_eq!(manager.get_statistics().active_resources, 0);
        manager.close().unwrap();
    }

    #[test]
    fn test_close_shuts_everything_down() {
        let manager = test_manager();
        let _a = manager.allocate_memory(256).unwrap();
        let _b = manager.allocate_memory(256).unwrap();

        manager.close().unwrap();
        assert!(manager.allocate_memory(128).is_err());
        assert_eq!(manager.get_total_allocated_bytes(), 0);
        assert_eq!(manager.tracker().active_count(), 0);

        // Idempotent.
        manager.close().unwrap();
    }

    #[test]
    fn test_statistics_json_renders() {
        let manager = test_manager();
        let buffer = manager.allocate_memory(1000).unwrap();
        let json = manager.get_statistics_json();
        assert!(json.contains("\"active_resources\": 1"));
        assert!(json.contains("\"Buffer\""));
        manager.release_memory(buffer).unwrap();
        manager.close().unwrap();
    }
}
