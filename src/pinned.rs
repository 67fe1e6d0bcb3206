//! # Pinned Buffer Pool
//!
//! Sibling of the host pool for regions that are simultaneously
//! host-accessible and device-visible, suitable for DMA staging. Shares
//! the power-of-two size-class discipline; a pooled entry is only reused
//! for the same class and access mode. Construction requires a GPU
//! driver; the manager surfaces `GpuNotConfigured` when none is
//! installed.

use crate::error::Result;
use crate::gpu::{check_result, check_status, GpuDriver};
use crate::types::{MemoryAccess, PinnedPoolStats};
use crate::utils::round_up_pow2;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::slice;
use std::sync::Arc;

struct PinnedBlock {
    device: u64,
    host: *mut u8,
    class: usize,
    access: MemoryAccess,
}

// A block is owned by exactly one holder (a bucket or a PinnedRegion);
// the host pointer is never shared.
unsafe impl Send for PinnedBlock {}

struct PinnedInner {
    buckets: HashMap<(usize, u32), VecDeque<PinnedBlock>>,
    hits: u64,
    misses: u64,
    closed: bool,
}

/// Pool of host-mapped device buffers
pub struct PinnedBufferPool {
    driver: Arc<dyn GpuDriver>,
    inner: Mutex<PinnedInner>,
    max_per_class: usize,
}

impl PinnedBufferPool {
    pub fn new(driver: Arc<dyn GpuDriver>, max_per_class: usize) -> Self {
        log::info!("Created pinned buffer pool (max {} per class)", max_per_class);
        Self {
            driver,
            inner: Mutex::new(PinnedInner {
                buckets: HashMap::new(),
                hits: 0,
                misses: 0,
                closed: false,
            }),
            max_per_class,
        }
    }

    /// Allocate a pinned region of at least `size` bytes
    ///
    /// Reuses a parked block of the same class and access mode when one
    /// exists; otherwise creates and maps a fresh device buffer. The host
    /// view is zeroed either way.
    pub fn allocate(self: &Arc<Self>, size: usize, access: MemoryAccess) -> Result<PinnedRegion> {
        let class = round_up_pow2(size.max(1));
        let key = (class, access.driver_flags());

        let reused = {
            let mut inner = self.inner.lock();
            let popped = inner
                .buckets
                .get_mut(&key)
                .and_then(|bucket| bucket.pop_back());
            match popped {
                Some(block) => {
                    inner.hits += 1;
                    Some(block)
                }
                None => {
                    inner.misses += 1;
                    None
                }
            }
        };

        let block = match reused {
            Some(block) => block,
            None => {
                let device = check_result(
                    "create_buffer",
                    self.driver.create_buffer(class, access),
                )?;
                let host = match check_result("map", self.driver.map(device)) {
                    Ok(ptr) => ptr,
                    Err(e) => {
                        let _ = self.driver.release(device);
                        return Err(e);
                    }
                };
                log::trace!("Pinned miss: fresh class {} (device {})", class, device);
                PinnedBlock {
                    device,
                    host,
                    class,
                    access,
                }
            }
        };

        unsafe { slice::from_raw_parts_mut(block.host, block.class) }.fill(0);

        Ok(PinnedRegion {
            block: Some(block),
            requested: size,
            pool: Arc::clone(self),
        })
    }

    /// Hit/miss counters; test hook
    pub fn stats(&self) -> PinnedPoolStats {
        let inner = self.inner.lock();
        PinnedPoolStats {
            idle_regions: inner.buckets.values().map(|b| b.len()).sum(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }

    /// Release every parked block and reject future parking
    pub fn close(&self) {
        let drained: Vec<PinnedBlock> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner
                .buckets
                .drain()
                .flat_map(|(_, bucket)| bucket.into_iter())
                .collect()
        };
        for block in drained {
            self.destroy(block);
        }
        log::info!("Pinned buffer pool closed");
    }

    /// Park a block for reuse, or destroy it when capacity forbids
    fn recycle_or_destroy(&self, block: PinnedBlock) {
        let key = (block.class, block.access.driver_flags());
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Some(block)
            } else {
                let bucket = inner.buckets.entry(key).or_insert_with(VecDeque::new);
                if bucket.len() < self.max_per_class {
                    bucket.push_back(block);
                    None
                } else {
                    Some(block)
                }
            }
        };
        // Destruction happens outside the lock.
        if let Some(block) = rejected {
            self.destroy(block);
        }
    }

    fn destroy(&self, block: PinnedBlock) {
        if let Err(e) = check_status("unmap", self.driver.unmap(block.device)) {
            log::warn!("Unmap of pinned device buffer {} failed: {}", block.device, e);
        }
        if let Err(e) = check_status("release", self.driver.release(block.device)) {
            log::warn!(
                "Release of pinned device buffer {} failed: {}",
                block.device,
                e
            );
        }
    }
}

/// Compound owning value: host byte view + device handle + size
///
/// Dropping (or closing) hands the block back to the pinned pool; when
/// capacity forbids parking, the device buffer unmaps and releases
/// instead.
pub struct PinnedRegion {
    block: Option<PinnedBlock>,
    requested: usize,
    pool: Arc<PinnedBufferPool>,
}

impl std::fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("requested", &self.requested)
            .field("has_block", &self.block.is_some())
            .finish()
    }
}

impl PinnedRegion {
    /// Requested size in bytes
    pub fn len(&self) -> usize {
        self.requested
    }

    pub fn is_empty(&self) -> bool {
        self.requested == 0
    }

    /// Full mapped capacity (the size class)
    pub fn capacity(&self) -> usize {
        self.block.as_ref().map_or(0, |b| b.class)
    }

    /// Device-side handle for enqueue operations
    pub fn device_handle(&self) -> u64 {
        self.block.as_ref().map_or(0, |b| b.device)
    }

    pub fn access(&self) -> Option<MemoryAccess> {
        self.block.as_ref().map(|b| b.access)
    }

    /// Host view of the mapped region
    pub fn as_slice(&self) -> &[u8] {
        match &self.block {
            Some(block) => unsafe { slice::from_raw_parts(block.host, block.class) },
            None => &[],
        }
    }

    /// Mutable host view of the mapped region
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.block {
            Some(block) => unsafe { slice::from_raw_parts_mut(block.host, block.class) },
            None => &mut [],
        }
    }

    /// Explicit close; equivalent to dropping
    pub fn close(mut self) {
        self.release_block();
    }

    fn release_block(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.recycle_or_destroy(block);
        }
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        self.release_block();
    }
}
