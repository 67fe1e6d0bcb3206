//! # Handle Core
//!
//! Shared RAII lifecycle for every resource kind the manager issues or
//! tracks: a compare-and-swap state machine, a random collision-resistant
//! ID, a monotonic allocation timestamp, an optional allocation-site
//! description and a one-shot cleanup callback. Concrete handle kinds
//! embed a [`HandleCore`] and supply their native release step through
//! [`HandleCore::close_with`].

use crate::error::{ResourceError, Result};
use crate::gpu::{check_status, GpuDriver};
use crate::pool::{BufferPool, PoolBlock};
use crate::tracker::ResourceTracker;
use crate::types::{HandleState, ResourceType};
use crate::utils::{capture_call_site, now_nanos};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// One-shot callback invoked before subtype cleanup
pub type CleanupCallback = Box<dyn FnOnce() + Send>;

/// Mint a random, collision-resistant handle ID with a type prefix
pub(crate) fn mint_id(prefix: &str) -> String {
    let n: u128 = rand::thread_rng().gen();
    format!("{}-{:032x}", prefix, n)
}

/// Shared lifecycle state embedded in every handle kind
pub struct HandleCore {
    /// Unique stable identifier
    id: String,

    /// Monotonic allocation timestamp in nanoseconds
    allocated_at: u64,

    /// Current lifecycle state; all transitions are compare-and-swap
    state: AtomicU8,

    /// Caller stack description; captured only when the debug flag is on
    allocation_site: Option<String>,

    /// One-shot callback run before subtype cleanup
    cleanup_callback: Mutex<Option<CleanupCallback>>,

    /// Back-reference to the registering tracker; never owning
    tracker: Mutex<Weak<ResourceTracker>>,
}

impl HandleCore {
    /// Create a core in the Allocated state
    pub fn new(tag: ResourceType) -> Self {
        Self {
            id: mint_id(tag.id_prefix()),
            allocated_at: now_nanos(),
            state: AtomicU8::new(HandleState::Allocated as u8),
            allocation_site: capture_call_site(),
            cleanup_callback: Mutex::new(None),
            tracker: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Time elapsed since allocation
    pub fn age(&self) -> Duration {
        Duration::from_nanos(now_nanos().saturating_sub(self.allocated_at))
    }

    /// Allocation timestamp in monotonic nanoseconds
    pub fn allocated_at(&self) -> u64 {
        self.allocated_at
    }

    pub fn allocation_site(&self) -> Option<&str> {
        self.allocation_site.as_deref()
    }

    /// Install the one-shot cleanup callback, replacing any previous one
    pub fn set_cleanup_callback(&self, callback: CleanupCallback) {
        *self.cleanup_callback.lock() = Some(callback);
    }

    /// Record the tracker this handle registered with
    pub(crate) fn attach_tracker(&self, tracker: Weak<ResourceTracker>) {
        *self.tracker.lock() = tracker;
    }

    /// Tracker-driven transition Allocated -> Leaked, skipping cleanup
    ///
    /// Returns whether this call performed the transition.
    pub(crate) fn mark_leaked(&self) -> bool {
        let moved = self
            .state
            .compare_exchange(
                HandleState::Allocated as u8,
                HandleState::Leaked as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if moved {
            // The callback must never fire for a leaked handle.
            self.cleanup_callback.lock().take();
        }
        moved
    }

    /// Run the shared close protocol around a subtype release step
    ///
    /// Exactly one caller wins the Allocated -> Closing transition and runs
    /// the callback and `release`; everyone else returns `Ok(())` with no
    /// side effects. A failed release moves the handle to Leaked, removes
    /// it from the tracker into the leaked totals and surfaces
    /// `CleanupFailed`.
    pub(crate) fn close_with<F>(&self, release: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let won = self.state.compare_exchange(
            HandleState::Allocated as u8,
            HandleState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if won.is_err() {
            return Ok(());
        }

        if let Some(callback) = self.cleanup_callback.lock().take() {
            callback();
        }

        match release() {
            Ok(()) => {
                if let Some(tracker) = self.tracker.lock().upgrade() {
                    tracker.note_closed(&self.id);
                }
                self.state
                    .store(HandleState::Closed as u8, Ordering::Release);
                log::trace!("Handle '{}' closed", self.id);
                Ok(())
            }
            Err(cause) => {
                self.state
                    .store(HandleState::Leaked as u8, Ordering::Release);
                if let Some(tracker) = self.tracker.lock().upgrade() {
                    tracker.note_cleanup_failure(&self.id);
                }
                log::error!("Cleanup failed for handle '{}': {}", self.id, cause);
                Err(ResourceError::cleanup_failed(
                    self.id.clone(),
                    cause.to_string(),
                ))
            }
        }
    }

    /// Error for operations that require the Allocated state
    pub(crate) fn invalid_state(&self, operation: &str) -> ResourceError {
        ResourceError::invalid_state(
            self.id.clone(),
            operation,
            HandleState::Allocated.as_str(),
            self.state().as_str(),
        )
    }
}

/// Capability set shared by every resource kind
///
/// A handle exclusively owns one native value and knows how to release
/// it; the tracker holds a weak back-reference keyed by ID.
pub trait TrackedResource: Send + Sync {
    /// The embedded lifecycle core
    fn core(&self) -> &HandleCore;

    /// Self-declared type tag
    fn type_tag(&self) -> ResourceType;

    /// Size of the owned native value in bytes
    fn size_bytes(&self) -> usize;

    /// Idempotent, thread-safe close
    fn close(&self) -> Result<()>;

    fn id(&self) -> &str {
        self.core().id()
    }

    fn state(&self) -> HandleState {
        self.core().state()
    }

    fn age(&self) -> Duration {
        self.core().age()
    }

    fn is_valid(&self) -> bool {
        self.state() == HandleState::Allocated
    }

    fn allocation_site(&self) -> Option<String> {
        self.core().allocation_site().map(str::to_string)
    }

    /// Install the one-shot cleanup callback
    fn set_cleanup_callback(&self, callback: CleanupCallback) {
        self.core().set_cleanup_callback(callback);
    }
}

impl std::fmt::Debug for dyn TrackedResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn TrackedResource")
            .field("id", &self.id())
            .field("type_tag", &self.type_tag())
            .field("state", &self.state())
            .finish()
    }
}

/// Handle over a pooled host byte region
///
/// Closing returns the region to the pool it came from; a pool past its
/// capacity (or already closed) frees the region natively instead.
pub struct MemoryHandle {
    core: HandleCore,
    requested: usize,
    addr: usize,
    block: Mutex<Option<PoolBlock>>,
    pool: Arc<BufferPool>,
}

impl MemoryHandle {
    pub fn new(block: PoolBlock, requested: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            core: HandleCore::new(ResourceType::Buffer),
            requested,
            addr: block.addr(),
            block: Mutex::new(Some(block)),
            pool,
        }
    }

    /// Base address of the owned region; identity key in the manager
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Capacity of the owned region, valid only while Allocated
    pub fn capacity(&self) -> Result<usize> {
        let guard = self.block.lock();
        match (&*guard, self.core.state()) {
            (Some(block), HandleState::Allocated) => Ok(block.len()),
            _ => Err(self.core.invalid_state("capacity")),
        }
    }

    /// Raw pointer and length of the region, valid only while Allocated
    pub(crate) fn raw_parts(&self) -> Result<(*mut u8, usize)> {
        let guard = self.block.lock();
        match (&*guard, self.core.state()) {
            (Some(block), HandleState::Allocated) => Ok(block.raw_parts()),
            _ => Err(self.core.invalid_state("raw_parts")),
        }
    }
}

impl TrackedResource for MemoryHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn type_tag(&self) -> ResourceType {
        ResourceType::Buffer
    }

    fn size_bytes(&self) -> usize {
        self.requested
    }

    fn close(&self) -> Result<()> {
        self.core.close_with(|| {
            if let Some(block) = self.block.lock().take() {
                self.pool.return_to_pool(block);
            }
            Ok(())
        })
    }
}

/// Handle over a foreign device-side object released through the driver
///
/// Covers textures, shader programs, kernels, events, samplers and
/// command queues alike; the tag and size are self-declared by whoever
/// registers the handle.
pub struct GpuResourceHandle {
    core: HandleCore,
    tag: ResourceType,
    size: usize,
    device_handle: u64,
    driver: Arc<dyn GpuDriver>,
}

impl GpuResourceHandle {
    pub fn new(tag: ResourceType, size: usize, device_handle: u64, driver: Arc<dyn GpuDriver>) -> Self {
        Self {
            core: HandleCore::new(tag),
            tag,
            size,
            device_handle,
            driver,
        }
    }

    /// The underlying device handle, valid only while Allocated
    pub fn device_handle(&self) -> Result<u64> {
        if self.core.state() == HandleState::Allocated {
            Ok(self.device_handle)
        } else {
            Err(self.core.invalid_state("device_handle"))
        }
    }
}

impl TrackedResource for GpuResourceHandle {
    fn core(&self) -> &HandleCore {
        &self.core
    }

    fn type_tag(&self) -> ResourceType {
        self.tag
    }

    fn size_bytes(&self) -> usize {
        self.size
    }

    fn close(&self) -> Result<()> {
        self.core.close_with(|| {
            check_status("release", self.driver.release(self.device_handle))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct ProbeHandle {
        core: HandleCore,
        releases: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ProbeHandle {
        fn new(fail: bool) -> (Self, Arc<AtomicUsize>) {
            let releases = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    core: HandleCore::new(ResourceType::Event),
                    releases: releases.clone(),
                    fail,
                },
                releases,
            )
        }
    }

    impl TrackedResource for ProbeHandle {
        fn core(&self) -> &HandleCore {
            &self.core
        }

        fn type_tag(&self) -> ResourceType {
            ResourceType::Event
        }

        fn size_bytes(&self) -> usize {
            0
        }

        fn close(&self) -> Result<()> {
            self.core.close_with(|| {
                self.releases.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err(ResourceError::invalid_argument("probe", "forced failure"))
                } else {
                    Ok(())
                }
            })
        }
    }

    #[test]
    fn test_close_happy_path() {
        let (handle, releases) = ProbeHandle::new(false);
        assert_eq!(handle.state(), HandleState::Allocated);
        assert!(handle.is_valid());

        handle.close().unwrap();
        assert_eq!(handle.state(), HandleState::Closed);
        assert!(!handle.is_valid());
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (handle, releases) = ProbeHandle::new(false);
        handle.close().unwrap();
        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn test_failed_cleanup_leaks() {
        let (handle, releases) = ProbeHandle::new(true);
        let err = handle.close().unwrap_err();
        assert!(matches!(err, ResourceError::CleanupFailed { .. }));
        assert_eq!(handle.state(), HandleState::Leaked);

        // Terminal: further closes are silent no-ops.
        handle.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_callback_runs_once_before_release() {
        let (handle, _) = ProbeHandle::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handle.set_cleanup_callback(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        handle.close().unwrap();
        handle.close().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mark_leaked_skips_cleanup() {
        let (handle, releases) = ProbeHandle::new(false);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        handle.set_cleanup_callback(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(handle.core().mark_leaked());
        assert_eq!(handle.state(), HandleState::Leaked);

        // Close after leak: no callback, no release.
        handle.close().unwrap();
        assert_eq!(releases.load(Ordering::SeqCst), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_close_single_winner() {
        let (handle, releases) = ProbeHandle::new(false);
        let handle = Arc::new(handle);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || h.close())
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }

        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert_eq!(handle.state(), HandleState::Closed);
    }

    #[test]
    fn test_ids_are_unique_and_prefixed() {
        let a = HandleCore::new(ResourceType::Texture);
        let b = HandleCore::new(ResourceType::Texture);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("tex-"));
    }

    #[test]
    fn test_age_grows() {
        let core = HandleCore::new(ResourceType::Kernel);
        std::thread::sleep(Duration::from_millis(5));
        assert!(core.age() >= Duration::from_millis(5));
    }
}
