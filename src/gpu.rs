//! # GPU Driver Boundary
//!
//! The narrow interface through which the core touches a GPU. Driver
//! methods report raw `i32` status codes; the core never interprets a code
//! beyond success versus error and forwards it verbatim inside
//! [`ResourceError::Gpu`]. A headless in-process driver backs the CI path.

use crate::error::{ResourceError, Result};
use crate::native::{NativeAllocator, RawRegion};
use crate::types::MemoryAccess;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// Raw driver status code; zero means success
pub type DriverStatus = i32;

/// Driver call that produces a value or a raw status code
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Convert a driver status into a crate result, forwarding the code
pub fn check_status(operation: &str, code: DriverStatus) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(ResourceError::Gpu {
            operation: operation.to_string(),
            code,
        })
    }
}

/// Convert a driver result into a crate result, forwarding the code
pub fn check_result<T>(operation: &str, result: DriverResult<T>) -> Result<T> {
    result.map_err(|code| ResourceError::Gpu {
        operation: operation.to_string(),
        code,
    })
}

/// Operations the core consumes from a GPU driver
///
/// Buffer handles are opaque `u64` values minted by the driver. All
/// methods are thread-safe.
pub trait GpuDriver: Send + Sync {
    /// Create a device buffer of `size` bytes with the given access mode
    fn create_buffer(&self, size: usize, access: MemoryAccess) -> DriverResult<u64>;

    /// Read `out.len()` bytes from `buffer` starting at `offset`
    fn enqueue_read(&self, buffer: u64, offset: usize, out: &mut [u8]) -> DriverStatus;

    /// Write `data` into `buffer` starting at `offset`
    fn enqueue_write(&self, buffer: u64, offset: usize, data: &[u8]) -> DriverStatus;

    /// Copy `bytes` bytes from `src` to `dst`
    fn enqueue_copy(&self, src: u64, dst: u64, bytes: usize) -> DriverStatus;

    /// Fill the first `bytes` bytes of `buffer` with `value`
    fn enqueue_fill(&self, buffer: u64, value: u8, bytes: usize) -> DriverStatus;

    /// Map the buffer into host address space; pointer stays valid until
    /// [`GpuDriver::unmap`]
    fn map(&self, buffer: u64) -> DriverResult<*mut u8>;

    /// Unmap a previously mapped buffer
    fn unmap(&self, buffer: u64) -> DriverStatus;

    /// Release the device buffer
    fn release(&self, buffer: u64) -> DriverStatus;
}

// Mock status codes. Real drivers have their own vocabularies; the core
// treats all of them as opaque.
const MOCK_ERR_UNKNOWN_HANDLE: DriverStatus = -38;
const MOCK_ERR_OUT_OF_BOUNDS: DriverStatus = -30;

struct MockBuffer {
    region: RawRegion,
    #[allow(dead_code)]
    access: MemoryAccess,
}

/// In-process driver backed by host memory
///
/// Used on machines without a GPU and on CI. Buffers live in native
/// regions, so mapped pointers are real host pointers and every enqueue
/// operation is an immediate memcpy.
pub struct MockGpuDriver {
    buffers: DashMap<u64, MockBuffer>,
    next_id: AtomicU64,
}

impl MockGpuDriver {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of live device buffers; test hook
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }
}

impl Default for MockGpuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDriver for MockGpuDriver {
    fn create_buffer(&self, size: usize, access: MemoryAccess) -> DriverResult<u64> {
        let region = NativeAllocator::alloc(size).map_err(|_| MOCK_ERR_OUT_OF_BOUNDS)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.insert(id, MockBuffer { region, access });
        log::trace!("Mock driver created buffer {} ({} bytes)", id, size);
        Ok(id)
    }

    fn enqueue_read(&self, buffer: u64, offset: usize, out: &mut [u8]) -> DriverStatus {
        match self.buffers.get(&buffer) {
            Some(entry) => {
                let data = entry.region.as_slice();
                if offset + out.len() > data.len() {
                    return MOCK_ERR_OUT_OF_BOUNDS;
                }
                out.copy_from_slice(&data[offset..offset + out.len()]);
                0
            }
            None => MOCK_ERR_UNKNOWN_HANDLE,
        }
    }

    fn enqueue_write(&self, buffer: u64, offset: usize, data: &[u8]) -> DriverStatus {
        match self.buffers.get_mut(&buffer) {
            Some(mut entry) => {
                let dst = entry.region.as_mut_slice();
                if offset + data.len() > dst.len() {
                    return MOCK_ERR_OUT_OF_BOUNDS;
                }
                dst[offset..offset + data.len()].copy_from_slice(data);
                0
            }
            None => MOCK_ERR_UNKNOWN_HANDLE,
        }
    }

    fn enqueue_copy(&self, src: u64, dst: u64, bytes: usize) -> DriverStatus {
        let chunk = {
            match self.buffers.get(&src) {
                Some(entry) => {
                    let data = entry.region.as_slice();
                    if bytes > data.len() {
                        return MOCK_ERR_OUT_OF_BOUNDS;
                    }
                    data[..bytes].to_vec()
                }
                None => return MOCK_ERR_UNKNOWN_HANDLE,
            }
        };
        self.enqueue_write(dst, 0, &chunk)
    }

    fn enqueue_fill(&self, buffer: u64, value: u8, bytes: usize) -> DriverStatus {
        match self.buffers.get_mut(&buffer) {
            Some(mut entry) => {
                let dst = entry.region.as_mut_slice();
                if bytes > dst.len() {
                    return MOCK_ERR_OUT_OF_BOUNDS;
                }
                dst[..bytes].fill(value);
                0
            }
            None => MOCK_ERR_UNKNOWN_HANDLE,
        }
    }

    fn map(&self, buffer: u64) -> DriverResult<*mut u8> {
        match self.buffers.get_mut(&buffer) {
            Some(mut entry) => Ok(entry.region.as_mut_slice().as_mut_ptr()),
            None => Err(MOCK_ERR_UNKNOWN_HANDLE),
        }
    }

    fn unmap(&self, buffer: u64) -> DriverStatus {
        if self.buffers.contains_key(&buffer) {
            0
        } else {
            MOCK_ERR_UNKNOWN_HANDLE
        }
    }

    fn release(&self, buffer: u64) -> DriverStatus {
        match self.buffers.remove(&buffer) {
            Some(_) => {
                log::trace!("Mock driver released buffer {}", buffer);
                0
            }
            None => MOCK_ERR_UNKNOWN_HANDLE,
        }
    }
}

/// Replaceable environment probe used to pick the headless driver path
static CI_PROBE: Lazy<RwLock<fn() -> bool>> = Lazy::new(|| RwLock::new(default_ci_probe));

fn default_ci_probe() -> bool {
    const INDICATORS: &[&str] = &[
        "CI",
        "CONTINUOUS_INTEGRATION",
        "GITHUB_ACTIONS",
        "GITLAB_CI",
        "JENKINS_URL",
        "BUILD_NUMBER",
    ];
    INDICATORS
        .iter()
        .any(|key| std::env::var_os(key).is_some())
}

/// Whether the process appears to run under CI
pub fn is_ci() -> bool {
    (*CI_PROBE.read())()
}

/// Replace the CI probe; test and embedder hook
pub fn set_ci_probe(probe: fn() -> bool) {
    *CI_PROBE.write() = probe;
}
