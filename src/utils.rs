//! # Utility Functions
//!
//! Shared helpers: byte formatting, power-of-two math, the monotonic
//! nanosecond clock every handle timestamps against, the page-size probe
//! and the process-wide debug flags.

use once_cell::sync::Lazy;
use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Process start reference for the monotonic clock
static CLOCK_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// When set, handle construction captures an allocation-site description
static DEBUG_CAPTURE: Lazy<AtomicBool> =
    Lazy::new(|| AtomicBool::new(std::env::var_os("RESOURCE_DEBUG").is_some()));

/// When set, the tracker force-closes survivors during its shutdown audit
/// instead of marking them leaked
static FORCE_CLOSE_ON_SHUTDOWN: Lazy<AtomicBool> =
    Lazy::new(|| AtomicBool::new(std::env::var_os("RESOURCE_FORCE_CLOSE").is_some()));

/// Monotonic nanoseconds since an arbitrary process-local epoch
pub fn now_nanos() -> u64 {
    CLOCK_EPOCH.elapsed().as_nanos() as u64
}

/// Enable or disable allocation-site capture for new handles
pub fn set_debug_capture(enabled: bool) {
    DEBUG_CAPTURE.store(enabled, Ordering::Relaxed);
    log::info!(
        "Allocation-site capture {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

/// Check whether allocation-site capture is on
pub fn debug_capture_enabled() -> bool {
    DEBUG_CAPTURE.load(Ordering::Relaxed)
}

/// Control the tracker's shutdown behavior for surviving handles
pub fn set_force_close_on_shutdown(enabled: bool) {
    FORCE_CLOSE_ON_SHUTDOWN.store(enabled, Ordering::Relaxed);
}

/// Whether the tracker should force-close survivors at shutdown
pub fn force_close_on_shutdown() -> bool {
    FORCE_CLOSE_ON_SHUTDOWN.load(Ordering::Relaxed)
}

/// Capture a short description of the caller's stack
///
/// Returns `None` when the debug flag is off; the backtrace machinery is
/// never touched in that case. The captured text keeps at most eight
/// caller frames, skipping the capture machinery itself.
pub fn capture_call_site() -> Option<String> {
    if !debug_capture_enabled() {
        return None;
    }

    let rendered = Backtrace::force_capture().to_string();
    let frames: Vec<String> = rendered
        .lines()
        .map(str::trim)
        .filter(|line| {
            // Frame symbol lines look like "3: path::to::function"
            line.split_once(": ")
                .map_or(false, |(idx, _)| idx.chars().all(|c| c.is_ascii_digit()))
        })
        .filter(|line| !line.contains("capture_call_site") && !line.contains("std::backtrace"))
        .take(8)
        .map(|line| line.to_string())
        .collect();

    if frames.is_empty() {
        None
    } else {
        Some(frames.join("\n"))
    }
}

/// Format bytes in a human-readable form (B, KB, MB, GB, TB)
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let value = bytes_f / THRESHOLD.powi(unit_index as i32);

    format!("{:.2} {}", value, UNITS[unit_index])
}

/// Round up to the nearest power of two, treating zero as one
///
/// This is the size-class key function of the buffer pool.
pub fn round_up_pow2(size: usize) -> usize {
    size.max(1).next_power_of_two()
}

/// Check if a value is a power of two
pub fn is_power_of_two(value: usize) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// System memory page size
#[cfg(unix)]
pub fn page_size() -> usize {
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as usize
    } else {
        4096
    }
}

/// System memory page size (fallback for non-unix targets)
#[cfg(not(unix))]
pub fn page_size() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_round_up_pow2() {
        assert_eq!(round_up_pow2(0), 1);
        assert_eq!(round_up_pow2(1), 1);
        assert_eq!(round_up_pow2(2), 2);
        assert_eq!(round_up_pow2(3), 4);
        assert_eq!(round_up_pow2(300), 512);
        assert_eq!(round_up_pow2(700), 1024);
        assert_eq!(round_up_pow2(1024), 1024);
        assert_eq!(round_up_pow2(1025), 2048);
    }

    #[test]
    fn test_is_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(4096));
        assert!(!is_power_of_two(4097));
    }

    #[test]
    fn test_clock_is_monotonic() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_capture_disabled_is_free() {
        set_debug_capture(false);
        assert!(capture_call_site().is_none());
    }

    #[test]
    fn test_capture_enabled_yields_frames() {
        set_debug_capture(true);
        let site = capture_call_site();
        set_debug_capture(false);
        // Backtrace availability depends on build settings; when present it
        // must be bounded to a handful of frames.
        if let Some(text) = site {
            assert!(text.lines().count() <= 8);
        }
    }

    #[test]
    fn test_page_size_sane() {
        let ps = page_size();
        assert!(is_power_of_two(ps));
        assert!(ps >= 1024);
    }
}
