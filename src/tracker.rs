//! # Resource Tracker
//!
//! Registry of live handles keyed by ID, with monotonic lifetime totals,
//! snapshot capture, snapshot diffing into leak reports, a background age
//! scan and a shutdown audit. The tracker never owns a handle: entries
//! hold weak references, and a handle's own close removes its entry.

use crate::handle::TrackedResource;
use crate::types::{ResourceType, TrackerTotals};
use crate::utils::{force_close_on_shutdown, now_nanos};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, SystemTime};

/// At most this many leak records are printed per type; the rest collapse
/// into an "and N more" line
const REPORT_LINES_PER_TYPE: usize = 5;

struct TrackedEntry {
    weak: Weak<dyn TrackedResource>,
    tag: ResourceType,
    size: usize,
    registered_at: u64,
}

/// Per-handle detail carried inside a snapshot
#[derive(Debug, Clone)]
pub struct HandleDetail {
    pub tag: ResourceType,
    pub age_at_capture: Duration,
    pub allocation_site: Option<String>,
}

/// Immutable capture of tracker state at one instant
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub captured_at: SystemTime,
    /// Active handle IDs grouped by type tag
    pub by_type: BTreeMap<ResourceType, BTreeSet<String>>,
    /// Detail per active handle ID
    pub details: HashMap<String, HandleDetail>,
    pub totals: TrackerTotals,
}

impl Snapshot {
    /// Total active handles in this snapshot
    pub fn active_count(&self) -> usize {
        self.by_type.values().map(|ids| ids.len()).sum()
    }

    fn contains(&self, id: &str) -> bool {
        self.details.contains_key(id)
    }
}

/// One surviving handle in a leak report
#[derive(Debug, Clone)]
pub struct LeakRecord {
    pub id: String,
    pub tag: ResourceType,
    pub age_at_capture: Duration,
    pub allocation_site: Option<String>,
}

/// Diff between two snapshots: handles alive in `after` that were not
/// alive in `before`
#[derive(Debug, Clone)]
pub struct LeakReport {
    pub leaks: BTreeMap<ResourceType, Vec<LeakRecord>>,
    pub before: Snapshot,
    pub after: Snapshot,
}

impl LeakReport {
    /// Number of leaked handles across all types
    pub fn net_leaks(&self) -> usize {
        self.leaks.values().map(|records| records.len()).sum()
    }

    /// Leaked handle count for one type
    pub fn leaks_of_type(&self, tag: ResourceType) -> usize {
        self.leaks.get(&tag).map_or(0, |records| records.len())
    }

    /// Render the report as human-readable text
    ///
    /// Per-type lists are capped at five entries with an "and N more"
    /// line; allocation sites print indented when available.
    pub fn format(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Leak Report ===");
        let _ = writeln!(
            out,
            "Before: {} active, After: {} active",
            self.before.active_count(),
            self.after.active_count()
        );
        let _ = writeln!(out, "Total Leaks: {}", self.net_leaks());

        for (tag, records) in &self.leaks {
            if records.is_empty() {
                continue;
            }
            let _ = writeln!(out, "  {} ({}):", tag, records.len());
            for record in records.iter().take(REPORT_LINES_PER_TYPE) {
                let _ = writeln!(
                    out,
                    "    {} age {:.1}s",
                    record.id,
                    record.age_at_capture.as_secs_f64()
                );
                if let Some(site) = &record.allocation_site {
                    for line in site.lines() {
                        let _ = writeln!(out, "      at {}", line);
                    }
                }
            }
            if records.len() > REPORT_LINES_PER_TYPE {
                let _ = writeln!(
                    out,
                    "    ... and {} more",
                    records.len() - REPORT_LINES_PER_TYPE
                );
            }
        }
        out
    }
}

enum ScanCommand {
    ScanNow,
    Shutdown,
}

struct ScanWorker {
    sender: Sender<ScanCommand>,
    thread: thread::JoinHandle<()>,
}

/// Leak-detecting registry of live resource handles
///
/// The entry map is a concurrent map (lock-free reads, linearizable
/// insert/remove); totals are atomics. At every observable instant
/// `active_count() == allocated - freed - leaked`.
pub struct ResourceTracker {
    entries: DashMap<String, TrackedEntry>,
    total_allocated: AtomicU64,
    total_freed: AtomicU64,
    total_leaked: AtomicU64,
    /// Age threshold for scan warnings; zero disables the warning
    max_idle: Duration,
    shut_down: AtomicBool,
    scanner: Mutex<Option<ScanWorker>>,
}

impl ResourceTracker {
    pub fn new(max_idle: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            total_allocated: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            total_leaked: AtomicU64::new(0),
            max_idle,
            shut_down: AtomicBool::new(false),
            scanner: Mutex::new(None),
        }
    }

    /// Register a handle; constant time
    ///
    /// Attaches a weak back-reference to this tracker so the handle's own
    /// close can unregister itself. After shutdown this is a no-op with a
    /// warning.
    pub fn register(self: &Arc<Self>, handle: &Arc<dyn TrackedResource>) {
        if self.shut_down.load(Ordering::Acquire) {
            log::warn!(
                "Ignoring registration of '{}' after tracker shutdown",
                handle.id()
            );
            return;
        }

        handle.core().attach_tracker(Arc::downgrade(self));
        self.entries.insert(
            handle.id().to_string(),
            TrackedEntry {
                weak: Arc::downgrade(handle),
                tag: handle.type_tag(),
                size: handle.size_bytes(),
                registered_at: now_nanos(),
            },
        );
        self.total_allocated.fetch_add(1, Ordering::Relaxed);
        log::trace!("Registered '{}' ({})", handle.id(), handle.type_tag());
    }

    /// Unregister a handle; constant time, idempotent
    pub fn unregister(&self, handle: &dyn TrackedResource) {
        self.note_closed(handle.id());
    }

    /// Record a successful close; called by the handle core
    pub(crate) fn note_closed(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.total_freed.fetch_add(1, Ordering::Relaxed);
            log::trace!("Unregistered '{}'", id);
        }
    }

    /// Record a cleanup failure; called by the handle core
    pub(crate) fn note_cleanup_failure(&self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.total_leaked.fetch_add(1, Ordering::Relaxed);
            log::warn!("Handle '{}' leaked after cleanup failure", id);
        }
    }

    /// Number of live entries; O(1)
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Snapshot copy of the active IDs; O(n)
    pub fn active_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Look up a live handle by ID
    pub fn get(&self, id: &str) -> Option<Arc<dyn TrackedResource>> {
        self.entries.get(id).and_then(|entry| entry.weak.upgrade())
    }

    /// Lifetime totals
    pub fn totals(&self) -> TrackerTotals {
        TrackerTotals {
            allocated: self.total_allocated.load(Ordering::Relaxed),
            freed: self.total_freed.load(Ordering::Relaxed),
            leaked: self.total_leaked.load(Ordering::Relaxed),
        }
    }

    /// Close every active handle; emergency escape hatch
    ///
    /// Returns the number of handles that closed cleanly.
    pub fn force_close_all(&self) -> usize {
        let ids = self.active_ids();
        let mut closed = 0;
        for id in ids {
            if let Some(handle) = self.get(&id) {
                match handle.close() {
                    Ok(()) => closed += 1,
                    Err(e) => log::error!("Force close of '{}' failed: {}", id, e),
                }
            } else {
                // Dropped without close; nothing left to release.
                self.note_cleanup_failure(&id);
            }
        }
        log::info!("Force closed {} handle(s)", closed);
        closed
    }

    /// Capture an immutable snapshot of the active set
    pub fn capture_snapshot(&self) -> Snapshot {
        let mut by_type: BTreeMap<ResourceType, BTreeSet<String>> = BTreeMap::new();
        let mut details: HashMap<String, HandleDetail> = HashMap::new();

        for entry in self.entries.iter() {
            let id = entry.key().clone();
            let tag = entry.value().tag;
            let age = Duration::from_nanos(now_nanos().saturating_sub(entry.value().registered_at));
            let site = entry
                .value()
                .weak
                .upgrade()
                .and_then(|handle| handle.allocation_site());

            by_type.entry(tag).or_default().insert(id.clone());
            details.insert(
                id,
                HandleDetail {
                    tag,
                    age_at_capture: age,
                    allocation_site: site,
                },
            );
        }

        Snapshot {
            captured_at: SystemTime::now(),
            by_type,
            details,
            totals: self.totals(),
        }
    }

    /// Diff two snapshots into a leak report
    ///
    /// A leak record is emitted for every ID active in `after` that was
    /// not active in `before`; both snapshots travel with the report for
    /// context.
    pub fn diff(before: &Snapshot, after: &Snapshot) -> LeakReport {
        let mut leaks: BTreeMap<ResourceType, Vec<LeakRecord>> = BTreeMap::new();

        for (tag, ids) in &after.by_type {
            for id in ids {
                if before.contains(id) {
                    continue;
                }
                let detail = &after.details[id];
                leaks.entry(*tag).or_default().push(LeakRecord {
                    id: id.clone(),
                    tag: *tag,
                    age_at_capture: detail.age_at_capture,
                    allocation_site: detail.allocation_site.clone(),
                });
            }
        }

        for records in leaks.values_mut() {
            records.sort_by(|a, b| a.id.cmp(&b.id));
        }

        LeakReport {
            leaks,
            before: before.clone(),
            after: after.clone(),
        }
    }

    /// Walk the active set once, warning about handles past the age limit
    ///
    /// Never closes and never unregisters; detection only.
    pub fn scan_once(&self) -> usize {
        if self.max_idle.is_zero() {
            return 0;
        }
        let threshold = self.max_idle.as_nanos() as u64;
        let mut flagged = 0;
        for entry in self.entries.iter() {
            let age = now_nanos().saturating_sub(entry.value().registered_at);
            if age > threshold {
                flagged += 1;
                log::warn!(
                    "Handle '{}' ({}) active for {:.1}s, exceeds max idle {:.1}s",
                    entry.key(),
                    entry.value().tag,
                    Duration::from_nanos(age).as_secs_f64(),
                    self.max_idle.as_secs_f64()
                );
            }
        }
        flagged
    }

    /// Start the background age scan
    ///
    /// One worker on the command-loop pattern: scans on every `period`
    /// tick, answers on-demand scans, exits on shutdown. Meaningful only
    /// when max idle is positive and leak detection is wanted.
    pub fn start_periodic_scan(self: &Arc<Self>, period: Duration) {
        let mut scanner = self.scanner.lock();
        if scanner.is_some() {
            log::debug!("Periodic scan already running");
            return;
        }

        let (sender, receiver) = channel::unbounded();
        let tracker = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("resource-leak-scan".to_string())
            .spawn(move || loop {
                match receiver.recv_timeout(period) {
                    Ok(ScanCommand::ScanNow) | Err(RecvTimeoutError::Timeout) => {
                        tracker.scan_once();
                    }
                    Ok(ScanCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        break;
                    }
                }
            })
            .expect("failed to spawn leak-scan thread");

        *scanner = Some(ScanWorker { sender, thread });
        log::info!("Leak scan started (period {:?})", period);
    }

    /// Request an immediate scan from the background worker
    pub fn request_scan(&self) {
        if let Some(worker) = &*self.scanner.lock() {
            let _ = worker.sender.send(ScanCommand::ScanNow);
        }
    }

    /// Stop the background age scan and join its thread
    pub fn stop_periodic_scan(&self) {
        if let Some(worker) = self.scanner.lock().take() {
            let _ = worker.sender.send(ScanCommand::Shutdown);
            if worker.thread.join().is_err() {
                log::warn!("Leak-scan thread panicked during shutdown");
            }
            log::info!("Leak scan stopped");
        }
    }

    /// Audit and shut the tracker down; idempotent
    ///
    /// Survivors are force-closed when the process-wide flag is set,
    /// otherwise marked leaked; either way a formatted report lands in the
    /// log and later registrations are ignored.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_periodic_scan();

        let survivors = self.active_count();
        if survivors > 0 {
            log::warn!("Tracker shutdown with {} active handle(s)", survivors);
            log::warn!("{}", self.format_report());

            if force_close_on_shutdown() {
                self.force_close_all();
            } else {
                for id in self.active_ids() {
                    if let Some((_, entry)) = self.entries.remove(&id) {
                        if let Some(handle) = entry.weak.upgrade() {
                            handle.core().mark_leaked();
                        }
                        self.total_leaked.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        log::info!("Resource tracker shut down");
    }

    /// Render the current active set as human-readable text
    pub fn format_report(&self) -> String {
        let totals = self.totals();
        let mut out = String::new();
        let _ = writeln!(out, "=== Resource Tracker Report ===");
        let _ = writeln!(
            out,
            "Active: {} (allocated {}, freed {}, leaked {})",
            self.active_count(),
            totals.allocated,
            totals.freed,
            totals.leaked
        );

        let mut by_type: BTreeMap<ResourceType, Vec<(String, Duration, usize)>> = BTreeMap::new();
        for entry in self.entries.iter() {
            let age = Duration::from_nanos(now_nanos().saturating_sub(entry.value().registered_at));
            by_type.entry(entry.value().tag).or_default().push((
                entry.key().clone(),
                age,
                entry.value().size,
            ));
        }

        for (tag, mut handles) in by_type {
            handles.sort_by(|a, b| a.0.cmp(&b.0));
            let _ = writeln!(out, "  {} ({}):", tag, handles.len());
            for (id, age, size) in handles {
                let _ = writeln!(
                    out,
                    "    {} age {:.1}s size {}",
                    id,
                    age.as_secs_f64(),
                    size
                );
            }
        }
        out
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        self.stop_periodic_scan();
    }
}

/// Process-wide tracker, lazily initialized on first access
static GLOBAL_TRACKER: Lazy<RwLock<Arc<ResourceTracker>>> =
    Lazy::new(|| RwLock::new(Arc::new(ResourceTracker::new(Duration::from_secs(300)))));

/// The process-wide tracker
pub fn global_tracker() -> Arc<ResourceTracker> {
    GLOBAL_TRACKER.read().clone()
}

/// Replace the process-wide tracker, returning the previous one
pub fn install_global_tracker(tracker: Arc<ResourceTracker>) -> Arc<ResourceTracker> {
    std::mem::replace(&mut *GLOBAL_TRACKER.write(), tracker)
}

/// Audit and shut down the process-wide tracker
///
/// Call at program exit so surviving handles make it into the log.
pub fn shutdown_global_tracker() {
    global_tracker().shutdown();
}
