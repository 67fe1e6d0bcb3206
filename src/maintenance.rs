//! # Background Maintenance
//!
//! A small pool of worker threads that runs a maintenance task on a fixed
//! cadence and on demand. Worker zero owns the schedule; the remaining
//! workers serve on-demand requests, so a slow sweep never delays an
//! explicit trigger. All workers are joined on shutdown.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

/// Maintenance activity counters
#[derive(Debug, Clone)]
pub struct MaintenanceStats {
    /// Completed maintenance cycles
    pub total_cycles: u64,

    /// Total time spent in cycles (milliseconds)
    pub total_time_ms: u64,

    /// Average cycle time (milliseconds)
    pub avg_cycle_time_ms: u64,

    /// When the last cycle finished
    pub last_run: Option<SystemTime>,
}

impl Default for MaintenanceStats {
    fn default() -> Self {
        Self {
            total_cycles: 0,
            total_time_ms: 0,
            avg_cycle_time_ms: 0,
            last_run: None,
        }
    }
}

/// Commands understood by the worker loop
enum MaintenanceCommand {
    /// Run a cycle immediately
    RunNow,
    /// Exit the worker loop
    Shutdown,
}

/// The work a scheduler drives on every cycle
pub type MaintenanceTask = Arc<dyn Fn() + Send + Sync>;

/// Fixed-cadence background scheduler over a worker thread pool
pub struct MaintenanceScheduler {
    sender: Sender<MaintenanceCommand>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<RwLock<MaintenanceStats>>,
    is_running: Arc<AtomicBool>,
}

impl MaintenanceScheduler {
    /// Spawn `worker_count` threads driving `task` every `interval`
    pub fn start(
        name: &str,
        worker_count: usize,
        interval: Duration,
        task: MaintenanceTask,
    ) -> Self {
        let (sender, receiver) = channel::unbounded();
        let stats = Arc::new(RwLock::new(MaintenanceStats::default()));
        let is_running = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|index| {
                let receiver: Receiver<MaintenanceCommand> = receiver.clone();
                let task = task.clone();
                let stats = stats.clone();
                let is_running = is_running.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", name, index))
                    .spawn(move || {
                        Self::worker_main(index, receiver, interval, task, stats, is_running)
                    })
                    .expect("failed to spawn maintenance worker")
            })
            .collect();

        log::info!(
            "Maintenance scheduler '{}' started ({} worker(s), every {:?})",
            name,
            worker_count.max(1),
            interval
        );

        Self {
            sender,
            workers,
            stats,
            is_running,
        }
    }

    /// Request an immediate cycle from the worker pool
    pub fn run_now(&self) {
        let _ = self.sender.send(MaintenanceCommand::RunNow);
    }

    /// Whether a cycle is in flight right now
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> MaintenanceStats {
        self.stats.read().clone()
    }

    /// Stop the workers and join every thread
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        for _ in 0..self.workers.len() {
            let _ = self.sender.send(MaintenanceCommand::Shutdown);
        }
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::warn!("Maintenance worker panicked during shutdown");
            }
        }
        log::info!("Maintenance scheduler stopped");
    }

    fn worker_main(
        index: usize,
        receiver: Receiver<MaintenanceCommand>,
        interval: Duration,
        task: MaintenanceTask,
        stats: Arc<RwLock<MaintenanceStats>>,
        is_running: Arc<AtomicBool>,
    ) {
        loop {
            // Worker zero ticks on the cadence; the rest only answer
            // explicit requests.
            let command = if index == 0 {
                match receiver.recv_timeout(interval) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => Some(MaintenanceCommand::Shutdown),
                }
            } else {
                match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => Some(MaintenanceCommand::Shutdown),
                }
            };

            match command {
                Some(MaintenanceCommand::Shutdown) => break,
                Some(MaintenanceCommand::RunNow) | None => {
                    Self::run_cycle(&task, &stats, &is_running);
                }
            }
        }
        log::debug!("Maintenance worker {} stopped", index);
    }

    fn run_cycle(
        task: &MaintenanceTask,
        stats: &Arc<RwLock<MaintenanceStats>>,
        is_running: &Arc<AtomicBool>,
    ) {
        let started = Instant::now();
        is_running.store(true, Ordering::Relaxed);

        task();

        is_running.store(false, Ordering::Relaxed);
        let elapsed = started.elapsed();

        let mut stats = stats.write();
        stats.total_cycles += 1;
        stats.total_time_ms += elapsed.as_millis() as u64;
        stats.avg_cycle_time_ms = stats.total_time_ms / stats.total_cycles;
        stats.last_run = Some(SystemTime::now());

        log::trace!("Maintenance cycle completed in {:?}", elapsed);
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cadence_drives_cycles() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let scheduler = MaintenanceScheduler::start(
            "test-maint",
            1,
            Duration::from_millis(10),
            Arc::new(move || {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        std::thread::sleep(Duration::from_millis(60));
        scheduler.shutdown();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn test_run_now_triggers_extra_cycle() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = ticks.clone();
        let scheduler = MaintenanceScheduler::start(
            "test-maint",
            2,
            Duration::from_secs(60),
            Arc::new(move || {
                ticks_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        scheduler.run_now();
        scheduler.run_now();
        std::thread::sleep(Duration::from_millis(50));

        let stats = scheduler.stats();
        scheduler.shutdown();

        assert!(ticks.load(Ordering::SeqCst) >= 2);
        assert!(stats.total_cycles >= 2);
        assert!(stats.last_run.is_some());
    }

    #[test]
    fn test_shutdown_joins_workers() {
        let scheduler =
            MaintenanceScheduler::start("test-maint", 3, Duration::from_secs(60), Arc::new(|| {}));
        scheduler.shutdown();
        // Dropping after shutdown must not double-join.
    }
}
