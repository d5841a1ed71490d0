//! Cycle timer and batch dispatch
//!
//! [`Scheduler::run_forever`] runs a job immediately and then on a fixed
//! interval. The job runs on the calling thread, so a cycle can never overlap
//! the next one: ticks that pass while a cycle is still running are skipped.
//!
//! [`run_batch`] fans independent jobs out either sequentially or on a bounded
//! rayon pool. A panicking job is caught and logged; its siblings and the
//! timer loop keep going.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A zero-argument unit of work.
pub type Job<'a> = Box<dyn FnOnce() + Send + 'a>;

/// How a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchMode {
    /// One job after another on the calling thread
    Serial,
    /// Concurrently on `min(max_workers, batch size)` worker threads
    Parallel { max_workers: usize },
}

impl BatchMode {
    pub fn new(parallel: bool, max_workers: usize) -> Self {
        if parallel {
            BatchMode::Parallel { max_workers }
        } else {
            BatchMode::Serial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Serial => "serial",
            BatchMode::Parallel { .. } => "parallel",
        }
    }
}

/// Cloneable stop signal shared between the timer and e.g. a Ctrl+C handler.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop and wake any waiter.
    pub fn trigger(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until `deadline` or a stop request. Returns true if stopped.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut stopped = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            stopped = cvar
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *stopped
    }
}

/// Fixed-interval, non-reentrant timer.
#[derive(Debug, Clone)]
pub struct Scheduler {
    interval: Duration,
    shutdown: Shutdown,
}

impl Scheduler {
    pub fn new(interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            shutdown,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Run `job` now, then once per interval until shutdown is triggered.
    ///
    /// Returns the number of completed runs.
    pub fn run_forever<F: FnMut()>(&self, mut job: F) -> u64 {
        let mut runs = 0u64;
        let mut next_tick = Instant::now();

        while !self.shutdown.is_triggered() {
            job();
            runs += 1;

            next_tick += self.interval;
            let mut skipped = 0u64;
            let now = Instant::now();
            while next_tick <= now {
                next_tick += self.interval;
                skipped += 1;
            }
            if skipped > 0 {
                tracing::warn!(
                    skipped,
                    interval_secs = self.interval.as_secs(),
                    "Cycle overran its interval, skipping missed ticks"
                );
            }

            if self.shutdown.wait_until(next_tick) {
                break;
            }
        }

        tracing::info!(runs, "Scheduler stopped");
        runs
    }
}

/// Execute independent jobs and return how many of them panicked.
///
/// Dispatch is fire-and-forget: results are not observed here.
pub fn run_batch<'a>(jobs: Vec<Job<'a>>, mode: BatchMode) -> usize {
    if jobs.is_empty() {
        return 0;
    }
    let panicked = AtomicUsize::new(0);

    match mode {
        BatchMode::Serial => {
            for job in jobs {
                run_isolated(job, &panicked);
            }
        }
        BatchMode::Parallel { max_workers } => {
            let workers = max_workers.max(1).min(jobs.len());
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("errsift-worker-{i}"))
                .build();

            match pool {
                Ok(pool) => {
                    tracing::debug!(workers, jobs = jobs.len(), "Dispatching batch");
                    let panicked = &panicked;
                    pool.scope(|scope| {
                        for job in jobs {
                            scope.spawn(move |_| run_isolated(job, panicked));
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build worker pool, running serially");
                    for job in jobs {
                        run_isolated(job, &panicked);
                    }
                }
            }
        }
    }

    panicked.into_inner()
}

fn run_isolated(job: Job<'_>, panicked: &AtomicUsize) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        panicked.fetch_add(1, Ordering::Relaxed);
        tracing::error!(panic = %panic_message(payload.as_ref()), "Job panicked");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn counting_jobs<'a>(n: usize, counter: &'a AtomicUsize) -> Vec<Job<'a>> {
        (0..n)
            .map(|_| -> Job<'a> {
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect()
    }

    #[test]
    fn test_serial_runs_in_order_on_caller() {
        let order = Mutex::new(Vec::new());
        let caller = thread::current().id();
        let mut jobs: Vec<Job<'_>> = Vec::new();
        for i in 0..4 {
            let order = &order;
            jobs.push(Box::new(move || {
                assert_eq!(thread::current().id(), caller);
                order.lock().unwrap().push(i);
            }));
        }

        assert_eq!(run_batch(jobs, BatchMode::Serial), 0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_parallel_runs_every_job() {
        let counter = AtomicUsize::new(0);
        let jobs = counting_jobs(20, &counter);
        run_batch(jobs, BatchMode::Parallel { max_workers: 4 });
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_pool_size_is_bounded() {
        let threads = Mutex::new(HashSet::new());
        let mut jobs: Vec<Job<'_>> = Vec::new();
        for _ in 0..16 {
            let threads = &threads;
            jobs.push(Box::new(move || {
                thread::sleep(Duration::from_millis(5));
                threads.lock().unwrap().insert(thread::current().id());
            }));
        }

        run_batch(jobs, BatchMode::Parallel { max_workers: 3 });
        let used = threads.lock().unwrap().len();
        assert!((1..=3).contains(&used), "used {used} threads");
    }

    #[test]
    fn test_panic_does_not_abort_siblings() {
        for mode in [BatchMode::Serial, BatchMode::Parallel { max_workers: 2 }] {
            let counter = AtomicUsize::new(0);
            let mut jobs = counting_jobs(3, &counter);
            jobs.insert(1, Box::new(|| panic!("unit exploded")));

            assert_eq!(run_batch(jobs, mode), 1);
            assert_eq!(counter.load(Ordering::SeqCst), 3);
        }
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(run_batch(Vec::new(), BatchMode::Parallel { max_workers: 8 }), 0);
    }

    #[test]
    fn test_runs_immediately_then_on_interval() {
        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(Duration::from_millis(20), shutdown.clone());
        let started = Instant::now();
        let mut stamps = Vec::new();

        let runs = scheduler.run_forever(|| {
            stamps.push(started.elapsed());
            if stamps.len() == 3 {
                shutdown.trigger();
            }
        });

        assert_eq!(runs, 3);
        assert!(stamps[0] < Duration::from_millis(15));
        assert!(stamps[2] >= Duration::from_millis(40));
    }

    #[test]
    fn test_overrun_skips_missed_ticks() {
        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(Duration::from_millis(10), shutdown.clone());
        let started = Instant::now();
        let mut stamps = Vec::new();

        scheduler.run_forever(|| {
            stamps.push(started.elapsed());
            if stamps.len() == 1 {
                // Overrun several ticks
                thread::sleep(Duration::from_millis(35));
            } else {
                shutdown.trigger();
            }
        });

        // The second run waits for the next tick boundary (40ms) instead of
        // catching up on the ticks missed at 10, 20 and 30ms
        assert_eq!(stamps.len(), 2);
        assert!(stamps[1] >= Duration::from_millis(40));
    }

    #[test]
    fn test_shutdown_interrupts_wait() {
        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(Duration::from_secs(3600), shutdown.clone());
        let trigger = shutdown.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            trigger.trigger();
        });

        let started = Instant::now();
        let runs = scheduler.run_forever(|| {});
        handle.join().unwrap();

        assert_eq!(runs, 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_triggered_before_start_runs_nothing() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let runs = Scheduler::new(Duration::from_millis(1), shutdown).run_forever(|| {});
        assert_eq!(runs, 0);
    }
}
