//! Bounded-memory job runner. Decode jobs declare a peak-memory estimate up
//! front and are only started once the estimate fits in the configured
//! budget, so a burst of segment decodes cannot blow the heap.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Scheduling class for queued jobs. FEC decodes run at `Low` so that they
/// never starve request traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPriority {
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy)]
pub struct JobRunnerConfig {
    pub capacity_bytes: u64,
    pub worker_threads: usize,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024 * 1024,
            worker_threads: 2,
        }
    }
}

type JobFn = Box<dyn FnOnce(MemoryChunk) + Send + 'static>;

struct QueuedJob {
    estimate: u64,
    run: JobFn,
}

struct RunnerState {
    normal: VecDeque<QueuedJob>,
    low: VecDeque<QueuedJob>,
    in_use: u64,
}

struct RunnerShared {
    capacity: u64,
    state: Mutex<RunnerState>,
    wake: Condvar,
    shutdown: AtomicBool,
}

/// Reservation of job-runner memory for the duration of one job. Released
/// on every exit path: explicitly via [`MemoryChunk::release`], or by `Drop`
/// when the job returns or unwinds.
pub struct MemoryChunk {
    shared: Arc<RunnerShared>,
    bytes: u64,
    released: bool,
}

impl MemoryChunk {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut state = self.shared.state.lock();
            state.in_use = state.in_use.saturating_sub(self.bytes);
        }
        self.shared.wake.notify_all();
    }
}

impl Drop for MemoryChunk {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Worker pool with a shared memory budget. Jobs start in queue order per
/// priority class (`Normal` ahead of `Low`); a job whose estimate does not
/// currently fit blocks the queue head until running jobs release memory.
pub struct MemoryLimitedJobRunner {
    shared: Arc<RunnerShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MemoryLimitedJobRunner {
    pub fn new(config: JobRunnerConfig) -> Self {
        let shared = Arc::new(RunnerShared {
            capacity: config.capacity_bytes,
            state: Mutex::new(RunnerState {
                normal: VecDeque::new(),
                low: VecDeque::new(),
                in_use: 0,
            }),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..config.worker_threads.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || worker_loop(shared))
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Queue a job with a peak-memory estimate in bytes. Estimates larger
    /// than the whole budget are clamped so the job can still run alone.
    pub fn queue_job<F>(&self, estimate: u64, priority: JobPriority, job: F)
    where
        F: FnOnce(MemoryChunk) + Send + 'static,
    {
        let estimate = estimate.min(self.shared.capacity);
        let queued = QueuedJob {
            estimate,
            run: Box::new(job),
        };
        {
            let mut state = self.shared.state.lock();
            match priority {
                JobPriority::Normal => state.normal.push_back(queued),
                JobPriority::Low => state.low.push_back(queued),
            }
        }
        self.shared.wake.notify_all();
    }

    pub fn memory_in_use(&self) -> u64 {
        self.shared.state.lock().in_use
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.shared.capacity
    }
}

impl Drop for MemoryLimitedJobRunner {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        let current = thread::current().id();
        for handle in self.workers.lock().drain(..) {
            // The runner can be dropped from one of its own workers when a
            // job owned the last reference; that worker exits on its own.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                debug!("event=job_worker_panic");
            }
        }
    }
}

fn worker_loop(shared: Arc<RunnerShared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = pop_admissible(&mut state, shared.capacity) {
                    state.in_use += job.estimate;
                    break Some(job);
                }
                if shared.shutdown.load(Ordering::Relaxed) {
                    break None;
                }
                shared.wake.wait(&mut state);
            }
        };
        let Some(job) = job else {
            return;
        };
        let chunk = MemoryChunk {
            shared: shared.clone(),
            bytes: job.estimate,
            released: false,
        };
        (job.run)(chunk);
    }
}

fn pop_admissible(state: &mut RunnerState, capacity: u64) -> Option<QueuedJob> {
    let admissible = |job: &QueuedJob, in_use: u64| in_use == 0 || in_use + job.estimate <= capacity;
    if let Some(job) = state.normal.front() {
        if admissible(job, state.in_use) {
            return state.normal.pop_front();
        }
        return None;
    }
    if let Some(job) = state.low.front() {
        if admissible(job, state.in_use) {
            return state.low.pop_front();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_a_queued_job() {
        let runner = MemoryLimitedJobRunner::new(JobRunnerConfig {
            capacity_bytes: 1024,
            worker_threads: 1,
        });
        let (tx, rx) = mpsc::channel();
        runner.queue_job(100, JobPriority::Low, move |chunk| {
            tx.send(chunk.bytes()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 100);
    }

    #[test]
    fn memory_budget_gates_admission() {
        let runner = MemoryLimitedJobRunner::new(JobRunnerConfig {
            capacity_bytes: 100,
            worker_threads: 2,
        });
        let (started_a, started_a_rx) = mpsc::channel();
        let (release_a, release_a_rx) = mpsc::channel::<()>();
        let (started_b, started_b_rx) = mpsc::channel();
        runner.queue_job(80, JobPriority::Low, move |chunk| {
            started_a.send(()).unwrap();
            release_a_rx.recv().unwrap();
            chunk.release();
        });
        started_a_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        runner.queue_job(80, JobPriority::Low, move |_chunk| {
            started_b.send(()).unwrap();
        });
        // Job B does not fit next to job A.
        assert!(started_b_rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        release_a.send(()).unwrap();
        started_b_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn normal_priority_runs_before_low() {
        let runner = MemoryLimitedJobRunner::new(JobRunnerConfig {
            capacity_bytes: 1024,
            worker_threads: 1,
        });
        let (order_tx, order_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let (busy_tx, busy_rx) = mpsc::channel();
        runner.queue_job(1, JobPriority::Low, move |_chunk| {
            busy_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        });
        busy_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let low_tx = order_tx.clone();
        runner.queue_job(1, JobPriority::Low, move |_chunk| {
            low_tx.send("low").unwrap();
        });
        runner.queue_job(1, JobPriority::Normal, move |_chunk| {
            order_tx.send("normal").unwrap();
        });
        gate_tx.send(()).unwrap();
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "normal");
        assert_eq!(order_rx.recv_timeout(Duration::from_secs(5)).unwrap(), "low");
    }

    #[test]
    fn oversized_estimate_is_clamped_and_runs() {
        let runner = MemoryLimitedJobRunner::new(JobRunnerConfig {
            capacity_bytes: 64,
            worker_threads: 1,
        });
        let (tx, rx) = mpsc::channel();
        runner.queue_job(10_000, JobPriority::Low, move |chunk| {
            tx.send(chunk.bytes()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 64);
    }
}
