// SPDX-License-Identifier: Apache-2.0

//! The background worker pool used for CPU-heavy signing and verification. A small
//! fixed number of threads drain a shared job channel; the main thread never blocks on
//! them — it submits work and picks up completions on its next `tick()`.
//!
//! Each feature (certifier signing, certifier verification, TCB signature
//! verification, ...) gets its own [`TaskQueue`], which bounds its own backlog to
//! `capacity` entries with *tail* truncation: once more than `capacity` jobs are
//! outstanding, the oldest ones are silently skipped rather than run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A small fixed-size pool of worker threads draining a single shared job channel.
pub struct ThreadPool {
    job_tx: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `num_threads` workers (the spec suggests 1-3).
    pub fn new(num_threads: usize, name: &str) -> Arc<Self> {
        assert!(num_threads > 0, "thread pool needs at least one worker");
        let (job_tx, job_rx): (Sender<Job>, Receiver<Job>) = unbounded();

        let workers = (0..num_threads)
            .map(|i| {
                let job_rx = job_rx.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            job();
                        }
                    })
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        Arc::new(Self { job_tx, workers })
    }

    /// Creates a task queue bound to this pool. `capacity` is the queue's tail window:
    /// at most `capacity` submitted-but-not-yet-run jobs are honoured at a time.
    pub fn queue<T: Send + 'static>(self: &Arc<Self>, capacity: usize) -> TaskQueue<T> {
        TaskQueue::new(self.clone(), capacity)
    }

    fn submit(&self, job: Job) {
        // The pool outlives every queue submitting to it; a send error here would mean
        // every worker thread has panicked, which is treated as a fatal local error
        // rather than something tick() can recover from.
        let _ = self.job_tx.send(job);
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Workers exit once job_tx is dropped and the channel drains; we don't wait
        // for them (matches the "never blocks on the main thread" contract).
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// A bounded, per-feature queue of background jobs with tail truncation, and the MPMC
/// completion channel their results come back on.
pub struct TaskQueue<T> {
    pool: Arc<ThreadPool>,
    capacity: u64,
    next_seq: Arc<AtomicU64>,
    /// Jobs with `seq < floor` are considered truncated and skipped when they run.
    floor: Arc<AtomicU64>,
    completion_tx: Sender<T>,
    completion_rx: Receiver<T>,
}

impl<T: Send + 'static> TaskQueue<T> {
    fn new(pool: Arc<ThreadPool>, capacity: usize) -> Self {
        assert!(capacity > 0, "task queue capacity must be positive");
        let (completion_tx, completion_rx) = unbounded();
        Self {
            pool,
            capacity: capacity as u64,
            next_seq: Arc::new(AtomicU64::new(0)),
            floor: Arc::new(AtomicU64::new(0)),
            completion_tx,
            completion_rx,
        }
    }

    /// Submits `work` to run on the pool. If the backlog already holds `capacity`
    /// outstanding jobs, the oldest of them (which may already be running) is marked
    /// truncated and its result, if any, will be silently discarded.
    pub fn submit<F>(&self, work: F)
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let new_floor = seq.saturating_sub(self.capacity - 1);
        self.floor.fetch_max(new_floor, Ordering::SeqCst);

        let floor = self.floor.clone();
        let completion_tx = self.completion_tx.clone();
        self.pool.submit(Box::new(move || {
            if seq < floor.load(Ordering::SeqCst) {
                return;
            }
            let result = work();
            let _ = completion_tx.send(result);
        }));
    }

    /// Non-blocking drain of completed jobs, to be called from the owner's `tick()`.
    pub fn poll(&self) -> Option<T> {
        self.completion_rx.try_recv().ok()
    }

    /// Number of jobs submitted and not yet truncated or completed; an over-estimate
    /// since completions are not subtracted until polled.
    pub fn backlog_len(&self) -> u64 {
        self.next_seq
            .load(Ordering::SeqCst)
            .saturating_sub(self.floor.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn drain_blocking<T>(queue: &TaskQueue<T>, expect: usize) -> Vec<T> {
        let mut out = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while out.len() < expect && std::time::Instant::now() < deadline {
            if let Some(item) = queue.poll() {
                out.push(item);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        out
    }

    #[test]
    fn runs_submitted_jobs_and_reports_completions() {
        let pool = ThreadPool::new(2, "test-pool");
        let queue = pool.queue::<u64>(8);
        for i in 0..5u64 {
            queue.submit(move || i * i);
        }
        let mut results = drain_blocking(&queue, 5);
        results.sort();
        assert_eq!(results, vec![0, 1, 4, 9, 16]);
    }

    #[test]
    fn tail_truncates_backlog_beyond_capacity() {
        let pool = ThreadPool::new(1, "truncate-pool");
        let queue: TaskQueue<u64> = pool.queue(2);

        // Block the single worker so all three submissions queue up behind it.
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        queue.submit(move || {
            gate_rx.recv().ok();
            0
        });
        queue.submit(|| 1);
        queue.submit(|| 2);

        // The backlog (excluding the in-flight blocker) has capacity 2; submitting a
        // third non-blocker should have truncated the first of the two queued jobs.
        gate_tx.send(()).unwrap();

        let results = drain_blocking(&queue, 2);
        assert_eq!(results.len(), 2);
        assert!(results.contains(&0));
        assert!(results.contains(&2));
        assert!(!results.contains(&1));
    }
}
