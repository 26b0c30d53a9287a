use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{Inner, Job};
use crate::deferred::AsyncError;

thread_local! {
    // (pool id, worker id) of the worker running on this thread, if any.
    static CURRENT_WORKER: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

/// Returns the id of the worker of pool `pool_id` running on this thread.
pub(super) fn current_worker(pool_id: usize) -> Option<usize> {
    CURRENT_WORKER
        .with(Cell::get)
        .filter(|(pool, _)| *pool == pool_id)
        .map(|(_, worker)| worker)
}

/// One scheduling thread and its local queue.
pub(super) struct Worker {
    pub(super) id: usize,
    pub(super) queue: Mutex<VecDeque<Job>>,
    pub(super) running: AtomicBool,
    pub(super) processed: AtomicU64,
    pub(super) thread: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(super) fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            running: AtomicBool::new(true),
            processed: AtomicU64::new(0),
            thread: Mutex::new(None),
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Queues `job` locally, handing it back if this worker has stopped running.
    pub(super) fn push(&self, job: Job) -> Result<(), Job> {
        let mut queue = self.queue.lock();
        if !self.is_running() {
            return Err(job);
        }
        queue.push_back(job);
        Ok(())
    }

    /// Stops the worker and takes its backlog.
    pub(super) fn retire(&self) -> Vec<Job> {
        let mut queue = self.queue.lock();
        self.running.store(false, Ordering::Release);
        queue.drain(..).collect()
    }
}

pub(super) fn run(inner: Arc<Inner>, me: Arc<Worker>) {
    CURRENT_WORKER.with(|current| current.set(Some((inner.id, me.id))));
    let _runtime = inner.runtime.as_ref().map(|handle| handle.enter());
    debug!(worker = me.id, "worker started");

    loop {
        if inner.discard.load(Ordering::Acquire) || !me.is_running() {
            break;
        }
        if inner.paused.load(Ordering::Acquire) {
            inner.park();
            continue;
        }
        match next_job(&inner, &me) {
            Some(job) => execute(&inner, &me, job),
            None => {
                if inner.draining.load(Ordering::Acquire) && inner.pending.load(Ordering::Acquire) == 0
                {
                    break;
                }
            }
        }
    }

    // A worker retired by `resize` hands its backlog to the rest of the pool. On
    // `shutdown_now` the backlog stays put for the final sweep to count and drop.
    if !inner.discard.load(Ordering::Acquire) {
        let leftovers: Vec<Job> = me.queue.lock().drain(..).collect();
        if !leftovers.is_empty() {
            trace!(worker = me.id, count = leftovers.len(), "moving backlog to global queue");
            inner.global.lock().extend(leftovers);
            inner.available.notify_all();
        }
    }

    CURRENT_WORKER.with(|current| current.set(None));
    debug!(
        worker = me.id,
        processed = me.processed.load(Ordering::Relaxed),
        "worker stopped"
    );
}

/// Local queue first, then one stolen item, then a bounded wait on the global queue.
///
/// A returned job already counts as active, so the pool never looks idle between
/// dequeuing it and running it.
fn next_job(inner: &Inner, me: &Worker) -> Option<Job> {
    let local = me.queue.lock().pop_front();
    if let Some(job) = local {
        return Some(claim(inner, job));
    }

    if inner.work_stealing.load(Ordering::Relaxed) {
        if let Some(job) = steal(inner, me) {
            inner.stolen.fetch_add(1, Ordering::Relaxed);
            return Some(claim(inner, job));
        }
    }

    let mut global = inner.global.lock();
    if let Some(job) = global.pop_front() {
        return Some(claim(inner, job));
    }
    if inner.discard.load(Ordering::Acquire) || !me.is_running() {
        return None;
    }
    if inner.draining.load(Ordering::Acquire) && inner.pending.load(Ordering::Acquire) == 0 {
        return None;
    }

    inner.available.wait_for(&mut global, inner.idle_wait);
    global.pop_front().map(|job| claim(inner, job))
}

fn claim(inner: &Inner, job: Job) -> Job {
    inner.active.fetch_add(1, Ordering::AcqRel);
    inner.pending.fetch_sub(1, Ordering::AcqRel);
    job
}

/// Takes the newest item of the first non-empty peer queue, scanning round-robin from
/// the worker after `me`. Every queue is visited, so a non-empty queue is never skipped.
fn steal(inner: &Inner, me: &Worker) -> Option<Job> {
    let workers = inner.workers.read();
    let count = workers.len();
    let start = workers
        .iter()
        .position(|w| w.id == me.id)
        .map_or(0, |pos| pos + 1);

    (0..count)
        .map(|offset| &workers[(start + offset) % count])
        .filter(|victim| victim.id != me.id)
        .find_map(|victim| {
            let job = victim.queue.lock().pop_back();
            if job.is_some() {
                trace!(thief = me.id, victim = victim.id, "stole work");
            }
            job
        })
}

/// Runs a job claimed by [`next_job`] and releases its active count.
fn execute(inner: &Inner, me: &Worker, job: Job) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(job));
    inner.active.fetch_sub(1, Ordering::AcqRel);
    me.processed.fetch_add(1, Ordering::Relaxed);

    match outcome {
        Ok(()) => {
            inner.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(payload) => inner.report_failure(AsyncError::from_panic(payload)),
    }

    if inner.is_idle() {
        let _guard = inner.idle_lock.lock();
        inner.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::time::Duration;

    #[test]
    fn claimed_job_keeps_pool_busy() {
        let scheduler = Scheduler::new(1).unwrap();
        scheduler.pause();
        let inner = &scheduler.inner;
        // Not registered with the pool, so nobody else can take its job.
        let me = Worker::new(usize::MAX);
        inner.pending.fetch_add(1, Ordering::AcqRel);
        assert!(me.push(Box::new(|| ())).is_ok());

        let job = next_job(inner, &me).unwrap();
        assert_eq!(inner.pending.load(Ordering::Acquire), 0);
        assert!(!inner.is_idle());
        assert!(!scheduler.wait_for_all_timeout(Duration::from_millis(20)));

        execute(inner, &me, job);
        assert!(inner.is_idle());
        assert!(scheduler.wait_for_all_timeout(Duration::from_millis(20)));
        scheduler.resume();
        scheduler.shutdown();
    }

    #[test]
    fn retired_worker_hands_jobs_back() {
        let worker = Worker::new(0);
        assert!(worker.push(Box::new(|| ())).is_ok());
        assert_eq!(worker.retire().len(), 1);
        assert!(worker.push(Box::new(|| ())).is_err());
    }
}
