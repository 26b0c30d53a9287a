//! Work-stealing task scheduler.
//!
//! A [`Scheduler`] owns a resizable pool of OS worker threads. Each worker has a local
//! queue; a shared global queue takes work submitted from outside the pool and work
//! released by the timer.
//!
//! A worker looks for work in this order:
//!
//! 1. the front of its own local queue,
//! 2. the back of a peer's local queue (one item, peers scanned round-robin),
//! 3. the global queue, waiting on a condition variable with a short timeout so the
//!    worker also observes pause and shutdown requests.
//!
//! Work submitted from a worker thread lands on that worker's local queue. A panic
//! inside a work item is caught, counted, reported to the optional exception handler
//! and never takes the worker thread down.
//!
//! # Examples
//!
//! ```
//! use kiln::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(4).unwrap();
//! let answer = scheduler.submit(|| 6 * 7).unwrap();
//! assert_eq!(answer.wait().unwrap(), 42);
//! scheduler.shutdown();
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::deferred::{self, AsyncError, Consumer, channel, race_timeout};
use crate::stats::Snapshot;

mod timer;
mod worker;

use timer::Timer;
use worker::Worker;

/// A type-erased unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Callback receiving every panic caught inside a work item.
pub type ExceptionHandler = Arc<dyn Fn(&AsyncError) + Send + Sync>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

/// Errors returned when work cannot be accepted.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler is shut down")]
    ShutDown,

    #[error("queue is full ({max} pending tasks)")]
    QueueFull { max: usize },

    #[error("worker pool size must be at least 1")]
    InvalidSize,

    #[error("no worker at index {index} (pool size {size})")]
    NoSuchWorker { index: usize, size: usize },

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<SchedulerError> for AsyncError {
    fn from(err: SchedulerError) -> Self {
        AsyncError::Rejected(err.to_string())
    }
}

/// Construction parameters for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    pub threads: usize,
    /// Worker thread name prefix.
    pub thread_name: String,
    /// Whether idle workers steal from their peers.
    pub work_stealing: bool,
    /// Upper bound on queued (not yet started) work; `None` is unbounded.
    pub max_queue_size: Option<usize>,
    /// How long an idle worker blocks on the global queue before re-checking flags.
    pub idle_wait: Duration,
    /// Tokio runtime entered by every worker, so work can use tokio timers and I/O.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(4, |n| n.get()),
            thread_name: "kiln-worker".to_owned(),
            work_stealing: true,
            max_queue_size: None,
            idle_wait: Duration::from_millis(10),
            runtime: None,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_work_stealing(mut self, enabled: bool) -> Self {
        self.work_stealing = enabled;
        self
    }

    #[must_use]
    pub fn with_max_queue_size(mut self, max: Option<usize>) -> Self {
        self.max_queue_size = max;
        self
    }

    #[must_use]
    pub fn with_runtime(mut self, handle: tokio::runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

#[derive(Clone)]
enum Placement {
    Global,
    Worker(Arc<Worker>),
}

pub(crate) struct Inner {
    id: usize,
    workers: RwLock<Vec<Arc<Worker>>>,
    global: Mutex<VecDeque<Job>>,
    available: Condvar,
    idle_lock: Mutex<()>,
    idle: Condvar,
    lifecycle: Mutex<()>,

    accepting: AtomicBool,
    draining: AtomicBool,
    // Set once every worker has been joined; nothing is queued after this.
    stopped: AtomicBool,
    discard: AtomicBool,
    paused: AtomicBool,
    work_stealing: AtomicBool,
    // 0 = unbounded
    max_queue: AtomicUsize,

    active: AtomicUsize,
    pending: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    stolen: AtomicU64,
    next_worker_id: AtomicUsize,

    exception_handler: RwLock<Option<ExceptionHandler>>,
    timer: Timer,
    idle_wait: Duration,
    thread_name: String,
    runtime: Option<tokio::runtime::Handle>,
}

impl Inner {
    fn enqueue(&self, job: Job, placement: Placement, internal: bool) -> Result<(), SchedulerError> {
        if self.discard.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if internal {
            self.pending.fetch_add(1, Ordering::AcqRel);
        } else {
            if !self.accepting.load(Ordering::Acquire) {
                return Err(SchedulerError::ShutDown);
            }
            self.reserve_slot()?;
        }

        // A retired or stopped worker's queue is never drained again.
        let job = match placement {
            Placement::Worker(worker) => match worker.push(job) {
                Ok(()) => {
                    // The owner may be among the waiters; wake everyone so it is not missed.
                    let _global = self.global.lock();
                    self.available.notify_all();
                    return Ok(());
                }
                Err(job) => job,
            },
            Placement::Global => job,
        };

        let mut global = self.global.lock();
        // `stop` sets the flag under this lock, so a job pushed here is either seen by
        // its final sweep or refused.
        if self.stopped.load(Ordering::Acquire) {
            drop(global);
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(SchedulerError::ShutDown);
        }
        global.push_back(job);
        self.available.notify_one();
        Ok(())
    }

    /// Counts one more pending item, unless that would exceed `max_queue`.
    fn reserve_slot(&self) -> Result<(), SchedulerError> {
        let max = self.max_queue.load(Ordering::Relaxed);
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |pending| {
                (max == 0 || pending < max).then_some(pending + 1)
            })
            .map(drop)
            .map_err(|_| SchedulerError::QueueFull { max })
    }

    /// Marks the pool stopped after its workers are joined and drops whatever was
    /// queued behind them. Returns the number of dropped items.
    fn stop(&self, workers: &[Arc<Worker>]) -> usize {
        let mut leftovers: Vec<Job> = {
            let mut global = self.global.lock();
            self.stopped.store(true, Ordering::Release);
            global.drain(..).collect()
        };
        for worker in workers {
            leftovers.extend(worker.retire());
        }
        let count = leftovers.len();
        self.pending.fetch_sub(count, Ordering::AcqRel);
        // Dropped outside every queue lock: dropping a job may run continuations.
        drop(leftovers);
        count
    }

    fn local_placement(&self) -> Placement {
        worker::current_worker(self.id)
            .and_then(|id| {
                self.workers
                    .read()
                    .iter()
                    .find(|w| w.id == id && w.is_running())
                    .cloned()
            })
            .map_or(Placement::Global, Placement::Worker)
    }

    fn park(&self) {
        let mut global = self.global.lock();
        if self.paused.load(Ordering::Acquire) {
            self.available.wait_for(&mut global, self.idle_wait);
        }
    }

    fn wake_all(&self) {
        let _global = self.global.lock();
        self.available.notify_all();
    }

    fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.active.load(Ordering::Acquire) == 0
    }

    pub(crate) fn report_failure(&self, err: AsyncError) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(error = %err, "work item failed");
        let handler = self.exception_handler.read().clone();
        if let Some(handler) = handler {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&err))).is_err() {
                warn!("exception handler panicked");
            }
        }
    }
}

/// Cancels a job registered with [`Scheduler::submit_periodic`].
#[derive(Debug, Clone)]
pub struct PeriodicHandle {
    cancelled: Arc<AtomicBool>,
}

impl PeriodicHandle {
    /// Stops future runs. A run already in progress completes.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A resizable work-stealing thread pool.
///
/// `Scheduler` is a cheap handle: clones share the same pool. The pool lives until
/// [`shutdown`](Self::shutdown) or [`shutdown_now`](Self::shutdown_now) is called.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Starts a pool with `threads` workers and default settings.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidSize`] for zero threads, [`SchedulerError::Spawn`] if
    /// the OS refuses to create a thread.
    pub fn new(threads: usize) -> Result<Self, SchedulerError> {
        Self::with_config(SchedulerConfig::default().with_threads(threads))
    }

    /// Starts a pool from an explicit configuration.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn with_config(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        if config.threads == 0 {
            return Err(SchedulerError::InvalidSize);
        }

        let inner = Arc::new(Inner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            workers: RwLock::new(Vec::with_capacity(config.threads)),
            global: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
            lifecycle: Mutex::new(()),
            accepting: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            discard: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            work_stealing: AtomicBool::new(config.work_stealing),
            max_queue: AtomicUsize::new(config.max_queue_size.unwrap_or(0)),
            active: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
            exception_handler: RwLock::new(None),
            timer: Timer::default(),
            idle_wait: config.idle_wait,
            thread_name: config.thread_name,
            runtime: config.runtime,
        });

        let scheduler = Self { inner };
        scheduler
            .inner
            .timer
            .start(&scheduler.inner.thread_name, Arc::downgrade(&scheduler.inner))?;
        if let Err(e) = scheduler.spawn_workers(config.threads) {
            scheduler.shutdown_now();
            return Err(e);
        }

        info!(threads = config.threads, "scheduler started");
        Ok(scheduler)
    }

    fn spawn_workers(&self, count: usize) -> Result<(), SchedulerError> {
        let mut workers = self.inner.workers.write();
        for _ in 0..count {
            let worker = Arc::new(Worker::new(
                self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed),
            ));
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.inner.thread_name, worker.id))
                .spawn({
                    let inner = Arc::clone(&self.inner);
                    let worker = Arc::clone(&worker);
                    move || worker::run(inner, worker)
                })?;
            *worker.thread.lock() = Some(handle);
            workers.push(worker);
        }
        Ok(())
    }

    // ── Submission ──────────────────────────────────────────────────────────────

    /// Submits `f` and returns a consumer for its result.
    ///
    /// A panic inside `f` resolves the consumer with [`AsyncError::Panicked`].
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] or [`SchedulerError::QueueFull`].
    pub fn submit<F, T>(&self, f: F) -> Result<Consumer<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (producer, consumer) = channel();
        self.submit_detached(move || {
            let _ = producer.fulfill_with(f);
        })?;
        Ok(consumer)
    }

    /// Submits `f` as a suspendable task (see [`spawn`](Self::spawn)).
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub fn submit_task<F, T>(&self, f: F) -> Result<Consumer<T>, SchedulerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn(async move { f() })
    }

    /// Submits fire-and-forget work. Panics are routed to the exception handler.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] or [`SchedulerError::QueueFull`].
    pub fn submit_detached<F>(&self, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let placement = self.inner.local_placement();
        self.inner.enqueue(Box::new(f), placement, false)
    }

    /// Places `f` on the local queue of the worker at `index`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NoSuchWorker`] for an out-of-range index, otherwise as
    /// [`submit`](Self::submit).
    pub fn submit_to<F>(&self, index: usize, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let worker = {
            let workers = self.inner.workers.read();
            workers
                .get(index)
                .cloned()
                .ok_or(SchedulerError::NoSuchWorker {
                    index,
                    size: workers.len(),
                })?
        };
        self.inner
            .enqueue(Box::new(f), Placement::Worker(worker), false)
    }

    /// Re-queues a woken task. Allowed while the pool drains after `shutdown`.
    pub(crate) fn resubmit(&self, job: Job) -> Result<(), SchedulerError> {
        let placement = self.inner.local_placement();
        self.inner.enqueue(job, placement, true)
    }

    /// Runs `f` on the pool once `delay` has elapsed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] if the pool no longer accepts work.
    pub fn submit_delayed<F>(&self, delay: Duration, f: F) -> Result<(), SchedulerError>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        if self.inner.timer.schedule(Instant::now() + delay, Box::new(f)) {
            Ok(())
        } else {
            Err(SchedulerError::ShutDown)
        }
    }

    /// Runs `f` now and then every `interval` until cancelled, paused or shut down.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] if the pool no longer accepts work.
    pub fn submit_periodic<F>(&self, interval: Duration, f: F) -> Result<PeriodicHandle, SchedulerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        arm_periodic(
            &self.inner,
            interval,
            Arc::new(f),
            Arc::clone(&cancelled),
            Duration::ZERO,
        );
        Ok(PeriodicHandle { cancelled })
    }

    /// Runs `future` as a suspendable task on the pool.
    ///
    /// The task is polled on a worker; while it awaits a pending [`Consumer`] it
    /// occupies no thread, and the consumer's producer pushes it back onto the pool.
    ///
    /// # Errors
    ///
    /// Same as [`submit`](Self::submit).
    pub fn spawn<F>(&self, future: F) -> Result<Consumer<F::Output>, SchedulerError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        deferred::task::spawn(self, future)
    }

    /// A consumer that resolves after `after`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] if the pool no longer accepts work.
    pub fn timeout(&self, after: Duration) -> Result<Consumer<()>, SchedulerError> {
        let (producer, consumer) = channel();
        self.submit_delayed(after, move || {
            let _ = producer.set_value(());
        })?;
        Ok(consumer)
    }

    /// Races `work` against a timer; see [`race_timeout`].
    ///
    /// # Errors
    ///
    /// [`SchedulerError::ShutDown`] if the pool no longer accepts work.
    pub fn with_timeout<T>(&self, work: Consumer<T>, after: Duration) -> Result<Consumer<T>, SchedulerError>
    where
        T: Send + 'static,
    {
        Ok(race_timeout(work, self.timeout(after)?, after))
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────────

    /// Grows or shrinks the pool to `size` workers.
    ///
    /// Retired workers finish their current item and hand their backlog to the
    /// global queue.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidSize`] for zero, [`SchedulerError::ShutDown`] after
    /// shutdown, [`SchedulerError::Spawn`] if a thread cannot be created.
    pub fn resize(&self, size: usize) -> Result<(), SchedulerError> {
        if size == 0 {
            return Err(SchedulerError::InvalidSize);
        }
        let _lifecycle = self.inner.lifecycle.lock();
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(SchedulerError::ShutDown);
        }

        let current = self.inner.workers.read().len();
        if size > current {
            self.spawn_workers(size - current)?;
        } else if size < current {
            let retired = self.inner.workers.write().split_off(size);
            for worker in &retired {
                worker.running.store(false, Ordering::Release);
            }
            self.inner.wake_all();
            join_workers(&retired);
        }
        info!(from = current, to = size, "worker pool resized");
        Ok(())
    }

    /// Stops accepting work, lets queued work drain, then joins every worker.
    ///
    /// Delayed work that has not fired yet is discarded. A suspended task woken after
    /// the workers are gone is dropped, so its consumer sees
    /// [`AsyncError::BrokenPromise`]. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        self.inner.timer.stop();
        self.inner.wake_all();

        let workers = self.inner.workers.read().clone();
        join_workers(&workers);
        self.inner.workers.write().clear();
        // Tasks woken from here on are refused, which drops them and breaks their
        // promises.
        let stranded = self.inner.stop(&workers);
        if stranded > 0 {
            warn!(dropped = stranded, "work queued after the workers stopped was dropped");
        }

        info!(
            completed = self.completed_tasks(),
            failed = self.failed_tasks(),
            "scheduler shut down"
        );
    }

    /// Stops immediately: queued-but-not-started work is discarded (its consumers see
    /// [`AsyncError::BrokenPromise`]). Returns the number of discarded items.
    pub fn shutdown_now(&self) -> usize {
        self.inner.accepting.store(false, Ordering::Release);
        self.inner.discard.store(true, Ordering::Release);
        self.inner.draining.store(true, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        self.inner.timer.stop();

        let mut discarded: Vec<Job> = self.inner.global.lock().drain(..).collect();
        let workers = self.inner.workers.read().clone();
        for worker in &workers {
            discarded.extend(worker.queue.lock().drain(..));
        }
        let discarded_count = discarded.len();
        self.inner.pending.fetch_sub(discarded_count, Ordering::AcqRel);
        // Dropped outside every queue lock: dropping a job may run continuations.
        drop(discarded);

        self.inner.wake_all();
        join_workers(&workers);
        self.inner.workers.write().clear();
        let count = discarded_count + self.inner.stop(&workers);

        if count > 0 {
            warn!(discarded = count, "scheduler stopped with queued work");
        } else {
            info!("scheduler stopped");
        }
        count
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Workers stop taking new items until [`resume`](Self::resume). Items already
    /// running complete; periodic work stops re-arming.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        debug!("scheduler paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        self.inner.wake_all();
        debug!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Acquire)
    }

    /// Blocks until no work is queued or running. Delayed work that has not fired yet
    /// and suspended tasks are not counted.
    pub fn wait_for_all(&self) {
        let mut guard = self.inner.idle_lock.lock();
        while !self.inner.is_idle() {
            self.inner
                .idle
                .wait_for(&mut guard, Duration::from_millis(50));
        }
    }

    /// Like [`wait_for_all`](Self::wait_for_all) with a deadline. Returns `true` if
    /// the pool became idle in time.
    pub fn wait_for_all_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.idle_lock.lock();
        while !self.inner.is_idle() {
            if self
                .inner
                .idle
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                return self.inner.is_idle();
            }
        }
        true
    }

    // ── Tuning ──────────────────────────────────────────────────────────────────

    pub fn enable_work_stealing(&self, enabled: bool) {
        self.inner.work_stealing.store(enabled, Ordering::Relaxed);
    }

    /// Bounds the number of queued items; `None` removes the bound.
    pub fn set_max_queue_size(&self, max: Option<usize>) {
        self.inner
            .max_queue
            .store(max.unwrap_or(0), Ordering::Relaxed);
    }

    /// Installs a callback invoked with every panic caught in a detached work item.
    pub fn set_exception_handler<F>(&self, handler: F)
    where
        F: Fn(&AsyncError) + Send + Sync + 'static,
    {
        *self.inner.exception_handler.write() = Some(Arc::new(handler));
    }

    // ── Statistics ──────────────────────────────────────────────────────────────

    pub fn size(&self) -> usize {
        self.inner.workers.read().len()
    }

    pub fn active_threads(&self) -> usize {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn completed_tasks(&self) -> u64 {
        self.inner.completed.load(Ordering::Relaxed)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    pub fn stolen_tasks(&self) -> u64 {
        self.inner.stolen.load(Ordering::Relaxed)
    }

    pub fn statistics(&self) -> Snapshot {
        let mut snap = Snapshot::new();
        snap.insert("size".into(), self.size().into());
        snap.insert("active_threads".into(), self.active_threads().into());
        snap.insert("pending_tasks".into(), self.pending_tasks().into());
        snap.insert("delayed_tasks".into(), self.inner.timer.pending().into());
        snap.insert("completed_tasks".into(), self.completed_tasks().into());
        snap.insert("failed_tasks".into(), self.failed_tasks().into());
        snap.insert("stolen_tasks".into(), self.stolen_tasks().into());
        snap.insert("paused".into(), self.is_paused().into());
        snap.insert("shutdown".into(), self.is_shutdown().into());
        snap.insert(
            "work_stealing".into(),
            self.inner.work_stealing.load(Ordering::Relaxed).into(),
        );
        snap.insert(
            "max_queue_size".into(),
            self.inner.max_queue.load(Ordering::Relaxed).into(),
        );
        for worker in self.inner.workers.read().iter() {
            snap.insert(
                format!("worker.{}.processed", worker.id),
                worker.processed.load(Ordering::Relaxed).into(),
            );
        }
        snap
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("size", &self.size())
            .field("pending", &self.pending_tasks())
            .field("active", &self.active_threads())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn arm_periodic(
    inner: &Arc<Inner>,
    interval: Duration,
    task: Arc<dyn Fn() + Send + Sync>,
    cancelled: Arc<AtomicBool>,
    delay: Duration,
) {
    let pool = Arc::downgrade(inner);
    let job: Job = Box::new(move || {
        let Some(inner) = pool.upgrade() else {
            return;
        };
        if cancelled.load(Ordering::Acquire)
            || !inner.accepting.load(Ordering::Acquire)
            || inner.paused.load(Ordering::Acquire)
        {
            debug!("periodic work stopped");
            return;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task())) {
            inner.report_failure(AsyncError::from_panic(payload));
        }
        arm_periodic(&inner, interval, task, cancelled, interval);
    });
    inner.timer.schedule(Instant::now() + delay, job);
}

fn join_workers(workers: &[Arc<Worker>]) {
    let me = thread::current().id();
    for worker in workers {
        let handle: Option<JoinHandle<()>> = worker.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == me {
                continue;
            }
            if handle.join().is_err() {
                warn!(worker = worker.id, "worker thread panicked outside a work item");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn zero_threads_is_rejected() {
        assert!(matches!(
            Scheduler::new(0),
            Err(SchedulerError::InvalidSize)
        ));
    }

    #[test]
    fn submit_returns_result() {
        let scheduler = Scheduler::new(2).unwrap();
        let c = scheduler.submit(|| "done").unwrap();
        assert_eq!(c.wait().unwrap(), "done");
        scheduler.shutdown();
    }

    #[test]
    fn every_item_runs_exactly_once_with_starved_workers() {
        const ITEMS: usize = 200;
        let scheduler = Scheduler::new(4).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        // Block worker 0 so its local backlog can only drain through stealing.
        // Stealing is off until the blocker is running on worker 0 itself.
        scheduler.enable_work_stealing(false);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        scheduler
            .submit_to(0, move || {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv().unwrap();
        scheduler.enable_work_stealing(true);

        for i in 0..ITEMS {
            let seen = Arc::clone(&seen);
            scheduler
                .submit_to(0, move || seen.lock().push(i))
                .unwrap();
        }

        // Everything except the blocker finishes while worker 0 is stuck.
        let deadline = Instant::now() + Duration::from_secs(10);
        while seen.lock().len() < ITEMS && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        release_tx.send(()).unwrap();
        scheduler.wait_for_all();

        let seen = seen.lock();
        assert_eq!(seen.len(), ITEMS);
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(unique.len(), ITEMS);
        assert!(scheduler.stolen_tasks() >= ITEMS as u64);
        scheduler.shutdown();
    }

    #[test]
    fn many_items_complete_exactly_once() {
        const ITEMS: usize = 1_000;
        let scheduler = Scheduler::new(3).unwrap();
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..ITEMS).map(|_| AtomicUsize::new(0)).collect());
        for i in 0..ITEMS {
            let counts = Arc::clone(&counts);
            scheduler
                .submit_detached(move || {
                    counts[i].fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.shutdown();
        assert!(counts.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(scheduler.completed_tasks(), ITEMS as u64);
    }

    #[test]
    fn panics_are_isolated_and_reported() {
        let scheduler = Scheduler::new(1).unwrap();
        let reported = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&reported);
        scheduler.set_exception_handler(move |err| {
            assert!(matches!(err, AsyncError::Panicked(_)));
            hits.fetch_add(1, Ordering::SeqCst);
        });

        scheduler.submit_detached(|| panic!("bad item")).unwrap();
        let after = scheduler.submit(|| 1).unwrap();
        assert_eq!(after.wait().unwrap(), 1);
        scheduler.wait_for_all();
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.failed_tasks(), 1);
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_rejects_new_work_and_drains_queue() {
        let scheduler = Scheduler::new(1).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let ran = Arc::clone(&ran);
            scheduler
                .submit_detached(move || {
                    thread::sleep(Duration::from_millis(1));
                    ran.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        scheduler.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert!(scheduler.is_shutdown());
        assert!(matches!(
            scheduler.submit(|| ()),
            Err(SchedulerError::ShutDown)
        ));
        // Idempotent.
        scheduler.shutdown();
    }

    #[test]
    fn shutdown_now_discards_queued_work() {
        let scheduler = Scheduler::new(1).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        scheduler
            .submit_detached(move || {
                started_tx.send(()).unwrap();
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap();
        started_rx.recv().unwrap();

        let queued: Vec<_> = (0..5).map(|i| scheduler.submit(move || i).unwrap()).collect();
        let stopper = {
            let scheduler = scheduler.clone();
            thread::spawn(move || scheduler.shutdown_now())
        };
        while scheduler.pending_tasks() > 0 {
            thread::sleep(Duration::from_millis(1));
        }
        release_tx.send(()).unwrap();
        assert_eq!(stopper.join().unwrap(), 5);
        for c in queued {
            assert!(matches!(c.wait(), Err(AsyncError::BrokenPromise)));
        }
    }

    #[test]
    fn queue_bound_is_enforced() {
        let scheduler = Scheduler::new(1).unwrap();
        scheduler.pause();
        scheduler.set_max_queue_size(Some(2));
        scheduler.submit_detached(|| ()).unwrap();
        scheduler.submit_detached(|| ()).unwrap();
        assert!(matches!(
            scheduler.submit_detached(|| ()),
            Err(SchedulerError::QueueFull { max: 2 })
        ));
        scheduler.resume();
        scheduler.wait_for_all();
        scheduler.shutdown();
    }

    #[test]
    fn queue_bound_holds_under_concurrent_submitters() {
        const SUBMITTERS: usize = 32;
        let scheduler = Scheduler::new(1).unwrap();
        scheduler.pause();
        scheduler.set_max_queue_size(Some(8));
        let barrier = Arc::new(std::sync::Barrier::new(SUBMITTERS));

        let accepted: usize = (0..SUBMITTERS)
            .map(|_| {
                let scheduler = scheduler.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    scheduler.submit_detached(|| ()).is_ok()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| usize::from(handle.join().unwrap()))
            .sum();

        assert_eq!(accepted, 8);
        assert_eq!(scheduler.pending_tasks(), 8);
        scheduler.resume();
        scheduler.wait_for_all();
        scheduler.shutdown();
    }

    #[test]
    fn work_refused_once_workers_are_joined() {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.shutdown();
        assert!(matches!(
            scheduler.resubmit(Box::new(|| ())),
            Err(SchedulerError::ShutDown)
        ));
        assert_eq!(scheduler.pending_tasks(), 0);
    }

    #[test]
    fn pause_holds_work_until_resume() {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.pause();
        let c = scheduler.submit(|| 3).unwrap();
        assert_eq!(
            c.wait_for(Duration::from_millis(50)),
            deferred::WaitStatus::Timeout
        );
        scheduler.resume();
        assert_eq!(c.wait().unwrap(), 3);
        scheduler.shutdown();
    }

    #[test]
    fn resize_grows_and_shrinks() {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.resize(5).unwrap();
        assert_eq!(scheduler.size(), 5);
        scheduler.resize(1).unwrap();
        assert_eq!(scheduler.size(), 1);
        assert_eq!(scheduler.submit(|| 8).unwrap().wait().unwrap(), 8);
        assert!(matches!(
            scheduler.resize(0),
            Err(SchedulerError::InvalidSize)
        ));
        scheduler.shutdown();
        assert!(matches!(scheduler.resize(2), Err(SchedulerError::ShutDown)));
    }

    #[test]
    fn submit_to_rejects_unknown_worker() {
        let scheduler = Scheduler::new(2).unwrap();
        assert!(matches!(
            scheduler.submit_to(7, || ()),
            Err(SchedulerError::NoSuchWorker { index: 7, size: 2 })
        ));
        scheduler.shutdown();
    }

    #[test]
    fn delayed_work_waits_for_its_deadline() {
        let scheduler = Scheduler::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        scheduler
            .submit_delayed(Duration::from_millis(30), move || {
                tx.send(Instant::now()).unwrap();
            })
            .unwrap();
        let fired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(30));
        scheduler.shutdown();
    }

    #[test]
    fn periodic_work_repeats_until_cancelled() {
        let scheduler = Scheduler::new(1).unwrap();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let handle = scheduler
            .submit_periodic(Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.cancel();
        assert!(handle.is_cancelled());
        assert!(ticks.load(Ordering::SeqCst) >= 3);
        scheduler.shutdown();
    }

    #[test]
    fn with_timeout_reports_slow_work() {
        let scheduler = Scheduler::new(2).unwrap();
        let slow = scheduler
            .submit(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();
        let raced = scheduler
            .with_timeout(slow, Duration::from_millis(20))
            .unwrap();
        assert!(raced.wait().unwrap_err().is_timeout());

        let fast = scheduler.submit(|| 5).unwrap();
        let raced = scheduler
            .with_timeout(fast, Duration::from_secs(5))
            .unwrap();
        assert_eq!(raced.wait().unwrap(), 5);
        scheduler.shutdown();
    }

    #[test]
    fn work_from_a_worker_stays_local() {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.enable_work_stealing(false);
        let inner = scheduler.clone();
        let outer = scheduler
            .submit(move || {
                let me = thread::current().id();
                let child = inner.submit(move || thread::current().id()).unwrap();
                (me, child)
            })
            .unwrap();
        let (parent_thread, child) = outer.wait().unwrap();
        assert_eq!(child.wait().unwrap(), parent_thread);
        scheduler.shutdown();
    }

    #[test]
    fn statistics_snapshot_has_counters() {
        let scheduler = Scheduler::new(2).unwrap();
        scheduler.submit(|| ()).unwrap().wait().unwrap();
        scheduler.wait_for_all();
        let stats = scheduler.statistics();
        assert_eq!(stats["size"].as_int(), Some(2));
        assert_eq!(stats["completed_tasks"].as_int(), Some(1));
        assert_eq!(stats["paused"].as_bool(), Some(false));
        scheduler.shutdown();
    }
}
