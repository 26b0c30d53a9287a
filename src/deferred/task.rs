//! Suspendable tasks: futures polled on the work-stealing scheduler.
//!
//! A task is polled on a worker thread until it returns `Pending`. It is then parked
//! inside its own waker; when the value channel it awaits is fulfilled, the producer
//! wakes the task, which pushes a poll job back onto the scheduler. No thread is ever
//! blocked waiting on the dependency.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context as TaskContext, Wake, Waker};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{AsyncError, Consumer, channel};
use crate::scheduler::{Scheduler, SchedulerError};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SuspendableTask {
    id: u64,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
    scheduler: Scheduler,
    queued: AtomicBool,
    // Set when the scheduler refused to resume the task; whoever holds the slot
    // drops the future.
    abandoned: AtomicBool,
}

impl SuspendableTask {
    fn schedule(self: Arc<Self>) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let task = Arc::clone(&self);
        if let Err(e) = self.scheduler.resubmit(Box::new(move || task.poll_once())) {
            // Dropping the future drops the producer inside it, so the consumer
            // observes a broken promise rather than hanging.
            warn!(task = self.id, error = %e, "task dropped: scheduler refused to resume it");
            self.abandon();
        }
    }

    fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
        // Locked means a poll is in flight, possibly the one that woke us; it sees
        // the flag once the poll returns.
        let future = self.future.try_lock().and_then(|mut slot| slot.take());
        drop(future);
    }

    fn poll_once(self: Arc<Self>) {
        self.queued.store(false, Ordering::Release);
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = TaskContext::from_waker(&waker);

        // Held across the poll so a wake-up that lands on another worker mid-poll
        // waits here instead of observing an empty slot.
        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };
        if future.as_mut().poll(&mut cx).is_ready() {
            trace!(task = self.id, "task completed");
            *slot = None;
        } else if self.abandoned.load(Ordering::Acquire) {
            let future = slot.take();
            drop(slot);
            drop(future);
        }
    }
}

impl Wake for SuspendableTask {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).schedule();
    }
}

/// Runs `future` as a suspendable task on `scheduler`.
///
/// The returned consumer resolves with the future's output, or with
/// [`AsyncError::Panicked`] if polling panics.
pub(crate) fn spawn<F>(scheduler: &Scheduler, future: F) -> Result<Consumer<F::Output>, SchedulerError>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let (producer, consumer) = channel();
    let body = async move {
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(value) => {
                let _ = producer.set_value(value);
            }
            Err(payload) => {
                let _ = producer.set_error(AsyncError::from_panic(payload));
            }
        }
    };

    let task = Arc::new(SuspendableTask {
        id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        future: Mutex::new(Some(body.boxed())),
        scheduler: scheduler.clone(),
        queued: AtomicBool::new(true),
        abandoned: AtomicBool::new(false),
    });
    let first = Arc::clone(&task);
    scheduler.submit_detached(move || first.poll_once())?;
    Ok(consumer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::{WaitStatus, block_on, channel};
    use std::time::Duration;

    #[test]
    fn task_completes_without_suspending() {
        let scheduler = Scheduler::new(2).unwrap();
        let result = scheduler.spawn(async { 40 + 2 }).unwrap().wait().unwrap();
        assert_eq!(result, 42);
        scheduler.shutdown();
    }

    #[test]
    fn task_resumes_when_dependency_is_fulfilled() {
        let scheduler = Scheduler::new(1).unwrap();
        let (producer, dependency) = channel::<u32>();
        let task = scheduler
            .spawn(async move { dependency.await.map(|v| v * 2) })
            .unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert!(!task.is_ready());
        // The single worker is free while the task is suspended.
        let side = scheduler.submit(|| "worker is free").unwrap();
        assert_eq!(side.wait().unwrap(), "worker is free");

        producer.set_value(21).unwrap();
        assert_eq!(task.wait().unwrap().unwrap(), 42);
        scheduler.shutdown();
    }

    #[test]
    fn task_awaits_other_scheduled_work() {
        let scheduler = Scheduler::new(2).unwrap();
        let inner = scheduler.clone();
        let task = scheduler
            .spawn(async move {
                let a = inner.submit(|| 1).unwrap().await.unwrap();
                let b = inner.submit(|| 2).unwrap().await.unwrap();
                a + b
            })
            .unwrap();
        assert_eq!(block_on(task).unwrap(), 3);
        scheduler.shutdown();
    }

    #[test]
    fn suspended_task_breaks_its_promise_after_shutdown() {
        let scheduler = Scheduler::new(2).unwrap();
        let (producer, dependency) = channel::<u32>();
        let task = scheduler.spawn(async move { dependency.await }).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        scheduler.shutdown();
        // Waking the task now finds no worker to resume it.
        producer.set_value(41).unwrap();

        assert_eq!(task.wait_for(Duration::from_secs(2)), WaitStatus::Ready);
        assert!(matches!(task.wait(), Err(AsyncError::BrokenPromise)));
    }

    #[test]
    fn task_abandoned_mid_poll_is_dropped_when_the_poll_ends() {
        let scheduler = Scheduler::new(1).unwrap();
        let (_dependency_producer, dependency) = channel::<()>();
        let (result, consumer) = channel::<()>();
        let task = Arc::new(SuspendableTask {
            id: 0,
            future: Mutex::new(Some(
                async move {
                    let _result = result;
                    let _ = dependency.await;
                }
                .boxed(),
            )),
            scheduler: scheduler.clone(),
            queued: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
        });

        {
            // A poll in flight holds the slot.
            let _polling = task.future.lock();
            task.abandon();
        }
        assert!(task.future.lock().is_some());

        Arc::clone(&task).poll_once();
        assert!(task.future.lock().is_none());
        assert!(matches!(consumer.wait(), Err(AsyncError::BrokenPromise)));
        scheduler.shutdown();
    }

    #[test]
    fn panicking_task_reports_error() {
        let scheduler = Scheduler::new(1).unwrap();
        let task = scheduler
            .spawn(async {
                if true {
                    panic!("task blew up");
                }
            })
            .unwrap();
        assert!(matches!(task.wait(), Err(AsyncError::Panicked(m)) if m == "task blew up"));
        // The worker survived.
        assert_eq!(scheduler.submit(|| 5).unwrap().wait().unwrap(), 5);
        scheduler.shutdown();
    }
}
