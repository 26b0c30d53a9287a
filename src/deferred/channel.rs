//! One-shot producer/consumer value channel.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll, Waker};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use super::AsyncError;
use crate::scheduler::Scheduler;

type Callback<T> = Box<dyn FnOnce(Result<T, AsyncError>) + Send>;

enum State<T> {
    Pending {
        waker: Option<Waker>,
        callback: Option<Callback<T>>,
    },
    Ready(Result<T, AsyncError>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Outcome of a bounded wait on a [`Consumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// A value or error is available.
    Ready,
    /// The deadline passed first.
    Timeout,
}

/// Creates a linked producer/consumer pair.
///
/// The producer delivers exactly one value or error; the consumer receives it by
/// blocking ([`Consumer::wait`]), by `.await`ing (the consumer is a [`Future`]), or by
/// attaching a continuation ([`Consumer::then`]).
///
/// # Examples
///
/// ```
/// use kiln::deferred::channel;
///
/// let (producer, consumer) = channel::<u32>();
/// std::thread::spawn(move || producer.set_value(7).unwrap());
/// assert_eq!(consumer.wait().unwrap(), 7);
/// ```
pub fn channel<T>() -> (Producer<T>, Consumer<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending {
            waker: None,
            callback: None,
        }),
        ready: Condvar::new(),
    });
    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

/// Returns a consumer that is already resolved with `value`.
pub fn ready<T>(value: T) -> Consumer<T> {
    resolved(Ok(value))
}

/// Returns a consumer that is already resolved with `err`.
pub fn failed<T>(err: AsyncError) -> Consumer<T> {
    resolved(Err(err))
}

fn resolved<T>(result: Result<T, AsyncError>) -> Consumer<T> {
    Consumer {
        shared: Arc::new(Shared {
            state: Mutex::new(State::Ready(result)),
            ready: Condvar::new(),
        }),
    }
}

/// The sending half of a value channel.
///
/// Dropping a producer that never delivered resolves its consumer with
/// [`AsyncError::BrokenPromise`].
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    /// Delivers a value.
    ///
    /// # Errors
    ///
    /// [`AsyncError::AlreadySatisfied`] if a result was already delivered.
    pub fn set_value(&self, value: T) -> Result<(), AsyncError> {
        self.complete(Ok(value))
    }

    /// Delivers an error.
    ///
    /// # Errors
    ///
    /// [`AsyncError::AlreadySatisfied`] if a result was already delivered.
    pub fn set_error(&self, err: AsyncError) -> Result<(), AsyncError> {
        self.complete(Err(err))
    }

    /// Delivers either half of a `Result`.
    ///
    /// # Errors
    ///
    /// [`AsyncError::AlreadySatisfied`] if a result was already delivered.
    pub fn set_result(&self, result: Result<T, AsyncError>) -> Result<(), AsyncError> {
        self.complete(result)
    }

    /// Runs `f` and delivers its return value, or [`AsyncError::Panicked`] if it panics.
    ///
    /// # Errors
    ///
    /// [`AsyncError::AlreadySatisfied`] if a result was already delivered.
    pub fn fulfill_with<F>(&self, f: F) -> Result<(), AsyncError>
    where
        F: FnOnce() -> T,
    {
        let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(AsyncError::from_panic);
        self.complete(result)
    }

    /// Returns `true` once a result has been delivered.
    pub fn is_satisfied(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending { .. })
    }

    fn complete(&self, result: Result<T, AsyncError>) -> Result<(), AsyncError> {
        let mut state = self.shared.state.lock();
        let State::Pending { waker, callback } = &mut *state else {
            return Err(AsyncError::AlreadySatisfied);
        };
        let waker = waker.take();
        match callback.take() {
            Some(callback) => {
                *state = State::Taken;
                drop(state);
                callback(result);
            }
            None => {
                *state = State::Ready(result);
                drop(state);
                self.shared.ready.notify_all();
                if let Some(waker) = waker {
                    waker.wake();
                }
            }
        }
        Ok(())
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        // No-op when a result was already delivered.
        let _ = self.complete(Err(AsyncError::BrokenPromise));
    }
}

/// The receiving half of a value channel.
///
/// `Consumer<T>` implements `Future<Output = Result<T, AsyncError>>`, so it can be
/// awaited from a [`SuspendableTask`](super::task) or any other async context.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Consumer<T> {
    /// Blocks the calling thread until the result is available.
    ///
    /// # Errors
    ///
    /// Returns the error delivered by the producer, or
    /// [`AsyncError::BrokenPromise`] if the producer was dropped.
    pub fn wait(self) -> Result<T, AsyncError> {
        let mut state = self.shared.state.lock();
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Ready(result) => return result,
                State::Taken => return Err(AsyncError::AlreadyTaken),
                pending @ State::Pending { .. } => {
                    *state = pending;
                    self.shared.ready.wait(&mut state);
                }
            }
        }
    }

    /// Blocks for at most `timeout` waiting for the result to become available.
    ///
    /// The result stays inside the consumer; take it with [`wait`](Self::wait) or
    /// [`try_take`](Self::try_take).
    pub fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until the result is available or `deadline` passes.
    pub fn wait_until(&self, deadline: Instant) -> WaitStatus {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending { .. }) {
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                return if matches!(*state, State::Pending { .. }) {
                    WaitStatus::Timeout
                } else {
                    WaitStatus::Ready
                };
            }
        }
        WaitStatus::Ready
    }

    /// Returns `true` if a result is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Ready(_))
    }

    /// Takes the result without blocking, if it is available.
    pub fn try_take(&mut self) -> Option<Result<T, AsyncError>> {
        let mut state = self.shared.state.lock();
        if matches!(*state, State::Ready(_)) {
            if let State::Ready(result) = std::mem::replace(&mut *state, State::Taken) {
                return Some(result);
            }
        }
        None
    }

    /// Attaches a continuation that receives the result.
    ///
    /// If the result is already available the continuation runs immediately on the
    /// calling thread; otherwise it runs on whichever thread delivers the result.
    pub fn then<F>(self, f: F)
    where
        F: FnOnce(Result<T, AsyncError>) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Pending { waker, .. } => {
                *state = State::Pending {
                    waker,
                    callback: Some(Box::new(f)),
                };
            }
            State::Ready(result) => {
                drop(state);
                f(result);
            }
            State::Taken => {
                drop(state);
                f(Err(AsyncError::AlreadyTaken));
            }
        }
    }

    /// Attaches a continuation that is pushed onto `scheduler` when the result arrives,
    /// instead of running on the delivering thread.
    pub fn then_on<F>(self, scheduler: &Scheduler, f: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, AsyncError>) + Send + 'static,
    {
        let scheduler = scheduler.clone();
        self.then(move |result| {
            if let Err(e) = scheduler.submit_detached(move || f(result)) {
                warn!(error = %e, "continuation dropped: scheduler rejected it");
            }
        });
    }

    /// Returns a consumer of `f` applied to this consumer's value. Errors pass through.
    pub fn map<U, F>(self, f: F) -> Consumer<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (producer, consumer) = channel();
        self.then(move |result| {
            let mapped = match result {
                Ok(value) => panic::catch_unwind(AssertUnwindSafe(|| f(value)))
                    .map_err(AsyncError::from_panic),
                Err(e) => Err(e),
            };
            let _ = producer.set_result(mapped);
        });
        consumer
    }
}

impl<T> Future for Consumer<T> {
    type Output = Result<T, AsyncError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.state.lock();
        if let State::Pending { waker, .. } = &mut *state {
            match waker {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => *waker = Some(cx.waker().clone()),
            }
            return Poll::Pending;
        }
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(result) => Poll::Ready(result),
            _ => Poll::Ready(Err(AsyncError::AlreadyTaken)),
        }
    }
}

impl<T> std::fmt::Debug for Consumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.shared.state.lock() {
            State::Pending { .. } => "pending",
            State::Ready(Ok(_)) => "ready",
            State::Ready(Err(_)) => "error",
            State::Taken => "taken",
        };
        f.debug_struct("Consumer").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn value_crosses_threads() {
        let (p, c) = channel();
        let t = thread::spawn(move || p.set_value(String::from("hello")).unwrap());
        assert_eq!(c.wait().unwrap(), "hello");
        t.join().unwrap();
    }

    #[test]
    fn second_delivery_is_reported() {
        let (p, c) = channel();
        p.set_value(1).unwrap();
        assert!(matches!(p.set_value(2), Err(AsyncError::AlreadySatisfied)));
        assert!(matches!(
            p.set_error(AsyncError::msg("late")),
            Err(AsyncError::AlreadySatisfied)
        ));
        assert_eq!(c.wait().unwrap(), 1);
    }

    #[test]
    fn error_is_delivered() {
        let (p, c) = channel::<u8>();
        p.set_error(AsyncError::msg("nope")).unwrap();
        let err = c.wait().unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[test]
    fn dropped_producer_breaks_promise() {
        let (p, c) = channel::<u8>();
        drop(p);
        assert!(matches!(c.wait(), Err(AsyncError::BrokenPromise)));
    }

    #[test]
    fn wait_for_times_out_then_succeeds() {
        let (p, mut c) = channel();
        assert_eq!(c.wait_for(Duration::from_millis(10)), WaitStatus::Timeout);
        assert!(!c.is_ready());
        p.set_value(5).unwrap();
        assert_eq!(c.wait_for(Duration::from_millis(10)), WaitStatus::Ready);
        assert!(c.is_ready());
        assert_eq!(c.try_take().unwrap().unwrap(), 5);
        assert!(c.try_take().is_none());
    }

    #[test]
    fn then_runs_inline_when_ready() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        ready(3).then(move |r| {
            seen.fetch_add(r.unwrap(), Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn then_runs_on_delivery() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        let (p, c) = channel();
        c.then(move |r: Result<usize, _>| {
            seen.fetch_add(r.unwrap(), Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        p.set_value(9).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 9);
    }

    #[test]
    fn map_transforms_and_forwards_errors() {
        assert_eq!(ready(20).map(|v| v + 1).wait().unwrap(), 21);
        let err = failed::<i32>(AsyncError::msg("bad"))
            .map(|v| v * 2)
            .wait()
            .unwrap_err();
        assert_eq!(err.to_string(), "bad");
    }

    #[test]
    fn map_captures_panics() {
        let err = ready(1)
            .map(|_: i32| -> i32 { panic!("mapper exploded") })
            .wait()
            .unwrap_err();
        assert!(matches!(err, AsyncError::Panicked(m) if m == "mapper exploded"));
    }

    #[test]
    fn fulfill_with_captures_panics() {
        let (p, c) = channel::<u8>();
        p.fulfill_with(|| panic!("worker exploded")).unwrap();
        assert!(p.is_satisfied());
        assert!(matches!(c.wait(), Err(AsyncError::Panicked(_))));
    }

    #[tokio::test]
    async fn consumer_is_awaitable() {
        let (p, c) = channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            p.set_value("async").unwrap();
        });
        assert_eq!(c.await.unwrap(), "async");
    }
}
