//! Composition of value channels: `when_all`, `when_any`, timeout races and
//! `block_on`.

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context as TaskContext, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::Duration;

use parking_lot::Mutex;

use super::{AsyncError, Consumer, Producer, channel, failed, ready};

struct AllState<T> {
    slots: Mutex<Vec<Option<T>>>,
    remaining: AtomicUsize,
    producer: Producer<Vec<T>>,
}

/// Resolves once every input resolves, yielding the values in input order.
///
/// The first error resolves the output immediately; later results are discarded.
/// An empty input resolves to an empty vector.
///
/// # Examples
///
/// ```
/// use kiln::deferred::{ready, when_all};
///
/// let all = when_all(vec![ready(1), ready(2), ready(3)]);
/// assert_eq!(all.wait().unwrap(), vec![1, 2, 3]);
/// ```
pub fn when_all<T>(inputs: Vec<Consumer<T>>) -> Consumer<Vec<T>>
where
    T: Send + 'static,
{
    if inputs.is_empty() {
        return ready(Vec::new());
    }

    let (producer, consumer) = channel();
    let shared = Arc::new(AllState {
        slots: Mutex::new(inputs.iter().map(|_| None).collect()),
        remaining: AtomicUsize::new(inputs.len()),
        producer,
    });

    for (index, input) in inputs.into_iter().enumerate() {
        let shared = Arc::clone(&shared);
        input.then(move |result| match result {
            Ok(value) => {
                shared.slots.lock()[index] = Some(value);
                if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = shared.slots.lock().drain(..).flatten().collect();
                    let _ = shared.producer.set_value(values);
                }
            }
            Err(e) => {
                let _ = shared.producer.set_error(e);
            }
        });
    }

    consumer
}

/// Resolves with `(index, value)` of the first input to resolve, or with the first
/// error. The remaining inputs keep running; their results are discarded.
///
/// An empty input resolves to an error, since there is nothing to wait for.
pub fn when_any<T>(inputs: Vec<Consumer<T>>) -> Consumer<(usize, T)>
where
    T: Send + 'static,
{
    if inputs.is_empty() {
        return failed(AsyncError::msg("when_any called with no inputs"));
    }

    let (producer, consumer) = channel();
    let producer = Arc::new(producer);
    for (index, input) in inputs.into_iter().enumerate() {
        let producer = Arc::clone(&producer);
        input.then(move |result| {
            let _ = producer.set_result(result.map(|value| (index, value)));
        });
    }
    consumer
}

/// Races `work` against `timer`.
///
/// Whichever resolves first decides the output: the work's result, or
/// [`AsyncError::Timeout`] carrying `after`. The loser is not cancelled. A timer that
/// resolves with an error never counts as a timeout.
pub fn race_timeout<T>(work: Consumer<T>, timer: Consumer<()>, after: Duration) -> Consumer<T>
where
    T: Send + 'static,
{
    let (producer, consumer) = channel();
    let producer = Arc::new(producer);

    let on_work = Arc::clone(&producer);
    work.then(move |result| {
        let _ = on_work.set_result(result);
    });
    // A broken timer (stopped at shutdown) leaves the decision to the work.
    timer.then(move |fired| {
        if fired.is_ok() {
            let _ = producer.set_error(AsyncError::Timeout(after));
        }
    });

    consumer
}

struct ThreadWaker(Thread);

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.0.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.0.unpark();
    }
}

/// Drives `future` to completion on the calling thread, parking between polls.
///
/// Must not be called from inside an async context that relies on the current thread
/// to make progress (e.g. a single-threaded tokio runtime).
pub fn block_on<F: Future>(future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = Waker::from(Arc::new(ThreadWaker(thread::current())));
    let mut cx = TaskContext::from_waker(&waker);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        thread::park();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn when_all_preserves_input_order() {
        let (p1, c1) = channel();
        let (p2, c2) = channel();
        let all = when_all(vec![c1, c2]);
        p2.set_value("second").unwrap();
        assert!(!all.is_ready());
        p1.set_value("first").unwrap();
        assert_eq!(all.wait().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn when_all_propagates_first_error() {
        let (p1, c1) = channel::<u8>();
        let (_p2, c2) = channel::<u8>();
        let all = when_all(vec![c1, c2]);
        p1.set_error(AsyncError::msg("first failure")).unwrap();
        assert_eq!(all.wait().unwrap_err().to_string(), "first failure");
    }

    #[test]
    fn when_all_of_nothing_is_empty() {
        assert!(when_all::<u8>(Vec::new()).wait().unwrap().is_empty());
    }

    #[test]
    fn when_any_takes_first() {
        let (_p1, c1) = channel::<&str>();
        let (p2, c2) = channel();
        let any = when_any(vec![c1, c2]);
        p2.set_value("fast").unwrap();
        assert_eq!(any.wait().unwrap(), (1, "fast"));
    }

    #[test]
    fn when_any_of_nothing_fails() {
        assert!(when_any::<u8>(Vec::new()).wait().is_err());
    }

    #[test]
    fn race_timeout_picks_timer_when_work_is_slow() {
        let (_work_p, work) = channel::<u8>();
        let (timer_p, timer) = channel();
        let raced = race_timeout(work, timer, Duration::from_millis(50));
        timer_p.set_value(()).unwrap();
        assert!(raced.wait().unwrap_err().is_timeout());
    }

    #[test]
    fn race_timeout_picks_work_when_fast() {
        let (work_p, work) = channel();
        let (_timer_p, timer) = channel();
        let raced = race_timeout(work, timer, Duration::from_secs(1));
        work_p.set_value(11).unwrap();
        assert_eq!(raced.wait().unwrap(), 11);
    }

    #[test]
    fn race_timeout_ignores_broken_timer() {
        let (work_p, work) = channel();
        let (timer_p, timer) = channel::<()>();
        let raced = race_timeout(work, timer, Duration::from_millis(10));
        drop(timer_p);
        assert!(!raced.is_ready());
        work_p.set_value("late but valid").unwrap();
        assert_eq!(raced.wait().unwrap(), "late but valid");
    }

    #[test]
    fn block_on_waits_for_cross_thread_delivery() {
        let (p, c) = channel();
        let start = Instant::now();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            p.set_value(99).unwrap();
        });
        assert_eq!(block_on(c).unwrap(), 99);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
