//! Deadline heap driving delayed and periodic work.
//!
//! One thread per scheduler sleeps until the earliest deadline, then moves the due
//! job onto the scheduler's global queue. The thread only holds a weak reference to
//! the pool, so a dropped pool never stays alive because of pending timers.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use super::{Inner, Job, Placement};

struct Entry {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
    stopped: bool,
}

#[derive(Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    changed: Condvar,
}

#[derive(Default)]
pub(super) struct Timer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    pub(super) fn start(&self, name: &str, pool: Weak<Inner>) -> std::io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("{name}-timer"))
            .spawn(move || run(shared, pool))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Queues `job` to be released onto the pool at `deadline`.
    ///
    /// Returns `false` if the timer was already stopped.
    pub(super) fn schedule(&self, deadline: Instant, job: Job) -> bool {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return false;
        }
        state.seq += 1;
        let seq = state.seq;
        state.heap.push(Reverse(Entry { deadline, seq, job }));
        drop(state);
        self.shared.changed.notify_one();
        true
    }

    pub(super) fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stops the timer thread and discards every entry that has not fired yet.
    pub(super) fn stop(&self) {
        let discarded: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.stopped = true;
            state.heap.drain().collect()
        };
        self.shared.changed.notify_all();
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "timer stopped with pending entries");
        }
        drop(discarded);

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run(shared: Arc<TimerShared>, pool: Weak<Inner>) {
    let mut state = shared.state.lock();
    loop {
        if state.stopped {
            break;
        }
        let next = state.heap.peek().map(|Reverse(entry)| entry.deadline);
        match next {
            None => shared.changed.wait(&mut state),
            Some(deadline) if deadline <= Instant::now() => {
                let Some(Reverse(entry)) = state.heap.pop() else {
                    continue;
                };
                MutexGuard::unlocked(&mut state, || release(&pool, entry));
            }
            Some(deadline) => {
                shared.changed.wait_until(&mut state, deadline);
            }
        }
    }
    trace!("timer thread exiting");
}

fn release(pool: &Weak<Inner>, entry: Entry) {
    let Some(inner) = pool.upgrade() else {
        return;
    };
    trace!(seq = entry.seq, "timer entry due");
    // A refused job is dropped, which resolves any channel it owns as broken.
    let _ = inner.enqueue(entry.job, Placement::Global, true);
}
