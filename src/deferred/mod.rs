//! Async primitives: one-shot value channels, suspendable tasks and their
//! combinators.
//!
//! | Type / function                 | Role                                                  |
//! |---------------------------------|-------------------------------------------------------|
//! | [`channel`]                     | linked [`Producer`] / [`Consumer`] pair               |
//! | [`Consumer`]                    | blocking `wait`, `.await`, or `then` continuation     |
//! | [`Scheduler::spawn`]            | run a future as a suspendable task on the pool        |
//! | [`when_all`] / [`when_any`]     | fan-in over many consumers                            |
//! | [`race_timeout`]                | `when_any(work, timer)`; the only cancellation model  |
//! | [`block_on`]                    | drive a future on the calling thread                  |
//!
//! Suspension never blocks a thread: a task awaiting a consumer registers its waker in
//! the channel, and the producer's delivery pushes the task back onto the scheduler.
//!
//! [`Scheduler::spawn`]: crate::scheduler::Scheduler::spawn

mod channel;
mod combinator;
mod error;
pub(crate) mod task;

pub use channel::{Consumer, Producer, WaitStatus, channel, failed, ready};
pub use combinator::{block_on, race_timeout, when_all, when_any};
pub use error::AsyncError;
pub(crate) use error::panic_message;
