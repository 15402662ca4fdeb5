//! A single-threaded execution context over Linux io_uring, exposing a
//! scheduler for sender/receiver-style structured concurrency.
//!
//! The [`Reactor`] owns one io_uring instance and runs its event loop on
//! whichever thread calls [`Reactor::run`]: it drains cross-thread
//! submissions, publishes submission queue entries in batches, enters the
//! kernel, and dispatches completions back to the tasks that own them. Work
//! is described lazily through the [`Scheduler`] handle, whose
//! [`schedule`](scheduler::Scheduler::schedule) and
//! [`schedule_after`](scheduler::Scheduler::schedule_after) senders complete
//! their [`Receiver`] on the loop thread.
//!
//! Threads other than the loop thread hand work in through a lock-free
//! request queue paired with an eventfd the loop keeps a read armed on, so a
//! blocked `io_uring_enter` is always interruptible. Stopping is
//! cooperative: after [`Reactor::request_stop`], not-yet-submitted tasks
//! complete synthetically as stopped, in-flight kernel operations are
//! cancelled where the kernel supports it, and `run` returns once everything
//! has drained.
//!
//! Linux only; the ring memory layout and the release/acquire pairing on the
//! shared head and tail counters are part of the kernel ABI.

#![cfg(target_os = "linux")]

mod memory;
mod ring;

pub mod reactor;
pub mod scheduler;
pub mod stop;
pub mod sys;
pub mod task;

pub use reactor::{Reactor, ReactorBuilder, ReactorError, ReactorId};
pub use scheduler::{ForwardProgress, Receiver, Scheduler};
pub use stop::{StopCallback, StopToken};
