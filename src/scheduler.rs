//! The scheduler façade and its schedule senders.
//!
//! A [`Scheduler`] is a cheap value handle onto a reactor. Its two factories
//! describe work lazily: [`schedule`](Scheduler::schedule) produces a sender
//! that completes after a no-op round-trip through the ring, which is how a
//! continuation is guaranteed to run on the loop thread, and
//! [`schedule_after`](Scheduler::schedule_after) produces a sender backed by
//! a kernel timeout. Connecting a sender to a [`Receiver`] yields an
//! operation state embedding the task that the reactor threads through its
//! queues; starting it is a single `submit` and never blocks.

use std::io;
use std::pin::Pin;
use std::ptr::NonNull;
use std::sync::Weak;
use std::time::Duration;

use crate::reactor::{Reactor, ReactorId};
use crate::sys::{
    __kernel_timespec, io_uring_cqe, io_uring_sqe, IORING_OP_NOP, IORING_OP_TIMEOUT,
};
use crate::task::{Task, TaskVtable};

/// The continuation sink of a schedule operation.
///
/// Exactly one of the three methods is invoked, exactly once, on the thread
/// running [`Reactor::run`].
pub trait Receiver: Send {
    /// The operation completed successfully.
    fn set_value(self);
    /// The kernel reported an error for the operation.
    fn set_error(self, error: io::Error);
    /// The operation was cancelled, or short-circuited by a stop request.
    fn set_stopped(self);
}

/// Forward progress delivered by a scheduler's completions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForwardProgress {
    /// Progress requires cooperation from other scheduled work.
    Concurrent,
    /// Progress is made regardless of any individual task's cooperation.
    Parallel,
    /// Progress is made eventually, with no fairness bound.
    WeaklyParallel,
}

/// A value handle onto a reactor, comparing equal iff it refers to the same
/// reactor instance.
#[derive(Clone, Debug)]
pub struct Scheduler {
    reactor: Weak<Reactor>,
    id: ReactorId,
}

impl Scheduler {
    pub(crate) fn new(reactor: Weak<Reactor>, id: ReactorId) -> Self {
        Self { reactor, id }
    }

    /// A sender that completes on the reactor's loop thread after a no-op
    /// round-trip through the ring, with the same forward progress as any
    /// other scheduled work.
    pub fn schedule(&self) -> ScheduleSender {
        ScheduleSender {
            reactor: Weak::clone(&self.reactor),
        }
    }

    /// A sender that completes on the reactor's loop thread no earlier than
    /// `duration` from being started. A zero duration completes on the next
    /// loop round without touching the kernel.
    pub fn schedule_after(&self, duration: Duration) -> ScheduleAfterSender {
        ScheduleAfterSender {
            reactor: Weak::clone(&self.reactor),
            duration,
        }
    }

    /// The reactor keeps making progress on kernel I/O regardless of any
    /// individual task, so its completions are parallel.
    pub const fn forward_progress(&self) -> ForwardProgress {
        ForwardProgress::Parallel
    }
}

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Scheduler {}

/// Sender for [`Scheduler::schedule`].
pub struct ScheduleSender {
    reactor: Weak<Reactor>,
}

impl ScheduleSender {
    /// Bind this sender to its continuation, producing the operation state.
    pub fn connect<R: Receiver>(self, receiver: R) -> ScheduleOperation<R> {
        ScheduleOperation {
            task: Task::new(&ScheduleOperation::<R>::VTABLE),
            reactor: self.reactor,
            receiver: Some(receiver),
        }
    }
}

/// Operation state of [`ScheduleSender`]: a no-op SQE whose completion
/// delivers `set_value` on the loop thread.
#[repr(C)]
pub struct ScheduleOperation<R: Receiver> {
    task: Task, // must stay first
    reactor: Weak<Reactor>,
    receiver: Option<R>,
}

// the task header's raw pointer is only touched by the reactor's queues
unsafe impl<R: Receiver> Send for ScheduleOperation<R> {}

impl<R: Receiver> ScheduleOperation<R> {
    const VTABLE: TaskVtable = TaskVtable {
        ready: Self::ready,
        submit: Self::submit,
        complete: Self::complete,
    };

    unsafe fn ready(_: NonNull<Task>) -> bool {
        false
    }

    unsafe fn submit(task: NonNull<Task>, sqe: &mut io_uring_sqe) {
        sqe.opcode = IORING_OP_NOP;
        sqe.fd = -1;
        sqe.user_data = task.as_ptr() as u64;
    }

    unsafe fn complete(task: NonNull<Task>, cqe: Option<&io_uring_cqe>) {
        let operation = task.as_ptr() as *mut Self;
        let receiver = (*operation)
            .receiver
            .take()
            .expect("schedule operation completed more than once");
        match cqe {
            Some(cqe) if cqe.res >= 0 => receiver.set_value(),
            Some(cqe) if cqe.res == -libc::ECANCELED => receiver.set_stopped(),
            Some(cqe) => receiver.set_error(io::Error::from_raw_os_error(-cqe.res)),
            None => receiver.set_stopped(),
        }
    }

    /// Link this operation into the reactor. Never blocks; the receiver is
    /// invoked later, on the loop thread.
    ///
    /// # Safety
    ///
    /// The operation must not be moved or dropped until the receiver has
    /// been invoked.
    pub unsafe fn start(self: Pin<&mut Self>) {
        let this = self.get_unchecked_mut();
        match this.reactor.upgrade() {
            Some(reactor) => reactor.submit(NonNull::from(&this.task)),
            None => {
                let receiver = this
                    .receiver
                    .take()
                    .expect("schedule operation started more than once");
                receiver.set_stopped();
            }
        }
    }
}

/// Sender for [`Scheduler::schedule_after`].
pub struct ScheduleAfterSender {
    reactor: Weak<Reactor>,
    duration: Duration,
}

impl ScheduleAfterSender {
    /// Bind this sender to its continuation, producing the operation state.
    pub fn connect<R: Receiver>(self, receiver: R) -> ScheduleAfterOperation<R> {
        ScheduleAfterOperation {
            task: Task::new(&ScheduleAfterOperation::<R>::VTABLE),
            reactor: self.reactor,
            duration: self.duration,
            timespec: __kernel_timespec::default(),
            receiver: Some(receiver),
        }
    }
}

/// Operation state of [`ScheduleAfterSender`]: a relative kernel timeout.
///
/// The timer elapsing is the success path (`-ETIME`, or a zero result when
/// the timeout fires through a completion count); kernel cancellation maps
/// to the stopped signal; anything else is an error carrying the errno.
#[repr(C)]
pub struct ScheduleAfterOperation<R: Receiver> {
    task: Task, // must stay first
    reactor: Weak<Reactor>,
    duration: Duration,
    // read by the kernel while the timeout is in flight
    timespec: __kernel_timespec,
    receiver: Option<R>,
}

// the task header's raw pointer is only touched by the reactor's queues
unsafe impl<R: Receiver> Send for ScheduleAfterOperation<R> {}

impl<R: Receiver> ScheduleAfterOperation<R> {
    const VTABLE: TaskVtable = TaskVtable {
        ready: Self::ready,
        submit: Self::submit,
        complete: Self::complete,
    };

    unsafe fn ready(task: NonNull<Task>) -> bool {
        (*(task.as_ptr() as *const Self)).duration.is_zero()
    }

    unsafe fn submit(task: NonNull<Task>, sqe: &mut io_uring_sqe) {
        let operation = task.as_ptr() as *mut Self;
        (*operation).timespec = __kernel_timespec {
            tv_sec: (*operation).duration.as_secs() as i64,
            tv_nsec: i64::from((*operation).duration.subsec_nanos()),
        };
        sqe.opcode = IORING_OP_TIMEOUT;
        sqe.fd = -1;
        sqe.addr = &(*operation).timespec as *const __kernel_timespec as u64;
        sqe.len = 1;
        sqe.user_data = task.as_ptr() as u64;
    }

    unsafe fn complete(task: NonNull<Task>, cqe: Option<&io_uring_cqe>) {
        let operation = task.as_ptr() as *mut Self;
        let receiver = (*operation)
            .receiver
            .take()
            .expect("schedule_after operation completed more than once");
        match cqe {
            Some(cqe) => match cqe.res {
                0 => receiver.set_value(),
                res if res == -libc::ETIME => receiver.set_value(),
                res if res == -libc::ECANCELED => receiver.set_stopped(),
                res => receiver.set_error(io::Error::from_raw_os_error(-res)),
            },
            // short-circuited: either a stop, or the zero-duration fast path
            None => {
                let stopped = (*operation)
                    .reactor
                    .upgrade()
                    .map_or(true, |reactor| reactor.stop_requested());
                if stopped {
                    receiver.set_stopped()
                } else {
                    receiver.set_value()
                }
            }
        }
    }

    /// Link this operation into the reactor. Never blocks; the receiver is
    /// invoked later, on the loop thread.
    ///
    /// # Safety
    ///
    /// The operation must not be moved or dropped until the receiver has
    /// been invoked.
    pub unsafe fn start(self: Pin<&mut Self>) {
        let this = self.get_unchecked_mut();
        match this.reactor.upgrade() {
            Some(reactor) => reactor.submit(NonNull::from(&this.task)),
            None => {
                let receiver = this
                    .receiver
                    .take()
                    .expect("schedule_after operation started more than once");
                receiver.set_stopped();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Outcome {
        Value,
        Error(i32),
        Stopped,
    }

    struct RecordingReceiver {
        outcome: Arc<Mutex<Option<Outcome>>>,
    }

    impl Receiver for RecordingReceiver {
        fn set_value(self) {
            *self.outcome.lock() = Some(Outcome::Value);
        }

        fn set_error(self, error: io::Error) {
            *self.outcome.lock() = Some(Outcome::Error(error.raw_os_error().unwrap_or(0)));
        }

        fn set_stopped(self) {
            *self.outcome.lock() = Some(Outcome::Stopped);
        }
    }

    fn recording() -> (RecordingReceiver, Arc<Mutex<Option<Outcome>>>) {
        let outcome = Arc::new(Mutex::new(None));
        (
            RecordingReceiver {
                outcome: Arc::clone(&outcome),
            },
            outcome,
        )
    }

    fn timer_operation(
        duration: Duration,
    ) -> (
        ScheduleAfterOperation<RecordingReceiver>,
        Arc<Mutex<Option<Outcome>>>,
    ) {
        let (receiver, outcome) = recording();
        let sender = ScheduleAfterSender {
            reactor: Weak::new(),
            duration,
        };
        (sender.connect(receiver), outcome)
    }

    fn cqe(res: i32) -> io_uring_cqe {
        io_uring_cqe {
            user_data: 0,
            res,
            flags: 0,
        }
    }

    #[test]
    fn timer_elapsing_is_success() {
        for res in [-libc::ETIME, 0] {
            let (operation, outcome) = timer_operation(Duration::from_millis(5));
            unsafe {
                ScheduleAfterOperation::<RecordingReceiver>::complete(
                    NonNull::from(&operation.task),
                    Some(&cqe(res)),
                );
            }
            assert_eq!(*outcome.lock(), Some(Outcome::Value));
        }
    }

    #[test]
    fn timer_cancellation_is_stopped() {
        let (operation, outcome) = timer_operation(Duration::from_millis(5));
        unsafe {
            ScheduleAfterOperation::<RecordingReceiver>::complete(
                NonNull::from(&operation.task),
                Some(&cqe(-libc::ECANCELED)),
            );
        }
        assert_eq!(*outcome.lock(), Some(Outcome::Stopped));
    }

    #[test]
    fn timer_surfaces_kernel_errors() {
        let (operation, outcome) = timer_operation(Duration::from_millis(5));
        unsafe {
            ScheduleAfterOperation::<RecordingReceiver>::complete(
                NonNull::from(&operation.task),
                Some(&cqe(-libc::EINVAL)),
            );
        }
        assert_eq!(*outcome.lock(), Some(Outcome::Error(libc::EINVAL)));
    }

    #[test]
    fn zero_duration_is_ready() {
        let (operation, _) = timer_operation(Duration::ZERO);
        assert!(unsafe {
            ScheduleAfterOperation::<RecordingReceiver>::ready(NonNull::from(&operation.task))
        });
        let (operation, _) = timer_operation(Duration::from_nanos(1));
        assert!(!unsafe {
            ScheduleAfterOperation::<RecordingReceiver>::ready(NonNull::from(&operation.task))
        });
    }

    #[test]
    fn timer_submit_fills_the_timeout_sqe() {
        let (operation, _) = timer_operation(Duration::from_secs(2));
        let mut sqe = io_uring_sqe::default();
        unsafe {
            ScheduleAfterOperation::<RecordingReceiver>::submit(
                NonNull::from(&operation.task),
                &mut sqe,
            );
        }
        assert_eq!(sqe.opcode, IORING_OP_TIMEOUT);
        assert_eq!(sqe.len, 1);
        assert_eq!(sqe.addr, &operation.timespec as *const _ as u64);
        assert_eq!(sqe.user_data, &operation.task as *const Task as u64);
        assert_eq!(operation.timespec.tv_sec, 2);
        assert_eq!(operation.timespec.tv_nsec, 0);
    }

    #[test]
    fn nop_completion_maps_results() {
        let cases = [
            (cqe(0), Outcome::Value),
            (cqe(-libc::ECANCELED), Outcome::Stopped),
            (cqe(-libc::EIO), Outcome::Error(libc::EIO)),
        ];
        for (entry, expected) in cases {
            let (receiver, outcome) = recording();
            let sender = ScheduleSender {
                reactor: Weak::new(),
            };
            let operation = sender.connect(receiver);
            unsafe {
                ScheduleOperation::<RecordingReceiver>::complete(
                    NonNull::from(&operation.task),
                    Some(&entry),
                );
            }
            assert_eq!(*outcome.lock(), Some(expected));
        }
    }

    #[test]
    fn nop_sqe_is_a_nop() {
        let (receiver, _) = recording();
        let sender = ScheduleSender {
            reactor: Weak::new(),
        };
        let operation = sender.connect(receiver);
        let mut sqe = io_uring_sqe::default();
        unsafe {
            ScheduleOperation::<RecordingReceiver>::submit(
                NonNull::from(&operation.task),
                &mut sqe,
            );
        }
        assert_eq!(sqe.opcode, IORING_OP_NOP);
        assert_eq!(sqe.user_data, &operation.task as *const Task as u64);
    }
}
