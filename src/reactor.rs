//! The reactor: an execution context bound to one io_uring instance,
//! driving a single-threaded event loop.
//!
//! Exactly one thread calls [`Reactor::run`]; every task completion, and
//! therefore every continuation scheduled through this context, executes on
//! that thread. Any thread may hand work in through [`Reactor::submit`],
//! which routes remote submissions through a lock-free request queue and an
//! eventfd that the loop keeps a read armed on, so a blocked
//! `io_uring_enter` always has something to wake it.

use std::cell::UnsafeCell;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use either::Either;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::memory::MappedRegion;
use crate::ring::{CompletionQueue, SubmissionQueue};
use crate::scheduler::Scheduler;
use crate::stop::{StopSource, StopToken};
use crate::sys::{
    self, io_uring_cqe, io_uring_params, io_uring_sqe, EnterFlags, SetupFlags,
    IORING_ASYNC_CANCEL_ANY, IORING_OFF_CQ_RING, IORING_OFF_SQES, IORING_OFF_SQ_RING,
    IORING_OP_ASYNC_CANCEL, IORING_OP_READ, IORING_OP_READV,
};
use crate::task::{AtomicTaskQueue, Task, TaskQueue, TaskVtable};

/// Process-unique identity of a reactor, used for scheduler equality.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ReactorId {
    inner: usize,
}

static LAST_REACTOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Errors surfaced by reactor construction and by [`Reactor::run`].
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// The requested ring geometry was rejected before reaching the kernel.
    #[error("invalid ring configuration: {0}")]
    InvalidConfig(&'static str),

    /// `io_uring_setup` failed.
    #[error("failed to set up the io_uring ring: {0}")]
    RingSetup(#[source] io::Error),

    /// Mapping one of the ring regions failed.
    #[error("failed to map ring memory: {0}")]
    RingMap(#[source] io::Error),

    /// Creating the wakeup eventfd failed.
    #[error("failed to create the wakeup eventfd: {0}")]
    Eventfd(#[source] io::Error),

    /// `io_uring_enter` failed with something other than `EINTR`.
    #[error("io_uring_enter failed: {0}")]
    Enter(#[source] io::Error),

    /// `run` was called while another thread was already running the loop.
    #[error("the reactor is already running")]
    AlreadyRunning,
}

/// A builder that configures the reactor.
pub struct ReactorBuilder {
    entries: u32,
    flags: SetupFlags,
}

impl ReactorBuilder {
    /// Create a reactor builder with the default options.
    pub const fn new() -> Self {
        Self {
            entries: 64,
            flags: SetupFlags::empty(),
        }
    }

    /// Set the submission queue depth. Must be a nonzero power of two.
    pub const fn with_entries(self, entries: u32) -> Self {
        Self { entries, ..self }
    }

    /// Pass extra `io_uring_setup` flags through to the kernel.
    pub const fn with_flags(self, flags: SetupFlags) -> Self {
        Self { flags, ..self }
    }

    /// Finalize the reactor, using the options that have been specified
    /// here.
    pub fn build(self) -> Result<Arc<Reactor>, ReactorError> {
        Reactor::with_flags(self.entries, self.flags)
    }
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An io_uring-bound execution context.
///
/// Construction sets up the ring, maps the three ring regions, and creates
/// the wakeup eventfd; all of it is released in reverse order if any step
/// fails, and on drop.
pub struct Reactor {
    id: ReactorId,
    params: io_uring_params,
    ring_fd: OwnedFd,
    eventfd: OwnedFd,
    // never read again, but the views below point into these mappings
    _sq_region: MappedRegion,
    _cq_region: MappedRegion,
    _sqe_region: MappedRegion,
    sq: SubmissionQueue,
    cq: CompletionQueue,
    /// Tasks awaiting a free SQE slot. Loop-thread only; every access is a
    /// short borrow that ends before any task callback runs.
    pending: UnsafeCell<TaskQueue>,
    /// Remote submissions, drained once per loop round.
    requests: AtomicTaskQueue,
    /// SQEs published to the kernel minus completions reaped. Loop-thread
    /// written; readable anywhere.
    n_submitted: AtomicUsize,
    stop_source: StopSource,
    running: AtomicBool,
    loop_thread: Mutex<Option<ThreadId>>,
    wakeup_op: Box<WakeupOperation>,
    cancel_op: Box<CancelAllOperation>,
    weak_ref: OnceCell<Weak<Reactor>>,
}

// All shared state is either atomic, lock-protected, or documented as
// loop-thread-only above.
unsafe impl Send for Reactor {}
unsafe impl Sync for Reactor {}

impl Reactor {
    /// Construct a reactor with `entries` submission slots and no extra
    /// setup flags.
    pub fn new(entries: u32) -> Result<Arc<Self>, ReactorError> {
        Self::with_flags(entries, SetupFlags::empty())
    }

    /// Construct a reactor with `entries` submission slots, passing `flags`
    /// through to `io_uring_setup`.
    pub fn with_flags(entries: u32, flags: SetupFlags) -> Result<Arc<Self>, ReactorError> {
        if entries == 0 {
            return Err(ReactorError::InvalidConfig("entries must be nonzero"));
        }
        if !entries.is_power_of_two() {
            return Err(ReactorError::InvalidConfig(
                "entries must be a power of two",
            ));
        }

        let mut params = io_uring_params::default();
        params.flags = flags.bits();
        let ring_fd = sys::io_uring_setup(entries, &mut params).map_err(ReactorError::RingSetup)?;

        let sq_size =
            params.sq_off.array as usize + params.sq_entries as usize * mem::size_of::<u32>();
        let cq_size = params.cq_off.cqes as usize
            + params.cq_entries as usize * mem::size_of::<io_uring_cqe>();
        let sqe_size = params.sq_entries as usize * mem::size_of::<io_uring_sqe>();

        let sq_region = MappedRegion::map(ring_fd.as_raw_fd(), sq_size, IORING_OFF_SQ_RING)
            .map_err(ReactorError::RingMap)?;
        let cq_region = MappedRegion::map(ring_fd.as_raw_fd(), cq_size, IORING_OFF_CQ_RING)
            .map_err(ReactorError::RingMap)?;
        let sqe_region = MappedRegion::map(ring_fd.as_raw_fd(), sqe_size, IORING_OFF_SQES)
            .map_err(ReactorError::RingMap)?;
        let eventfd = sys::eventfd().map_err(ReactorError::Eventfd)?;

        let sq = unsafe { SubmissionQueue::new(&sq_region, &sqe_region, &params) };
        let cq = unsafe { CompletionQueue::new(&cq_region, &params) };
        let wakeup_op = Box::new(WakeupOperation::new(eventfd.as_raw_fd()));
        let cancel_op = Box::new(CancelAllOperation::new());

        let reactor = Arc::new(Reactor {
            id: ReactorId {
                inner: LAST_REACTOR_ID.fetch_add(1, Ordering::Relaxed),
            },
            params,
            ring_fd,
            eventfd,
            _sq_region: sq_region,
            _cq_region: cq_region,
            _sqe_region: sqe_region,
            sq,
            cq,
            pending: UnsafeCell::new(TaskQueue::new()),
            requests: AtomicTaskQueue::new(),
            n_submitted: AtomicUsize::new(0),
            stop_source: StopSource::new(),
            running: AtomicBool::new(false),
            loop_thread: Mutex::new(None),
            wakeup_op,
            cancel_op,
            weak_ref: OnceCell::new(),
        });
        if reactor.weak_ref.set(Arc::downgrade(&reactor)).is_err() {
            unreachable!();
        }
        if reactor
            .wakeup_op
            .reactor
            .set(Arc::downgrade(&reactor))
            .is_err()
        {
            unreachable!();
        }
        log::debug!(
            "created reactor {:?}: {} sq entries, {} cq entries",
            reactor.id,
            reactor.params.sq_entries,
            reactor.params.cq_entries
        );
        Ok(reactor)
    }

    pub fn id(&self) -> ReactorId {
        self.id
    }

    /// Obtain a scheduler for this reactor, capable of creating schedule
    /// senders that complete on its loop thread.
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Weak::clone(self.weak_ref.get().unwrap()), self.id)
    }

    /// A token observing this reactor's stop source.
    pub fn stop_token(&self) -> StopToken {
        self.stop_source.token()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_source.stop_requested()
    }

    /// Ask the loop to stop. Safe from any thread; returns true for the
    /// call that made the transition. Pending tasks complete synthetically
    /// from here on, and the loop exits once in-flight kernel work has
    /// drained (cancelled where the kernel supports it).
    pub fn request_stop(&self) -> bool {
        let transitioned = self.stop_source.request_stop();
        if transitioned {
            self.wakeup();
        }
        transitioned
    }

    /// Kick the loop out of a blocked `io_uring_enter` by bumping the
    /// eventfd counter the wakeup read is armed on.
    pub fn wakeup(&self) {
        if let Err(error) = sys::eventfd_write(self.eventfd.as_raw_fd(), 1) {
            log::warn!("wakeup write failed: {}", error);
        }
    }

    /// Kernel operations currently in flight: SQEs published minus
    /// completions reaped.
    pub fn in_flight(&self) -> usize {
        self.n_submitted.load(Ordering::Relaxed)
    }

    /// Hand a task to the context. From the loop thread this splices
    /// directly onto the pending queue; from any other thread it goes
    /// through the atomic request queue followed by a wakeup write.
    ///
    /// # Safety
    ///
    /// `task` must not be linked into any queue, must stay valid and
    /// unmoved until its `complete` runs, and its vtable must honor the
    /// contract documented on [`TaskVtable`].
    pub unsafe fn submit(&self, task: NonNull<Task>) {
        if self.on_loop_thread() {
            (*self.pending.get()).push_back(task);
        } else {
            self.requests.push(task);
            self.wakeup();
        }
    }

    fn on_loop_thread(&self) -> bool {
        *self.loop_thread.lock() == Some(thread::current().id())
    }

    /// Run the event loop on the calling thread until a stop has been
    /// requested and all submitted work has quiesced.
    pub fn run(&self) -> Result<(), ReactorError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ReactorError::AlreadyRunning);
        }
        *self.loop_thread.lock() = Some(thread::current().id());
        let result = self.run_inner();
        *self.loop_thread.lock() = None;
        self.running.store(false, Ordering::Release);
        result
    }

    fn run_inner(&self) -> Result<(), ReactorError> {
        // Arm the wakeup read before the first enter so a remote submit can
        // always interrupt the loop.
        unsafe { (*self.pending.get()).push_back(NonNull::from(&self.wakeup_op.task)) };

        let mut cancel_submitted = false;
        loop {
            // 1. Drain remote requests onto the local pending queue.
            let requests = self.requests.take_all();
            unsafe { (*self.pending.get()).append(requests) };

            let stop_requested = self.stop_requested();
            if stop_requested
                && self.n_submitted.load(Ordering::Relaxed) == 0
                && unsafe { (*self.pending.get()).is_empty() }
                && self.requests.is_empty()
            {
                break;
            }

            let mut to_submit = 0;

            // On the stop transition, try to cancel whatever is still in
            // flight. This one internal submission bypasses the stop
            // short-circuit; user tasks never do.
            if stop_requested && !cancel_submitted && self.n_submitted.load(Ordering::Relaxed) > 0
            {
                let mut cancel = TaskQueue::new();
                unsafe { cancel.push_back(NonNull::from(&self.cancel_op.task)) };
                let result = self.sq.submit(cancel, false);
                if result.n_submitted == 1 {
                    log::debug!("submitted cancel-any for in-flight operations");
                    cancel_submitted = true;
                    to_submit += 1;
                    self.n_submitted.fetch_add(1, Ordering::Relaxed);
                }
                // on a full ring the task is dropped on the floor and
                // re-pushed next round
            }

            // 2. Publish SQEs for as many pending tasks as fit.
            let pending = unsafe { (*self.pending.get()).take() };
            let result = self.sq.submit(pending, stop_requested);
            to_submit += result.n_submitted;
            self.n_submitted
                .fetch_add(result.n_submitted as usize, Ordering::Relaxed);
            let ready = result.ready;
            unsafe {
                // nothing ran in between: the leftovers go back as-is, and
                // tasks submitted by completion callbacks land behind them
                debug_assert!((*self.pending.get()).is_empty());
                *self.pending.get() = result.pending;
            }

            // 3. Enter the kernel. Block only when there is nothing to do
            // locally and completions are outstanding.
            let pending_empty = unsafe { (*self.pending.get()).is_empty() };
            if to_submit > 0 || pending_empty {
                let outstanding = self.n_submitted.load(Ordering::Relaxed);
                let min_complete = if ready.is_empty() && pending_empty && outstanding > 0 {
                    1
                } else {
                    0
                };
                loop {
                    match sys::io_uring_enter(
                        self.ring_fd.as_raw_fd(),
                        to_submit,
                        min_complete,
                        EnterFlags::GETEVENTS,
                    ) {
                        Ok(_) => break,
                        Err(error) if error.raw_os_error() == Some(libc::EINTR) => {
                            log::debug!("io_uring_enter interrupted, retrying");
                            continue;
                        }
                        Err(error) => return Err(ReactorError::Enter(error)),
                    }
                }
            }

            // 4. Reap: synthetic completions first, then the CQ drain.
            let completed = self.cq.complete(ready);
            if completed > 0 {
                self.n_submitted
                    .fetch_sub(completed as usize, Ordering::Relaxed);
            }
        }

        // A remote submit can race the final emptiness check; whatever it
        // managed to enqueue still gets its synthetic completion.
        let late = self.requests.take_all();
        if !late.is_empty() {
            self.cq.complete(late);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.id)
            .field("sq_entries", &self.params.sq_entries)
            .field("cq_entries", &self.params.cq_entries)
            .field("in_flight", &self.in_flight())
            .field("stop_requested", &self.stop_requested())
            .finish()
    }
}

/// Buffer for the wakeup read: a plain 8-byte read where the kernel has
/// `IORING_OP_READ`, a 1-element readv on older kernels.
type WakeupBuffer = Either<u64, ReadvBuffer>;

struct ReadvBuffer {
    value: u64,
    iov: libc::iovec,
}

/// The permanent self-wakeup task: a read of the eventfd counter that
/// re-arms itself, through the pending queue, every time it completes. While
/// the loop runs, this read is always either in flight or being re-armed, so
/// a blocked `io_uring_enter` can always be interrupted by an eventfd write.
#[repr(C)]
struct WakeupOperation {
    task: Task, // must stay first
    eventfd: RawFd,
    reactor: OnceCell<Weak<Reactor>>,
    buffer: UnsafeCell<WakeupBuffer>,
}

impl WakeupOperation {
    const VTABLE: TaskVtable = TaskVtable {
        ready: Self::ready,
        submit: Self::submit,
        complete: Self::complete,
    };

    fn new(eventfd: RawFd) -> Self {
        let buffer = if sys::supports_op_read() {
            Either::Left(0)
        } else {
            Either::Right(ReadvBuffer {
                value: 0,
                iov: libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                },
            })
        };
        Self {
            task: Task::new(&Self::VTABLE),
            eventfd,
            reactor: OnceCell::new(),
            buffer: UnsafeCell::new(buffer),
        }
    }

    unsafe fn ready(_: NonNull<Task>) -> bool {
        false
    }

    unsafe fn submit(task: NonNull<Task>, sqe: &mut io_uring_sqe) {
        let this = &*(task.as_ptr() as *const WakeupOperation);
        match &mut *this.buffer.get() {
            Either::Left(value) => {
                sqe.opcode = IORING_OP_READ;
                sqe.addr = value as *mut u64 as u64;
                sqe.len = mem::size_of::<u64>() as u32;
            }
            Either::Right(readv) => {
                readv.iov = libc::iovec {
                    iov_base: &mut readv.value as *mut u64 as *mut libc::c_void,
                    iov_len: mem::size_of::<u64>(),
                };
                sqe.opcode = IORING_OP_READV;
                sqe.addr = &readv.iov as *const libc::iovec as u64;
                sqe.len = 1;
            }
        }
        sqe.fd = this.eventfd;
        sqe.user_data = task.as_ptr() as u64;
    }

    unsafe fn complete(task: NonNull<Task>, cqe: Option<&io_uring_cqe>) {
        if let Some(cqe) = cqe {
            if cqe.res < 0 && cqe.res != -libc::ECANCELED {
                log::warn!("wakeup read failed with {}", cqe.res);
            }
        }
        let this = &*(task.as_ptr() as *const WakeupOperation);
        let reactor = match this.reactor.get().and_then(Weak::upgrade) {
            Some(reactor) => reactor,
            None => return,
        };
        if !reactor.stop_requested() {
            // re-arm through the pending queue; never touch the ring from
            // inside a completion
            reactor.submit(task);
        }
    }
}

/// The stop-time cancellation task: one `IORING_OP_ASYNC_CANCEL` with
/// `IORING_ASYNC_CANCEL_ANY`, aimed at everything in flight. Kernels without
/// cancel-any fail the request, which is fine; in-flight operations then
/// drain naturally.
#[repr(C)]
struct CancelAllOperation {
    task: Task, // must stay first
}

impl CancelAllOperation {
    const VTABLE: TaskVtable = TaskVtable {
        ready: Self::ready,
        submit: Self::submit,
        complete: Self::complete,
    };

    fn new() -> Self {
        Self {
            task: Task::new(&Self::VTABLE),
        }
    }

    unsafe fn ready(_: NonNull<Task>) -> bool {
        false
    }

    unsafe fn submit(task: NonNull<Task>, sqe: &mut io_uring_sqe) {
        sqe.opcode = IORING_OP_ASYNC_CANCEL;
        sqe.fd = -1;
        sqe.op_flags = IORING_ASYNC_CANCEL_ANY;
        sqe.user_data = task.as_ptr() as u64;
    }

    unsafe fn complete(_: NonNull<Task>, cqe: Option<&io_uring_cqe>) {
        match cqe {
            Some(cqe) if cqe.res >= 0 => {
                log::debug!("cancelled {} in-flight operations", cqe.res)
            }
            Some(cqe) => log::debug!("cancel-any not effective: {}", cqe.res),
            None => {}
        }
    }
}
