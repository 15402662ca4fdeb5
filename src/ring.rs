//! Typed views over the submission and completion rings shared with the
//! kernel.
//!
//! Both views capture raw pointers into the mapped regions at construction
//! and then operate purely on those. The head/tail counters are the kernel
//! ABI: the kernel acquires the SQ tail and releases the CQ tail, so the
//! user side must release the SQ tail and acquire the CQ tail. None of these
//! orderings can be relaxed.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::memory::MappedRegion;
use crate::sys::{io_uring_cqe, io_uring_params, io_uring_sqe};
use crate::task::{Task, TaskQueue};

/// User-side view of the submission queue ring.
pub(crate) struct SubmissionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    entries: *mut io_uring_sqe,
    mask: u32,
    capacity: u32,
}

unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

/// Outcome of one submission batch.
pub(crate) struct SubmissionResult {
    /// SQEs published to the kernel this batch.
    pub(crate) n_submitted: u32,
    /// Tasks that were not tried because the ring ran out of slots.
    pub(crate) pending: TaskQueue,
    /// Tasks to complete synthetically: their `ready` fired, or submission
    /// was short-circuited by a stop request.
    pub(crate) ready: TaskQueue,
}

impl SubmissionQueue {
    /// # Safety
    ///
    /// `region` and `sqes` must be the SQ ring and SQE array mappings of the
    /// ring described by `params`, and must outlive the returned view.
    pub(crate) unsafe fn new(
        region: &MappedRegion,
        sqes: &MappedRegion,
        params: &io_uring_params,
    ) -> Self {
        // The indirection array gets the identity permutation once,
        // permanently: ring slot i always names SQE i.
        let array = region.offset_as::<u32>(params.sq_off.array);
        for i in 0..params.sq_entries {
            *array.add(i as usize) = i;
        }
        Self {
            head: region.offset_as::<AtomicU32>(params.sq_off.head),
            tail: region.offset_as::<AtomicU32>(params.sq_off.tail),
            entries: sqes.offset_as::<io_uring_sqe>(0),
            mask: *region.offset_as::<u32>(params.sq_off.ring_mask),
            capacity: params.sq_entries,
        }
    }

    /// Try to publish SQEs for as many of `tasks` as fit.
    ///
    /// Tasks whose `ready` returns true never touch the ring and come back
    /// in `ready`; when `stop_requested` is set, every tried task does.
    /// Tasks that found no free slot come back untried in `pending`.
    ///
    /// The tail store is a release so the kernel observes fully written
    /// SQEs before it observes the new index; the head load is an acquire
    /// pairing with the kernel's release when it consumes entries.
    pub(crate) fn submit(&self, mut tasks: TaskQueue, stop_requested: bool) -> SubmissionResult {
        let head = unsafe { (*self.head).load(Ordering::Acquire) };
        let tail_shared = unsafe { &*self.tail };
        let mut tail = tail_shared.load(Ordering::Relaxed);
        let mut free = self.capacity - tail.wrapping_sub(head);
        let mut result = SubmissionResult {
            n_submitted: 0,
            pending: TaskQueue::new(),
            ready: TaskQueue::new(),
        };
        while free > 0 {
            let task = match tasks.pop_front() {
                Some(task) => task,
                None => break,
            };
            unsafe {
                if stop_requested || Task::invoke_ready(task) {
                    result.ready.push_back(task);
                } else {
                    let sqe = &mut *self.entries.add((tail & self.mask) as usize);
                    *sqe = io_uring_sqe::default();
                    Task::invoke_submit(task, sqe);
                    debug_assert_eq!(sqe.user_data, task.as_ptr() as u64);
                    tail = tail.wrapping_add(1);
                    free -= 1;
                    result.n_submitted += 1;
                }
            }
        }
        result.pending = tasks;
        tail_shared.store(tail, Ordering::Release);
        result
    }
}

/// User-side view of the completion queue ring.
pub(crate) struct CompletionQueue {
    head: *const AtomicU32,
    tail: *const AtomicU32,
    entries: *const io_uring_cqe,
    mask: u32,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// # Safety
    ///
    /// `region` must be the CQ ring mapping of the ring described by
    /// `params`, and must outlive the returned view.
    pub(crate) unsafe fn new(region: &MappedRegion, params: &io_uring_params) -> Self {
        Self {
            head: region.offset_as::<AtomicU32>(params.cq_off.head),
            tail: region.offset_as::<AtomicU32>(params.cq_off.tail),
            entries: region.offset_as::<io_uring_cqe>(params.cq_off.cqes),
            mask: *region.offset_as::<u32>(params.cq_off.ring_mask),
        }
    }

    /// Complete `ready` tasks synthetically (no CQE), then drain and
    /// dispatch every kernel completion. Returns the kernel count only.
    ///
    /// The head store is a release so the kernel may reuse the drained
    /// slots; the tail load is an acquire pairing with the kernel's release
    /// when it posts entries.
    pub(crate) fn complete(&self, mut ready: TaskQueue) -> u32 {
        while let Some(task) = ready.pop_front() {
            unsafe { Task::invoke_complete(task, None) };
        }
        let head_shared = unsafe { &*self.head };
        let mut head = head_shared.load(Ordering::Relaxed);
        let tail = unsafe { (*self.tail).load(Ordering::Acquire) };
        let mut n_completed = 0;
        while head != tail {
            let cqe = unsafe { *self.entries.add((head & self.mask) as usize) };
            head = head.wrapping_add(1);
            n_completed += 1;
            match NonNull::new(cqe.user_data as *mut Task) {
                Some(task) => unsafe { Task::invoke_complete(task, Some(&cqe)) },
                None => log::warn!(
                    "dropping completion with null user_data (res {})",
                    cqe.res
                ),
            }
        }
        head_shared.store(head, Ordering::Release);
        n_completed
    }
}

#[cfg(test)]
mod tests {
    //
    // These tests run the views against anonymous memory laid out like the
    // kernel would lay out a small ring, so the index arithmetic and the
    // task classification can be checked without an io_uring fd.
    //

    use super::*;
    use crate::sys::{io_cqring_offsets, io_sqring_offsets};
    use crate::task::TaskVtable;
    use std::cell::Cell;
    use std::mem;

    const ENTRIES: u32 = 8;

    // SQ ring layout: head at 0, tail at 4, mask at 8, array at 16.
    fn sq_params() -> io_uring_params {
        io_uring_params {
            sq_entries: ENTRIES,
            cq_entries: ENTRIES * 2,
            sq_off: io_sqring_offsets {
                head: 0,
                tail: 4,
                ring_mask: 8,
                array: 16,
                ..Default::default()
            },
            cq_off: io_cqring_offsets {
                head: 0,
                tail: 4,
                ring_mask: 8,
                cqes: 16,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn sq_fixture() -> (MappedRegion, MappedRegion, io_uring_params) {
        let params = sq_params();
        let region = MappedRegion::anonymous(4096).unwrap();
        let sqes =
            MappedRegion::anonymous(ENTRIES as usize * mem::size_of::<io_uring_sqe>()).unwrap();
        unsafe {
            *region.offset_as::<u32>(params.sq_off.ring_mask) = ENTRIES - 1;
        }
        (region, sqes, params)
    }

    #[repr(C)]
    struct ProbeTask {
        task: Task,
        ready: bool,
        completions: Cell<u32>,
        last_res: Cell<Option<i32>>,
    }

    unsafe fn probe_ready(task: NonNull<Task>) -> bool {
        (*(task.as_ptr() as *const ProbeTask)).ready
    }

    unsafe fn probe_submit(task: NonNull<Task>, sqe: &mut io_uring_sqe) {
        sqe.opcode = crate::sys::IORING_OP_NOP;
        sqe.user_data = task.as_ptr() as u64;
    }

    unsafe fn probe_complete(task: NonNull<Task>, cqe: Option<&io_uring_cqe>) {
        let probe = &*(task.as_ptr() as *const ProbeTask);
        probe.completions.set(probe.completions.get() + 1);
        probe.last_res.set(cqe.map(|cqe| cqe.res));
    }

    static PROBE_VTABLE: TaskVtable = TaskVtable {
        ready: probe_ready,
        submit: probe_submit,
        complete: probe_complete,
    };

    fn probe(ready: bool) -> Box<ProbeTask> {
        Box::new(ProbeTask {
            task: Task::new(&PROBE_VTABLE),
            ready,
            completions: Cell::new(0),
            last_res: Cell::new(None),
        })
    }

    fn queue_of(tasks: &[Box<ProbeTask>]) -> TaskQueue {
        let mut queue = TaskQueue::new();
        for task in tasks {
            unsafe { queue.push_back(NonNull::from(&task.task)) };
        }
        queue
    }

    #[test]
    fn submit_publishes_tail_and_user_data() {
        let (region, sqes, params) = sq_fixture();
        let sq = unsafe { SubmissionQueue::new(&region, &sqes, &params) };
        let tasks: Vec<_> = (0..3).map(|_| probe(false)).collect();

        let result = sq.submit(queue_of(&tasks), false);
        assert_eq!(result.n_submitted, 3);
        assert!(result.pending.is_empty());
        assert!(result.ready.is_empty());

        let tail = unsafe { (*region.offset_as::<AtomicU32>(4)).load(Ordering::Relaxed) };
        assert_eq!(tail, 3);
        for (i, task) in tasks.iter().enumerate() {
            let sqe = unsafe { *sqes.offset_as::<io_uring_sqe>(i as u32 * 64) };
            assert_eq!(sqe.user_data, &task.task as *const Task as u64);
        }
        // the indirection array is the identity permutation
        for i in 0..ENTRIES {
            let slot = unsafe { *region.offset_as::<u32>(params.sq_off.array + 4 * i) };
            assert_eq!(slot, i);
        }
    }

    #[test]
    fn submit_routes_ready_tasks_around_the_ring() {
        let (region, sqes, params) = sq_fixture();
        let sq = unsafe { SubmissionQueue::new(&region, &sqes, &params) };
        let tasks = [probe(false), probe(true), probe(false)];

        let mut result = sq.submit(queue_of(&tasks), false);
        assert_eq!(result.n_submitted, 2);
        let ready = result.ready.pop_front().unwrap();
        assert_eq!(ready.as_ptr() as *const Task, &tasks[1].task as *const Task);
        assert!(result.ready.is_empty());
    }

    #[test]
    fn submit_respects_capacity() {
        let (region, sqes, params) = sq_fixture();
        let sq = unsafe { SubmissionQueue::new(&region, &sqes, &params) };
        let tasks: Vec<_> = (0..ENTRIES + 4).map(|_| probe(false)).collect();

        let mut result = sq.submit(queue_of(&tasks), false);
        assert_eq!(result.n_submitted, ENTRIES);
        let mut left_over = 0;
        while result.pending.pop_front().is_some() {
            left_over += 1;
        }
        assert_eq!(left_over, 4);
    }

    #[test]
    fn stop_short_circuits_everything() {
        let (region, sqes, params) = sq_fixture();
        let sq = unsafe { SubmissionQueue::new(&region, &sqes, &params) };
        let tasks: Vec<_> = (0..3).map(|_| probe(false)).collect();

        let mut result = sq.submit(queue_of(&tasks), true);
        assert_eq!(result.n_submitted, 0);
        let mut ready = 0;
        while result.ready.pop_front().is_some() {
            ready += 1;
        }
        assert_eq!(ready, 3);
        let tail = unsafe { (*region.offset_as::<AtomicU32>(4)).load(Ordering::Relaxed) };
        assert_eq!(tail, 0);
    }

    #[test]
    fn complete_dispatches_by_user_data() {
        let params = sq_params();
        let region = MappedRegion::anonymous(4096).unwrap();
        unsafe {
            *region.offset_as::<u32>(params.cq_off.ring_mask) = ENTRIES * 2 - 1;
        }
        let cq = unsafe { CompletionQueue::new(&region, &params) };

        let synthetic = probe(true);
        let completed = [probe(false), probe(false)];
        unsafe {
            for (i, task) in completed.iter().enumerate() {
                *region.offset_as::<io_uring_cqe>(params.cq_off.cqes + 16 * i as u32) =
                    io_uring_cqe {
                        user_data: &task.task as *const Task as u64,
                        res: -(libc::ETIME),
                        flags: 0,
                    };
            }
            (*region.offset_as::<AtomicU32>(params.cq_off.tail)).store(2, Ordering::Release);
        }

        let mut ready = TaskQueue::new();
        unsafe { ready.push_back(NonNull::from(&synthetic.task)) };
        let n = cq.complete(ready);

        assert_eq!(n, 2);
        assert_eq!(synthetic.completions.get(), 1);
        assert_eq!(synthetic.last_res.get(), None);
        for task in &completed {
            assert_eq!(task.completions.get(), 1);
            assert_eq!(task.last_res.get(), Some(-libc::ETIME));
        }
        let head = unsafe {
            (*region.offset_as::<AtomicU32>(params.cq_off.head)).load(Ordering::Relaxed)
        };
        assert_eq!(head, 2);
    }
}
