//! Raw io_uring kernel interface.
//!
//! The structs here mirror `<linux/io_uring.h>` exactly; the ring memory
//! layout they describe is shared with the kernel and must not be rearranged.

#![allow(non_camel_case_types)]

use std::ffi::CStr;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::{io, mem, ptr};

use bitflags::bitflags;
use once_cell::sync::Lazy;

// Magic offsets for mmapping the ring regions.
pub const IORING_OFF_SQ_RING: libc::off_t = 0;
pub const IORING_OFF_CQ_RING: libc::off_t = 0x800_0000;
pub const IORING_OFF_SQES: libc::off_t = 0x1000_0000;

pub const IORING_OP_NOP: u8 = 0;
pub const IORING_OP_READV: u8 = 1;
pub const IORING_OP_TIMEOUT: u8 = 11;
pub const IORING_OP_ASYNC_CANCEL: u8 = 14;
pub const IORING_OP_READ: u8 = 22;

/// `sqe.op_flags` bit for `IORING_OP_ASYNC_CANCEL`: match every in-flight
/// request instead of a single `user_data` (Linux 5.19+).
pub const IORING_ASYNC_CANCEL_ANY: u32 = 1 << 2;

bitflags! {
    /// Flags accepted by `io_uring_setup`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetupFlags: u32 {
        const IOPOLL = 1 << 0;
        const SQPOLL = 1 << 1;
        const SQ_AFF = 1 << 2;
        const CQSIZE = 1 << 3;
        const CLAMP = 1 << 4;
        const ATTACH_WQ = 1 << 5;
    }
}

bitflags! {
    /// Flags accepted by `io_uring_enter`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnterFlags: u32 {
        const GETEVENTS = 1 << 0;
        const SQ_WAKEUP = 1 << 1;
    }
}

bitflags! {
    /// Feature bits reported by the kernel in `io_uring_params::features`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureFlags: u32 {
        const SINGLE_MMAP = 1 << 0;
        const NODROP = 1 << 1;
        const SUBMIT_STABLE = 1 << 2;
        const RW_CUR_POS = 1 << 3;
        const CUR_PERSONALITY = 1 << 4;
        const FAST_POLL = 1 << 5;
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_sqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_cqring_offsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
    pub resv: [u32; 3],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_uring_params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: u32,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: u32,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: io_sqring_offsets,
    pub cq_off: io_cqring_offsets,
}

/// A submission queue entry. The kernel's sqe is a web of unions; this is the
/// flattened view for the handful of opcodes this crate issues, with
/// `op_flags` standing in for `timeout_flags`/`cancel_flags`/`rw_flags`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct io_uring_sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub personality: u16,
    pub splice_fd_in: i32,
    pub pad2: [u64; 2],
}

/// A completion queue entry.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct io_uring_cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct __kernel_timespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

const _: () = assert!(mem::size_of::<io_sqring_offsets>() == 40);
const _: () = assert!(mem::size_of::<io_cqring_offsets>() == 40);
const _: () = assert!(mem::size_of::<io_uring_params>() == 120);
const _: () = assert!(mem::size_of::<io_uring_sqe>() == 64);
const _: () = assert!(mem::size_of::<io_uring_cqe>() == 16);

/// `io_uring_setup(2)`. The kernel writes the ring geometry back into
/// `params`; the returned fd owns the ring.
pub fn io_uring_setup(entries: u32, params: &mut io_uring_params) -> io::Result<OwnedFd> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_uring_setup,
            entries,
            params as *mut io_uring_params,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(res as RawFd) })
}

/// `io_uring_enter(2)`. Returns the number of SQEs consumed by the kernel.
pub fn io_uring_enter(
    fd: RawFd,
    to_submit: u32,
    min_complete: u32,
    flags: EnterFlags,
) -> io::Result<u32> {
    let res = unsafe {
        libc::syscall(
            libc::SYS_io_uring_enter,
            fd,
            to_submit,
            min_complete,
            flags.bits(),
            ptr::null_mut::<libc::sigset_t>(),
            0usize,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(res as u32)
}

/// Create the wakeup eventfd with a zero counter.
pub fn eventfd() -> io::Result<OwnedFd> {
    let res = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(res) })
}

/// Add `value` to an eventfd counter. Writes between reads coalesce: the
/// next completed 8-byte read observes the summed counter and resets it.
pub fn eventfd_write(fd: RawFd, value: u64) -> io::Result<()> {
    let res = unsafe {
        libc::write(
            fd,
            &value as *const u64 as *const libc::c_void,
            mem::size_of::<u64>(),
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Whether the running kernel has `IORING_OP_READ` (5.6+). Older kernels
/// take the readv path for the wakeup read.
pub fn supports_op_read() -> bool {
    static SUPPORTED: Lazy<bool> = Lazy::new(|| {
        let mut uts: libc::utsname = unsafe { mem::zeroed() };
        if unsafe { libc::uname(&mut uts) } != 0 {
            return false;
        }
        let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) };
        match release.to_str() {
            Ok(release) => parse_release(release) >= (5, 6),
            Err(_) => false,
        }
    });
    *SUPPORTED
}

fn parse_release(release: &str) -> (u32, u32) {
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor)
}
