//! Blocking I/O primitives shared by the `sync` and `worker` method
//! backends (spec §4.6). Both ultimately issue the same `preadv`/`pwritev`/
//! `fsync` calls against a raw file descriptor; only the thread that runs
//! them differs.

use crate::handle::{IovecSpan, OpPayload, OpType};

pub(crate) fn perform(op: OpType, payload: &OpPayload, iov: &[IovecSpan]) -> i64 {
    match op {
        OpType::Read => preadv(payload.fd, payload.offset, iov),
        OpType::Write => pwritev(payload.fd, payload.offset, iov),
        OpType::Fsync => fsync(payload.fd, false),
        OpType::FlushRange => fsync(payload.fd, true),
        OpType::Nop | OpType::Invalid => 0,
    }
}

fn to_iovecs(iov: &[IovecSpan]) -> Vec<libc::iovec> {
    iov.iter()
        .map(|span| libc::iovec { iov_base: span.ptr.cast(), iov_len: span.len as usize })
        .collect()
}

fn last_errno_negative() -> i64 {
    -(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
}

fn preadv(fd: i32, offset: u64, iov: &[IovecSpan]) -> i64 {
    let vecs = to_iovecs(iov);
    let n = unsafe { libc::preadv(fd, vecs.as_ptr(), vecs.len() as i32, offset as i64) };
    if n < 0 {
        last_errno_negative()
    } else {
        n as i64
    }
}

fn pwritev(fd: i32, offset: u64, iov: &[IovecSpan]) -> i64 {
    let vecs = to_iovecs(iov);
    let n = unsafe { libc::pwritev(fd, vecs.as_ptr(), vecs.len() as i32, offset as i64) };
    if n < 0 {
        last_errno_negative()
    } else {
        n as i64
    }
}

fn fsync(fd: i32, data_only: bool) -> i64 {
    let rc = unsafe {
        if data_only {
            libc::fdatasync(fd)
        } else {
            libc::fsync(fd)
        }
    };
    if rc < 0 {
        last_errno_negative()
    } else {
        0
    }
}
