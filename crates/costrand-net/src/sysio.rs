//! Thin syscall wrappers shared by the socket types
//!
//! All return [`IoResult`](crate::IoResult) with the raw OS errno; the
//! callers decide what EAGAIN/EINTR mean for their operation.

use crate::IoResult;
use std::os::fd::RawFd;

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// One recv(2). `bytes == 0` with `ok` means end of stream.
pub(crate) fn sys_recv(fd: RawFd, buf: &mut [u8]) -> IoResult {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n >= 0 {
        IoResult::done(n as usize)
    } else {
        IoResult::error(last_errno())
    }
}

/// One send(2), SIGPIPE suppressed
pub(crate) fn sys_send(fd: RawFd, buf: &[u8]) -> IoResult {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        IoResult::done(n as usize)
    } else {
        IoResult::error(last_errno())
    }
}

/// One writev(2) over the whole buffer list; `bytes` counts bytes
pub(crate) fn sys_writev(fd: RawFd, bufs: &[&[u8]]) -> IoResult {
    let iovs: Vec<libc::iovec> = bufs
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = unsafe { libc::writev(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
    if n >= 0 {
        IoResult::done(n as usize)
    } else {
        IoResult::error(last_errno())
    }
}

/// One readv(2); `bytes` counts bytes
pub(crate) fn sys_readv(fd: RawFd, bufs: &mut [&mut [u8]]) -> IoResult {
    let iovs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|b| libc::iovec {
            iov_base: b.as_mut_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    let n = unsafe { libc::readv(fd, iovs.as_ptr(), iovs.len() as libc::c_int) };
    if n >= 0 {
        IoResult::done(n as usize)
    } else {
        IoResult::error(last_errno())
    }
}

const MMSG_BATCH: usize = 32;

/// sendmmsg(2) over `chunks`, one message per buffer.
///
/// `bytes` in the result counts fully transmitted buffers; the second
/// return value is the byte count of the last (possibly partial)
/// buffer. A short buffer ends the iteration; `EINTR` retries;
/// `EAGAIN` after progress reports success-so-far.
pub(crate) fn sys_sendmmsg(fd: RawFd, chunks: &[&[u8]], flags: libc::c_int) -> (IoResult, usize) {
    let mut res = IoResult {
        bytes: 0,
        code: 0,
        ok: false,
    };
    let mut last_bytes = 0usize;
    let mut idx = 0usize;

    while idx < chunks.len() {
        let ct = (chunks.len() - idx).min(MMSG_BATCH);
        let mut iovs: [libc::iovec; MMSG_BATCH] = unsafe { std::mem::zeroed() };
        let mut hdrs: [libc::mmsghdr; MMSG_BATCH] = unsafe { std::mem::zeroed() };
        for k in 0..ct {
            iovs[k].iov_base = chunks[idx + k].as_ptr() as *mut libc::c_void;
            iovs[k].iov_len = chunks[idx + k].len();
            hdrs[k].msg_hdr.msg_iov = &mut iovs[k];
            hdrs[k].msg_hdr.msg_iovlen = 1;
        }

        let pcks = unsafe {
            libc::sendmmsg(
                fd,
                hdrs.as_mut_ptr(),
                ct as libc::c_uint,
                flags | libc::MSG_NOSIGNAL,
            )
        };

        if pcks > 0 {
            let pcks = pcks as usize;
            res.bytes += pcks;
            last_bytes = hdrs[pcks - 1].msg_len as usize;
            if last_bytes != chunks[idx + pcks - 1].len() {
                // Short write into the last buffer: stop here.
                break;
            }
            if pcks != ct {
                if last_errno() == libc::EINTR {
                    idx += pcks;
                    continue;
                }
                break;
            }
            idx += pcks;
        } else {
            let err = last_errno();
            if err == libc::EINTR {
                continue;
            }
            if res.bytes > 0 && (err == libc::EAGAIN || err == libc::EWOULDBLOCK) {
                break;
            }
            res.code = err;
            return (res, last_bytes);
        }
    }

    res.ok = true;
    (res, last_bytes)
}

/// recvmmsg(2) into `bufs`, one message per buffer. Same accounting as
/// [`sys_sendmmsg`].
pub(crate) fn sys_recvmmsg(
    fd: RawFd,
    bufs: &mut [&mut [u8]],
    flags: libc::c_int,
) -> (IoResult, usize) {
    let mut res = IoResult {
        bytes: 0,
        code: 0,
        ok: false,
    };
    let mut last_bytes = 0usize;
    let mut idx = 0usize;

    while idx < bufs.len() {
        let ct = (bufs.len() - idx).min(MMSG_BATCH);
        let mut iovs: [libc::iovec; MMSG_BATCH] = unsafe { std::mem::zeroed() };
        let mut hdrs: [libc::mmsghdr; MMSG_BATCH] = unsafe { std::mem::zeroed() };
        for k in 0..ct {
            iovs[k].iov_base = bufs[idx + k].as_mut_ptr() as *mut libc::c_void;
            iovs[k].iov_len = bufs[idx + k].len();
            hdrs[k].msg_hdr.msg_iov = &mut iovs[k];
            hdrs[k].msg_hdr.msg_iovlen = 1;
        }

        let pcks = unsafe {
            libc::recvmmsg(
                fd,
                hdrs.as_mut_ptr(),
                ct as libc::c_uint,
                flags,
                std::ptr::null_mut(),
            )
        };

        if pcks > 0 {
            let pcks = pcks as usize;
            res.bytes += pcks;
            last_bytes = hdrs[pcks - 1].msg_len as usize;
            if last_bytes != bufs[idx + pcks - 1].len() {
                break;
            }
            if pcks != ct {
                if last_errno() == libc::EINTR {
                    idx += pcks;
                    continue;
                }
                break;
            }
            idx += pcks;
        } else {
            let err = last_errno();
            if err == libc::EINTR {
                continue;
            }
            if res.bytes > 0 && (err == libc::EAGAIN || err == libc::EWOULDBLOCK) {
                break;
            }
            res.code = err;
            return (res, last_bytes);
        }
    }

    res.ok = true;
    (res, last_bytes)
}

/// SO_ERROR after a non-blocking connect
pub(crate) fn sys_so_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return last_errno();
    }
    err
}
