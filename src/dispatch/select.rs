//! `fd_set` plumbing for the zero-timeout readiness probes.

use std::mem;
use std::ptr;

pub(crate) struct FdSet(libc::fd_set);

impl FdSet {
    pub(crate) fn new() -> Self {
        let mut raw: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut raw);
        }
        Self(raw)
    }

    /// Adds a descriptor to the set. Descriptors outside the range `select`
    /// can watch are rejected.
    pub(crate) fn insert(&mut self, fd: i32) -> bool {
        if fd < 0 || fd >= libc::FD_SETSIZE as i32 {
            return false;
        }
        unsafe {
            libc::FD_SET(fd, &mut self.0);
        }
        true
    }

    pub(crate) fn contains(&self, fd: i32) -> bool {
        if fd < 0 || fd >= libc::FD_SETSIZE as i32 {
            return false;
        }
        unsafe { libc::FD_ISSET(fd, &self.0) }
    }
}

/// Nonblocking `select` over both sets. The loop paces itself with an
/// explicit sleep instead of a select timeout, so the probe never waits.
pub(crate) fn probe(nfds: i32, read: &mut FdSet, write: &mut FdSet) -> i32 {
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    unsafe { libc::select(nfds, &mut read.0, &mut write.0, ptr::null_mut(), &mut tv) }
}

/// One-shot writability probe for a single descriptor.
pub(crate) fn writable(fd: i32) -> bool {
    let mut set = FdSet::new();
    if !set.insert(fd) {
        return false;
    }
    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let ready = unsafe {
        libc::select(
            fd + 1,
            ptr::null_mut(),
            &mut set.0,
            ptr::null_mut(),
            &mut tv,
        )
    };
    ready > 0 && set.contains(fd)
}
