//! Common state and dispatch hooks for every socket the service loop
//! manages.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use crate::clock;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Bookkeeping shared by every managed socket.
///
/// `fd` and `dns_ready` are mutated only under the registry mutex; the
/// atomics let the accessors stay lock-free for callers that only need a
/// point-in-time read.
pub(crate) struct SocketBase {
    id: u64,
    fd: AtomicI32,
    selected: AtomicBool,
    dns_ready: AtomicBool,
    last_activity: AtomicU64,
}

impl SocketBase {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            fd: AtomicI32::new(-1),
            selected: AtomicBool::new(false),
            dns_ready: AtomicBool::new(false),
            last_activity: AtomicU64::new(clock::millis()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn fd(&self) -> i32 {
        self.fd.load(Ordering::Relaxed)
    }

    pub(crate) fn set_fd(&self, fd: i32) {
        self.fd.store(fd, Ordering::Relaxed);
    }

    pub(crate) fn selected(&self) -> bool {
        self.selected.load(Ordering::Relaxed)
    }

    pub(crate) fn set_selected(&self, selected: bool) {
        self.selected.store(selected, Ordering::Relaxed);
    }

    pub(crate) fn mark_dns_ready(&self) {
        self.dns_ready.store(true, Ordering::Release);
    }

    pub(crate) fn take_dns_ready(&self) -> bool {
        self.dns_ready.swap(false, Ordering::Acquire)
    }

    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, now: u64) {
        self.last_activity.store(now, Ordering::Relaxed);
    }
}

/// The capability set the service loop dispatches over.
///
/// The no-op defaults make a plain base socket valid; concrete sockets
/// override the hooks they care about. All hooks run on the service worker
/// with the registry mutex held.
pub(crate) trait ManagedSocket: Send + Sync {
    fn base(&self) -> &SocketBase;

    /// The descriptor reported writable. Returns whether any progress was
    /// made (counted by the loop to pick the pacing sleep).
    fn handle_writable(&self) -> bool {
        false
    }

    /// The descriptor reported readable.
    fn handle_readable(&self) {}

    /// 125 ms idle poll.
    fn handle_poll(&self) {}

    /// Deferred DNS resolution finished for this socket.
    fn handle_delayed_connect(&self) {}
}
