//! Process-wide registry of live managed sockets.
//!
//! The registry observes but never owns: it holds weak handles, the
//! application keeps the owning `Arc`s. Entries are appended at
//! construction, removed at drop, and traversed in insertion order by the
//! service loop.
//!
//! The guarding mutex is recursive because hooks run while it is held and
//! may re-enter registry-protected paths (a readable hook accepting a
//! connection registers the new client; an error path closes under the same
//! lock).

use std::cell::RefCell;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::dispatch::base::ManagedSocket;

pub(crate) struct Entry {
    id: u64,
    sock: Weak<dyn ManagedSocket>,
}

type Table = ReentrantMutex<RefCell<Vec<Entry>>>;

static SOCKETS: OnceLock<Table> = OnceLock::new();

fn table() -> &'static Table {
    SOCKETS.get_or_init(|| ReentrantMutex::new(RefCell::new(Vec::new())))
}

pub(crate) type RegistryGuard = ReentrantMutexGuard<'static, RefCell<Vec<Entry>>>;

/// Takes the registry mutex. All composite socket-state mutations
/// (close, error, begin, end, DNS completion) happen under this guard.
pub(crate) fn lock() -> RegistryGuard {
    table().lock()
}

pub(crate) fn register(id: u64, sock: Weak<dyn ManagedSocket>) {
    let guard = lock();
    guard.borrow_mut().push(Entry { id, sock });
}

pub(crate) fn unregister(id: u64) {
    let guard = lock();
    guard.borrow_mut().retain(|entry| entry.id != id);
}

/// Prunes entries whose owner has dropped and upgrades the rest, in
/// insertion order. The borrow on the table is released before returning so
/// hooks dispatched over the snapshot may register or unregister freely.
pub(crate) fn alive(guard: &RegistryGuard) -> Vec<Arc<dyn ManagedSocket>> {
    guard
        .borrow_mut()
        .retain(|entry| entry.sock.strong_count() > 0);
    guard
        .borrow()
        .iter()
        .filter_map(|entry| entry.sock.upgrade())
        .collect()
}
