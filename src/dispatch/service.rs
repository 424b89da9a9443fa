//! The service loop: a single background worker multiplexing every
//! registered socket.
//!
//! Each tick snapshots the registry, probes readiness with a zero-timeout
//! `select`, and dispatches hooks in a fixed order: writable first, then
//! readable, then deferred DNS completions, then (after the pacing sleep)
//! the 125 ms idle poll. Hooks for one tick never re-enter; sockets
//! registered by a hook are picked up on the next tick.
//!
//! The loop paces itself with an explicit sleep rather than a select
//! timeout: no activity means a long sleep that doubles as the idle-poll
//! period, activity means a minimal yield.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use crate::clock;
use crate::dispatch::registry;
use crate::dispatch::select::{self, FdSet};

/// Idle-poll period; also the upper bound on the pacing sleep.
pub(crate) const POLL_PERIOD_MS: u64 = 125;

/// Build-time core pinning, e.g. `ASYNCSOCK_RUNNING_CORE=1 cargo build`.
const RUNNING_CORE: Option<&str> = option_env!("ASYNCSOCK_RUNNING_CORE");

/// Starts the service worker once. Safe to call repeatedly; returns whether
/// a worker is running.
pub(crate) fn ensure_service_thread() -> bool {
    static STARTED: OnceLock<bool> = OnceLock::new();

    *STARTED.get_or_init(|| {
        let spawned = thread::Builder::new()
            .name("asyncsock-svc".into())
            .spawn(service_loop)
            .is_ok();
        if !spawned {
            log::error!("failed to start service worker thread");
        }
        spawned
    })
}

fn service_loop() {
    if let Some(core) = RUNNING_CORE.and_then(|raw| raw.parse::<usize>().ok()) {
        pin_to_core(core);
    }

    loop {
        tick();
    }
}

fn tick() {
    let mut read_set = FdSet::new();
    let mut write_set = FdSet::new();
    let mut nfds = 0;

    let guard = registry::lock();
    let snapshot = registry::alive(&guard);

    // Collect every open descriptor into both probe sets.
    for sock in &snapshot {
        let base = sock.base();
        let fd = base.fd();
        if fd == -1 {
            continue;
        }
        if !read_set.insert(fd) || !write_set.insert(fd) {
            log::warn!("fd {fd} exceeds FD_SETSIZE, socket not serviced");
            continue;
        }
        base.set_selected(true);
        if nfds <= fd {
            nfds = fd + 1;
        }
    }

    let t1 = clock::millis();
    let ready = select::probe(nfds, &mut read_set, &mut write_set);

    let mut n_active: u32 = 0;
    if ready > 0 {
        // Writable hooks first, in registration order.
        for sock in &snapshot {
            let base = sock.base();
            let fd = base.fd();
            if base.selected() && write_set.contains(fd) {
                let _wdt = clock::wdt_guard();
                if sock.handle_writable() {
                    base.touch(clock::millis());
                    n_active += 1;
                }
            }
        }

        // Then readable hooks.
        for sock in &snapshot {
            let base = sock.base();
            let fd = base.fd();
            if base.selected() && read_set.contains(fd) {
                let _wdt = clock::wdt_guard();
                base.touch(clock::millis());
                sock.handle_readable();
                n_active += 1;
            }
        }
    }

    // Drain DNS completions flagged by the resolver thread.
    for sock in &snapshot {
        if sock.base().take_dns_ready() {
            let _wdt = clock::wdt_guard();
            sock.handle_delayed_connect();
        }
    }

    drop(guard);

    // The probe itself never waits, so the loop provides its own pacing:
    // a quiet tick sleeps out the remainder of the poll period, an active
    // tick yields just long enough to let callers in.
    let t2 = clock::millis();
    let pause = if n_active == 0 && t2 - t1 < POLL_PERIOD_MS {
        POLL_PERIOD_MS - (t2 - t1)
    } else {
        1
    };
    thread::sleep(Duration::from_millis(pause));

    let guard = registry::lock();
    let now = clock::millis();
    let mut poll_list = Vec::new();
    for sock in registry::alive(&guard) {
        let base = sock.base();
        base.set_selected(false);
        if now - base.last_activity() >= POLL_PERIOD_MS {
            base.touch(now);
            poll_list.push(sock);
        }
    }
    for sock in &poll_list {
        let _wdt = clock::wdt_guard();
        sock.handle_poll();
    }
    drop(guard);
}

#[cfg(target_os = "linux")]
fn pin_to_core(core: usize) {
    let mut cpus: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_SET(core, &mut cpus);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpus);
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_core(_core: usize) {}
