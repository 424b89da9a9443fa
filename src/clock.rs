//! Monotonic millisecond clock and the task-watchdog shim.
//!
//! Every timestamp in the crate (`queued_at`, `written_at`, last-activity,
//! timeout arithmetic) comes from [`millis`], a monotonic counter anchored at
//! first use. The watchdog shim brackets each hook and user callback
//! dispatched by the service loop; it is compiled in only with the
//! `task-wdt` feature and is inert until the application installs hooks.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds elapsed since the clock was first read.
pub(crate) fn millis() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[cfg(feature = "task-wdt")]
static WDT_HOOKS: OnceLock<(fn(), fn())> = OnceLock::new();

/// Installs the watchdog enter/leave hooks fed around every dispatched
/// callback. May be called once; later calls are ignored with a warning.
#[cfg(feature = "task-wdt")]
pub fn set_task_watchdog(enter: fn(), leave: fn()) {
    if WDT_HOOKS.set((enter, leave)).is_err() {
        log::warn!("task watchdog hooks already installed");
    }
}

pub(crate) struct WdtGuard {
    #[cfg(feature = "task-wdt")]
    leave: Option<fn()>,
}

/// Feeds the watchdog and returns a guard that un-feeds it on drop.
pub(crate) fn wdt_guard() -> WdtGuard {
    #[cfg(feature = "task-wdt")]
    {
        return match WDT_HOOKS.get() {
            Some(&(enter, leave)) => {
                enter();
                WdtGuard { leave: Some(leave) }
            }
            None => WdtGuard { leave: None },
        };
    }
    #[cfg(not(feature = "task-wdt"))]
    WdtGuard {}
}

impl Drop for WdtGuard {
    fn drop(&mut self) {
        #[cfg(feature = "task-wdt")]
        if let Some(leave) = self.leave {
            leave();
        }
    }
}
