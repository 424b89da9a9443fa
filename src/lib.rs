//! Callback-driven asynchronous TCP on top of nonblocking BSD sockets.
//!
//! Applications open outbound connections, accept inbound ones, enqueue
//! byte buffers for transmission and receive inbound bytes through
//! per-socket callbacks, without ever blocking on I/O. A single background
//! worker multiplexes every managed socket with `select` and dispatches
//! readiness to the owning objects.
//!
//! # Architecture
//!
//! - **Service loop**: background worker polling every registered socket
//!   for readability, writability, deferred DNS completion and the 125 ms
//!   idle poll
//! - **Registry**: process-wide list of live sockets behind a recursive
//!   mutex, observed (not owned) through weak handles
//! - **AsyncClient**: per-connection state machine with an ordered write
//!   queue, partial-write accounting and ack/rx timeout detection
//! - **AsyncServer**: listening socket that wraps each accepted descriptor
//!   in a fresh client
//! - **DNS bridge**: resolver thread whose completion is drained by the
//!   service loop, never acted on directly
//!
//! # Example
//!
//! ```ignore
//! use asyncsock::AsyncClient;
//!
//! let client = AsyncClient::new();
//! client.on_connect(|c| {
//!     c.write(b"hello");
//! });
//! client.on_data(|_c, data| {
//!     println!("got {} bytes", data.len());
//! });
//! client.connect("example.com", 7000);
//! ```

mod clock;
mod dispatch;
mod dns;
mod error;
mod net;
mod sock;

pub use error::{ERR_ABRT, ERR_DNS_FAILED, ErrCode, error_to_string};
pub use net::client::{
    AsyncClient, ConnState, MAX_PAYLOAD, WRITE_FLAG_COPY, WRITE_FLAG_MORE,
};
pub use net::server::AsyncServer;

#[cfg(feature = "task-wdt")]
pub use clock::set_task_watchdog;
