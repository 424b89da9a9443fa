//! Host-name resolution bridge.
//!
//! Resolution runs on its own short-lived thread; completion is delivered
//! through the provided closure, which parks the result on the client and
//! flags it for the service loop. The actual connect never happens on the
//! resolver thread.

use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::thread;

/// Kicks off a lookup and invokes `found` with the first IPv4 address, or
/// `None` when resolution fails. Returns whether the resolver thread could
/// be spawned.
pub(crate) fn spawn_lookup(
    host: &str,
    port: u16,
    found: impl FnOnce(Option<Ipv4Addr>) + Send + 'static,
) -> bool {
    let host = host.to_owned();
    let spawned = thread::Builder::new()
        .name("asyncsock-dns".into())
        .spawn(move || {
            let addr = (host.as_str(), port)
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| {
                    addrs.find_map(|addr| match addr {
                        SocketAddr::V4(v4) => Some(*v4.ip()),
                        SocketAddr::V6(_) => None,
                    })
                });
            found(addr);
        });

    match spawned {
        Ok(_) => true,
        Err(err) => {
            log::error!("failed to start resolver thread: {err}");
            false
        }
    }
}
