//! The listening socket.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dispatch::base::{ManagedSocket, SocketBase};
use crate::dispatch::registry;
use crate::dispatch::service;
use crate::net::client::AsyncClient;
use crate::sock;

const BACKLOG: i32 = 5;

type ClientHandler = Arc<dyn Fn(Arc<AsyncClient>) + Send + Sync>;

/// A callback-driven TCP listener.
///
/// Each accepted connection is wrapped in a fresh
/// [`AsyncClient`] (already `Established`) and handed to the callback
/// registered with [`on_client`](AsyncServer::on_client). The callback owns
/// the client from that point on; dropping it closes the connection.
pub struct AsyncServer {
    base: SocketBase,
    addr: Ipv4Addr,
    port: u16,
    no_delay: AtomicBool,
    on_client: Mutex<Option<ClientHandler>>,
}

impl AsyncServer {
    pub fn new(addr: Ipv4Addr, port: u16) -> Arc<Self> {
        let server = Arc::new(Self {
            base: SocketBase::new(),
            addr,
            port,
            no_delay: AtomicBool::new(false),
            on_client: Mutex::new(None),
        });
        let weak: Weak<dyn ManagedSocket> = Arc::downgrade(&(server.clone() as Arc<dyn ManagedSocket>));
        registry::register(server.base.id(), weak);
        server
    }

    /// Listens on all interfaces.
    pub fn any(port: u16) -> Arc<Self> {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// Registers the callback receiving each accepted connection. Without
    /// one, incoming connections are left in the backlog.
    pub fn on_client(&self, cb: impl Fn(Arc<AsyncClient>) + Send + Sync + 'static) {
        *self.on_client.lock() = Some(Arc::new(cb));
    }

    /// Binds and starts listening. Failures are logged and leave the server
    /// inert; a later `begin` may retry.
    pub fn begin(&self) {
        if self.base.fd() != -1 {
            return;
        }
        if !service::ensure_service_thread() {
            return;
        }

        let fd = match sock::tcp_socket() {
            Ok(fd) => fd,
            Err(err) => {
                log::error!("socket: {err}");
                return;
            }
        };
        if let Err(err) = sock::bind(fd, self.addr, self.port) {
            sock::close(fd);
            log::error!("bind error: {err}");
            return;
        }
        if let Err(err) = sock::listen(fd, BACKLOG) {
            sock::close(fd);
            log::error!("listen error: {err}");
            return;
        }

        let _lock = registry::lock();
        self.base.set_fd(fd);
    }

    /// Stops listening. Connections already accepted are unaffected.
    pub fn end(&self) {
        let _lock = registry::lock();
        let fd = self.base.fd();
        if fd != -1 {
            sock::close(fd);
            self.base.set_fd(-1);
        }
    }

    /// 1 while listening, 0 otherwise.
    pub fn status(&self) -> u8 {
        if self.base.fd() != -1 { 1 } else { 0 }
    }

    /// Applied to every subsequently accepted connection.
    pub fn set_no_delay(&self, nodelay: bool) {
        self.no_delay.store(nodelay, Ordering::Relaxed);
    }

    pub fn no_delay(&self) -> bool {
        self.no_delay.load(Ordering::Relaxed)
    }

    /// The port actually bound, useful after binding port 0.
    pub fn local_port(&self) -> u16 {
        let fd = self.base.fd();
        if fd == -1 {
            return 0;
        }
        sock::local_name(fd).map(|(_, port)| port).unwrap_or(0)
    }
}

impl ManagedSocket for AsyncServer {
    fn base(&self) -> &SocketBase {
        &self.base
    }

    fn handle_readable(&self) {
        let Some(cb) = self.on_client.lock().clone() else {
            return;
        };

        match sock::accept(self.base.fd()) {
            Ok(client_fd) => {
                let client = AsyncClient::from_fd(client_fd);
                client.set_no_delay(self.no_delay.load(Ordering::Relaxed));
                cb(client);
            }
            Err(err) => {
                log::error!("accept error: {err}");
            }
        }
    }
}

impl Drop for AsyncServer {
    fn drop(&mut self) {
        self.end();
        registry::unregister(self.base.id());
    }
}
