//! The per-connection state machine.
//!
//! An [`AsyncClient`] wraps one nonblocking TCP descriptor. The service
//! loop drives it through the four dispatch hooks; the application mutates
//! it from its own threads through the enqueue and teardown APIs. The two
//! sides meet under two locks: the registry mutex guards descriptor and
//! connection state, the per-client write mutex guards the outbound queue.
//! Neither lock is ever held while a user callback runs on this client.

use std::cell::RefCell;
use std::fmt;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::clock;
use crate::dispatch::base::{ManagedSocket, SocketBase};
use crate::dispatch::registry;
use crate::dispatch::select;
use crate::dispatch::service;
use crate::dns;
use crate::error::{ERR_ABRT, ERR_DNS_FAILED};
use crate::net::queue::{OutboundData, WriteQueue};
use crate::sock;

/// Largest chunk delivered to a single `on_data` callback.
pub const MAX_PAYLOAD: usize = 1360;

/// Engine-owned copy of the caller's bytes (the default for `add`).
pub const WRITE_FLAG_COPY: u8 = 0x01;
/// Hint that more data follows, suppressing an immediate push to the wire
/// where the platform can honour it.
pub const WRITE_FLAG_MORE: u8 = 0x02;

const DEFAULT_ACK_TIMEOUT_MS: u32 = 5000;

// Readable hooks run sequentially on the service worker, so one receive
// buffer per dispatcher thread is enough. Callbacks must consume or copy
// the slice before returning.
thread_local! {
    static READ_BUF: RefCell<[u8; MAX_PAYLOAD]> = const { RefCell::new([0u8; MAX_PAYLOAD]) };
}

/// Connection states. The engine transitions only through `Closed`,
/// `SynSent` and `Established` (`SynReceived` is accepted while probing
/// connect completion); the remaining values exist for state reporting.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynReceived = 3,
    Established = 4,
    FinWait1 = 5,
    FinWait2 = 6,
    CloseWait = 7,
    Closing = 8,
    LastAck = 9,
    TimeWait = 10,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnState::Listen,
            2 => ConnState::SynSent,
            3 => ConnState::SynReceived,
            4 => ConnState::Established,
            5 => ConnState::FinWait1,
            6 => ConnState::FinWait2,
            7 => ConnState::CloseWait,
            8 => ConnState::Closing,
            9 => ConnState::LastAck,
            10 => ConnState::TimeWait,
            _ => ConnState::Closed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Closed => "Closed",
            ConnState::Listen => "Listen",
            ConnState::SynSent => "SYN Sent",
            ConnState::SynReceived => "SYN Received",
            ConnState::Established => "Established",
            ConnState::FinWait1 => "FIN Wait 1",
            ConnState::FinWait2 => "FIN Wait 2",
            ConnState::CloseWait => "Close Wait",
            ConnState::Closing => "Closing",
            ConnState::LastAck => "Last ACK",
            ConnState::TimeWait => "Time Wait",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

type ConnectHandler = Arc<dyn Fn(&AsyncClient) + Send + Sync>;
type AckHandler = Arc<dyn Fn(&AsyncClient, usize, u64) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&AsyncClient, i32) + Send + Sync>;
type DataHandler = Arc<dyn Fn(&AsyncClient, &[u8]) + Send + Sync>;
type TimeoutHandler = Arc<dyn Fn(&AsyncClient, u64) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    connect: Option<ConnectHandler>,
    disconnect: Option<ConnectHandler>,
    ack: Option<AckHandler>,
    error: Option<ErrorHandler>,
    data: Option<DataHandler>,
    timeout: Option<TimeoutHandler>,
    poll: Option<ConnectHandler>,
}

/// A callback-driven TCP connection.
///
/// Created detached with [`AsyncClient::new`] and pointed somewhere with
/// [`connect`](AsyncClient::connect), or manufactured by an
/// [`AsyncServer`](crate::AsyncServer) around an accepted descriptor. The
/// application owns the `Arc`; the service loop observes it through the
/// registry until it is dropped.
pub struct AsyncClient {
    base: SocketBase,
    state: AtomicU8,
    rx_last_packet: AtomicU64,
    rx_timeout_secs: AtomicU32,
    ack_timeout_ms: AtomicU32,
    connect_port: AtomicU16,
    connect_addr: Mutex<Option<Ipv4Addr>>,
    queue: Mutex<WriteQueue>,
    callbacks: Mutex<Callbacks>,
}

impl AsyncClient {
    /// A fresh, closed client.
    pub fn new() -> Arc<Self> {
        Self::build(-1)
    }

    /// Wraps an already-connected descriptor (e.g. one returned by
    /// `accept`). The descriptor is switched to nonblocking and the client
    /// starts out `Established`.
    pub fn from_fd(fd: i32) -> Arc<Self> {
        Self::build(fd)
    }

    fn build(fd: i32) -> Arc<Self> {
        let client = Arc::new(Self {
            base: SocketBase::new(),
            state: AtomicU8::new(ConnState::Closed as u8),
            rx_last_packet: AtomicU64::new(0),
            rx_timeout_secs: AtomicU32::new(0),
            ack_timeout_ms: AtomicU32::new(DEFAULT_ACK_TIMEOUT_MS),
            connect_port: AtomicU16::new(0),
            connect_addr: Mutex::new(None),
            queue: Mutex::new(WriteQueue::new()),
            callbacks: Mutex::new(Callbacks::default()),
        });

        if fd != -1 {
            sock::set_nonblocking(fd);
            let _lock = registry::lock();
            client.set_state(ConnState::Established);
            client.base.set_fd(fd);
            client.rx_last_packet.store(clock::millis(), Ordering::Relaxed);
        }

        let weak: Weak<dyn ManagedSocket> = Arc::downgrade(&(client.clone() as Arc<dyn ManagedSocket>));
        registry::register(client.base.id(), weak);
        client
    }

    /// Begins a nonblocking connect to an IPv4 address. Success is reported
    /// later through `on_connect`, failure through `on_error` followed by
    /// `on_disconnect`.
    pub fn connect_ip(&self, ip: Ipv4Addr, port: u16) -> bool {
        if self.fd() != -1 {
            log::warn!("already connected, state {}", self.state() as u8);
            return false;
        }
        if !service::ensure_service_thread() {
            return false;
        }

        let fd = match sock::tcp_socket() {
            Ok(fd) => fd,
            Err(err) => {
                log::error!("socket: {err}");
                return false;
            }
        };
        if let Err(err) = sock::start_connect(fd, ip, port) {
            log::error!("connect on fd {fd}: {err}");
            sock::close(fd);
            return false;
        }

        let _lock = registry::lock();
        self.set_state(ConnState::SynSent);
        self.base.set_fd(fd);
        true
    }

    /// Resolves `host` and connects. An IPv4 literal connects immediately;
    /// anything else goes through the resolver thread, and the connect is
    /// issued from the service loop once resolution completes. Resolution
    /// failure surfaces as `on_error(ERR_DNS_FAILED)` then `on_disconnect`.
    pub fn connect(self: &Arc<Self>, host: &str, port: u16) -> bool {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return self.connect_ip(ip, port);
        }
        if !service::ensure_service_thread() {
            return false;
        }

        self.connect_port.store(port, Ordering::Relaxed);
        let target = Arc::downgrade(self);
        dns::spawn_lookup(host, port, move |addr| {
            if let Some(client) = target.upgrade() {
                client.dns_finished(addr);
            }
        })
    }

    // Runs on the resolver thread: park the result and flag the socket so
    // the service loop issues the actual connect on its next tick.
    fn dns_finished(&self, addr: Option<Ipv4Addr>) {
        *self.connect_addr.lock() = addr;
        let _lock = registry::lock();
        self.base.mark_dns_ready();
    }

    /// Closes the connection. Idempotent; fires `on_disconnect` if the
    /// connection was open.
    pub fn close(&self) {
        if self.fd() != -1 {
            self.teardown_close();
        }
    }

    /// Linger-zero close: the peer sees a reset instead of an orderly
    /// shutdown. Returns [`ERR_ABRT`].
    pub fn abort(&self) -> i32 {
        let fd = self.fd();
        if fd != -1 {
            if let Err(err) = sock::set_linger_abort(fd) {
                log::error!("SO_LINGER on fd {fd}: {err}");
            }
            self.teardown_close();
        }
        ERR_ABRT
    }

    pub fn connected(&self) -> bool {
        self.fd() != -1 && self.state() == ConnState::Established
    }

    /// Whether the connection is gone (or going) and the object may be
    /// dropped by its owner.
    pub fn freeable(&self) -> bool {
        if self.fd() == -1 {
            return true;
        }
        let state = self.state();
        state == ConnState::Closed || (state as u8) > (ConnState::Established as u8)
    }

    pub fn free(&self) -> bool {
        self.freeable()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn fd(&self) -> i32 {
        self.base.fd()
    }

    /// Bytes the next [`add`](AsyncClient::add) will accept.
    pub fn space(&self) -> usize {
        if !self.connected() {
            return 0;
        }
        self.queue.lock().space_remaining
    }

    pub fn can_send(&self) -> bool {
        self.space() > 0
    }

    /// Enqueues a copy of up to `space()` bytes of `data` for transmission.
    /// Returns the number of bytes accepted; 0 when not connected or the
    /// window is full. The COPY flag is implied (the engine always owns the
    /// copy); MORE is honoured as a push-suppression hint.
    pub fn add(&self, data: &[u8], flags: u8) -> usize {
        if !self.connected() || data.is_empty() {
            return 0;
        }
        let mut queue = self.queue.lock();
        let room = queue.space_remaining;
        if room == 0 {
            return 0;
        }
        let will_send = room.min(data.len());
        queue.push(
            OutboundData::Owned(Box::from(&data[..will_send])),
            flags & WRITE_FLAG_MORE != 0,
        )
    }

    /// Zero-copy variant of [`add`](AsyncClient::add): the engine keeps a
    /// clone of the `Arc` and releases it once the buffer drains; the
    /// caller's allocation is never freed by the engine. Accepts at most
    /// `space()` bytes of the slice.
    pub fn add_shared(&self, data: &Arc<[u8]>, flags: u8) -> usize {
        if !self.connected() || data.is_empty() {
            return 0;
        }
        let mut queue = self.queue.lock();
        let room = queue.space_remaining;
        if room == 0 {
            return 0;
        }
        let len = room.min(data.len());
        queue.push(
            OutboundData::Shared {
                data: Arc::clone(data),
                len,
            },
            flags & WRITE_FLAG_MORE != 0,
        )
    }

    /// Opportunistic flush: if the socket is writable right now, drains the
    /// head buffer without waiting for the next service tick. Always
    /// returns true; transmission itself is confirmed through `on_ack`.
    pub fn send(&self) -> bool {
        let fd = self.fd();
        if fd == -1 {
            return true;
        }
        let mut queue = self.queue.lock();
        if select::writable(fd) {
            queue.flush_head(fd);
        }
        true
    }

    /// [`add`](AsyncClient::add) + [`send`](AsyncClient::send).
    pub fn write(&self, data: &[u8]) -> usize {
        self.write_flags(data, WRITE_FLAG_COPY)
    }

    pub fn write_flags(&self, data: &[u8], flags: u8) -> usize {
        let accepted = self.add(data, flags);
        if accepted == 0 || !self.send() {
            return 0;
        }
        accepted
    }

    /// Maximum time the head buffer may sit unacknowledged before
    /// `on_timeout` fires, in milliseconds. Zero disables.
    pub fn set_ack_timeout(&self, timeout_ms: u32) {
        self.ack_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn ack_timeout(&self) -> u32 {
        self.ack_timeout_ms.load(Ordering::Relaxed)
    }

    /// Maximum idle time since the last received byte before the connection
    /// is closed, in seconds. Zero disables.
    pub fn set_rx_timeout(&self, timeout_secs: u32) {
        self.rx_timeout_secs.store(timeout_secs, Ordering::Relaxed);
    }

    pub fn rx_timeout(&self) -> u32 {
        self.rx_timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_no_delay(&self, nodelay: bool) {
        let fd = self.fd();
        if fd == -1 {
            return;
        }
        if let Err(err) = sock::set_nodelay(fd, nodelay) {
            log::error!("TCP_NODELAY on fd {fd}: {err}");
        }
    }

    pub fn no_delay(&self) -> bool {
        let fd = self.fd();
        if fd == -1 {
            return false;
        }
        match sock::nodelay(fd) {
            Ok(nodelay) => nodelay,
            Err(err) => {
                log::error!("TCP_NODELAY on fd {fd}: {err}");
                false
            }
        }
    }

    pub fn remote_ip(&self) -> Ipv4Addr {
        self.peer().map(|(ip, _)| ip).unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn remote_port(&self) -> u16 {
        self.peer().map(|(_, port)| port).unwrap_or(0)
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local().map(|(ip, _)| ip).unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn local_port(&self) -> u16 {
        self.local().map(|(_, port)| port).unwrap_or(0)
    }

    fn peer(&self) -> Option<(Ipv4Addr, u16)> {
        let fd = self.fd();
        if fd == -1 {
            return None;
        }
        sock::peer_name(fd).ok()
    }

    fn local(&self) -> Option<(Ipv4Addr, u16)> {
        let fd = self.fd();
        if fd == -1 {
            return None;
        }
        sock::local_name(fd).ok()
    }

    /// Fired once when an outbound connect completes.
    pub fn on_connect(&self, cb: impl Fn(&AsyncClient) + Send + Sync + 'static) {
        self.callbacks.lock().connect = Some(Arc::new(cb));
    }

    /// Fired when the connection goes away, whatever the reason.
    pub fn on_disconnect(&self, cb: impl Fn(&AsyncClient) + Send + Sync + 'static) {
        self.callbacks.lock().disconnect = Some(Arc::new(cb));
    }

    /// Fired once per enqueued buffer when it has fully drained, with the
    /// buffer length and the queue-to-drain delay in milliseconds.
    pub fn on_ack(&self, cb: impl Fn(&AsyncClient, usize, u64) + Send + Sync + 'static) {
        self.callbacks.lock().ack = Some(Arc::new(cb));
    }

    /// Fired on failed connects and mid-stream errors, before
    /// `on_disconnect`. Positive codes are errnos; negative codes come from
    /// [`crate::ErrCode`].
    pub fn on_error(&self, cb: impl Fn(&AsyncClient, i32) + Send + Sync + 'static) {
        self.callbacks.lock().error = Some(Arc::new(cb));
    }

    /// Fired with each received chunk. The slice is only valid for the
    /// duration of the call; consume or copy it before returning.
    pub fn on_data(&self, cb: impl Fn(&AsyncClient, &[u8]) + Send + Sync + 'static) {
        self.callbacks.lock().data = Some(Arc::new(cb));
    }

    /// Fired when the head buffer has been waiting longer than the ack
    /// timeout, with the wait in milliseconds.
    pub fn on_timeout(&self, cb: impl Fn(&AsyncClient, u64) + Send + Sync + 'static) {
        self.callbacks.lock().timeout = Some(Arc::new(cb));
    }

    /// Fired every 125 ms while nothing else is going on.
    pub fn on_poll(&self, cb: impl Fn(&AsyncClient) + Send + Sync + 'static) {
        self.callbacks.lock().poll = Some(Arc::new(cb));
    }

    fn clear_callbacks(&self) {
        *self.callbacks.lock() = Callbacks::default();
    }

    fn fire_connect(&self) {
        let cb = self.callbacks.lock().connect.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    fn fire_disconnect(&self) {
        let cb = self.callbacks.lock().disconnect.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    fn fire_ack(&self, len: usize, delay: u64) {
        let cb = self.callbacks.lock().ack.clone();
        if let Some(cb) = cb {
            cb(self, len, delay);
        }
    }

    fn fire_error(&self, err: i32) {
        let cb = self.callbacks.lock().error.clone();
        if let Some(cb) = cb {
            cb(self, err);
        }
    }

    fn fire_timeout(&self, delay: u64) {
        let cb = self.callbacks.lock().timeout.clone();
        if let Some(cb) = cb {
            cb(self, delay);
        }
    }

    fn fire_poll(&self) {
        let cb = self.callbacks.lock().poll.clone();
        if let Some(cb) = cb {
            cb(self);
        }
    }

    /// Orderly teardown: close the descriptor, drop the queue, tell the
    /// application once, forget the callbacks.
    fn teardown_close(&self) {
        {
            let _lock = registry::lock();
            if self.fd() == -1 {
                return;
            }
            self.set_state(ConnState::Closed);
            sock::close(self.fd());
            self.base.set_fd(-1);
        }

        self.queue.lock().clear();
        self.fire_disconnect();
        self.clear_callbacks();
    }

    /// Error teardown: as close, but `on_error` fires first.
    fn teardown_error(&self, err: i32) {
        {
            let _lock = registry::lock();
            if self.fd() == -1 {
                return;
            }
            self.set_state(ConnState::Closed);
            sock::close(self.fd());
            self.base.set_fd(-1);
        }

        self.queue.lock().clear();
        self.fire_error(err);
        self.fire_disconnect();
        self.clear_callbacks();
    }
}

impl ManagedSocket for AsyncClient {
    fn base(&self) -> &SocketBase {
        &self.base
    }

    fn handle_writable(&self) -> bool {
        let mut activity = false;

        match self.state() {
            ConnState::SynSent | ConnState::SynReceived => {
                // Connect finished; SO_ERROR says how.
                match sock::so_error(self.fd()) {
                    Err(err) => {
                        self.teardown_error(err.raw_os_error().unwrap_or(0));
                    }
                    Ok(sockerr) if sockerr != 0 => {
                        self.teardown_error(sockerr);
                    }
                    Ok(_) => {
                        self.set_state(ConnState::Established);
                        activity = true;
                        self.rx_last_packet.store(clock::millis(), Ordering::Relaxed);
                        self.queue.lock().ack_timeout_signaled = false;
                        self.fire_connect();
                    }
                }
            }
            _ => {
                // The socket can take more data.
                let mut retired: Option<(usize, u64)> = None;
                let mut failed = 0;
                {
                    let mut queue = self.queue.lock();
                    if !queue.bufs.is_empty() {
                        activity = queue.flush_head(self.fd());
                        if let Some(head) = queue.bufs.front() {
                            if head.write_errno != 0 {
                                failed = head.write_errno;
                            } else if head.written >= head.data.len() {
                                // Draining counts as link activity for the
                                // rx timeout as well.
                                if head.written_at > self.rx_last_packet.load(Ordering::Relaxed) {
                                    self.rx_last_packet.store(head.written_at, Ordering::Relaxed);
                                }
                                retired = Some((head.data.len(), head.written_at - head.queued_at));
                            }
                        }
                        if retired.is_some() {
                            queue.retire_head();
                        }
                    }
                }

                if failed != 0 {
                    self.teardown_error(failed);
                } else if let Some((len, delay)) = retired {
                    self.fire_ack(len, delay);
                }
            }
        }

        activity
    }

    fn handle_readable(&self) {
        self.rx_last_packet.store(clock::millis(), Ordering::Relaxed);

        READ_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            let received = sock::read(self.fd(), &mut buf[..]);
            if received > 0 {
                let cb = self.callbacks.lock().data.clone();
                if let Some(cb) = cb {
                    cb(self, &buf[..received as usize]);
                }
            } else if received == 0 {
                // Orderly shutdown by the peer.
                self.teardown_close();
            } else {
                let err = sock::errno();
                if err != libc::EAGAIN && err != libc::EWOULDBLOCK {
                    self.teardown_error(err);
                }
            }
        });
    }

    fn handle_poll(&self) {
        if self.fd() == -1 {
            return;
        }
        let now = clock::millis();

        let mut queue = self.queue.lock();
        let stalled = match queue.bufs.front() {
            Some(head) => {
                let timeout = self.ack_timeout_ms.load(Ordering::Relaxed) as u64;
                let waited = now.saturating_sub(head.queued_at);
                (!queue.ack_timeout_signaled && timeout > 0 && waited >= timeout).then_some(waited)
            }
            None => None,
        };
        if let Some(waited) = stalled {
            queue.ack_timeout_signaled = true;
            drop(queue);
            self.fire_timeout(waited);
            return;
        }
        drop(queue);

        let rx_timeout = self.rx_timeout_secs.load(Ordering::Relaxed) as u64;
        if rx_timeout > 0
            && now.saturating_sub(self.rx_last_packet.load(Ordering::Relaxed)) >= rx_timeout * 1000
        {
            self.teardown_close();
            return;
        }

        self.fire_poll();
    }

    fn handle_delayed_connect(&self) {
        let addr = self.connect_addr.lock().take();
        match addr {
            Some(ip) => {
                self.connect_ip(ip, self.connect_port.load(Ordering::Relaxed));
            }
            None => {
                self.fire_error(ERR_DNS_FAILED);
                self.fire_disconnect();
            }
        }
    }
}

impl AsRawFd for AsyncClient {
    fn as_raw_fd(&self) -> RawFd {
        self.fd()
    }
}

impl Drop for AsyncClient {
    fn drop(&mut self) {
        if self.fd() != -1 {
            self.teardown_close();
        }
        registry::unregister(self.base.id());
    }
}
