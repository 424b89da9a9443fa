use asyncsock::AsyncClient;
use std::mem;
use std::net::{Ipv4Addr, TcpListener};
use std::os::fd::AsRawFd;
use std::ptr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, PartialEq)]
enum Event {
    Connected,
    Disconnected,
    Error(i32),
    Timeout(u64),
}

fn wired_client(tx: Sender<Event>) -> Arc<AsyncClient> {
    let client = AsyncClient::new();
    {
        let tx = tx.clone();
        client.on_connect(move |_| {
            let _ = tx.send(Event::Connected);
        });
    }
    {
        let tx = tx.clone();
        client.on_disconnect(move |_| {
            let _ = tx.send(Event::Disconnected);
        });
    }
    {
        let tx = tx.clone();
        client.on_timeout(move |_, delay| {
            let _ = tx.send(Event::Timeout(delay));
        });
    }
    client.on_error(move |_, code| {
        let _ = tx.send(Event::Error(code));
    });
    client
}

/// Listening socket with the smallest receive buffer the kernel allows, so
/// a peer that never reads stops accepting bytes almost immediately.
fn tiny_listener() -> (i32, u16) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        let val: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = 0u16.to_be();
        addr.sin_addr.s_addr = u32::from(Ipv4Addr::LOCALHOST).to_be();
        let ret = libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        );
        assert_eq!(ret, 0);
        assert_eq!(libc::listen(fd, 5), 0);

        let mut bound: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len);
        (fd, u16::from_be(bound.sin_port))
    }
}

fn shrink_sndbuf(fd: i32) {
    unsafe {
        let val: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[test]
fn ack_timeout_fires_once_then_latch_resets() {
    let (listener_fd, port) = tiny_listener();

    let (tx, rx) = mpsc::channel();
    let client = wired_client(tx);
    client.set_ack_timeout(500);
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("connect"),
        Event::Connected
    );
    shrink_sndbuf(client.as_raw_fd());

    // Flood until both the kernel buffers and the 5840-byte window are
    // full, so the head buffer stops making progress.
    let payload = [0x55u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut stable = 0;
    while stable < 4 {
        assert!(Instant::now() < deadline, "send path never stalled");
        if client.space() == 0 {
            stable += 1;
        } else {
            stable = 0;
            client.write(&payload);
        }
        thread::sleep(Duration::from_millis(50));
    }

    match rx.recv_timeout(Duration::from_secs(5)).expect("ack timeout") {
        Event::Timeout(delay) => assert!(delay >= 500, "delay {delay} below timeout"),
        other => panic!("unexpected event: {other:?}"),
    }

    // Enqueues during the flood may have re-armed the latch; drain those
    // fires, then the latch holds and the channel stays quiet even though
    // the head buffer is still stalled.
    loop {
        match rx.recv_timeout(Duration::from_millis(1500)) {
            Ok(Event::Timeout(_)) => continue,
            Ok(other) => panic!("unexpected event: {other:?}"),
            Err(_) => break,
        }
    }

    // Let the peer take a little data, then enqueue again: the fresh add
    // resets the latch and the still-stalled head fires once more.
    let peer_fd = unsafe { libc::accept(listener_fd, ptr::null_mut(), ptr::null_mut()) };
    assert!(peer_fd >= 0);
    let mut drain = [0u8; 1000];
    let drained = unsafe { libc::read(peer_fd, drain.as_mut_ptr() as *mut _, drain.len()) };
    assert!(drained > 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        assert!(Instant::now() < deadline, "window never recovered");
        if client.space() > 0 && client.write(b"zz") > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }

    match rx.recv_timeout(Duration::from_secs(5)).expect("second timeout") {
        Event::Timeout(_) => {}
        other => panic!("unexpected event: {other:?}"),
    }

    // Timeouts never tear the connection down.
    assert!(client.connected());

    unsafe {
        libc::close(peer_fd);
        libc::close(listener_fd);
    }
    client.close();
}

#[test]
fn rx_timeout_closes_silent_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();

    // Accept and then say nothing, holding the peer open past the timeout.
    thread::spawn(move || {
        let (conn, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_secs(8));
        drop(conn);
    });

    let (tx, rx) = mpsc::channel();
    let client = wired_client(tx);
    client.set_rx_timeout(2);
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("connect"),
        Event::Connected
    );

    let start = Instant::now();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(6)).expect("teardown"),
        Event::Disconnected
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1800), "closed too early: {elapsed:?}");

    // The idle close is not an error.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(!client.connected());
    assert!(client.freeable());
}

fn expect_quiet(rx: &Receiver<Event>) {
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn ack_timeout_zero_never_fires() {
    let (listener_fd, port) = tiny_listener();

    let (tx, rx) = mpsc::channel();
    let client = wired_client(tx);
    client.set_ack_timeout(0);
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("connect"),
        Event::Connected
    );
    shrink_sndbuf(client.as_raw_fd());

    let payload = [0x77u8; 1024];
    let deadline = Instant::now() + Duration::from_secs(15);
    while client.space() > 0 {
        assert!(Instant::now() < deadline, "send path never stalled");
        client.write(&payload);
        thread::sleep(Duration::from_millis(25));
    }

    // Head is stalled, but a zero timeout disables the watchdog entirely.
    thread::sleep(Duration::from_millis(800));
    expect_quiet(&rx);
    assert!(client.connected());

    unsafe {
        libc::close(listener_fd);
    }
    client.close();
}
