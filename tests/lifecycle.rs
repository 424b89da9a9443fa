use asyncsock::{
    AsyncClient, AsyncServer, ConnState, ERR_ABRT, ErrCode, error_to_string,
};
use std::net::{Ipv4Addr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn close_is_idempotent_and_fires_disconnect_once() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let keeper = thread::spawn(move || listener.accept().expect("accept"));

    let (tx, rx) = mpsc::channel();
    let client = AsyncClient::new();
    {
        let tx = tx.clone();
        client.on_connect(move |_| {
            let _ = tx.send("connected");
        });
    }
    client.on_disconnect(move |_| {
        let _ = tx.send("disconnected");
    });

    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).expect("connect"),
        "connected"
    );

    client.close();
    assert_eq!(
        rx.recv_timeout(Duration::from_secs(2)).expect("disconnect"),
        "disconnected"
    );

    client.close();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    assert!(!client.connected());
    assert!(client.freeable());
    assert!(client.free());
    assert_eq!(client.state(), ConnState::Closed);
    assert_eq!(client.as_raw_fd(), -1);

    drop(keeper.join().unwrap());
}

#[test]
fn abort_returns_the_sentinel() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let keeper = thread::spawn(move || listener.accept().expect("accept"));

    let (tx, rx) = mpsc::channel();
    let client = AsyncClient::new();
    client.on_connect(move |_| {
        let _ = tx.send(());
    });
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    rx.recv_timeout(Duration::from_secs(5)).expect("connect");

    assert_eq!(client.abort(), ERR_ABRT);
    assert!(client.freeable());
    // Aborting a closed connection still reports the sentinel.
    assert_eq!(client.abort(), ERR_ABRT);

    drop(keeper.join().unwrap());
}

#[test]
fn fresh_client_is_inert() {
    let client = AsyncClient::new();
    assert_eq!(client.state(), ConnState::Closed);
    assert!(!client.connected());
    assert!(client.freeable());
    assert_eq!(client.space(), 0);
    assert_eq!(client.as_raw_fd(), -1);
    assert_eq!(client.remote_ip(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(client.remote_port(), 0);
    assert_eq!(client.local_ip(), Ipv4Addr::UNSPECIFIED);
    assert_eq!(client.local_port(), 0);
    assert!(client.send());
    client.close();
}

#[test]
fn registry_survives_churn() {
    for _ in 0..50 {
        let client = AsyncClient::new();
        drop(client);
    }

    // A connection still works after the churn.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    let keeper = thread::spawn(move || listener.accept().expect("accept"));

    let (tx, rx) = mpsc::channel();
    let client = AsyncClient::new();
    client.on_connect(move |_| {
        let _ = tx.send(());
    });
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    rx.recv_timeout(Duration::from_secs(5)).expect("connect");

    drop(keeper.join().unwrap());
    client.close();
}

#[test]
fn server_lifecycle_and_nodelay_propagation() {
    let server = AsyncServer::new(Ipv4Addr::LOCALHOST, 0);
    assert_eq!(server.status(), 0);
    assert_eq!(server.local_port(), 0);

    server.set_no_delay(true);
    assert!(server.no_delay());

    let (tx, rx) = mpsc::channel();
    server.on_client(move |client| {
        let _ = tx.send(client);
    });

    server.begin();
    assert_eq!(server.status(), 1);
    let port = server.local_port();
    assert_ne!(port, 0);
    // begin() on a listening server is a no-op.
    server.begin();
    assert_eq!(server.local_port(), port);

    let (ctx, crx) = mpsc::channel();
    let client = AsyncClient::new();
    client.on_connect(move |_| {
        let _ = ctx.send(());
    });
    assert!(client.connect_ip(Ipv4Addr::LOCALHOST, port));
    crx.recv_timeout(Duration::from_secs(5)).expect("connect");

    let accepted = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("accepted client");
    assert!(accepted.connected());
    assert!(accepted.no_delay());
    assert_eq!(accepted.remote_ip(), Ipv4Addr::LOCALHOST);
    assert_eq!(accepted.remote_port(), client.local_port());

    server.end();
    assert_eq!(server.status(), 0);
    server.end();
    assert_eq!(server.status(), 0);

    client.close();
    accepted.close();
}

#[test]
fn error_code_table() {
    assert_eq!(error_to_string(0), "OK");
    assert_eq!(error_to_string(ERR_ABRT), "Connection aborted");
    assert_eq!(error_to_string(-55), "DNS failed");
    assert_eq!(error_to_string(-14), "Connection reset");
    assert_eq!(error_to_string(9999), "UNKNOWN");
    assert_eq!(error_to_string(libc::ECONNREFUSED), "UNKNOWN");

    assert_eq!(ErrCode::from_code(-13), Some(ErrCode::Abort));
    assert_eq!(ErrCode::from_code(1), None);
    assert_eq!(i32::from(ErrCode::DnsFailed), -55);
    assert_eq!(ErrCode::Timeout.to_string(), "Timeout");
}

#[test]
fn conn_state_names() {
    assert_eq!(ConnState::Closed as u8, 0);
    assert_eq!(ConnState::SynSent as u8, 2);
    assert_eq!(ConnState::SynReceived as u8, 3);
    assert_eq!(ConnState::Established as u8, 4);
    assert_eq!(ConnState::Established.name(), "Established");
    assert_eq!(ConnState::SynSent.to_string(), "SYN Sent");
    assert_eq!(ConnState::TimeWait.name(), "Time Wait");
}
