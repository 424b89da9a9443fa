//! Thin wrappers over the nonblocking BSD socket syscalls.
//!
//! Everything here is IPv4-only and descriptor-oriented: the connection
//! objects own plain `i32` descriptors and all readiness handling lives in
//! the dispatch layer. Failures surface as `io::Error::last_os_error()` on
//! the setup paths; the streaming paths (`read`/`send`) return the raw
//! syscall result so callers can tell EAGAIN apart from real errors via
//! [`errno`].

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;

#[cfg(target_os = "linux")]
const SEND_BASE_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_BASE_FLAGS: libc::c_int = 0;

#[cfg(target_os = "linux")]
const SEND_MORE_FLAG: libc::c_int = libc::MSG_MORE;
#[cfg(not(target_os = "linux"))]
const SEND_MORE_FLAG: libc::c_int = 0;

/// The errno left behind by the last failing syscall on this thread.
pub(crate) fn errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn set_nonblocking(fd: i32) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };

    unsafe {
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

/// Creates a nonblocking IPv4 TCP socket.
pub(crate) fn tcp_socket() -> io::Result<i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fd);
    Ok(fd)
}

pub(crate) fn close(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

fn sockaddr_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

/// Begins a nonblocking connect. EINPROGRESS is success here; completion is
/// observed later through writability plus [`so_error`].
pub(crate) fn start_connect(fd: i32, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_v4(ip, port);
    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 && errno() != libc::EINPROGRESS {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn bind(fd: i32, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_v4(ip, port);
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: i32, backlog: i32) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accepts one pending connection and returns its descriptor, already set
/// nonblocking.
pub(crate) fn accept(fd: i32) -> io::Result<i32> {
    let client_fd = unsafe { libc::accept(fd, ptr::null_mut(), ptr::null_mut()) };
    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(client_fd);
    Ok(client_fd)
}

pub(crate) fn read(fd: i32, buf: &mut [u8]) -> isize {
    unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) }
}

/// One nonblocking send. MSG_NOSIGNAL keeps a dead peer from raising
/// SIGPIPE; `more` maps to MSG_MORE where the platform has it.
pub(crate) fn send(fd: i32, buf: &[u8], more: bool) -> isize {
    let mut flags = SEND_BASE_FLAGS;
    if more {
        flags |= SEND_MORE_FLAG;
    }
    unsafe { libc::send(fd, buf.as_ptr() as *const _, buf.len(), flags) }
}

/// Reads and clears the pending asynchronous error on the socket.
pub(crate) fn so_error(fd: i32) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(err)
}

pub(crate) fn set_nodelay(fd: i32, nodelay: bool) -> io::Result<()> {
    let val: libc::c_int = if nodelay { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn nodelay(fd: i32) -> io::Result<bool> {
    let mut val: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &mut val as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(val != 0)
}

/// Arms linger-zero so the following close sends RST instead of FIN.
pub(crate) fn set_linger_abort(fd: i32) -> io::Result<()> {
    let val = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn name_v4(addr: &libc::sockaddr_in) -> (Ipv4Addr, u16) {
    (
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    )
}

pub(crate) fn peer_name(fd: i32) -> io::Result<(Ipv4Addr, u16)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe { libc::getpeername(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(name_v4(&addr))
}

pub(crate) fn local_name(fd: i32) -> io::Result<(Ipv4Addr, u16)> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(name_v4(&addr))
}
