//! Error codes surfaced to the `on_error` callback.
//!
//! Positive values are raw `errno` values from the sockets layer. Negative
//! values come from the table below; `-55` is the synthetic DNS-failure code
//! reported when host resolution produces no address.

use std::fmt;

/// Sentinel returned by [`crate::AsyncClient::abort`].
pub const ERR_ABRT: i32 = ErrCode::Abort as i32;

/// Synthetic code reported when DNS resolution fails.
pub const ERR_DNS_FAILED: i32 = ErrCode::DnsFailed as i32;

/// The documented error-code table.
///
/// Codes are carried as `i32` so that positive `errno` values fit alongside
/// them in the same callback argument.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrCode {
    /// No error.
    Ok = 0,
    /// Out of memory.
    Mem = -1,
    /// Buffer error.
    Buf = -2,
    /// Timeout.
    Timeout = -3,
    /// Routing problem.
    Rte = -4,
    /// Operation in progress.
    InProgress = -5,
    /// Illegal value.
    Val = -6,
    /// Operation would block.
    WouldBlock = -7,
    /// Address in use.
    Use = -8,
    /// Already connecting.
    Already = -9,
    /// Connection already established.
    IsConn = -10,
    /// Not connected.
    Conn = -11,
    /// Low-level netif error.
    Interface = -12,
    /// Connection aborted.
    Abort = -13,
    /// Connection reset.
    Reset = -14,
    /// Connection closed.
    Closed = -15,
    /// Illegal argument.
    Arg = -16,
    /// DNS resolution failed.
    DnsFailed = -55,
}

impl ErrCode {
    /// Parse a raw code. Returns `None` for values outside the table
    /// (including positive `errno` values).
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ErrCode::Ok,
            -1 => ErrCode::Mem,
            -2 => ErrCode::Buf,
            -3 => ErrCode::Timeout,
            -4 => ErrCode::Rte,
            -5 => ErrCode::InProgress,
            -6 => ErrCode::Val,
            -7 => ErrCode::WouldBlock,
            -8 => ErrCode::Use,
            -9 => ErrCode::Already,
            -10 => ErrCode::IsConn,
            -11 => ErrCode::Conn,
            -12 => ErrCode::Interface,
            -13 => ErrCode::Abort,
            -14 => ErrCode::Reset,
            -15 => ErrCode::Closed,
            -16 => ErrCode::Arg,
            -55 => ErrCode::DnsFailed,
            _ => return None,
        })
    }

    /// Human-readable rendering of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrCode::Ok => "OK",
            ErrCode::Mem => "Out of memory error",
            ErrCode::Buf => "Buffer error",
            ErrCode::Timeout => "Timeout",
            ErrCode::Rte => "Routing problem",
            ErrCode::InProgress => "Operation in progress",
            ErrCode::Val => "Illegal value",
            ErrCode::WouldBlock => "Operation would block",
            ErrCode::Use => "Address in use",
            ErrCode::Already => "Already connected",
            ErrCode::IsConn => "Is connected",
            ErrCode::Conn => "Not connected",
            ErrCode::Interface => "Low-level netif error",
            ErrCode::Abort => "Connection aborted",
            ErrCode::Reset => "Connection reset",
            ErrCode::Closed => "Connection closed",
            ErrCode::Arg => "Illegal argument",
            ErrCode::DnsFailed => "DNS failed",
        }
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrCode {}

impl From<ErrCode> for i32 {
    fn from(code: ErrCode) -> i32 {
        code as i32
    }
}

/// Maps any code surfaced to `on_error` to a human string.
///
/// Codes outside the table (including positive `errno` values) map to
/// `"UNKNOWN"`.
pub fn error_to_string(code: i32) -> &'static str {
    match ErrCode::from_code(code) {
        Some(code) => code.as_str(),
        None => "UNKNOWN",
    }
}
