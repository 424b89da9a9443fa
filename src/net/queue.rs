//! The per-connection outbound queue.
//!
//! Buffers drain strictly in submission order. The head buffer is the only
//! one ever written; it keeps partial-write position, queue/completion
//! timestamps and a latched write error. All fields here are guarded by the
//! owning client's write mutex.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::clock;
use crate::sock;

/// Bytes a fresh connection is willing to queue, mirroring the TCP send
/// buffer of the platform this engine models.
pub(crate) const SEND_WINDOW: usize = 5840;

/// Payload bytes for an enqueued write.
///
/// `Owned` is the copy mode: the engine holds the only allocation and drops
/// it when the buffer retires or the queue clears. `Shared` is the
/// zero-copy mode: the engine keeps a reference-counted clone and the
/// caller's allocation is never freed by the engine. `len` bounds the
/// accepted prefix when the window could not take the whole slice.
pub(crate) enum OutboundData {
    Owned(Box<[u8]>),
    Shared { data: Arc<[u8]>, len: usize },
}

impl OutboundData {
    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            OutboundData::Owned(data) => data,
            OutboundData::Shared { data, len } => &data[..*len],
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            OutboundData::Owned(data) => data.len(),
            OutboundData::Shared { len, .. } => *len,
        }
    }
}

pub(crate) struct QueuedBuffer {
    pub(crate) data: OutboundData,
    pub(crate) written: usize,
    pub(crate) queued_at: u64,
    pub(crate) written_at: u64,
    pub(crate) write_errno: i32,
    pub(crate) more: bool,
}

pub(crate) struct WriteQueue {
    pub(crate) bufs: VecDeque<QueuedBuffer>,
    pub(crate) space_remaining: usize,
    pub(crate) ack_timeout_signaled: bool,
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self {
            bufs: VecDeque::new(),
            space_remaining: SEND_WINDOW,
            ack_timeout_signaled: false,
        }
    }

    /// Appends a buffer, charges the window and re-arms the ack-timeout
    /// latch. Returns the number of bytes accepted.
    pub(crate) fn push(&mut self, data: OutboundData, more: bool) -> usize {
        let len = data.len();
        self.bufs.push_back(QueuedBuffer {
            data,
            written: 0,
            queued_at: clock::millis(),
            written_at: 0,
            write_errno: 0,
            more,
        });
        self.space_remaining -= len;
        self.ack_timeout_signaled = false;
        len
    }

    /// Drains the head buffer as far as the socket will take it.
    ///
    /// Stops on completion, on EAGAIN, or on a real error (latched into the
    /// head's `write_errno`; the owner turns that into error teardown).
    /// Returns whether any bytes moved.
    pub(crate) fn flush_head(&mut self, fd: i32) -> bool {
        let mut activity = false;

        if fd == -1 {
            return false;
        }
        let Some(head) = self.bufs.front_mut() else {
            return false;
        };

        while head.write_errno == 0 && head.written < head.data.len() {
            let pending = &head.data.bytes()[head.written..];
            let sent = sock::send(fd, pending, head.more);

            if sent >= 0 {
                head.written += sent as usize;
                self.space_remaining += sent as usize;
                if sent > 0 {
                    activity = true;
                }
                if head.written >= head.data.len() {
                    head.written_at = clock::millis();
                    break;
                }
                if sent == 0 {
                    break;
                }
            } else {
                let err = sock::errno();
                if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                    break;
                }
                head.write_errno = err;
                break;
            }
        }

        activity
    }

    pub(crate) fn retire_head(&mut self) {
        self.bufs.pop_front();
    }

    /// Drops every queued buffer. A no-op in normal operation; after an
    /// error or early close this releases whatever never drained.
    pub(crate) fn clear(&mut self) {
        self.bufs.clear();
        self.space_remaining = SEND_WINDOW;
    }
}
