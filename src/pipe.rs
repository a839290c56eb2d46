//! Bounded, half-closeable byte-pipe backing each
//! TCP connection adapter's receive side. Modeled on the same
//! shared-state-plus-notify pattern the device ring uses: an
//! `Arc<parking_lot::Mutex<_>>` guards the bytes, and a `tokio::sync::Notify`
//! wakes a blocked reader or writer when state changes.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

pub const DEFAULT_PIPE_CAPACITY: usize = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeError {
    /// The reader end has been closed; writes are rejected.
    Closed,
}

struct Inner {
    buf: VecDeque<u8>,
    capacity: usize,
    writer_closed: bool,
    reader_closed: bool,
}

/// A bounded FIFO of bytes with independently closeable ends.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Pipe {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                capacity,
                writer_closed: false,
                reader_closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_PIPE_CAPACITY)
    }

    /// Non-blocking write of as much of `data` as fits before the pipe hits
    /// capacity. Returns the number of bytes accepted, or `Err(Closed)` if
    /// the reader end has gone away.
    pub fn write(&self, data: &[u8]) -> Result<usize, PipeError> {
        let mut inner = self.inner.lock();
        if inner.reader_closed {
            return Err(PipeError::Closed);
        }
        let room = inner.capacity.saturating_sub(inner.buf.len());
        let n = room.min(data.len());
        inner.buf.extend(&data[..n]);
        drop(inner);
        if n > 0 {
            self.notify.notify_waiters();
        }
        Ok(n)
    }

    pub fn is_full(&self) -> bool {
        let inner = self.inner.lock();
        inner.buf.len() >= inner.capacity
    }

    /// Bytes of room left before the pipe hits capacity. Callers that dequeue
    /// bytes from an upstream source before calling `write` should check this
    /// first — `write` truncates silently, which would lose data once it has
    /// already been removed from that upstream source.
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner.capacity.saturating_sub(inner.buf.len())
    }

    /// Blocks until at least one byte is available or the writer end closes
    /// (returns `Ok(0)` for EOF), or the reader end is already closed
    /// (`Err(Closed)`).
    pub async fn read(&self, out: &mut [u8]) -> Result<usize, PipeError> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.reader_closed {
                    return Err(PipeError::Closed);
                }
                if !inner.buf.is_empty() {
                    let n = out.len().min(inner.buf.len());
                    for slot in out.iter_mut().take(n) {
                        *slot = inner.buf.pop_front().unwrap();
                    }
                    drop(inner);
                    self.notify.notify_waiters();
                    return Ok(n);
                }
                if inner.writer_closed {
                    return Ok(0);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Closes the writer end. Any blocked reader wakes and, once the buffer
    /// drains, sees EOF.
    pub fn close_writer(&self) {
        let mut inner = self.inner.lock();
        inner.writer_closed = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Closes the reader end, discarding any buffered bytes. Subsequent
    /// writes fail with `Closed`.
    pub fn close_reader(&self) {
        let mut inner = self.inner.lock();
        inner.reader_closed = true;
        inner.buf.clear();
        drop(inner);
        self.notify.notify_waiters();
    }

    pub fn is_writer_closed(&self) -> bool {
        self.inner.lock().writer_closed
    }

    pub fn is_reader_closed(&self) -> bool {
        self.inner.lock().reader_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_preserves_order() {
        let pipe = Pipe::with_default_capacity();
        pipe.write(b"hello").unwrap();
        let mut out = [0u8; 5];
        let fut = pipe.read(&mut out);
        let n = futures_block_on(fut).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn write_short_fills_at_capacity() {
        let pipe = Pipe::new(4);
        let n = pipe.write(b"abcdef").unwrap();
        assert_eq!(n, 4);
        assert!(pipe.is_full());
    }

    #[test]
    fn read_returns_eof_after_writer_closes_and_drains() {
        let pipe = Pipe::with_default_capacity();
        pipe.write(b"x").unwrap();
        pipe.close_writer();
        let mut out = [0u8; 1];
        assert_eq!(futures_block_on(pipe.read(&mut out)).unwrap(), 1);
        assert_eq!(futures_block_on(pipe.read(&mut out)).unwrap(), 0);
    }

    #[test]
    fn write_after_reader_closed_is_rejected() {
        let pipe = Pipe::with_default_capacity();
        pipe.close_reader();
        assert_eq!(pipe.write(b"x"), Err(PipeError::Closed));
    }

    #[test]
    fn closing_reader_discards_buffered_bytes() {
        let pipe = Pipe::with_default_capacity();
        pipe.write(b"buffered").unwrap();
        pipe.close_reader();
        assert_eq!(pipe.inner.lock().buf.len(), 0);
    }

    fn futures_block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
