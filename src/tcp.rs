//! TCP connection adapter. Wraps a terminated TCP flow as a
//! bidirectional byte stream, implementing the lifecycle state machine and
//! the bounded internal pipe that buffers bytes until the handler reads
//! them.
//!
//! The stack engine is poll-driven rather than callback-driven (see the
//! module docs on [`crate::stack`]), so the `recv`/`sent`/`err` hooks the
//! spec describes become plain methods the engine calls on its tick instead
//! of the stack calling back into this type synchronously. The adapter
//! itself — state machine, pipe, half-close fusion — is unchanged by that
//! difference.

use crate::error::{StackError, StackResult};
use crate::pipe::{Pipe, PipeError};
use crate::registry::AdapterId;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TcpState {
    New = 0,
    Connecting = 1,
    Connected = 2,
    WriteClosed = 3,
    ReceiveClosed = 4,
    Closing = 5,
    Aborting = 6,
    Closed = 7,
    Errored = 8,
}

impl TcpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::WriteClosed,
            4 => Self::ReceiveClosed,
            5 => Self::Closing,
            6 => Self::Aborting,
            7 => Self::Closed,
            _ => Self::Errored,
        }
    }
}

/// What a connected adapter asks the stack engine to do on its behalf. The
/// engine implements this for itself; the adapter only ever sees the trait,
/// which keeps the two modules decoupled in both directions instead of
/// letting the adapter reach back into engine internals.
pub trait TcpBackend: Send + Sync {
    fn send(&self, id: AdapterId, data: &[u8]) -> StackResult<usize>;
    fn flush(&self, id: AdapterId);
    fn shutdown_tx(&self, id: AdapterId);
    fn recved(&self, id: AdapterId, n: usize);
    fn abort(&self, id: AdapterId);
    fn release(&self, id: AdapterId);
}

/// Bidirectional byte stream handed to a `TcpConnHandler`.
#[derive(Clone)]
pub struct TcpConnection {
    id: AdapterId,
    backend: Arc<dyn TcpBackend>,
    state: Arc<AtomicU8>,
    rx_pipe: Pipe,
    read_closed_once: Arc<AtomicBool>,
    write_closed_once: Arc<AtomicBool>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpConnection {
    pub(crate) fn new(
        id: AdapterId,
        backend: Arc<dyn TcpBackend>,
        pipe_capacity: usize,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            id,
            backend,
            state: Arc::new(AtomicU8::new(TcpState::Connecting as u8)),
            rx_pipe: Pipe::new(pipe_capacity),
            read_closed_once: Arc::new(AtomicBool::new(false)),
            write_closed_once: Arc::new(AtomicBool::new(false)),
            local_addr,
            remote_addr,
        }
    }

    pub fn id(&self) -> AdapterId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> TcpState {
        TcpState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn cas_state(&self, current: TcpState, next: TcpState) -> bool {
        self.state
            .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn force_state(&self, next: TcpState) {
        self.state.store(next as u8, Ordering::SeqCst);
    }

    /// CAS performed by the handler-dispatch task once `handler.handle`
    /// returns without error.
    pub(crate) fn mark_connected(&self) -> bool {
        self.cas_state(TcpState::Connecting, TcpState::Connected)
    }

    /// Dequeues bytes from the pipe, blocking until data arrives or the
    /// writer end closes (EOF, `Ok(0)`). Widens the flow-control window via
    /// `recved` after every successful dequeue.
    pub async fn read(&self, buf: &mut [u8]) -> StackResult<usize> {
        if self.state() >= TcpState::Closing {
            return Err(StackError::PipeClosed);
        }
        match self.rx_pipe.read(buf).await {
            Ok(0) => Ok(0),
            Ok(n) => {
                self.backend.recved(self.id, n);
                Ok(n)
            }
            Err(PipeError::Closed) => Err(StackError::PipeClosed),
        }
    }

    /// Loops until every byte in `buf` is accepted by the stack, yielding
    /// between retries when the send window is temporarily full.
    pub async fn write(&self, buf: &[u8]) -> StackResult<usize> {
        let disallowed = matches!(
            self.state(),
            TcpState::Aborting | TcpState::Closing | TcpState::Closed | TcpState::WriteClosed | TcpState::Errored
        );
        if disallowed {
            return Err(StackError::ConnectionClosed);
        }
        let mut written = 0;
        while written < buf.len() {
            match self.backend.send(self.id, &buf[written..]) {
                Ok(0) => tokio::task::yield_now().await,
                Ok(n) => written += n,
                Err(e) if e.is_try_again() => tokio::task::yield_now().await,
                Err(e) => return Err(e),
            }
        }
        self.backend.flush(self.id);
        Ok(written)
    }

    /// Closes the reader end, discarding buffered bytes. Idempotent.
    pub fn close_read(&self) {
        if self.read_closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.rx_pipe.close_reader();
    }

    /// Transitions toward `WriteClosed` (fusing into `Closing` if the
    /// receive side is already closed) and shuts down the send side.
    /// Idempotent.
    pub fn close_write(&self) {
        if self.write_closed_once.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let current = self.state();
            let next = if current == TcpState::ReceiveClosed {
                TcpState::Closing
            } else {
                TcpState::WriteClosed
            };
            if self.cas_state(current, next) {
                break;
            }
        }
        self.backend.shutdown_tx(self.id);
    }

    /// Runs `close_read` then `close_write`, each at most once.
    pub fn close(&self) {
        self.close_read();
        self.close_write();
    }

    /// Non-blocking: flips state to `Aborting` and lets the next engine tick
    /// observe it.
    pub fn abort(&self) {
        self.force_state(TcpState::Aborting);
        self.backend.abort(self.id);
    }

    /// Room available in the receive pipe. The engine must not dequeue more
    /// than this many bytes from the underlying socket before calling
    /// [`Self::deliver`], since bytes already removed from the socket can't
    /// be put back.
    pub(crate) fn pipe_room(&self) -> usize {
        self.rx_pipe.available()
    }

    /// Delivers bytes received from the peer. Caller must have already
    /// checked `pipe_room`.
    pub(crate) fn deliver(&self, data: &[u8]) {
        let _ = self.rx_pipe.write(data);
    }

    /// Delivers a FIN: fuses into `Closing` if the write side is already
    /// closed, otherwise moves to `ReceiveClosed`, and closes the pipe
    /// writer end so a blocked reader wakes with EOF.
    pub(crate) fn deliver_fin(&self) {
        loop {
            let current = self.state();
            if current >= TcpState::ReceiveClosed {
                break;
            }
            let next = if current == TcpState::WriteClosed {
                TcpState::Closing
            } else {
                TcpState::ReceiveClosed
            };
            if self.cas_state(current, next) {
                break;
            }
        }
        self.rx_pipe.close_writer();
    }

    /// Delivers an error observed by the engine (the underlying socket has
    /// already been torn down at this point).
    pub(crate) fn deliver_err(&self) {
        self.force_state(TcpState::Errored);
        self.rx_pipe.close_writer();
        self.backend.release(self.id);
    }

    /// Called from the engine's `Sent`/`Poll`-equivalent tick: releases the
    /// adapter once it reaches a terminal state.
    pub(crate) fn check_state(&self) {
        match self.state() {
            TcpState::Closing => {
                self.force_state(TcpState::Closed);
                self.backend.release(self.id);
            }
            TcpState::Aborting => {
                self.force_state(TcpState::Closed);
                self.backend.release(self.id);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBackend {
        sent: Mutex<Vec<u8>>,
        recved_total: AtomicU8,
        shutdown_called: AtomicBool,
        aborted: AtomicBool,
        released: AtomicBool,
    }

    impl TcpBackend for RecordingBackend {
        fn send(&self, _id: AdapterId, data: &[u8]) -> StackResult<usize> {
            self.sent.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&self, _id: AdapterId) {}
        fn shutdown_tx(&self, _id: AdapterId) {
            self.shutdown_called.store(true, Ordering::SeqCst);
        }
        fn recved(&self, _id: AdapterId, n: usize) {
            self.recved_total.fetch_add(n as u8, Ordering::SeqCst);
        }
        fn abort(&self, _id: AdapterId) {
            self.aborted.store(true, Ordering::SeqCst);
        }
        fn release(&self, _id: AdapterId) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn echo_round_trip_preserves_bytes() {
        let backend = Arc::new(RecordingBackend::default());
        let conn = TcpConnection::new(AdapterId::next(), backend.clone(), 65_535, addr(1), addr(2));
        assert!(conn.mark_connected());

        conn.deliver(b"hello, world\n");
        let mut buf = [0u8; 32];
        let n = conn.read(&mut buf).await.unwrap();
        conn.write(&buf[..n]).await.unwrap();

        assert_eq!(&backend.sent.lock().unwrap()[..], b"hello, world\n");
    }

    #[tokio::test]
    async fn fin_then_read_returns_eof() {
        let backend = Arc::new(RecordingBackend::default());
        let conn = TcpConnection::new(AdapterId::next(), backend, 65_535, addr(1), addr(2));
        conn.mark_connected();
        conn.deliver_fin();
        assert_eq!(conn.state(), TcpState::ReceiveClosed);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn write_after_fin_still_succeeds() {
        let backend = Arc::new(RecordingBackend::default());
        let conn = TcpConnection::new(AdapterId::next(), backend.clone(), 65_535, addr(1), addr(2));
        conn.mark_connected();
        conn.deliver_fin();

        let n = conn.write(b"bye").await.unwrap();
        assert_eq!(n, 3);
        assert_eq!(&backend.sent.lock().unwrap()[..], b"bye");
    }

    #[test]
    fn close_is_idempotent() {
        let backend = Arc::new(RecordingBackend::default());
        let conn = TcpConnection::new(AdapterId::next(), backend.clone(), 65_535, addr(1), addr(2));
        conn.close();
        conn.close();
        assert_eq!(conn.state(), TcpState::WriteClosed);
    }

    #[test]
    fn fin_while_write_closed_fuses_into_closing() {
        let backend = Arc::new(RecordingBackend::default());
        let conn = TcpConnection::new(AdapterId::next(), backend, 65_535, addr(1), addr(2));
        conn.close_write();
        assert_eq!(conn.state(), TcpState::WriteClosed);
        conn.deliver_fin();
        assert_eq!(conn.state(), TcpState::Closing);
    }
}
