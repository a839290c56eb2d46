//! UDP connection adapter. Each adapter represents one flow
//! keyed by its source endpoint (see [`crate::registry::FlowId`]); datagrams
//! that arrive before the handler's `connect` call finishes are buffered on
//! a bounded early-packet queue and drained once the dial succeeds.

use crate::error::{StackError, StackResult};
use crate::handler::UdpConnHandler;
use crate::registry::FlowId;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_EARLY_QUEUE_CAPACITY: usize = 128;

/// UDP has no FIN/RST to signal that a flow is done, unlike TCP, so idle
/// flows are reclaimed on a timer instead. Ten seconds without an inbound
/// datagram or an outbound write closes the adapter.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpState {
    Connecting = 0,
    Connected = 1,
    Closed = 2,
}

impl UdpState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// What a connected adapter asks the stack engine to do on its behalf.
pub trait UdpBackend: Send + Sync {
    fn send_to(&self, flow_id: &str, local_addr: SocketAddr, data: &[u8], dst: SocketAddr) -> StackResult<usize>;
    fn release(&self, flow_id: &str);
}

/// Datagram socket handed to a `UdpConnHandler`.
#[derive(Clone)]
pub struct UdpConnection {
    flow_id: FlowId,
    backend: Arc<dyn UdpBackend>,
    handler: Arc<dyn UdpConnHandler>,
    state: Arc<AtomicU8>,
    early_queue: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddr)>>>,
    early_queue_capacity: usize,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    last_activity: Arc<Mutex<Instant>>,
}

impl UdpConnection {
    pub(crate) fn new(
        flow_id: FlowId,
        backend: Arc<dyn UdpBackend>,
        handler: Arc<dyn UdpConnHandler>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            flow_id,
            backend,
            handler,
            state: Arc::new(AtomicU8::new(UdpState::Connecting as u8)),
            early_queue: Arc::new(Mutex::new(VecDeque::new())),
            early_queue_capacity: DEFAULT_EARLY_QUEUE_CAPACITY,
            local_addr,
            remote_addr,
            last_activity: Arc::new(Mutex::new(Instant::now())),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time elapsed since the last inbound datagram or outbound write. The
    /// engine closes the adapter once this exceeds [`DEFAULT_IDLE_TIMEOUT`].
    pub(crate) fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> UdpState {
        UdpState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Spawns the dial task: calls `handler.connect`, then on success CASes
    /// to `Connected` and drains the early-packet queue FIFO, or on failure
    /// closes the adapter.
    pub(crate) fn spawn_dial(self) {
        tokio::spawn(async move {
            let handler = Arc::clone(&self.handler);
            match handler.connect(self.clone(), self.remote_addr).await {
                Ok(()) => {
                    if self.try_mark_connected() {
                        self.drain_early_queue().await;
                    }
                }
                Err(e) => {
                    crate::logger::warn(format!("udp connect handler failed: {e}"));
                    self.close();
                }
            }
        });
    }

    fn try_mark_connected(&self) -> bool {
        self.state
            .compare_exchange(
                UdpState::Connecting as u8,
                UdpState::Connected as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    async fn drain_early_queue(&self) {
        loop {
            let item = self.early_queue.lock().pop_front();
            let Some((data, dst_addr)) = item else { break };
            if let Err(e) = self.handler.receive_to(self.clone(), data, dst_addr).await {
                crate::logger::warn(format!("udp receive_to handler failed: {e}"));
                break;
            }
        }
    }

    /// Delivers an inbound datagram. Called by the stack engine, not the
    /// handler. While `Connecting`, buffers on the early queue (dropping
    /// silently on overflow, per UDP semantics); while `Connected`, hands
    /// off to the handler on its own task so the engine tick never blocks
    /// on handler code.
    pub(crate) fn deliver(&self, data: Vec<u8>, dst_addr: SocketAddr) -> StackResult<()> {
        self.touch();
        match self.state() {
            UdpState::Connecting => {
                let mut queue = self.early_queue.lock();
                if queue.len() >= self.early_queue_capacity {
                    return Err(StackError::AllocationFailure("udp early-packet queue full"));
                }
                queue.push_back((data, dst_addr));
                Ok(())
            }
            UdpState::Connected => {
                let handler = Arc::clone(&self.handler);
                let conn = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = handler.receive_to(conn, data, dst_addr).await {
                        crate::logger::warn(format!("udp receive_to handler failed: {e}"));
                    }
                });
                Ok(())
            }
            UdpState::Closed => Err(StackError::ConnectionClosed),
        }
    }

    /// Sends a datagram from the handler toward `dst_addr`. A no-op success
    /// on an empty payload.
    pub async fn write_from(&self, buf: &[u8], dst_addr: SocketAddr) -> StackResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state() != UdpState::Connected {
            return Err(StackError::ConnectionClosed);
        }
        self.touch();
        self.backend.send_to(&self.flow_id, self.local_addr, buf, dst_addr)
    }

    /// Sets state to `Closed` and releases the adapter from the flow
    /// registry. Idempotent.
    pub fn close(&self) {
        let prev = self.state.swap(UdpState::Closed as u8, Ordering::SeqCst);
        if prev != UdpState::Closed as u8 {
            self.backend.release(&self.flow_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct RecordingBackend {
        sent: StdMutex<Vec<(Vec<u8>, SocketAddr)>>,
        released: AtomicUsize,
    }

    impl UdpBackend for RecordingBackend {
        fn send_to(&self, _flow_id: &str, _local_addr: SocketAddr, data: &[u8], dst: SocketAddr) -> StackResult<usize> {
            self.sent.lock().unwrap().push((data.to_vec(), dst));
            Ok(data.len())
        }
        fn release(&self, _flow_id: &str) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct AcceptingHandler {
        received: Arc<StdMutex<Vec<Vec<u8>>>>,
    }

    impl UdpConnHandler for AcceptingHandler {
        fn connect(&self, _conn: UdpConnection, _remote_addr: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn receive_to(
            &self,
            _conn: UdpConnection,
            data: Vec<u8>,
            _dst_addr: SocketAddr,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            let received = Arc::clone(&self.received);
            Box::pin(async move {
                received.lock().unwrap().push(data);
                Ok(())
            })
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn early_packets_drain_fifo_after_connect() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let backend = Arc::new(RecordingBackend {
            sent: StdMutex::new(Vec::new()),
            released: AtomicUsize::new(0),
        });
        let handler = Arc::new(AcceptingHandler { received: Arc::clone(&received) });
        let conn = UdpConnection::new("10.0.0.2:9".to_string(), backend, handler, addr(1), addr(2));

        conn.deliver(b"first".to_vec(), addr(1)).unwrap();
        conn.deliver(b"second".to_vec(), addr(1)).unwrap();
        conn.clone().spawn_dial();

        for _ in 0..50 {
            if received.lock().unwrap().len() == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(received.lock().unwrap().as_slice(), &[b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn early_queue_overflow_is_rejected() {
        let backend = Arc::new(RecordingBackend {
            sent: StdMutex::new(Vec::new()),
            released: AtomicUsize::new(0),
        });
        let handler = Arc::new(AcceptingHandler { received: Arc::new(StdMutex::new(Vec::new())) });
        let conn = UdpConnection::new("10.0.0.2:9".to_string(), backend, handler, addr(1), addr(2));
        for _ in 0..DEFAULT_EARLY_QUEUE_CAPACITY {
            conn.deliver(b"x".to_vec(), addr(1)).unwrap();
        }
        assert!(conn.deliver(b"overflow".to_vec(), addr(1)).is_err());
    }

    #[test]
    fn close_is_idempotent_and_releases_once() {
        let backend = Arc::new(RecordingBackend {
            sent: StdMutex::new(Vec::new()),
            released: AtomicUsize::new(0),
        });
        let handler = Arc::new(AcceptingHandler { received: Arc::new(StdMutex::new(Vec::new())) });
        let conn = UdpConnection::new("10.0.0.2:9".to_string(), backend.clone(), handler, addr(1), addr(2));
        conn.close();
        conn.close();
        assert_eq!(backend.released.load(Ordering::SeqCst), 1);
    }
}
