//! Stack engine. Owns the embedded smoltcp interface and socket set behind
//! the recursive [`crate::lock::StackLock`]. Rather than the embedded stack
//! calling back into an adapter synchronously on `recv`/`sent`/`err`, this
//! engine's tick walks the live flows itself and calls the adapter methods
//! directly, then releases the lock before touching the egress sink or a
//! handler task — the stack lock is never held across a handler callback.

mod interface;

use crate::config::StackConfig;
use crate::device::{self, ParsedPacket, TunDevice, TunHandle};
use crate::error::{StackError, StackResult};
use crate::handler::{TcpConnHandler, UdpConnHandler};
use crate::lock::StackLock;
use crate::logger::{self, BreadcrumbFlags};
use crate::pool::BufferPool;
use crate::registry::{AdapterId, TcpRegistry, UdpRegistry};
use crate::reply;
use crate::tcp::{TcpBackend, TcpConnection, TcpState};
use crate::timer::{StopMode, TimerDriver};
use crate::udp::{UdpBackend, UdpConnection, DEFAULT_IDLE_TIMEOUT};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{Socket as SmolTcpSocket, State as SmolTcpState};
use smoltcp::socket::udp::Socket as SmolUdpSocket;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{IpAddress, IpEndpoint, IpListenEndpoint};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::Notify;

pub type OutputFn = dyn Fn(&[u8]) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TcpFlowKey {
    src: SocketAddr,
    dst: SocketAddr,
}

struct TcpFlowState {
    socket: SocketHandle,
    adapter_id: Option<AdapterId>,
    fin_delivered: bool,
}

struct EngineState {
    device: TunDevice,
    interface: smoltcp::iface::Interface,
    sockets: smoltcp::iface::SocketSet<'static>,
    tcp_free: Vec<SocketHandle>,
    udp_free: Vec<SocketHandle>,
    tcp_flows: FxHashMap<TcpFlowKey, TcpFlowState>,
    tcp_by_id: FxHashMap<AdapterId, TcpFlowKey>,
    udp_listeners: FxHashMap<(IpAddr, u16), SocketHandle>,
}

/// Owns the embedded TCP/IP state machine and serializes every call into it
/// through the stack lock.
pub struct StackEngine {
    lock: StackLock<EngineState>,
    device_handle: TunHandle,
    wake: Arc<Notify>,
    config: StackConfig,
    buffer_pool: BufferPool,
    tcp_registry: TcpRegistry<TcpConnection>,
    udp_registry: UdpRegistry<UdpConnection>,
    tcp_handler: Arc<dyn TcpConnHandler>,
    udp_handler: Arc<dyn UdpConnHandler>,
    output: Arc<OutputFn>,
    running: AtomicBool,
    epoch: StdInstant,
    timer: TimerDriver,
    self_ref: std::sync::Weak<StackEngine>,
}

impl StackEngine {
    pub fn new(
        config: StackConfig,
        tcp_handler: Arc<dyn TcpConnHandler>,
        udp_handler: Arc<dyn UdpConnHandler>,
        output: Arc<OutputFn>,
    ) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        let mut device = TunDevice::new(config.normalized_mtu(), Arc::clone(&wake), device::DEFAULT_RING_CAPACITY);
        let device_handle = device.handle();
        let built = interface::build(&mut device, config.enable_ipv6);

        let state = EngineState {
            device,
            interface: built.interface,
            sockets: built.sockets,
            tcp_free: built.tcp_pool,
            udp_free: built.udp_pool,
            tcp_flows: FxHashMap::default(),
            tcp_by_id: FxHashMap::default(),
            udp_listeners: FxHashMap::default(),
        };

        Arc::new_cyclic(|weak: &std::sync::Weak<StackEngine>| {
            let weak_for_timer = weak.clone();
            let tick_fn: Arc<dyn Fn() + Send + Sync> = Arc::new(move || {
                if let Some(engine) = weak_for_timer.upgrade() {
                    engine.tick();
                }
            });
            Self {
                lock: StackLock::new(state),
                device_handle,
                wake,
                config,
                buffer_pool: BufferPool::new(),
                tcp_registry: TcpRegistry::new(),
                udp_registry: UdpRegistry::new(),
                tcp_handler,
                udp_handler,
                output,
                running: AtomicBool::new(false),
                epoch: StdInstant::now(),
                timer: TimerDriver::new(tick_fn),
                self_ref: weak.clone(),
            }
        })
    }

    fn now(&self) -> SmolInstant {
        SmolInstant::from_millis(self.epoch.elapsed().as_millis().min(i64::MAX as u128) as i64)
    }

    pub fn get_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_timeouts(&self) {
        self.running.store(true, Ordering::SeqCst);
        self.timer.start_timeouts();
    }

    pub fn stop_timeouts(&self, mode: StopMode) {
        self.timer.stop_timeouts(mode);
    }

    pub fn restart_timeouts(&self) {
        self.timer.restart_timeouts();
    }

    /// Ingress sink. Validates `frame`, admits any new TCP/UDP flow it
    /// carries, then enqueues a copy for the device to hand smoltcp on the
    /// next poll.
    pub fn write(&self, frame: &[u8]) -> (usize, Option<StackError>) {
        if !self.get_running() {
            return (0, Some(StackError::StackClosed));
        }
        if frame.is_empty() {
            return (0, None);
        }
        let parsed = match device::parse_packet_validated(frame) {
            Ok(parsed) => parsed,
            Err(e) => return (0, Some(StackError::PacketRejected(e.description()))),
        };

        self.lock.with(|state| match &parsed {
            ParsedPacket::Tcp(tcp) => self.admit_tcp(state, tcp),
            ParsedPacket::Udp(udp) => self.admit_udp(state, udp),
            ParsedPacket::Other => {}
        });

        let mut slab = self.buffer_pool.acquire(frame.len());
        slab.as_mut_slice().copy_from_slice(frame);
        let accepted = self.device_handle.push_inbound(slab.as_slice());
        self.buffer_pool.release(slab);

        if accepted {
            self.wake.notify_one();
            (frame.len(), None)
        } else {
            (0, Some(StackError::PacketRejected("ingress validation failed")))
        }
    }

    fn admit_tcp(&self, state: &mut EngineState, packet: &device::TcpPacket<'_>) {
        let key = TcpFlowKey {
            src: SocketAddr::new(packet.src, packet.src_port),
            dst: SocketAddr::new(packet.dst, packet.dst_port),
        };
        if state.tcp_flows.contains_key(&key) {
            return;
        }
        if !self.config.allow_lan && !packet.dst.is_loopback() {
            logger::breadcrumb(BreadcrumbFlags::TCP, format!("tcp flow to {} rejected: lan disallowed", packet.dst));
            return;
        }
        let Some(handle) = state.tcp_free.pop() else {
            logger::warn("tcp admission failed: socket pool exhausted");
            return;
        };
        let socket = state.sockets.get_mut::<SmolTcpSocket>(handle);
        let endpoint = IpListenEndpoint {
            addr: Some(to_smoltcp_addr(packet.dst)),
            port: packet.dst_port,
        };
        if socket.listen(endpoint).is_err() {
            state.tcp_free.push(handle);
            return;
        }
        socket.set_nagle_enabled(false);
        socket.set_keep_alive(Some(smoltcp::time::Duration::from_secs(60)));
        state.tcp_flows.insert(
            key,
            TcpFlowState {
                socket: handle,
                adapter_id: None,
                fin_delivered: false,
            },
        );
        logger::breadcrumb(BreadcrumbFlags::TCP, format!("tcp flow admitted {key:?}"));
    }

    fn admit_udp(&self, state: &mut EngineState, packet: &device::UdpPacket<'_>) {
        let local = (packet.dst, packet.dst_port);
        if state.udp_listeners.contains_key(&local) {
            return;
        }
        if !self.config.allow_lan && !packet.dst.is_loopback() {
            logger::breadcrumb(BreadcrumbFlags::UDP, format!("udp flow to {} rejected: lan disallowed", packet.dst));
            return;
        }
        let Some(handle) = state.udp_free.pop() else {
            logger::warn("udp admission failed: socket pool exhausted");
            return;
        };
        let socket = state.sockets.get_mut::<SmolUdpSocket>(handle);
        let endpoint = IpListenEndpoint {
            addr: Some(to_smoltcp_addr(packet.dst)),
            port: packet.dst_port,
        };
        if socket.bind(endpoint).is_err() {
            state.udp_free.push(handle);
            return;
        }
        state.udp_listeners.insert(local, handle);
        logger::breadcrumb(BreadcrumbFlags::UDP, format!("udp listener bound {local:?}"));
    }

    /// The timer's tick hook: drives the embedded stack, then handles newly
    /// established connections, delivers inbound bytes/datagrams to
    /// adapters, and finally flushes egress — all outside the stack lock.
    fn tick(&self) {
        let now = self.now();
        let (new_tcp, inbound_udp) = self.lock.with(|state| {
            state.interface.poll(now, &mut state.device, &mut state.sockets);

            let mut newly_established: SmallVec<[(TcpFlowKey, SocketHandle, SocketAddr, SocketAddr); 16]> = SmallVec::new();
            for (key, flow) in state.tcp_flows.iter_mut() {
                if flow.adapter_id.is_none() {
                    let socket = state.sockets.get::<SmolTcpSocket>(flow.socket);
                    if socket.state() == SmolTcpState::Established {
                        let local = socket.local_endpoint();
                        let remote = socket.remote_endpoint();
                        if let (Some(local), Some(remote)) = (local, remote) {
                            newly_established.push((*key, flow.socket, to_std_addr(local), to_std_addr(remote)));
                        }
                    }
                }
            }

            for flow in state.tcp_flows.values_mut() {
                let Some(id) = flow.adapter_id else { continue };
                let Some(conn) = self.tcp_registry_get(id) else { continue };
                let socket = state.sockets.get_mut::<SmolTcpSocket>(flow.socket);

                let room = conn.pipe_room();
                if room > 0 && socket.can_recv() {
                    let mut buf = vec![0u8; room];
                    if let Ok(n) = socket.recv_slice(&mut buf) {
                        if n > 0 {
                            conn.deliver(&buf[..n]);
                        }
                    }
                }

                if !flow.fin_delivered {
                    let remote_closed = matches!(
                        socket.state(),
                        SmolTcpState::CloseWait | SmolTcpState::LastAck | SmolTcpState::TimeWait
                    );
                    if remote_closed {
                        conn.deliver_fin();
                        flow.fin_delivered = true;
                    }
                }
                conn.check_state();
            }

            let mut inbound_udp: SmallVec<[(IpAddr, u16, SocketAddr, Vec<u8>); 16]> = SmallVec::new();
            for (&(dst_ip, dst_port), &handle) in state.udp_listeners.iter() {
                let socket = state.sockets.get_mut::<SmolUdpSocket>(handle);
                while socket.can_recv() {
                    let mut buf = vec![0u8; interface::UDP_BUFFER_SIZE];
                    match socket.recv_slice(&mut buf) {
                        Ok((n, meta)) => {
                            inbound_udp.push((dst_ip, dst_port, to_std_addr(meta.endpoint), buf[..n].to_vec()));
                        }
                        Err(_) => break,
                    }
                }
            }

            self.release_terminal_tcp_flows(state);

            (newly_established, inbound_udp)
        });

        for (key, handle, local_addr, remote_addr) in new_tcp {
            self.spawn_tcp_adapter(key, handle, local_addr, remote_addr);
        }
        for (dst_ip, dst_port, remote_addr, data) in inbound_udp {
            self.deliver_udp(dst_ip, dst_port, remote_addr, data);
        }

        self.prune_idle_udp_flows();

        for frame in self.device_handle.drain_outbound() {
            (self.output)(&frame);
        }
    }

    fn release_terminal_tcp_flows(&self, state: &mut EngineState) {
        let terminal: SmallVec<[TcpFlowKey; 16]> = state
            .tcp_flows
            .iter()
            .filter_map(|(key, flow)| {
                let socket = state.sockets.get::<SmolTcpSocket>(flow.socket);
                let adapter_closed = flow
                    .adapter_id
                    .and_then(|id| self.tcp_registry_get(id))
                    .map(|conn| conn.state() >= TcpState::Closed)
                    .unwrap_or(false);
                (socket.state() == SmolTcpState::Closed && (flow.adapter_id.is_none() || adapter_closed))
                    .then_some(*key)
            })
            .collect();
        for key in terminal {
            if let Some(flow) = state.tcp_flows.remove(&key) {
                if let Some(id) = flow.adapter_id {
                    state.tcp_by_id.remove(&id);
                }
                state.sockets.get_mut::<SmolTcpSocket>(flow.socket).abort();
                state.tcp_free.push(flow.socket);
            }
        }
    }

    fn tcp_registry_get(&self, id: AdapterId) -> Option<Arc<TcpConnection>> {
        self.tcp_registry.get(id)
    }

    /// UDP has no FIN/RST to signal completion, so abandoned flows are
    /// reclaimed here instead: any adapter idle past [`DEFAULT_IDLE_TIMEOUT`]
    /// is closed, which also releases it from the registry.
    fn prune_idle_udp_flows(&self) {
        self.udp_registry.range(|_, conn| {
            if conn.idle_for() >= DEFAULT_IDLE_TIMEOUT {
                conn.close();
            }
        });
    }

    fn spawn_tcp_adapter(
        &self,
        key: TcpFlowKey,
        _socket_handle: SocketHandle,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
    ) {
        let id = AdapterId::next();
        let engine = self.self_ref.upgrade().expect("engine alive while ticking");
        let backend: Arc<dyn TcpBackend> = engine as Arc<dyn TcpBackend>;
        let conn = TcpConnection::new(id, backend, 65_535, local_addr, remote_addr);

        self.lock.with(|state| {
            if let Some(flow) = state.tcp_flows.get_mut(&key) {
                flow.adapter_id = Some(id);
                state.tcp_by_id.insert(id, key);
            }
        });
        self.tcp_registry.insert(id, Arc::new(conn.clone()));

        let handler = Arc::clone(&self.tcp_handler);
        tokio::spawn(async move {
            match handler.handle(conn.clone(), remote_addr).await {
                Ok(()) => {
                    conn.mark_connected();
                }
                Err(e) => {
                    logger::warn(format!("tcp handler failed: {e}"));
                    conn.abort();
                }
            }
        });
    }

    fn deliver_udp(&self, dst_ip: IpAddr, dst_port: u16, remote_addr: SocketAddr, data: Vec<u8>) {
        let local_addr = SocketAddr::new(dst_ip, dst_port);
        let flow_id = remote_addr.to_string();
        let engine = self.self_ref.upgrade().expect("engine alive while ticking");
        let backend: Arc<dyn UdpBackend> = engine as Arc<dyn UdpBackend>;
        let handler = Arc::clone(&self.udp_handler);
        let registry = &self.udp_registry;
        let lookup_id = flow_id.clone();
        let conn = registry.get_or_create(&lookup_id, move || {
            let conn = UdpConnection::new(flow_id, backend, handler, local_addr, remote_addr);
            conn.clone().spawn_dial();
            Arc::new(conn)
        });
        if let Err(e) = conn.deliver(data, local_addr) {
            logger::warn(format!("udp deliver dropped datagram: {e}"));
        }
    }

    /// Aborts every TCP adapter and closes every UDP adapter, releasing
    /// listener state, then stops the timer.
    pub fn close(&self, mode: StopMode) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.tcp_registry.range(|_, conn| conn.abort());
            self.udp_registry.range(|_, conn| conn.close());
            self.lock.with(|state| {
                state.tcp_flows.clear();
                state.udp_listeners.clear();
            });
        }
        self.timer.stop_timeouts(mode);
    }

    pub fn config(&self) -> StackConfig {
        self.config
    }
}

impl TcpBackend for StackEngine {
    fn send(&self, id: AdapterId, data: &[u8]) -> StackResult<usize> {
        self.lock.with(|state| {
            let Some(&key) = state.tcp_by_id.get(&id) else {
                return Err(StackError::ConnectionClosed);
            };
            let Some(flow) = state.tcp_flows.get(&key) else {
                return Err(StackError::ConnectionClosed);
            };
            let socket = state.sockets.get_mut::<SmolTcpSocket>(flow.socket);
            socket.send_slice(data).map_err(|_| StackError::ConnectionClosed)
        })
    }

    fn flush(&self, _id: AdapterId) {
        self.wake.notify_one();
    }

    fn shutdown_tx(&self, id: AdapterId) {
        self.lock.with(|state| {
            if let Some(&key) = state.tcp_by_id.get(&id) {
                if let Some(flow) = state.tcp_flows.get(&key) {
                    state.sockets.get_mut::<SmolTcpSocket>(flow.socket).close();
                }
            }
        });
    }

    fn recved(&self, _id: AdapterId, _n: usize) {
        // smoltcp widens the receive window automatically as bytes are
        // dequeued from the socket buffer via recv_slice; no explicit
        // acknowledgement call is needed.
    }

    fn abort(&self, id: AdapterId) {
        self.lock.with(|state| {
            if let Some(&key) = state.tcp_by_id.get(&id) {
                if let Some(flow) = state.tcp_flows.get(&key) {
                    state.sockets.get_mut::<SmolTcpSocket>(flow.socket).abort();
                }
            }
        });
        self.wake.notify_one();
    }

    fn release(&self, id: AdapterId) {
        self.tcp_registry.remove(id);
    }
}

impl UdpBackend for StackEngine {
    fn send_to(&self, _flow_id: &str, local_addr: SocketAddr, data: &[u8], dst: SocketAddr) -> StackResult<usize> {
        let Some(frame) = reply::build_udp_response(local_addr.ip(), local_addr.port(), dst.ip(), dst.port(), data)
        else {
            return Err(StackError::PacketRejected("mixed address families in udp reply"));
        };
        self.device_handle.push_outbound(frame);
        self.wake.notify_one();
        Ok(data.len())
    }

    fn release(&self, flow_id: &str) {
        self.udp_registry.delete(flow_id);
    }
}

fn to_smoltcp_addr(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4.into()),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6.into()),
    }
}

fn to_std_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip: IpAddr = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4.into()),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6.into()),
    };
    SocketAddr::new(ip, endpoint.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;

    struct NoopTcpHandler;
    impl TcpConnHandler for NoopTcpHandler {
        fn handle(&self, _conn: TcpConnection, _remote_addr: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    struct NoopUdpHandler;
    impl UdpConnHandler for NoopUdpHandler {
        fn connect(&self, _conn: UdpConnection, _remote_addr: SocketAddr) -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
        fn receive_to(
            &self,
            _conn: UdpConnection,
            _data: Vec<u8>,
            _dst_addr: SocketAddr,
        ) -> BoxFuture<'static, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn test_engine(config: StackConfig) -> Arc<StackEngine> {
        let output: Arc<OutputFn> = Arc::new(|_frame: &[u8]| {});
        StackEngine::new(config, Arc::new(NoopTcpHandler), Arc::new(NoopUdpHandler), output)
    }

    fn ipv4_header(total_len: u16, protocol: u8, src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut header = vec![0u8; 20];
        header[0] = 0x45;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        header[8] = 64;
        header[9] = protocol;
        header[12..16].copy_from_slice(&src);
        header[16..20].copy_from_slice(&dst);
        header
    }

    fn build_tcp_syn(src: [u8; 4], src_port: u16, dst_port: u16) -> Vec<u8> {
        build_tcp_syn_to(src, src_port, [10, 0, 0, 1], dst_port)
    }

    fn build_tcp_syn_to(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16) -> Vec<u8> {
        let mut tcp = vec![0u8; 20];
        tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
        tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
        tcp[12] = 5 << 4;
        tcp[13] = 0x02; // SYN
        let mut frame = ipv4_header((20 + tcp.len()) as u16, 6, src, dst);
        frame.extend_from_slice(&tcp);
        frame
    }

    #[tokio::test]
    async fn write_before_start_timeouts_reports_stack_closed() {
        let engine = test_engine(StackConfig::default());
        let frame = build_tcp_syn([10, 0, 0, 2], 5000, 80);
        let (n, err) = engine.write(&frame);
        assert_eq!(n, 0);
        assert!(matches!(err, Some(StackError::StackClosed)));
    }

    #[tokio::test]
    async fn empty_frame_is_a_no_op_success() {
        let engine = test_engine(StackConfig::default());
        engine.start_timeouts();
        let (n, err) = engine.write(&[]);
        assert_eq!(n, 0);
        assert!(err.is_none());
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn malformed_frame_is_rejected() {
        let engine = test_engine(StackConfig::default());
        engine.start_timeouts();
        let (n, err) = engine.write(&[0x99]);
        assert_eq!(n, 0);
        assert!(matches!(err, Some(StackError::PacketRejected(_))));
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn valid_syn_is_accepted_once_running() {
        let engine = test_engine(StackConfig::default());
        engine.start_timeouts();
        let frame = build_tcp_syn([10, 0, 0, 2], 5000, 80);
        let (n, err) = engine.write(&frame);
        assert_eq!(n, frame.len());
        assert!(err.is_none());
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn lan_disallowed_rejects_admission_to_a_non_loopback_destination() {
        let config = StackConfig {
            enable_ipv6: true,
            allow_lan: false,
            mtu: 1500,
        };
        let engine = test_engine(config);
        engine.start_timeouts();
        let frame = build_tcp_syn_to([10, 0, 0, 2], 5000, [10, 0, 0, 1], 80);
        let (n, err) = engine.write(&frame);
        assert_eq!(n, frame.len());
        assert!(err.is_none());
        let admitted = engine.lock.with(|state| state.tcp_flows.len());
        assert_eq!(admitted, 0, "flow to a non-loopback destination must not be admitted when allow_lan is false");
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn lan_disallowed_still_admits_a_loopback_destination() {
        let config = StackConfig {
            enable_ipv6: true,
            allow_lan: false,
            mtu: 1500,
        };
        let engine = test_engine(config);
        engine.start_timeouts();
        let frame = build_tcp_syn_to([10, 0, 0, 2], 5000, [127, 0, 0, 1], 80);
        let (n, err) = engine.write(&frame);
        assert_eq!(n, frame.len());
        assert!(err.is_none());
        let admitted = engine.lock.with(|state| state.tcp_flows.len());
        assert_eq!(admitted, 1, "flow to a loopback destination must still be admitted when allow_lan is false");
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn lan_allowed_admits_a_non_loopback_destination() {
        let engine = test_engine(StackConfig::new(true, true));
        engine.start_timeouts();
        let frame = build_tcp_syn([10, 0, 0, 2], 5000, 80);
        let (n, err) = engine.write(&frame);
        assert_eq!(n, frame.len());
        assert!(err.is_none());
        let admitted = engine.lock.with(|state| state.tcp_flows.len());
        assert_eq!(admitted, 1);
        engine.close(StopMode::Instant);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let engine = test_engine(StackConfig::default());
        engine.start_timeouts();
        engine.close(StopMode::Instant);
        engine.close(StopMode::Instant);
        assert!(!engine.get_running());
    }
}
