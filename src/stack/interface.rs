//! Builds the smoltcp `Interface`, its `SocketSet`, and the pre-allocated
//! TCP/UDP socket pools the engine draws from on admission. Pool sizes and
//! buffer sizes are scaled for a general-purpose bridge rather than one tuned
//! to a single mobile OS's memory ceiling.

use crate::device::TunDevice;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::socket::udp::{PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata, Socket as UdpSocket};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};

pub const TCP_SOCKET_COUNT: usize = 128;
pub const UDP_SOCKET_COUNT: usize = 128;
pub const TCP_RX_BUFFER_SIZE: usize = 16_384;
pub const TCP_TX_BUFFER_SIZE: usize = 16_384;
pub const UDP_PACKET_METADATA: usize = 64;
pub const UDP_BUFFER_SIZE: usize = 32_768;

pub struct BuiltInterface {
    pub interface: Interface,
    pub sockets: SocketSet<'static>,
    pub tcp_pool: Vec<SocketHandle>,
    pub udp_pool: Vec<SocketHandle>,
}

/// Brings up the interface on `10.0.0.1/24` (and, when `enable_ipv6` is set,
/// `fd00::1/64`), with default routes pointing at itself — the gateway is
/// its own next hop, since every address the TUN routes here terminates
/// locally.
pub fn build(device: &mut TunDevice, enable_ipv6: bool) -> BuiltInterface {
    let ipv4_addr = Ipv4Address::new(10, 0, 0, 1);
    let ipv6_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = 0;
    let mut interface = Interface::new(config, device, Instant::from_millis(0));
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), 24));
        if enable_ipv6 {
            let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6_addr), 64));
        }
    });
    {
        let routes = interface.routes_mut();
        let _ = routes.add_default_ipv4_route(ipv4_addr);
        if enable_ipv6 {
            let _ = routes.add_default_ipv6_route(ipv6_addr);
        }
    }

    let mut sockets = SocketSet::new(Vec::new());

    let mut tcp_pool = Vec::with_capacity(TCP_SOCKET_COUNT);
    for _ in 0..TCP_SOCKET_COUNT {
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; TCP_RX_BUFFER_SIZE]),
            TcpSocketBuffer::new(vec![0; TCP_TX_BUFFER_SIZE]),
        );
        tcp_pool.push(sockets.add(socket));
    }

    let mut udp_pool = Vec::with_capacity(UDP_SOCKET_COUNT);
    for _ in 0..UDP_SOCKET_COUNT {
        let rx_meta = vec![UdpPacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let tx_meta = vec![UdpPacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let socket = UdpSocket::new(
            UdpPacketBuffer::new(rx_meta, vec![0; UDP_BUFFER_SIZE]),
            UdpPacketBuffer::new(tx_meta, vec![0; UDP_BUFFER_SIZE]),
        );
        udp_pool.push(sockets.add(socket));
    }

    BuiltInterface {
        interface,
        sockets,
        tcp_pool,
        udp_pool,
    }
}
