//! Raw UDP reply construction. smoltcp's socket layer addresses a UDP
//! endpoint by its local bound port alone, so when several client source
//! endpoints share one stack-side UDP socket (the normal case here, since the
//! stack always binds on behalf of the TUN-facing side) there is no way to
//! ask the socket to send a reply to one specific client without it also
//! being deliverable to the others. Building the IP/UDP datagram by hand and
//! pushing it straight onto the device's outbound ring (bypassing the socket
//! entirely) sidesteps that ambiguity.

use crate::checksum;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Builds a raw UDP reply datagram from `server:server_port` to
/// `client:client_port`, or `None` if the two endpoints mix address
/// families.
pub fn build_udp_response(
    server: IpAddr,
    server_port: u16,
    client: IpAddr,
    client_port: u16,
    payload: &[u8],
) -> Option<Vec<u8>> {
    match (server, client) {
        (IpAddr::V4(server), IpAddr::V4(client)) => Some(build_ipv4_udp_response(
            server,
            client,
            server_port,
            client_port,
            payload,
        )),
        (IpAddr::V6(server), IpAddr::V6(client)) => Some(build_ipv6_udp_response(
            server,
            client,
            server_port,
            client_port,
            payload,
        )),
        _ => None,
    }
}

fn build_ipv4_udp_response(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV4_HEADER_LEN: usize = 20;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x45;
    buffer[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buffer[8] = 64; // TTL
    buffer[9] = 17; // UDP
    buffer[12..16].copy_from_slice(&src.octets());
    buffer[16..20].copy_from_slice(&dst.octets());

    let udp_offset = IPV4_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv4(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    let ip_checksum = checksum::ipv4_header(&buffer[..IPV4_HEADER_LEN]);
    buffer[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    buffer
}

fn build_ipv6_udp_response(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    const IPV6_HEADER_LEN: usize = 40;
    const UDP_HEADER_LEN: usize = 8;

    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV6_HEADER_LEN + udp_len;
    let mut buffer = vec![0u8; total_len];

    buffer[0] = 0x60;
    buffer[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[6] = 17; // next header = UDP
    buffer[7] = 64; // hop limit
    buffer[8..24].copy_from_slice(&src.octets());
    buffer[24..40].copy_from_slice(&dst.octets());

    let udp_offset = IPV6_HEADER_LEN;
    buffer[udp_offset..udp_offset + 2].copy_from_slice(&src_port.to_be_bytes());
    buffer[udp_offset + 2..udp_offset + 4].copy_from_slice(&dst_port.to_be_bytes());
    buffer[udp_offset + 4..udp_offset + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buffer[udp_offset + UDP_HEADER_LEN..].copy_from_slice(payload);

    let udp_checksum = checksum::udp_ipv6(src, dst, &buffer[udp_offset..]);
    buffer[udp_offset + 6..udp_offset + 8].copy_from_slice(&udp_checksum.to_be_bytes());

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_response_carries_payload_and_swapped_ports() {
        let frame = build_udp_response(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            53,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            9999,
            b"answer",
        )
        .unwrap();
        assert_eq!(frame[9], 17);
        let udp_offset = 20;
        assert_eq!(&frame[udp_offset..udp_offset + 2], &53u16.to_be_bytes());
        assert_eq!(&frame[udp_offset + 2..udp_offset + 4], &9999u16.to_be_bytes());
        assert_eq!(&frame[udp_offset + 8..], b"answer");
    }

    #[test]
    fn mixed_families_are_rejected() {
        let result = build_udp_response(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            53,
            IpAddr::V6(Ipv6Addr::LOCALHOST),
            9999,
            b"x",
        );
        assert!(result.is_none());
    }
}
