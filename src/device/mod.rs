//! Ingress/egress adapters (components B and C) plus the shared ring buffer
//! smoltcp drives as its `Device`. Frames enter via [`TunHandle::push_inbound`]
//! (ingress: validate, copy, enqueue) and leave via [`TunHandle::drain_outbound`]
//! (egress: drain what the stack engine produced after releasing the stack lock).

use parking_lot::Mutex;
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::sync::Notify;

pub const DEFAULT_MTU: usize = 1500;
pub const DEFAULT_RING_CAPACITY: usize = 512;
pub const MAX_EMIT_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    EmptyPacket,
    UnsupportedIpVersion(u8),
    MalformedIpv4Header,
    MalformedIpv6Header,
    MalformedTcpSegment,
    MalformedUdpDatagram,
}

impl ParseError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::EmptyPacket => "empty packet",
            Self::UnsupportedIpVersion(_) => "unsupported IP version",
            Self::MalformedIpv4Header => "malformed IPv4 header",
            Self::MalformedIpv6Header => "malformed IPv6 header",
            Self::MalformedTcpSegment => "malformed TCP segment",
            Self::MalformedUdpDatagram => "malformed UDP datagram",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPacket<'a> {
    Tcp(TcpPacket<'a>),
    Udp(UdpPacket<'a>),
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TcpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UdpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

struct SharedRing {
    inbound: VecDeque<Vec<u8>>,
    outbound: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl SharedRing {
    fn new(capacity: usize) -> Self {
        Self {
            inbound: VecDeque::with_capacity(capacity),
            outbound: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

/// Device exposed to smoltcp. Cheap to clone; all state lives behind the
/// shared ring.
#[derive(Clone)]
pub struct TunDevice {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

/// Handle used by the ingress/egress adapters to push inbound frames or drain
/// outbound frames without borrowing the smoltcp device mutably.
#[derive(Clone)]
pub struct TunHandle {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
}

impl TunDevice {
    pub fn new(mtu: usize, wake: Arc<Notify>, ring_capacity: usize) -> Self {
        let capacity = ring_capacity.max(16);
        Self {
            inner: Arc::new(Mutex::new(SharedRing::new(capacity))),
            wake,
            mtu: mtu.max(576),
        }
    }

    pub fn handle(&self) -> TunHandle {
        TunHandle {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
        }
    }

    pub fn device_capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = self.mtu;
        caps.medium = Medium::Ip;
        caps
    }
}

impl TunHandle {
    /// Ingress adapter. Validates the frame (peek version,
    /// reject empty) then enqueues a copy for the stack engine to consume on
    /// its next poll. Returns `false` if the frame fails validation.
    pub fn push_inbound(&self, packet: &[u8]) -> bool {
        if packet.is_empty() {
            return true;
        }
        if !Self::validate_packet(packet) {
            return false;
        }
        let mut guard = self.inner.lock();
        if guard.inbound.len() >= guard.capacity {
            guard.inbound.pop_front();
        }
        let capped = packet.len().min(self.mtu);
        guard.inbound.push_back(packet[..capped].to_vec());
        drop(guard);
        self.wake.notify_one();
        true
    }

    fn validate_packet(packet: &[u8]) -> bool {
        if packet.is_empty() {
            return false;
        }
        match packet[0] >> 4 {
            4 => Self::validate_ipv4(packet),
            6 => Self::validate_ipv6(packet),
            _ => false,
        }
    }

    fn validate_ipv4(packet: &[u8]) -> bool {
        if packet.len() < 20 {
            return false;
        }
        let ihl = (packet[0] & 0x0F) as usize;
        let header_len = ihl * 4;
        if ihl < 5 || header_len > packet.len() {
            return false;
        }
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        total_len >= header_len && total_len <= packet.len()
    }

    fn validate_ipv6(packet: &[u8]) -> bool {
        if packet.len() < 40 {
            return false;
        }
        let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
        40 + payload_len <= packet.len()
    }

    /// Egress adapter. Drains up to `MAX_EMIT_BATCH` outbound
    /// frames produced by the stack engine. Called after the stack lock is
    /// released so the `OutputFn` sink never runs under it.
    pub fn drain_outbound(&self) -> Vec<Vec<u8>> {
        let mut guard = self.inner.lock();
        let drain_count = MAX_EMIT_BATCH.min(guard.outbound.len());
        guard.outbound.drain(..drain_count).collect()
    }

    pub fn inbound_queue_len(&self) -> usize {
        self.inner.lock().inbound.len()
    }

    /// Pushes a pre-built reply frame straight onto the outbound ring,
    /// bypassing smoltcp sockets entirely. Used for UDP replies that smoltcp's
    /// per-endpoint socket binding cannot address correctly (see `reply.rs`).
    pub fn push_outbound(&self, frame: Vec<u8>) {
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= guard.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(frame);
        drop(guard);
        self.wake.notify_one();
    }
}

impl Device for TunDevice {
    type RxToken<'a>
        = TunRxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TunTxToken
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let mut guard = self.inner.lock();
        let capacity = guard.capacity;
        guard.inbound.pop_front().map(|packet| {
            let rx = TunRxToken { buffer: packet };
            let tx = TunTxToken {
                inner: Arc::clone(&self.inner),
                wake: Arc::clone(&self.wake),
                mtu: self.mtu,
                capacity,
            };
            (rx, tx)
        })
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        let capacity = self.inner.lock().capacity;
        Some(TunTxToken {
            inner: Arc::clone(&self.inner),
            wake: Arc::clone(&self.wake),
            mtu: self.mtu,
            capacity,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.device_capabilities()
    }
}

pub struct TunRxToken {
    buffer: Vec<u8>,
}

pub struct TunTxToken {
    inner: Arc<Mutex<SharedRing>>,
    wake: Arc<Notify>,
    mtu: usize,
    capacity: usize,
}

impl RxToken for TunRxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = self.buffer;
        f(&mut buffer)
    }
}

impl TxToken for TunTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len.min(self.mtu)];
        let result = f(&mut frame);
        strip_unnegotiated_ecn(&mut frame);
        let mut guard = self.inner.lock();
        if guard.outbound.len() >= self.capacity {
            guard.outbound.pop_front();
        }
        guard.outbound.push_back(frame);
        self.wake.notify_one();
        result
    }
}

/// Strips ECE/CWR from outbound IPv4 SYN-ACK frames. smoltcp never negotiates
/// ECN, so peers that reject an ECN-flagged SYN-ACK from a stack that never
/// offered ECN in the SYN would otherwise see a broken handshake.
fn strip_unnegotiated_ecn(frame: &mut [u8]) {
    if frame.len() < 40 {
        return;
    }
    let version = frame[0] >> 4;
    if version != 4 || frame[9] != 6 {
        return;
    }
    let header_len = ((frame[0] & 0x0F) as usize) * 4;
    if frame.len() < header_len + 20 {
        return;
    }
    let flags = frame[header_len + 13];
    let is_syn_ack = (flags & 0x12) == 0x12;
    let has_ecn = (flags & 0xC0) != 0;
    if is_syn_ack && has_ecn {
        frame[header_len + 13] &= !0xC0;
        recalculate_tcp_checksum_ipv4(frame, header_len);
    }
}

fn recalculate_tcp_checksum_ipv4(packet: &mut [u8], ip_header_len: usize) {
    if packet.len() < ip_header_len + 20 {
        return;
    }
    let ip_total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let tcp_len = ip_total_len.saturating_sub(ip_header_len);
    if tcp_len < 20 || packet.len() < ip_header_len + tcp_len {
        return;
    }
    let checksum_offset = ip_header_len + 16;
    packet[checksum_offset] = 0;
    packet[checksum_offset + 1] = 0;

    let mut sum: u32 = 0;
    sum += u32::from(u16::from_be_bytes([packet[12], packet[13]]));
    sum += u32::from(u16::from_be_bytes([packet[14], packet[15]]));
    sum += u32::from(u16::from_be_bytes([packet[16], packet[17]]));
    sum += u32::from(u16::from_be_bytes([packet[18], packet[19]]));
    sum += 6u32;
    sum += tcp_len as u32;

    let tcp_start = ip_header_len;
    let mut i = tcp_start;
    while i + 1 < packet.len() && i + 1 < tcp_start + tcp_len {
        sum += u32::from(u16::from_be_bytes([packet[i], packet[i + 1]]));
        i += 2;
    }
    if i < packet.len() && i < tcp_start + tcp_len {
        sum += u32::from(packet[i]) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    let checksum = (!sum as u16).to_be_bytes();
    packet[checksum_offset] = checksum[0];
    packet[checksum_offset + 1] = checksum[1];
}

/// Parses a raw frame into one of the transport-layer shapes the stack
/// engine understands, with a specific [`ParseError`] on malformed input.
pub fn parse_packet_validated(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.is_empty() {
        return Err(ParseError::EmptyPacket);
    }
    match packet[0] >> 4 {
        4 => parse_ipv4_validated(packet),
        6 => parse_ipv6_validated(packet),
        version => Err(ParseError::UnsupportedIpVersion(version)),
    }
}

fn parse_ipv4_validated(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 20 {
        return Err(ParseError::MalformedIpv4Header);
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(ParseError::MalformedIpv4Header);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len > packet.len() || total_len < header_len {
        return Err(ParseError::MalformedIpv4Header);
    }
    let protocol = packet[9];
    let src = IpAddr::V4(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]));
    let dst = IpAddr::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]));
    let payload = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp_validated(src, dst, payload),
        17 => parse_udp_validated(src, dst, payload),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_ipv6_validated(packet: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if packet.len() < 40 {
        return Err(ParseError::MalformedIpv6Header);
    }
    let next_header = packet[6];
    let payload_len = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if 40 + payload_len > packet.len() {
        return Err(ParseError::MalformedIpv6Header);
    }
    let src = IpAddr::V6(Ipv6Addr::new(
        u16::from_be_bytes([packet[8], packet[9]]),
        u16::from_be_bytes([packet[10], packet[11]]),
        u16::from_be_bytes([packet[12], packet[13]]),
        u16::from_be_bytes([packet[14], packet[15]]),
        u16::from_be_bytes([packet[16], packet[17]]),
        u16::from_be_bytes([packet[18], packet[19]]),
        u16::from_be_bytes([packet[20], packet[21]]),
        u16::from_be_bytes([packet[22], packet[23]]),
    ));
    let dst = IpAddr::V6(Ipv6Addr::new(
        u16::from_be_bytes([packet[24], packet[25]]),
        u16::from_be_bytes([packet[26], packet[27]]),
        u16::from_be_bytes([packet[28], packet[29]]),
        u16::from_be_bytes([packet[30], packet[31]]),
        u16::from_be_bytes([packet[32], packet[33]]),
        u16::from_be_bytes([packet[34], packet[35]]),
        u16::from_be_bytes([packet[36], packet[37]]),
        u16::from_be_bytes([packet[38], packet[39]]),
    ));
    let payload = &packet[40..40 + payload_len];
    match next_header {
        6 => parse_tcp_validated(src, dst, payload),
        17 => parse_udp_validated(src, dst, payload),
        _ => Ok(ParsedPacket::Other),
    }
}

fn parse_tcp_validated(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if payload.len() < 20 {
        return Err(ParseError::MalformedTcpSegment);
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let seq_number = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let ack_number = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    let data_offset = usize::from(payload[12] >> 4) * 4;
    if data_offset < 20 || data_offset > payload.len() {
        return Err(ParseError::MalformedTcpSegment);
    }
    let flags_byte = payload[13];
    let flags = TcpFlags {
        syn: flags_byte & 0x02 != 0,
        ack: flags_byte & 0x10 != 0,
        fin: flags_byte & 0x01 != 0,
        rst: flags_byte & 0x04 != 0,
    };
    Ok(ParsedPacket::Tcp(TcpPacket {
        src,
        dst,
        src_port,
        dst_port,
        seq_number,
        ack_number,
        flags,
        payload: &payload[data_offset..],
    }))
}

fn parse_udp_validated(src: IpAddr, dst: IpAddr, payload: &[u8]) -> Result<ParsedPacket<'_>, ParseError> {
    if payload.len() < 8 {
        return Err(ParseError::MalformedUdpDatagram);
    }
    let src_port = u16::from_be_bytes([payload[0], payload[1]]);
    let dst_port = u16::from_be_bytes([payload[2], payload[3]]);
    let length = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    if length < 8 || length > payload.len() {
        return Err(ParseError::MalformedUdpDatagram);
    }
    Ok(ParsedPacket::Udp(UdpPacket {
        src,
        dst,
        src_port,
        dst_port,
        payload: &payload[8..length],
    }))
}

#[cfg(test)]
mod tests;
