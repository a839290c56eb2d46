use super::*;

#[test]
fn empty_frame_is_rejected() {
    assert_eq!(parse_packet_validated(&[]), Err(ParseError::EmptyPacket));
}

#[test]
fn malformed_ip_version_nibble_is_rejected() {
    let frame = [0x90u8; 20];
    assert_eq!(
        parse_packet_validated(&frame),
        Err(ParseError::UnsupportedIpVersion(9))
    );
}

#[test]
fn truncated_ipv4_header_is_rejected() {
    let frame = [0x45u8; 10];
    assert_eq!(
        parse_packet_validated(&frame),
        Err(ParseError::MalformedIpv4Header)
    );
}

#[test]
fn well_formed_tcp_segment_parses() {
    let mut frame = vec![0u8; 20 + 20];
    frame[0] = 0x45;
    let frame_len = frame.len() as u16;
    frame[2..4].copy_from_slice(&frame_len.to_be_bytes());
    frame[9] = 6; // TCP
    frame[12..16].copy_from_slice(&[10, 0, 0, 2]);
    frame[16..20].copy_from_slice(&[10, 0, 0, 1]);
    let tcp = &mut frame[20..];
    tcp[0..2].copy_from_slice(&1234u16.to_be_bytes());
    tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = 0x02; // SYN

    match parse_packet_validated(&frame).unwrap() {
        ParsedPacket::Tcp(pkt) => {
            assert_eq!(pkt.src_port, 1234);
            assert_eq!(pkt.dst_port, 443);
            assert!(pkt.flags.syn);
        }
        _ => panic!("expected tcp packet"),
    }
}

#[tokio::test]
async fn push_inbound_rejects_malformed_frame() {
    let wake = Arc::new(Notify::new());
    let device = TunDevice::new(DEFAULT_MTU, wake, DEFAULT_RING_CAPACITY);
    let handle = device.handle();
    assert!(!handle.push_inbound(&[0xFFu8; 4]));
    assert_eq!(handle.inbound_queue_len(), 0);
}

#[tokio::test]
async fn push_inbound_accepts_valid_frame() {
    let wake = Arc::new(Notify::new());
    let device = TunDevice::new(DEFAULT_MTU, wake, DEFAULT_RING_CAPACITY);
    let handle = device.handle();
    let mut frame = vec![0u8; 20];
    frame[0] = 0x45;
    frame[2..4].copy_from_slice(&20u16.to_be_bytes());
    assert!(handle.push_inbound(&frame));
    assert_eq!(handle.inbound_queue_len(), 1);
}
