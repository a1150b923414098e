use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes, checksum};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;

/// Build an ICMP Echo Request with the given identifier and sequence.
///
/// Probes carry no payload: the 8-byte echo header is all that is needed for
/// correlation, and routers quote at least that much in Time Exceeded
/// messages (RFC 792).
pub fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE];

    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_icmp_type(IcmpTypes::EchoRequest);
    packet.set_icmp_code(IcmpCode::new(0));
    packet.set_identifier(identifier);
    packet.set_sequence_number(sequence);

    let cksum = checksum(&IcmpPacket::new(&buffer).unwrap());
    let mut packet = MutableEchoRequestPacket::new(&mut buffer).unwrap();
    packet.set_checksum(cksum);

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::correlate::validate_icmp_checksum;

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(1234, 5678);

        assert_eq!(packet.len(), ICMP_HEADER_SIZE);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 5678);
    }

    #[test]
    fn test_checksum_is_valid() {
        let packet = build_echo_request(0xABCD, 0x0102);

        let cksum = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(cksum, 0, "checksum should be computed");
        assert!(validate_icmp_checksum(&packet));
    }

    #[test]
    fn test_boundary_identifiers() {
        for (id, seq) in [(0u16, 0u16), (u16::MAX, u16::MAX), (1, u16::MAX)] {
            let packet = build_echo_request(id, seq);
            assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), id);
            assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), seq);
        }
    }
}
