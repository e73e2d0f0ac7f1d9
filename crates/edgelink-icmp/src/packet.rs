//! ICMP echo encoding and reply parsing
//!
//! Datagram ICMP sockets exchange bare ICMP messages (no IP header), so the
//! codec here covers only the 8-byte echo header plus payload. IPv4
//! checksums are computed here; IPv6 checksums cover a pseudo-header the
//! kernel fills in, so they are left zero on encode and not verified on
//! parse.

use crate::IcmpError;
use bytes::{BufMut, Bytes, BytesMut};
use std::net::IpAddr;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

/// Echo identity and payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub id: u16,
    pub seq: u16,
    pub payload: Bytes,
}

/// A parsed ICMP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpMessage {
    EchoRequest(IcmpEcho),
    EchoReply(IcmpEcho),
    /// Any non-echo type; the response listener skips these
    Other { icmp_type: u8 },
}

impl IcmpMessage {
    pub fn is_echo_reply(&self) -> bool {
        matches!(self, IcmpMessage::EchoReply(_))
    }
}

/// A client-visible echo packet with addressing, as carried by the
/// edge datagram session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub echo: IcmpEcho,
    pub is_reply: bool,
}

/// Encode an echo request for the wire.
pub fn encode_echo_request(echo: &IcmpEcho, v6: bool) -> Bytes {
    encode_echo(echo, if v6 { ICMPV6_ECHO_REQUEST } else { ICMPV4_ECHO_REQUEST }, v6)
}

/// Encode an echo reply for the wire.
pub fn encode_echo_reply(echo: &IcmpEcho, v6: bool) -> Bytes {
    encode_echo(echo, if v6 { ICMPV6_ECHO_REPLY } else { ICMPV4_ECHO_REPLY }, v6)
}

fn encode_echo(echo: &IcmpEcho, icmp_type: u8, v6: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(8 + echo.payload.len());
    buf.put_u8(icmp_type);
    buf.put_u8(0); // code
    buf.put_u16(0); // checksum placeholder
    buf.put_u16(echo.id);
    buf.put_u16(echo.seq);
    buf.put_slice(&echo.payload);

    if !v6 {
        let sum = checksum(&buf);
        buf[2] = (sum >> 8) as u8;
        buf[3] = sum as u8;
    }
    buf.freeze()
}

/// Parse a datagram read from an ICMP socket.
pub fn parse_message(buf: &[u8], v6: bool) -> Result<IcmpMessage, IcmpError> {
    if buf.len() < 8 {
        return Err(IcmpError::Malformed("short ICMP header"));
    }
    let icmp_type = buf[0];
    let (request, reply) = if v6 {
        (ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY)
    } else {
        (ICMPV4_ECHO_REQUEST, ICMPV4_ECHO_REPLY)
    };
    if icmp_type != request && icmp_type != reply {
        return Ok(IcmpMessage::Other { icmp_type });
    }
    if !v6 && checksum(buf) != 0 {
        return Err(IcmpError::Malformed("bad ICMP checksum"));
    }

    let echo = IcmpEcho {
        id: u16::from_be_bytes([buf[4], buf[5]]),
        seq: u16::from_be_bytes([buf[6], buf[7]]),
        payload: Bytes::copy_from_slice(&buf[8..]),
    };
    if icmp_type == reply {
        Ok(IcmpMessage::EchoReply(echo))
    } else {
        Ok(IcmpMessage::EchoRequest(echo))
    }
}

/// RFC 1071 internet checksum. Over a well-formed packet (checksum field
/// included) the result is zero.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo() -> IcmpEcho {
        IcmpEcho {
            id: 0xabcd,
            seq: 7,
            payload: Bytes::from_static(b"edgelink-probe"),
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let encoded = encode_echo_request(&echo(), false);
        match parse_message(&encoded, false).unwrap() {
            IcmpMessage::EchoRequest(parsed) => assert_eq!(parsed, echo()),
            other => panic!("expected echo request, got {other:?}"),
        }
    }

    #[test]
    fn test_reply_roundtrip() {
        let encoded = encode_echo_reply(&echo(), false);
        let msg = parse_message(&encoded, false).unwrap();
        assert!(msg.is_echo_reply());
        match msg {
            IcmpMessage::EchoReply(parsed) => {
                assert_eq!(parsed.id, 0xabcd);
                assert_eq!(parsed.seq, 7);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_v6_types() {
        let encoded = encode_echo_request(&echo(), true);
        assert_eq!(encoded[0], 128);
        match parse_message(&encoded, true).unwrap() {
            IcmpMessage::EchoRequest(parsed) => assert_eq!(parsed, echo()),
            other => panic!("expected echo request, got {other:?}"),
        }
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let encoded = encode_echo_request(&echo(), false);
        let mut corrupted = encoded.to_vec();
        corrupted[9] ^= 0xff;
        assert!(matches!(
            parse_message(&corrupted, false),
            Err(IcmpError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_echo_type_passes_through() {
        // Destination unreachable
        let raw = [3u8, 0, 0, 0, 0, 0, 0, 0];
        match parse_message(&raw, false).unwrap() {
            IcmpMessage::Other { icmp_type } => assert_eq!(icmp_type, 3),
            other => panic!("expected other, got {other:?}"),
        }
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(matches!(
            parse_message(&[8, 0, 0], false),
            Err(IcmpError::Malformed(_))
        ));
    }

    #[test]
    fn test_odd_length_checksum() {
        let odd = IcmpEcho {
            id: 1,
            seq: 2,
            payload: Bytes::from_static(b"xyz"),
        };
        let encoded = encode_echo_request(&odd, false);
        assert_eq!(checksum(&encoded), 0);
    }
}
