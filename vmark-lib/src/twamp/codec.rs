//! RFC 5357 unauthenticated-mode PDU framing.
//!
//! Test packets carry NTP timestamps in network byte order; MBZ fields
//! are zero-filled on encode. The codec validates lengths in both
//! directions and refuses payloads above [`MAX_PADDING`] bytes.

use std::net::IpAddr;

use crate::error::{NodeError, Result};
use crate::twamp::time::NtpTimestamp;

/// Upper bound on padding bytes beyond the required fields.
pub const MAX_PADDING: usize = 9000;

/// Default Error Estimate: S=1 (synchronized), scale 0, multiplier 1.
pub const DEFAULT_ERROR_ESTIMATE: u16 = 0x8001;

/// Command number of Request-TW-Session (RFC 5357 §3.5).
const REQUEST_TW_SESSION: u8 = 5;

/// Sender test packet: `seq | timestamp | err_estimate | padding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderPacket {
    pub seq: u32,
    pub timestamp: NtpTimestamp,
    pub error_estimate: u16,
    pub padding: usize,
}

impl SenderPacket {
    pub const BASE_LEN: usize = 14;

    pub fn encode(&self) -> Result<Vec<u8>> {
        check_padding(self.padding)?;
        let mut buf = Vec::with_capacity(Self::BASE_LEN + self.padding);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_bytes());
        buf.extend_from_slice(&self.error_estimate.to_be_bytes());
        buf.resize(Self::BASE_LEN + self.padding, 0);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<SenderPacket> {
        check_length("sender test packet", buf.len(), Self::BASE_LEN)?;
        Ok(SenderPacket {
            seq: be_u32(&buf[0..4]),
            timestamp: ntp(&buf[4..12]),
            error_estimate: be_u16(&buf[12..14]),
            padding: buf.len() - Self::BASE_LEN,
        })
    }
}

/// Reflected test packet (RFC 5357 §4.2.1):
/// `seq | t3 | err | MBZ | t2 | sender_seq | t1 | sender_err | MBZ |
/// sender_ttl | padding`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflectedPacket {
    /// Reflector's own sequence number.
    pub seq: u32,
    /// Reflector transmit timestamp (t3).
    pub timestamp: NtpTimestamp,
    pub error_estimate: u16,
    /// Reflector receive timestamp (t2).
    pub receive_timestamp: NtpTimestamp,
    pub sender_seq: u32,
    /// Sender transmit timestamp echoed back (t1).
    pub sender_timestamp: NtpTimestamp,
    pub sender_error_estimate: u16,
    pub sender_ttl: u8,
    pub padding: usize,
}

impl ReflectedPacket {
    pub const BASE_LEN: usize = 41;

    pub fn encode(&self) -> Result<Vec<u8>> {
        check_padding(self.padding)?;
        let mut buf = Vec::with_capacity(Self::BASE_LEN + self.padding);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_bytes());
        buf.extend_from_slice(&self.error_estimate.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]); // MBZ
        buf.extend_from_slice(&self.receive_timestamp.to_bytes());
        buf.extend_from_slice(&self.sender_seq.to_be_bytes());
        buf.extend_from_slice(&self.sender_timestamp.to_bytes());
        buf.extend_from_slice(&self.sender_error_estimate.to_be_bytes());
        buf.extend_from_slice(&[0u8; 2]); // MBZ
        buf.push(self.sender_ttl);
        buf.resize(Self::BASE_LEN + self.padding, 0);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<ReflectedPacket> {
        check_length("reflected test packet", buf.len(), Self::BASE_LEN)?;
        Ok(ReflectedPacket {
            seq: be_u32(&buf[0..4]),
            timestamp: ntp(&buf[4..12]),
            error_estimate: be_u16(&buf[12..14]),
            receive_timestamp: ntp(&buf[16..24]),
            sender_seq: be_u32(&buf[24..28]),
            sender_timestamp: ntp(&buf[28..36]),
            sender_error_estimate: be_u16(&buf[36..38]),
            sender_ttl: buf[40],
            padding: buf.len() - Self::BASE_LEN,
        })
    }
}

/// Request-TW-Session control message (RFC 5357 §3.5, unauthenticated:
/// the HMAC field is zero-filled). IPv4 addresses occupy the low four
/// bytes of the 16-byte address fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTwSession {
    pub ipvn: u8,
    pub num_packets: u32,
    pub sender_port: u16,
    pub receiver_port: u16,
    pub sender_address: Option<IpAddr>,
    pub receiver_address: Option<IpAddr>,
    pub sid: [u8; 16],
    pub padding_length: u32,
    pub start_time: NtpTimestamp,
    pub timeout: u32,
    pub type_p: u8,
}

impl RequestTwSession {
    pub const LEN: usize = 105;

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.ipvn != 4 && self.ipvn != 6 {
            return Err(NodeError::invalid(format!("ipvn must be 4 or 6, got {}", self.ipvn)));
        }
        for (field, addr) in
            [("sender_address", self.sender_address), ("receiver_address", self.receiver_address)]
        {
            match (self.ipvn, addr) {
                (4, Some(IpAddr::V6(_))) | (6, Some(IpAddr::V4(_))) => {
                    return Err(NodeError::invalid(format!(
                        "{field} does not match ipvn {}",
                        self.ipvn
                    )))
                }
                _ => {}
            }
        }
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.push(REQUEST_TW_SESSION);
        buf.push(self.ipvn & 0x0F); // MBZ high nibble | IPVN
        buf.push(0); // Conf-Sender: reflector both receives and sends
        buf.push(0); // Conf-Receiver
        buf.extend_from_slice(&0u32.to_be_bytes()); // Schedule-Slots
        buf.extend_from_slice(&self.num_packets.to_be_bytes());
        buf.extend_from_slice(&self.sender_port.to_be_bytes());
        buf.extend_from_slice(&self.receiver_port.to_be_bytes());
        buf.extend_from_slice(&address_bytes(self.sender_address));
        buf.extend_from_slice(&address_bytes(self.receiver_address));
        buf.extend_from_slice(&self.sid);
        buf.extend_from_slice(&self.padding_length.to_be_bytes());
        buf.extend_from_slice(&self.start_time.to_bytes());
        buf.extend_from_slice(&self.timeout.to_be_bytes());
        buf.push(self.type_p);
        buf.extend_from_slice(&[0u8; 8]); // MBZ
        buf.extend_from_slice(&[0u8; 16]); // HMAC, zero in unauthenticated mode
        debug_assert_eq!(buf.len(), Self::LEN);
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<RequestTwSession> {
        if buf.len() != Self::LEN {
            return Err(NodeError::invalid(format!(
                "Request-TW-Session must be {} bytes, got {}",
                Self::LEN,
                buf.len()
            )));
        }
        if buf[0] != REQUEST_TW_SESSION {
            return Err(NodeError::invalid(format!(
                "unexpected control command {}, want {REQUEST_TW_SESSION}",
                buf[0]
            )));
        }
        let ipvn = buf[1] & 0x0F;
        if ipvn != 4 && ipvn != 6 {
            return Err(NodeError::invalid(format!("ipvn must be 4 or 6, got {ipvn}")));
        }
        let mut sid = [0u8; 16];
        sid.copy_from_slice(&buf[48..64]);
        Ok(RequestTwSession {
            ipvn,
            num_packets: be_u32(&buf[8..12]),
            sender_port: be_u16(&buf[12..14]),
            receiver_port: be_u16(&buf[14..16]),
            sender_address: decode_address(ipvn, &buf[16..32]),
            receiver_address: decode_address(ipvn, &buf[32..48]),
            sid,
            padding_length: be_u32(&buf[64..68]),
            start_time: ntp(&buf[68..76]),
            timeout: be_u32(&buf[76..80]),
            type_p: buf[80],
        })
    }
}

fn address_bytes(addr: Option<IpAddr>) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    match addr {
        Some(IpAddr::V4(v4)) => bytes[12..16].copy_from_slice(&v4.octets()),
        Some(IpAddr::V6(v6)) => bytes = v6.octets(),
        None => {}
    }
    bytes
}

fn decode_address(ipvn: u8, bytes: &[u8]) -> Option<IpAddr> {
    if bytes.iter().all(|b| *b == 0) {
        return None;
    }
    if ipvn == 4 {
        let mut octets = [0u8; 4];
        octets.copy_from_slice(&bytes[12..16]);
        Some(IpAddr::from(octets))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(bytes);
        Some(IpAddr::from(octets))
    }
}

fn check_padding(padding: usize) -> Result<()> {
    if padding > MAX_PADDING {
        return Err(NodeError::invalid(format!(
            "padding {padding} exceeds the {MAX_PADDING} byte limit"
        )));
    }
    Ok(())
}

fn check_length(what: &str, len: usize, base: usize) -> Result<()> {
    if len < base {
        return Err(NodeError::invalid(format!("{what} too short: {len} < {base} bytes")));
    }
    if len > base + MAX_PADDING {
        return Err(NodeError::invalid(format!(
            "{what} oversized: {len} > {} bytes",
            base + MAX_PADDING
        )));
    }
    Ok(())
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn ntp(b: &[u8]) -> NtpTimestamp {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    NtpTimestamp::from_bytes(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ts(seconds: u32, fraction: u32) -> NtpTimestamp {
        NtpTimestamp { seconds, fraction }
    }

    #[test]
    fn sender_packet_roundtrip() {
        let pkt = SenderPacket {
            seq: 42,
            timestamp: ts(1000, 0x4000_0000),
            error_estimate: DEFAULT_ERROR_ESTIMATE,
            padding: 32,
        };
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes.len(), SenderPacket::BASE_LEN + 32);
        assert_eq!(SenderPacket::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn reflected_packet_roundtrip_preserves_sender_fields() {
        let pkt = ReflectedPacket {
            seq: 7,
            timestamp: ts(2000, 1),
            error_estimate: DEFAULT_ERROR_ESTIMATE,
            receive_timestamp: ts(1999, 2),
            sender_seq: 42,
            sender_timestamp: ts(1998, 3),
            sender_error_estimate: 0x8002,
            sender_ttl: 64,
            padding: 0,
        };
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes.len(), ReflectedPacket::BASE_LEN);
        // MBZ fields are zero on the wire.
        assert_eq!(&bytes[14..16], &[0, 0]);
        assert_eq!(&bytes[38..40], &[0, 0]);

        let decoded = ReflectedPacket::decode(&bytes).unwrap();
        assert_eq!(decoded, pkt);
        assert_eq!(decoded.sender_seq, 42);
        assert_eq!(decoded.sender_timestamp, ts(1998, 3));
    }

    #[test]
    fn rejects_oversized_padding() {
        let pkt = SenderPacket {
            seq: 0,
            timestamp: ts(0, 0),
            error_estimate: 0,
            padding: MAX_PADDING + 1,
        };
        assert!(pkt.encode().is_err());
    }

    #[test]
    fn rejects_truncated_reflection() {
        let buf = [0u8; ReflectedPacket::BASE_LEN - 1];
        assert!(ReflectedPacket::decode(&buf).is_err());
    }

    #[test]
    fn request_tw_session_roundtrip() {
        let req = RequestTwSession {
            ipvn: 4,
            num_packets: 100,
            sender_port: 4000,
            receiver_port: 5000,
            sender_address: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            receiver_address: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))),
            sid: [9u8; 16],
            padding_length: 64,
            start_time: ts(3_900_000_000, 0),
            timeout: 10,
            type_p: 0x2E, // EF DSCP
        };
        let bytes = req.encode().unwrap();
        assert_eq!(bytes.len(), RequestTwSession::LEN);
        // HMAC tail is zero in unauthenticated mode.
        assert!(bytes[89..].iter().all(|b| *b == 0));
        assert_eq!(RequestTwSession::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn request_rejects_family_mismatch() {
        let req = RequestTwSession {
            ipvn: 6,
            num_packets: 1,
            sender_port: 1,
            receiver_port: 2,
            sender_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            receiver_address: None,
            sid: [0; 16],
            padding_length: 0,
            start_time: ts(0, 0),
            timeout: 0,
            type_p: 0,
        };
        assert!(req.encode().is_err());
    }
}
