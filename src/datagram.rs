//! # Wire Framing
//!
//! Every packet on the wire is a single [`Datagram`] with the fixed layout:
//!
//! ```ascii
//! offset        size  field
//! 0             1     header     bit 7 = direction (1 request, 0 response)
//!                                bits 0..6 = kind (probe = 1)
//! 1             20    cookie     opaque bytes
//! 21            20    source id  opaque bytes
//! 41            8     timestamp  little-endian u64, sender's nanoseconds since epoch
//! 49            ...   payload    kind-specific; probe payload is empty
//! ```
//!
//! The source address is never carried in the packet body; the decoder grafts
//! the address reported by the transport onto the decoded source peer. Future
//! request kinds fit in the header's low seven bits without a format change.

use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::{Cookie, NodeId, Peer, COOKIE_LEN, NODE_ID_LEN};

/// Largest packet this codec will emit. Chosen to fit a common MTU with PPPoE
/// overhead subtracted.
pub const MAX_DATAGRAM_SIZE: usize = 1460;

/// Header byte plus cookie, source id, and timestamp. Anything shorter cannot
/// be a datagram.
pub const MIN_DATAGRAM_SIZE: usize = 1 + COOKIE_LEN + NODE_ID_LEN + 8;

/// High bit of the header byte: set on requests, clear on responses.
const REQUEST_FLAG: u8 = 0x80;

const KIND_PROBE: u8 = 1;

/// A framing bound was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramError {
    /// Inbound buffer is too short to hold the fixed fields.
    ShortDatagram { len: usize },
    /// Encoding would exceed [`MAX_DATAGRAM_SIZE`].
    Oversize { len: usize },
}

impl fmt::Display for DatagramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatagramError::ShortDatagram { len } => {
                write!(f, "datagram too short: {len} bytes, need {MIN_DATAGRAM_SIZE}")
            }
            DatagramError::Oversize { len } => {
                write!(f, "datagram too large: {len} bytes, limit {MAX_DATAGRAM_SIZE}")
            }
        }
    }
}

impl std::error::Error for DatagramError {}

/// Request kind carried in the header's low seven bits.
///
/// Kinds this peer does not understand decode to `Unknown` and are dropped by
/// the request handler rather than failing the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Probe,
    Unknown(u8),
}

impl Kind {
    pub fn from_wire(byte: u8) -> Self {
        match byte & !REQUEST_FLAG {
            KIND_PROBE => Kind::Probe,
            other => Kind::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Kind::Probe => KIND_PROBE,
            Kind::Unknown(byte) => byte & !REQUEST_FLAG,
        }
    }
}

/// One decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub kind: Kind,
    pub is_request: bool,
    pub cookie: Cookie,
    pub source: Peer,
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Build a request datagram stamped with the current time.
    pub fn request(kind: Kind, cookie: Cookie, source: Peer, payload: Vec<u8>) -> Self {
        Self { kind, is_request: true, cookie, source, timestamp_ns: now_ns(), payload }
    }

    /// Build a response datagram stamped with the current time. The cookie
    /// must be the one from the request being answered.
    pub fn response(kind: Kind, cookie: Cookie, source: Peer, payload: Vec<u8>) -> Self {
        Self { kind, is_request: false, cookie, source, timestamp_ns: now_ns(), payload }
    }

    /// Serialize for transmission.
    pub fn encode(&self) -> Result<Vec<u8>, DatagramError> {
        let total = MIN_DATAGRAM_SIZE + self.payload.len();
        if total > MAX_DATAGRAM_SIZE {
            return Err(DatagramError::Oversize { len: total });
        }
        let mut buf = Vec::with_capacity(total);
        let mut header = self.kind.to_wire();
        if self.is_request {
            header |= REQUEST_FLAG;
        }
        buf.push(header);
        buf.extend_from_slice(self.cookie.as_bytes());
        buf.extend_from_slice(self.source.id.as_bytes());
        buf.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a received buffer. `src` is the transport-reported sender
    /// address and becomes the source peer's address.
    pub fn decode(buf: &[u8], src: SocketAddr) -> Result<Self, DatagramError> {
        if buf.len() < MIN_DATAGRAM_SIZE {
            return Err(DatagramError::ShortDatagram { len: buf.len() });
        }
        let header = buf[0];
        let mut p = 1;

        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&buf[p..p + COOKIE_LEN]);
        p += COOKIE_LEN;

        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&buf[p..p + NODE_ID_LEN]);
        p += NODE_ID_LEN;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[p..p + 8]);
        p += 8;

        Ok(Self {
            kind: Kind::from_wire(header),
            is_request: header & REQUEST_FLAG != 0,
            cookie: Cookie::from_bytes(cookie),
            source: Peer::new(NodeId::from_bytes(id), src),
            timestamp_ns: u64::from_le_bytes(ts),
            payload: buf[p..].to_vec(),
        })
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> Peer {
        let mut id = [0u8; NODE_ID_LEN];
        id[0] = 0x42;
        id[NODE_ID_LEN - 1] = 0x99;
        Peer::new(NodeId::from_bytes(id), "10.0.0.1:54321".parse().unwrap())
    }

    fn sample_cookie() -> Cookie {
        Cookie::from_bytes([7u8; COOKIE_LEN])
    }

    #[test]
    fn round_trips_with_transport_address_grafted() {
        let original = Datagram::request(
            Kind::Probe,
            sample_cookie(),
            sample_peer(),
            b"hello".to_vec(),
        );
        let wire = original.encode().expect("encode");
        let observed: SocketAddr = "192.0.2.20:1111".parse().unwrap();
        let decoded = Datagram::decode(&wire, observed).expect("decode");

        assert_eq!(decoded.kind, original.kind);
        assert_eq!(decoded.is_request, original.is_request);
        assert_eq!(decoded.cookie, original.cookie);
        assert_eq!(decoded.source.id, original.source.id);
        assert_eq!(decoded.source.addr, observed, "address comes from the transport");
        assert_eq!(decoded.timestamp_ns, original.timestamp_ns);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn empty_probe_is_exactly_minimum_size() {
        let wire = Datagram::request(Kind::Probe, sample_cookie(), sample_peer(), Vec::new())
            .encode()
            .expect("encode");
        assert_eq!(wire.len(), MIN_DATAGRAM_SIZE);

        let src = "127.0.0.1:1".parse().unwrap();
        let decoded = Datagram::decode(&wire, src).expect("minimum-size buffer must decode");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn one_byte_short_is_rejected() {
        let wire = Datagram::request(Kind::Probe, sample_cookie(), sample_peer(), Vec::new())
            .encode()
            .expect("encode");
        let src = "127.0.0.1:1".parse().unwrap();
        let err = Datagram::decode(&wire[..wire.len() - 1], src).unwrap_err();
        assert_eq!(err, DatagramError::ShortDatagram { len: MIN_DATAGRAM_SIZE - 1 });
    }

    #[test]
    fn oversize_payload_is_rejected() {
        let fits = MAX_DATAGRAM_SIZE - MIN_DATAGRAM_SIZE;
        let ok = Datagram::request(Kind::Probe, sample_cookie(), sample_peer(), vec![0; fits]);
        assert_eq!(ok.encode().expect("at the limit").len(), MAX_DATAGRAM_SIZE);

        let over = Datagram::request(Kind::Probe, sample_cookie(), sample_peer(), vec![0; fits + 1]);
        assert_eq!(
            over.encode().unwrap_err(),
            DatagramError::Oversize { len: MAX_DATAGRAM_SIZE + 1 }
        );
    }

    #[test]
    fn header_packs_direction_and_kind() {
        let request = Datagram::request(Kind::Probe, sample_cookie(), sample_peer(), Vec::new());
        assert_eq!(request.encode().expect("encode")[0], 0x81);

        let response = Datagram::response(Kind::Probe, sample_cookie(), sample_peer(), Vec::new());
        assert_eq!(response.encode().expect("encode")[0], 0x01);
    }

    #[test]
    fn unknown_kinds_survive_the_wire() {
        let datagram = Datagram::request(Kind::Unknown(0x3f), sample_cookie(), sample_peer(), Vec::new());
        let wire = datagram.encode().expect("encode");
        let decoded = Datagram::decode(&wire, "127.0.0.1:1".parse().unwrap()).expect("decode");
        assert_eq!(decoded.kind, Kind::Unknown(0x3f));
        assert!(decoded.is_request);
    }
}
