//! # Identifiers and Peer Descriptors
//!
//! This module defines the core identity types:
//!
//! - [`NodeId`]: 20-byte opaque identifier naming a peer
//! - [`Cookie`]: 20-byte random value correlating a response to a prior request
//! - [`Peer`]: an identifier plus the UDP address it was last seen at
//!
//! Identifiers are compared by equality and by common-prefix length, which
//! serves as the bucket index in the routing table. Peers compare equal on
//! identifier alone; the address is updated in place when the same identifier
//! reappears elsewhere.
//!
//! The textual peer form is base64 of `id || ipv4 || port_le16`, compact
//! enough to paste into a terminal when introducing two peers to each other.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Length of a node identifier in bytes.
pub const NODE_ID_LEN: usize = 20;

/// Length of a request cookie in bytes.
pub const COOKIE_LEN: usize = 20;

/// Decoded length of a peer string: identifier, IPv4 octets, port.
pub const PEER_STRING_RAW_LEN: usize = NODE_ID_LEN + 4 + 2;

/// The system CSPRNG could not produce bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RngError {
    pub code: Option<u32>,
}

impl fmt::Display for RngError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "CSPRNG unavailable (error code {})", code),
            None => write!(f, "CSPRNG unavailable"),
        }
    }
}

impl std::error::Error for RngError {}

impl From<getrandom::Error> for RngError {
    fn from(err: getrandom::Error) -> Self {
        Self { code: Some(err.code().get()) }
    }
}

/// A peer string could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedPeer(&'static str);

impl fmt::Display for MalformedPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed peer string: {}", self.0)
    }
}

impl std::error::Error for MalformedPeer {}

/// Number of leading bits shared by two equal-length byte strings, counting
/// from the most significant bit of the first byte.
///
/// Returns `None` when the lengths differ.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> Option<usize> {
    if a.len() != b.len() {
        return None;
    }
    let mut count = 0;
    for (x, y) in a.iter().zip(b) {
        let diff = x ^ y;
        count += diff.leading_zeros() as usize;
        if diff != 0 {
            break;
        }
    }
    Some(count)
}

/// Opaque 20-byte identifier naming a peer.
///
/// Generated from the system CSPRNG on first start and persisted with the
/// routing table thereafter.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Draw a fresh identifier from the system CSPRNG.
    pub fn random() -> Result<Self, RngError> {
        let mut bytes = [0u8; NODE_ID_LEN];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Common-prefix length with another identifier, in bits.
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        common_prefix_len(&self.0, &other.0).expect("node ids are fixed-width")
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Opaque 20-byte random value correlating a response to a prior request.
///
/// Any peer can learn our identifier; only the peer we addressed sees the
/// cookie, so a response carrying it cannot be trivially forged.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie([u8; COOKIE_LEN]);

impl Cookie {
    pub fn from_bytes(bytes: [u8; COOKIE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; COOKIE_LEN] {
        &self.0
    }

    /// Draw a fresh cookie from the system CSPRNG.
    pub fn random() -> Result<Self, RngError> {
        let mut bytes = [0u8; COOKIE_LEN];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// A remote peer: identifier plus the transport address it was last seen at.
///
/// Equality and hashing consider the identifier only. The address is mutated
/// in place when a newer datagram from the same identifier arrives from
/// somewhere else.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    /// Textual form: base64 of `id || ipv4 || port_le16`.
    ///
    /// Only IPv4 addresses have a wire representation.
    pub fn to_base64(&self) -> Result<String, MalformedPeer> {
        let ip = match self.addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return Err(MalformedPeer("address is not IPv4")),
        };
        let mut raw = Vec::with_capacity(PEER_STRING_RAW_LEN);
        raw.extend_from_slice(self.id.as_bytes());
        raw.extend_from_slice(&ip.octets());
        raw.extend_from_slice(&self.addr.port().to_le_bytes());
        Ok(BASE64.encode(raw))
    }

    /// Inverse of [`Peer::to_base64`].
    pub fn from_base64(s: &str) -> Result<Self, MalformedPeer> {
        let raw = BASE64
            .decode(s.trim())
            .map_err(|_| MalformedPeer("not valid base64"))?;
        if raw.len() != PEER_STRING_RAW_LEN {
            return Err(MalformedPeer("decoded length mismatch"));
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&raw[..NODE_ID_LEN]);
        let ip = Ipv4Addr::new(
            raw[NODE_ID_LEN],
            raw[NODE_ID_LEN + 1],
            raw[NODE_ID_LEN + 2],
            raw[NODE_ID_LEN + 3],
        );
        let port = u16::from_le_bytes([raw[NODE_ID_LEN + 4], raw[NODE_ID_LEN + 5]]);
        Ok(Self {
            id: NodeId::from_bytes(id),
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        })
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.id, self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn id_with(first: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = first;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn cpl_counts_leading_matching_bits() {
        assert_eq!(common_prefix_len(&[0x00], &[0x00]), Some(8));
        assert_eq!(common_prefix_len(&[0x00], &[0x80]), Some(0));
        assert_eq!(common_prefix_len(&[0x00], &[0x40]), Some(1));
        assert_eq!(common_prefix_len(&[0x00], &[0x01]), Some(7));
        assert_eq!(common_prefix_len(&[0xf0, 0x00], &[0xf0, 0x80]), Some(8));
        assert_eq!(common_prefix_len(&[0xf0, 0x0f], &[0xf0, 0x0f]), Some(16));
    }

    #[test]
    fn cpl_rejects_length_mismatch() {
        assert_eq!(common_prefix_len(&[0x00], &[0x00, 0x00]), None);
        assert_eq!(common_prefix_len(&[], &[0x00]), None);
    }

    #[test]
    fn node_id_cpl_spans_full_width() {
        let zero = id_with(0x00);
        assert_eq!(zero.common_prefix_len(&zero), NODE_ID_LEN * 8);
        assert_eq!(zero.common_prefix_len(&id_with(0x80)), 0);
        assert_eq!(zero.common_prefix_len(&id_with(0x20)), 2);
    }

    #[test]
    fn random_ids_are_distinct() {
        let a = NodeId::random().expect("rng");
        let b = NodeId::random().expect("rng");
        assert_ne!(a, b, "two fresh ids should not collide");
        assert_eq!(format!("{a}").len(), NODE_ID_LEN * 2);
    }

    #[test]
    fn peer_string_round_trips() {
        let peer = Peer::new(id_with(0xab), "192.0.2.7:54321".parse().unwrap());
        let text = peer.to_base64().expect("encode");
        let decoded = Peer::from_base64(&text).expect("decode");
        assert_eq!(decoded.id, peer.id);
        assert_eq!(decoded.addr, peer.addr);
    }

    #[test]
    fn peer_string_rejects_bad_input() {
        assert!(Peer::from_base64("not base64 at all!").is_err());
        // Valid base64 of the wrong decoded length.
        let short = BASE64.encode([0u8; 10]);
        assert!(Peer::from_base64(&short).is_err());
        let long = BASE64.encode([0u8; PEER_STRING_RAW_LEN + 1]);
        assert!(Peer::from_base64(&long).is_err());
    }

    #[test]
    fn peer_string_requires_ipv4() {
        let peer = Peer::new(id_with(1), "[::1]:54321".parse().unwrap());
        assert!(peer.to_base64().is_err());
    }

    #[test]
    fn peer_identity_ignores_address() {
        let a = Peer::new(id_with(1), "127.0.0.1:1000".parse().unwrap());
        let b = Peer::new(id_with(1), "127.0.0.1:2000".parse().unwrap());
        let c = Peer::new(id_with(2), "127.0.0.1:1000".parse().unwrap());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b), "hash must follow identifier equality");
    }
}
