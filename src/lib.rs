//! # Murmur - Kademlia-style DHT peer
//!
//! Murmur maintains a routing table of remote peers organized by XOR distance
//! to its own identifier, exchanges short datagrams over UDP to verify
//! liveness, and correlates responses to outstanding requests via per-request
//! cookies that age out.
//!
//! ## Architecture
//!
//! Three subsystems carry the interesting correctness properties:
//!
//! - **Routing table**: prefix-indexed buckets with least-recently-seen
//!   eviction and on-demand splitting of the bucket that straddles the local
//!   identifier's prefix
//! - **Cookie table**: maps per-request cookies to single-shot reply sinks,
//!   with a background sweep that ages entries out
//! - **Datagram plane**: packet framing, the receive-dispatch loop, and the
//!   liveness-probe RPC that ties the other two together
//!
//! Inbound packets are decoded, their source peer is (asynchronously) welcomed
//! into the routing table, and the packet is classified: requests go to the
//! per-kind handler queue, responses are matched against the cookie table and
//! delivered to the waiting caller.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `identity` | Node identifiers, cookies, common-prefix distance, peer descriptors |
//! | `datagram` | Wire framing: kind/direction header, cookie, source id, timestamp |
//! | `cookies` | Request/response correlation with age-based eviction |
//! | `routing` | XOR-metric bucket tree with split-or-probe insertion |
//! | `server` | UDP receive loop, request/response handlers, probe RPC |
//! | `admin` | Local admin plane over a Unix socket |
//! | `persist` | Routing-table snapshots on disk |

pub mod admin;
pub mod cookies;
pub mod datagram;
pub mod identity;
pub mod persist;
pub mod routing;
pub mod server;

pub use identity::{Cookie, NodeId, Peer};
pub use routing::{Prober, RoutingTable, DEFAULT_K};
pub use server::Server;
