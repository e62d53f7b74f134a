//! # Routing Table
//!
//! A prefix-indexed family of bounded buckets. A peer whose identifier shares
//! `i` leading bits with ours lives in bucket `min(i, max_index)`; the bucket
//! at `max_index` is the frontier, the only one still eligible to split.
//! Buckets are materialized lazily, one split at a time.
//!
//! Within a bucket, the front is the least-recently-refreshed peer and the
//! back the most-recently-refreshed. Insertion into a full bucket either
//! splits the frontier or challenges the oldest occupant with a liveness
//! probe: a responsive incumbent keeps its seat and the newcomer is dropped,
//! an unresponsive one is evicted.
//!
//! The whole tree sits behind one async mutex. The lock is never held across
//! the eviction probe; after the probe returns, the bucket is re-examined and
//! the insertion starts over if the state moved underneath it.

use std::cmp;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use anyhow::bail;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::identity::{NodeId, Peer, NODE_ID_LEN};
use crate::persist::{BucketSnapshot, TableSnapshot};

/// Bucket capacity.
pub const DEFAULT_K: usize = 8;

/// Deepest possible bucket slot plus one.
pub const MAX_BUCKETS: usize = NODE_ID_LEN * 8;

/// Liveness oracle consulted before evicting a bucket's oldest peer.
///
/// The server implements this with the probe RPC; tests substitute canned
/// answers to drive the eviction paths without a socket.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, peer: &Peer) -> bool;
}

/// `update` was called for an identifier its bucket does not hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPeer;

impl fmt::Display for UnknownPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no such peer in the routing table")
    }
}

impl std::error::Error for UnknownPeer {}

/// One bucket: refresh-ordered peers plus a membership index over their
/// identifiers. Both structures always describe the same set.
#[derive(Debug)]
struct Bucket {
    index: usize,
    order: VecDeque<Peer>,
    ids: HashSet<NodeId>,
}

impl Bucket {
    fn new(index: usize) -> Self {
        Self { index, order: VecDeque::new(), ids: HashSet::new() }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.ids.contains(id)
    }

    fn get(&self, id: &NodeId) -> Option<&Peer> {
        if !self.ids.contains(id) {
            return None;
        }
        self.order.iter().find(|peer| &peer.id == id)
    }

    fn front(&self) -> Option<&Peer> {
        self.order.front()
    }

    fn push_back(&mut self, peer: Peer) {
        self.ids.insert(peer.id);
        self.order.push_back(peer);
    }

    /// Refresh a known peer: adopt the newer address and move it to the back.
    fn touch(&mut self, id: &NodeId, addr: SocketAddr) -> bool {
        let Some(pos) = self.order.iter().position(|peer| &peer.id == id) else {
            return false;
        };
        let mut peer = self.order.remove(pos).expect("position is in range");
        peer.addr = addr;
        self.order.push_back(peer);
        true
    }

    fn move_to_back(&mut self, id: &NodeId) -> bool {
        let Some(pos) = self.order.iter().position(|peer| &peer.id == id) else {
            return false;
        };
        let peer = self.order.remove(pos).expect("position is in range");
        self.order.push_back(peer);
        true
    }

    fn remove(&mut self, id: &NodeId) -> Option<Peer> {
        let pos = self.order.iter().position(|peer| &peer.id == id)?;
        let peer = self.order.remove(pos).expect("position is in range");
        self.ids.remove(id);
        Some(peer)
    }
}

enum AddOutcome {
    Done,
    /// The target bucket is full and cannot split; the oldest occupant must
    /// answer a probe before anything changes.
    NeedsProbe { bucket: usize, oldest: Peer },
}

struct TreeState {
    self_peer: Peer,
    k: usize,
    /// Materialized buckets, slot `i` at index `i`. Never shrinks.
    buckets: Vec<Bucket>,
}

impl TreeState {
    fn max_index(&self) -> usize {
        self.buckets.len() - 1
    }

    fn bucket_index_for(&self, id: &NodeId) -> usize {
        cmp::min(self.self_peer.id.common_prefix_len(id), self.max_index())
    }

    /// Insertion up to the point where a liveness probe would be needed.
    /// Splits happen inline; the probe cannot, since it suspends.
    fn try_add(&mut self, id: NodeId, addr: SocketAddr) -> AddOutcome {
        loop {
            let index = self.bucket_index_for(&id);
            let splittable = index == self.max_index() && index < MAX_BUCKETS - 1;
            let bucket = &mut self.buckets[index];

            if bucket.touch(&id, addr) {
                return AddOutcome::Done;
            }
            if bucket.len() < self.k {
                bucket.push_back(Peer::new(id, addr));
                return AddOutcome::Done;
            }
            if splittable {
                self.split_frontier();
                // Start over: the newcomer may now land in either half.
                continue;
            }
            let oldest = *bucket.front().expect("a full bucket has a front");
            return AddOutcome::NeedsProbe { bucket: index, oldest };
        }
    }

    /// Materialize the next bucket slot and migrate every frontier peer whose
    /// common-prefix length outgrew the old slot, preserving relative order.
    fn split_frontier(&mut self) {
        let old_index = self.max_index();
        let new_index = old_index + 1;
        self.buckets.push(Bucket::new(new_index));

        let self_id = self.self_peer.id;
        let (rest, new_half) = self.buckets.split_at_mut(new_index);
        let old_bucket = &mut rest[old_index];
        let new_bucket = &mut new_half[0];

        let drained: Vec<Peer> = old_bucket.order.drain(..).collect();
        old_bucket.ids.clear();
        for peer in drained {
            if self_id.common_prefix_len(&peer.id) == old_index {
                old_bucket.push_back(peer);
            } else {
                new_bucket.push_back(peer);
            }
        }
        debug!(
            old_index,
            new_index,
            migrated = new_bucket.len(),
            "split frontier bucket"
        );
    }
}

/// The bucket tree, shared across the receive loop, handlers, and the admin
/// plane.
pub struct RoutingTable {
    state: Mutex<TreeState>,
}

impl RoutingTable {
    /// Fresh table with only bucket 0 materialized.
    pub fn new(self_peer: Peer, k: usize) -> Self {
        Self {
            state: Mutex::new(TreeState { self_peer, k, buckets: vec![Bucket::new(0)] }),
        }
    }

    /// The local peer descriptor. Created once, never mutated.
    pub async fn self_peer(&self) -> Peer {
        self.state.lock().await.self_peer
    }

    /// Highest materialized bucket slot.
    pub async fn max_index(&self) -> usize {
        self.state.lock().await.max_index()
    }

    /// Find a peer by identifier.
    pub async fn get(&self, id: &NodeId) -> Option<Peer> {
        let state = self.state.lock().await;
        state.buckets[state.bucket_index_for(id)].get(id).copied()
    }

    /// Up to `k` peers closest to `id`, most-recently-refreshed first,
    /// excluding `id` itself.
    ///
    /// Draws from the bucket `id` maps to, then from the next bucket to its
    /// left; deeper buckets are farther away by construction and are never
    /// consulted.
    pub async fn get_k(&self, id: &NodeId) -> Vec<Peer> {
        let state = self.state.lock().await;
        let index = state.bucket_index_for(id);
        let mut result = Vec::with_capacity(state.k);

        let collect = |bucket: &Bucket, result: &mut Vec<Peer>| {
            for peer in bucket.order.iter().rev() {
                if result.len() == state.k {
                    break;
                }
                if &peer.id == id {
                    continue;
                }
                result.push(*peer);
            }
        };
        collect(&state.buckets[index], &mut result);
        if result.len() < state.k && index > 0 {
            collect(&state.buckets[index - 1], &mut result);
        }
        result
    }

    /// Bump an identifier's freshness in its bucket without changing the
    /// address.
    pub async fn update(&self, id: &NodeId) -> Result<(), UnknownPeer> {
        let mut state = self.state.lock().await;
        let index = state.bucket_index_for(id);
        if state.buckets[index].move_to_back(id) {
            Ok(())
        } else {
            Err(UnknownPeer)
        }
    }

    /// Peers of one materialized bucket, least-recently-refreshed first.
    /// `None` for slots that have not been materialized.
    pub async fn bucket_peers(&self, index: usize) -> Option<Vec<Peer>> {
        let state = self.state.lock().await;
        state.buckets.get(index).map(|b| b.order.iter().copied().collect())
    }

    /// Insert or refresh a peer.
    ///
    /// A known identifier has its address updated and its freshness bumped. An
    /// unknown one is appended, splitting the frontier when that makes room.
    /// When neither helps, the bucket's oldest occupant is probed with the
    /// table unlocked; whoever loses the exchange leaves the bucket. If the
    /// bucket changed while the probe was in flight, the insertion is retried
    /// from scratch.
    pub async fn add(&self, id: NodeId, addr: SocketAddr, prober: &dyn Prober) {
        loop {
            let outcome = {
                let mut state = self.state.lock().await;
                state.try_add(id, addr)
            };
            let (bucket, oldest) = match outcome {
                AddOutcome::Done => return,
                AddOutcome::NeedsProbe { bucket, oldest } => (bucket, oldest),
            };

            let alive = prober.probe(&oldest).await;

            let mut state = self.state.lock().await;
            if state.bucket_index_for(&id) != bucket {
                continue; // a concurrent split moved the goalposts
            }
            let k = state.k;
            let target = &mut state.buckets[bucket];
            if target.contains(&id) || target.len() < k {
                continue; // retake the fast paths
            }
            match target.front() {
                Some(front) if front.id == oldest.id => {}
                _ => continue, // someone else settled the oldest's fate
            }

            if alive {
                target.move_to_back(&oldest.id);
                debug!(incumbent = %oldest.id, newcomer = %id, "oldest peer answered, newcomer dropped");
            } else {
                target.remove(&oldest.id);
                target.push_back(Peer::new(id, addr));
                debug!(evicted = %oldest.id, added = %id, "replaced unresponsive peer");
            }
            return;
        }
    }

    /// Copy of the table's data model for persistence.
    pub async fn snapshot(&self) -> TableSnapshot {
        let state = self.state.lock().await;
        TableSnapshot {
            self_peer: state.self_peer,
            buckets: state
                .buckets
                .iter()
                .map(|bucket| BucketSnapshot {
                    index: bucket.index,
                    peers: bucket.order.iter().copied().collect(),
                })
                .collect(),
        }
    }

    /// Rebuild a table from a snapshot, re-validating the structural
    /// invariants a well-formed table maintains.
    pub fn from_snapshot(snapshot: TableSnapshot, k: usize) -> anyhow::Result<Self> {
        if snapshot.buckets.is_empty() || snapshot.buckets.len() > MAX_BUCKETS {
            bail!("snapshot has {} bucket slots", snapshot.buckets.len());
        }
        let max_index = snapshot.buckets.len() - 1;
        let self_id = snapshot.self_peer.id;
        let mut seen = HashSet::new();
        let mut buckets = Vec::with_capacity(snapshot.buckets.len());

        for (slot, persisted) in snapshot.buckets.iter().enumerate() {
            if persisted.index != slot {
                bail!("bucket slot {slot} persisted with index {}", persisted.index);
            }
            if persisted.peers.len() > k {
                bail!("bucket {slot} holds {} peers, capacity {k}", persisted.peers.len());
            }
            let mut bucket = Bucket::new(slot);
            for peer in &persisted.peers {
                if !seen.insert(peer.id) {
                    bail!("peer {} appears in more than one bucket", peer.id);
                }
                let cpl = self_id.common_prefix_len(&peer.id);
                if slot < max_index && cpl != slot {
                    bail!("peer {} has prefix length {cpl}, bucket {slot}", peer.id);
                }
                if slot == max_index && cpl < slot {
                    bail!("peer {} is too distant for the frontier bucket", peer.id);
                }
                bucket.push_back(*peer);
            }
            buckets.push(bucket);
        }

        Ok(Self {
            state: Mutex::new(TreeState { self_peer: snapshot.self_peer, k, buckets }),
        })
    }

    #[cfg(test)]
    async fn assert_invariants(&self) {
        let state = self.state.lock().await;
        let max_index = state.max_index();
        let mut seen = HashSet::new();
        for (slot, bucket) in state.buckets.iter().enumerate() {
            assert_eq!(bucket.index, slot);
            assert!(bucket.len() <= state.k, "bucket {slot} over capacity");
            assert_eq!(
                bucket.order.len(),
                bucket.ids.len(),
                "order and index of bucket {slot} disagree"
            );
            for peer in &bucket.order {
                assert!(bucket.ids.contains(&peer.id));
                assert!(seen.insert(peer.id), "{} is in two buckets", peer.id);
                let cpl = state.self_peer.id.common_prefix_len(&peer.id);
                if slot < max_index {
                    assert_eq!(cpl, slot, "peer {} misfiled", peer.id);
                } else {
                    assert!(cpl >= slot, "frontier peer {} too distant", peer.id);
                }
            }
        }
    }
}
