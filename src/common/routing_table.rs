//! Simplified Kademlia routing table

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::trace;

use crate::common::{ClosestPeers, Id, PeerAddress};
use crate::rpc::PeerDirectory;

/// K = the default maximum size of a k-bucket.
pub const MAX_BUCKET_SIZE_K: usize = 20;

/// A peer not heard from for this long may be evicted from a full bucket.
const STALE_TIME: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
/// Simplified Kademlia routing table
pub struct RoutingTable {
    local: PeerAddress,
    buckets: BTreeMap<u8, KBucket>,
}

impl RoutingTable {
    /// Create a new [RoutingTable] for the local peer.
    pub fn new(local: PeerAddress) -> Self {
        RoutingTable {
            local,
            buckets: BTreeMap::new(),
        }
    }

    /// Returns the [Id] of this peer, where the distance is measured from.
    pub fn id(&self) -> &Id {
        &self.local.id
    }

    pub fn local(&self) -> PeerAddress {
        self.local
    }

    // === Public Methods ===

    /// Attempts to add a peer to this routing table, and return `true` if it did.
    pub fn add(&mut self, peer: PeerAddress) -> bool {
        let distance = self.local.id.distance(&peer.id);

        if distance == 0 {
            // Do not add self to the routing_table
            return false;
        }

        let bucket = self.buckets.entry(distance).or_default();

        bucket.add(peer)
    }

    /// Remove a peer from this routing table.
    pub fn remove(&mut self, id: &Id) -> bool {
        let distance = self.local.id.distance(id);

        self.buckets
            .get_mut(&distance)
            .map(|bucket| bucket.remove(id))
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &Id) -> bool {
        let distance = self.local.id.distance(id);

        self.buckets
            .get(&distance)
            .map(|bucket| bucket.contains(id))
            .unwrap_or(false)
    }

    /// Return up to `count` known peers closest to the target.
    pub fn closest(&self, target: &Id, count: usize) -> Vec<PeerAddress> {
        let mut closest = ClosestPeers::new(*target);

        closest.extend(self.peers());

        closest.into_iter().take(count).collect()
    }

    /// Returns `true` if this routing table is empty.
    pub fn is_empty(&self) -> bool {
        self.buckets.values().all(|bucket| bucket.is_empty())
    }

    /// Return the number of peers in this routing table.
    pub fn size(&self) -> usize {
        self.buckets
            .values()
            .fold(0, |acc, bucket| acc + bucket.entries.len())
    }

    /// Returns an iterator over the peers in this routing table, closest buckets first.
    pub fn peers(&self) -> impl Iterator<Item = PeerAddress> + '_ {
        self.buckets
            .values()
            .flat_map(|bucket| bucket.entries.iter().map(|entry| entry.peer))
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    peer: PeerAddress,
    last_seen: Instant,
}

impl Entry {
    fn is_stale(&self) -> bool {
        self.last_seen.elapsed() > STALE_TIME
    }
}

/// Kbuckets are similar to LRU caches that checks and evicts unresponsive peers,
/// without dropping any responsive peers in the process.
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Peers in the k-bucket, sorted by the least recently seen.
    entries: Vec<Entry>,
}

impl KBucket {
    pub fn new() -> Self {
        KBucket {
            entries: Vec::with_capacity(MAX_BUCKET_SIZE_K),
        }
    }

    // === Public Methods ===

    pub fn add(&mut self, incoming: PeerAddress) -> bool {
        let entry = Entry {
            peer: incoming,
            last_seen: Instant::now(),
        };

        if let Some(index) = self.entries.iter().position(|e| e.peer == incoming) {
            // Seen again, possibly on a new address: move to the most recent end.
            self.entries.remove(index);
            self.entries.push(entry);

            true
        } else if self.entries.len() < MAX_BUCKET_SIZE_K {
            self.entries.push(entry);
            true
        } else if self.entries[0].is_stale() {
            // Remove the least recently seen peer and add the new one
            self.entries.remove(0);
            self.entries.push(entry);

            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: &Id) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.peer.id != *id);

        before != self.entries.len()
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|entry| entry.peer.id == *id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for KBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
/// A [RoutingTable] shared between concurrent lookups.
pub struct SharedRoutingTable(Arc<RwLock<RoutingTable>>);

impl SharedRoutingTable {
    pub fn new(local: PeerAddress) -> Self {
        Self(Arc::new(RwLock::new(RoutingTable::new(local))))
    }

    pub fn add(&self, peer: PeerAddress) -> bool {
        self.0.write().add(peer)
    }

    pub fn remove(&self, id: &Id) -> bool {
        self.0.write().remove(id)
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.0.read().contains(id)
    }

    pub fn size(&self) -> usize {
        self.0.read().size()
    }

    /// Returns a clone of the current table.
    pub fn snapshot(&self) -> RoutingTable {
        self.0.read().clone()
    }
}

impl PeerDirectory for SharedRoutingTable {
    fn local(&self) -> PeerAddress {
        self.0.read().local()
    }

    fn close_peers(&self, target: &Id, count: usize) -> Vec<PeerAddress> {
        self.0.read().closest(target, count)
    }

    fn peer_found(&self, peer: &PeerAddress, reporter: Option<&PeerAddress>) {
        // Only first hand contact is trusted enough to enter the table.
        if reporter.is_none() && self.0.write().add(*peer) {
            trace!(?peer, "Added peer to routing table");
        }
    }

    fn peer_failed(&self, peer: &PeerAddress) {
        if self.0.write().remove(&peer.id) {
            trace!(?peer, "Removed failed peer from routing table");
        }
    }
}
