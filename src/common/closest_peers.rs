use std::{collections::HashMap, vec::IntoIter};

use rand::Rng;

use crate::common::{DigestInfo, Id, PeerAddress, XorComparator};

#[derive(Debug, Clone)]
/// Peers sorted by XOR distance to a target, closest first, without duplicates.
pub struct ClosestPeers {
    comparator: XorComparator,
    peers: Vec<PeerAddress>,
}

impl ClosestPeers {
    pub fn new(target: Id) -> Self {
        Self::with_comparator(XorComparator::new(target))
    }

    pub fn with_comparator(comparator: XorComparator) -> Self {
        Self {
            comparator,
            peers: Vec::with_capacity(32),
        }
    }

    // === Getters ===

    pub fn target(&self) -> Id {
        *self.comparator.target()
    }

    pub fn comparator(&self) -> &XorComparator {
        &self.comparator
    }

    pub fn peers(&self) -> &[PeerAddress] {
        &self.peers
    }

    pub fn first(&self) -> Option<&PeerAddress> {
        self.peers.first()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer: &PeerAddress) -> bool {
        self.search(peer).is_ok()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PeerAddress> {
        self.peers.iter()
    }

    // === Public Methods ===

    /// Insert a peer at its sorted position. Returns `false` if it was already there.
    pub fn add(&mut self, peer: PeerAddress) -> bool {
        match self.search(&peer) {
            Err(pos) => {
                self.peers.insert(pos, peer);
                true
            }
            Ok(_) => false,
        }
    }

    pub fn remove(&mut self, peer: &PeerAddress) -> bool {
        match self.search(peer) {
            Ok(pos) => {
                self.peers.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn pop_first(&mut self) -> Option<PeerAddress> {
        if self.peers.is_empty() {
            return None;
        }

        Some(self.peers.remove(0))
    }

    /// Remove and return a uniformly random peer.
    pub fn pop_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<PeerAddress> {
        if self.peers.is_empty() {
            return None;
        }

        let index = rng.gen_range(0..self.peers.len());

        Some(self.peers.remove(index))
    }

    pub fn retain<F: FnMut(&PeerAddress) -> bool>(&mut self, f: F) {
        self.peers.retain(f)
    }

    // === Private Methods ===

    fn search(&self, peer: &PeerAddress) -> Result<usize, usize> {
        self.peers
            .binary_search_by(|probe| self.comparator.compare(probe, peer))
    }
}

impl Extend<PeerAddress> for ClosestPeers {
    fn extend<T: IntoIterator<Item = PeerAddress>>(&mut self, iter: T) {
        for peer in iter {
            self.add(peer);
        }
    }
}

impl IntoIterator for ClosestPeers {
    type Item = PeerAddress;
    type IntoIter = IntoIter<PeerAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.into_iter()
    }
}

impl<'a> IntoIterator for &'a ClosestPeers {
    type Item = &'a PeerAddress;
    type IntoIter = std::slice::Iter<'a, PeerAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.peers.iter()
    }
}

#[derive(Debug, Clone)]
/// Peers that claimed to hold data for a key, closest first.
///
/// Only non-empty digests are kept.
pub struct DirectHits {
    peers: ClosestPeers,
    digests: HashMap<Id, DigestInfo>,
}

impl DirectHits {
    pub fn new(comparator: XorComparator) -> Self {
        Self {
            peers: ClosestPeers::with_comparator(comparator),
            digests: HashMap::new(),
        }
    }

    /// Record a peer's digest. Empty digests are ignored and `false` is returned.
    pub fn insert(&mut self, peer: PeerAddress, digest: DigestInfo) -> bool {
        if digest.is_empty() {
            return false;
        }

        self.peers.add(peer);
        self.digests.insert(peer.id, digest);

        true
    }

    pub fn remove(&mut self, peer: &PeerAddress) -> Option<DigestInfo> {
        self.peers.remove(peer);
        self.digests.remove(&peer.id)
    }

    pub fn retain<F: FnMut(&PeerAddress, &DigestInfo) -> bool>(&mut self, mut f: F) {
        let digests = &mut self.digests;

        self.peers.retain(|peer| match digests.get(&peer.id) {
            Some(digest) if f(peer, digest) => true,
            _ => {
                digests.remove(&peer.id);
                false
            }
        });
    }

    pub fn get(&self, peer: &PeerAddress) -> Option<&DigestInfo> {
        self.digests.get(&peer.id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The peers only, in the same order.
    pub fn peers(&self) -> &ClosestPeers {
        &self.peers
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddress, &DigestInfo)> {
        self.peers
            .iter()
            .filter_map(|peer| self.digests.get(&peer.id).map(|digest| (peer, digest)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn peer(value: u64) -> PeerAddress {
        PeerAddress::new(Id::from_u64(value), SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    #[test]
    fn add() {
        let target = Id::random();

        let mut closest_peers = ClosestPeers::new(target);

        for _ in 0..10 {
            let peer = PeerAddress::random();
            closest_peers.add(peer);
            closest_peers.add(peer);
        }

        assert_eq!(closest_peers.len(), 10);

        let distances = closest_peers
            .iter()
            .map(|p| p.id.xor(&target))
            .collect::<Vec<_>>();

        let mut sorted = distances.clone();
        sorted.sort();

        assert_eq!(sorted, distances);
    }

    #[test]
    fn pop_first_is_closest() {
        let mut closest_peers = ClosestPeers::new(Id::from_u64(88));

        closest_peers.extend([peer(12), peer(14), peer(89), peer(16)]);

        assert_eq!(closest_peers.pop_first(), Some(peer(89)));
        assert_eq!(closest_peers.pop_first(), Some(peer(16)));
        assert!(!closest_peers.contains(&peer(89)));
        assert_eq!(closest_peers.len(), 2);
    }

    #[test]
    fn pop_random_drains_everything() {
        let mut closest_peers = ClosestPeers::new(Id::random());
        closest_peers.extend((0..20).map(peer));

        let mut rng = rand::thread_rng();
        let mut popped = 0;

        while closest_peers.pop_random(&mut rng).is_some() {
            popped += 1;
        }

        assert_eq!(popped, 20);
        assert!(closest_peers.is_empty());
    }

    #[test]
    fn direct_hits_skip_empty_digests() {
        let mut hits = DirectHits::new(XorComparator::new(Id::from_u64(0)));

        assert!(!hits.insert(peer(3), DigestInfo::empty()));
        assert!(hits.insert(peer(5), DigestInfo::new(Id::ZERO, Id::ZERO, 1)));
        assert!(hits.insert(peer(1), DigestInfo::new(Id::ZERO, Id::ZERO, 2)));

        let order = hits.iter().map(|(p, d)| (p.id, d.size)).collect::<Vec<_>>();

        assert_eq!(order, vec![(Id::from_u64(1), 2), (Id::from_u64(5), 1)]);
    }
}
