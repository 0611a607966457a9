//! Peer addresses and the XOR ordering lookups sort them by.
use std::{
    cmp::Ordering,
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
};

use crate::common::Id;

#[derive(Clone, Copy)]
/// A peer's identifier plus where to reach it.
///
/// Two addresses are the same peer iff their ids are bit-equal; the socket address
/// is only reachability information.
pub struct PeerAddress {
    pub id: Id,
    pub address: SocketAddr,
}

impl PeerAddress {
    /// Creates a new PeerAddress from an id and socket address.
    pub fn new(id: Id, address: SocketAddr) -> PeerAddress {
        PeerAddress { id, address }
    }

    /// A peer with a random id and a random localhost port.
    pub fn random() -> PeerAddress {
        PeerAddress {
            id: Id::random(),
            address: SocketAddr::from(([127, 0, 0, 1], rand::random())),
        }
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for PeerAddress {}

impl Hash for PeerAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}@{})", self.id, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Total order of peers by XOR distance to a target.
///
/// The full 160 bit XOR value is compared, not only the bucket distance, so two
/// distinct ids never compare as equal.
pub struct XorComparator {
    target: Id,
}

impl XorComparator {
    pub fn new(target: Id) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Id {
        &self.target
    }

    /// Compare two ids by their XOR distance to the target.
    pub fn compare_ids(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(&self.target)
            .cmp(&b.xor(&self.target))
            .then_with(|| a.cmp(b))
    }

    pub fn compare(&self, a: &PeerAddress, b: &PeerAddress) -> Ordering {
        self.compare_ids(&a.id, &b.id)
    }
}
