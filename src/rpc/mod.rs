//! Iterative routing and bounded fan-out, and the collaborators they are built on.
//!
//! Nothing in this module talks to a socket. Requests go out through the injected
//! [NeighborRpc], [StorageRpc], [TrackerRpc] and [QuitRpc] implementations, each of
//! which returns a [RequestHandle] that carries its own timeout.

mod config;
mod evaluation;
mod fanout;
mod router;
mod routing_state;

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::common::{Data, DigestInfo, Id, PeerAddress, StorageKey, TrackerEntry, XorComparator};
use crate::handle::RequestHandle;

pub use config::{RequestConfig, RoutingConfig, TransportPreference};
pub use evaluation::{majority, CumulativeScheme, EvaluationScheme, VotingScheme};
pub use fanout::{fanout, CollectResponses, FanoutResult, Operation, RequestTracker};
pub use router::{Router, RoutingRequest, RoutingResult, RoutingStats};

/// Number of closest peers a friendly shutdown notifies.
pub const QUIT_NOTIFY_COUNT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// What a neighbor query asks the responder to report besides its neighbors.
pub enum RoutingKind {
    /// Neighbors only.
    #[default]
    Neighbors,
    /// Neighbors plus a digest of the stored data for the target.
    StorageDigest,
    /// Neighbors plus a digest of the tracker entries for the target.
    TrackerDigest,
}

// === Peer directory ===

/// Known peers, ordered by XOR distance to any target.
///
/// Shared by every concurrent lookup, so implementations synchronize internally.
pub trait PeerDirectory: Send + Sync {
    /// This node.
    fn local(&self) -> PeerAddress;

    /// Up to `count` known peers, closest to `target` first.
    fn close_peers(&self, target: &Id, count: usize) -> Vec<PeerAddress>;

    fn comparator(&self, target: &Id) -> XorComparator {
        XorComparator::new(*target)
    }

    /// A peer answered (`reporter == None`) or was reported by another peer.
    fn peer_found(&self, _peer: &PeerAddress, _reporter: Option<&PeerAddress>) {}

    /// A request to this peer failed.
    fn peer_failed(&self, _peer: &PeerAddress) {}
}

/// Digests this node can answer for itself, folded into lookups before the first round.
pub trait LocalDigests: Send + Sync {
    fn storage_digest(&self, location: &Id, domain: &Id, content: Option<&Id>) -> DigestInfo;

    fn tracker_digest(&self, location: &Id, domain: &Id) -> DigestInfo;
}

/// Drops reported neighbors before they are merged into a lookup's queue.
pub trait PeerFilter: Send + Sync {
    fn reject_pre_routing(&self, peer: &PeerAddress, known: &[PeerAddress]) -> bool;
}

/// Drops peers from a finished lookup's hit sets.
pub trait PostRoutingFilter: Send + Sync {
    fn reject_potential_hit(&self, _peer: &PeerAddress) -> bool {
        false
    }

    fn reject_direct_hit(&self, _peer: &PeerAddress, _digest: &DigestInfo) -> bool {
        false
    }
}

// === Requests ===

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRequest {
    pub target: Id,
    pub domain: Option<Id>,
    pub content: Option<Id>,
    pub kind: RoutingKind,
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NeighborResponse {
    /// What the responder holds for the target, empty for [RoutingKind::Neighbors].
    pub digest: DigestInfo,
    /// The responder's closest known peers to the target.
    pub neighbors: Vec<PeerAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    pub location: Id,
    pub domain: Id,
    /// Content key to value.
    pub entries: BTreeMap<Id, Data>,
    /// Keep values already stored under a key instead of overwriting them.
    pub put_if_absent: bool,
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Selects one value, or every value under `location / domain` when `content` is `None`.
pub struct GetRequest {
    pub location: Id,
    pub domain: Id,
    pub content: Option<Id>,
    /// Inclusive content key bounds, takes precedence over `content`.
    pub content_range: Option<(Id, Id)>,
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveRequest {
    pub location: Id,
    pub domain: Id,
    pub content: Option<Id>,
    /// Whether the removed values should be sent back.
    pub return_results: bool,
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddRequest {
    pub location: Id,
    pub domain: Id,
    pub attachment: Option<Bytes>,
    pub transport: TransportPreference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerGetRequest {
    pub location: Id,
    pub domain: Id,
    pub transport: TransportPreference,
}

// === Remote procedure calls ===

/// Asks one peer for its closest known peers to a target.
pub trait NeighborRpc: Send + Sync {
    fn neighbors(
        &self,
        peer: &PeerAddress,
        request: &NeighborRequest,
    ) -> RequestHandle<NeighborResponse>;
}

/// Storage requests to a single peer.
pub trait StorageRpc: Send + Sync {
    /// Returns the keys the peer stored.
    fn put(&self, peer: &PeerAddress, request: &PutRequest) -> RequestHandle<BTreeSet<StorageKey>>;

    fn get(
        &self,
        peer: &PeerAddress,
        request: &GetRequest,
    ) -> RequestHandle<BTreeMap<StorageKey, Data>>;

    /// Returns content hashes instead of the values.
    fn digest(
        &self,
        peer: &PeerAddress,
        request: &GetRequest,
    ) -> RequestHandle<BTreeMap<StorageKey, Id>>;

    /// Returns what the peer removed. Values are only present if
    /// [RemoveRequest::return_results] was set, otherwise they are empty.
    fn remove(
        &self,
        peer: &PeerAddress,
        request: &RemoveRequest,
    ) -> RequestHandle<BTreeMap<StorageKey, Data>>;
}

/// Tracker requests to a single peer.
pub trait TrackerRpc: Send + Sync {
    /// Register this node on the peer's tracker for `location / domain`.
    fn add(&self, peer: &PeerAddress, request: &TrackerAddRequest) -> RequestHandle<()>;

    fn get(&self, peer: &PeerAddress, request: &TrackerGetRequest) -> RequestHandle<Vec<TrackerEntry>>;
}

/// Tells a peer this node is leaving.
pub trait QuitRpc: Send + Sync {
    fn quit(&self, peer: &PeerAddress, transport: TransportPreference) -> RequestHandle<()>;
}

/// Reserves transport resources before an operation starts.
pub trait ConnectionReservation: Send + Sync {
    fn reserve(&self, permits: usize) -> RequestHandle<()>;

    fn release(&self, _permits: usize) {}
}

/// A [ConnectionReservation] that always succeeds right away.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unreserved;

impl ConnectionReservation for Unreserved {
    fn reserve(&self, _permits: usize) -> RequestHandle<()> {
        RequestHandle::completed(Ok(()))
    }
}
