//! An in-process network of nodes for tests and demos.
//!
//! Requests are dispatched to the target node by a direct function call. By default
//! every handle completes before it is returned. In manual mode handles stay pending
//! until [Testnet::release] answers them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use rand::{thread_rng, Rng};
use tracing::trace;

use crate::common::{
    Data, DigestInfo, Id, PeerAddress, SharedRoutingTable, StorageKey, TrackerEntry,
    MAX_BUCKET_SIZE_K,
};
use crate::dht::DistributedHashTable;
use crate::handle::RequestHandle;
use crate::rpc::{
    ConnectionReservation, GetRequest, LocalDigests, NeighborRequest, NeighborResponse,
    NeighborRpc, PeerDirectory, PutRequest, QuitRpc, RemoveRequest, Router, RoutingKind,
    StorageRpc, TrackerAddRequest, TrackerGetRequest, TrackerRpc, TransportPreference,
};
use crate::tracker::Tracker;
use crate::{Error, Result};

/// Most entries a tracker returns for one key.
const MAX_TRACKER_RESULTS: usize = 20;

/// Build a network of nodes with deterministic ids.
pub struct Testnet {
    network: Arc<Network>,
    nodes: Vec<TestNode>,
}

impl Testnet {
    /// `count` nodes that all know each other.
    pub fn new(count: usize) -> Self {
        let testnet = Self::with_ids((0..count).map(|i| Id::hash_of(&(i as u64).to_be_bytes())));

        for node in &testnet.nodes {
            for other in &testnet.nodes {
                node.table().add(other.peer());
            }
        }

        testnet
    }

    /// `count` nodes where node `i` has the id `0xf`, `0xff`, `0xfff`.. with `i + 1`
    /// hex digits, and knows nodes `0..=i + 1`. The last two nodes know nobody.
    pub fn line(count: usize) -> Self {
        let ids = (0..count).map(|i| {
            let digits = (i + 1) as u32;

            Id::from_u64(16_u64.checked_pow(digits).map(|n| n - 1).unwrap_or(u64::MAX))
        });

        let testnet = Self::with_ids(ids);

        for (i, node) in testnet.nodes.iter().enumerate().take(count.saturating_sub(2)) {
            for other in &testnet.nodes[..=i + 1] {
                node.table().add(other.peer());
            }
        }

        testnet
    }

    fn with_ids<I: IntoIterator<Item = Id>>(ids: I) -> Self {
        let network = Arc::new(Network {
            nodes: RwLock::new(HashMap::new()),
            manual: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
        });

        let nodes = ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| {
                let peer = PeerAddress::new(id, SocketAddr::from(([127, 0, 0, 1], 10_000 + i as u16)));

                TestNode {
                    inner: Arc::new(NodeInner::new(peer)),
                    network: Arc::downgrade(&network),
                }
            })
            .collect::<Vec<_>>();

        {
            let mut registry = network.nodes.write();

            for node in &nodes {
                registry.insert(node.id(), node.inner.clone());
            }
        }

        Self { network, nodes }
    }

    // === Getters ===

    pub fn nodes(&self) -> &[TestNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        self.nodes.iter().map(TestNode::peer).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Requests waiting for [Self::release].
    pub fn held(&self) -> usize {
        self.network.held.lock().len()
    }

    // === Public Methods ===

    /// In manual mode requests are answered only by [Self::release].
    pub fn set_manual(&self, manual: bool) {
        self.network.manual.store(manual, Ordering::SeqCst);
    }

    /// Answer every held request, returns how many were answered. Requests issued while
    /// answering are held for the next call.
    pub fn release(&self) -> usize {
        let held = std::mem::take(&mut *self.network.held.lock());
        let count = held.len();

        for answer in held {
            answer();
        }

        count
    }

    /// Answer the oldest held request, if any.
    pub fn release_one(&self) -> bool {
        let answer = {
            let mut held = self.network.held.lock();

            if held.is_empty() {
                return false;
            }

            held.remove(0)
        };

        answer();

        true
    }
}

impl Debug for Testnet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Testnet")
            .field("nodes", &self.nodes)
            .field("held", &self.held())
            .finish()
    }
}

type Answer = Box<dyn FnOnce() + Send>;

struct Network {
    nodes: RwLock<HashMap<Id, Arc<NodeInner>>>,
    manual: AtomicBool,
    held: Mutex<Vec<Answer>>,
}

#[derive(Clone)]
/// One node of a [Testnet].
pub struct TestNode {
    inner: Arc<NodeInner>,
    network: Weak<Network>,
}

impl TestNode {
    // === Getters ===

    pub fn peer(&self) -> PeerAddress {
        self.inner.peer
    }

    pub fn id(&self) -> Id {
        self.inner.peer.id
    }

    pub fn table(&self) -> &SharedRoutingTable {
        &self.inner.table
    }

    /// Requests of any kind this node received and answered.
    pub fn received(&self) -> usize {
        self.inner.received.load(Ordering::SeqCst)
    }

    /// Everything this node stores.
    pub fn stored(&self) -> BTreeMap<StorageKey, Data> {
        self.inner.storage.lock().clone()
    }

    /// Peers announced on this node's tracker under `location / domain`.
    pub fn tracked(&self, location: Id, domain: Id) -> Vec<TrackerEntry> {
        self.inner.tracker.lock().all(&location, &domain)
    }

    /// Permits currently held through this node's [ConnectionReservation].
    pub fn reserved_permits(&self) -> usize {
        self.inner.reservations.in_use.load(Ordering::SeqCst)
    }

    // === Public Methods ===

    /// An unreachable node fails every request sent to it.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Make this node's [ConnectionReservation] refuse every reservation.
    pub fn set_reservation_refused(&self, refused: bool) {
        self.inner.reservations.refused.store(refused, Ordering::SeqCst);
    }

    /// Store a value locally, bypassing the network.
    pub fn store(&self, key: StorageKey, data: Data) {
        self.inner.storage.lock().insert(key, data);
    }

    /// Client side of the RPCs, sending from this node.
    pub fn client(&self) -> Arc<Client> {
        Arc::new(Client {
            from: self.peer(),
            network: self.network.clone(),
        })
    }

    /// A router over this node's routing table, folding in its local digests.
    pub fn router(&self) -> Router {
        Router::new(Arc::new(self.inner.table.clone()), self.client())
            .with_local_digests(self.inner.clone())
    }

    pub fn dht(&self) -> DistributedHashTable {
        let client = self.client();

        DistributedHashTable::new(self.router(), client.clone(), client)
            .with_reservation(self.reservation())
    }

    pub fn tracker(&self) -> Tracker {
        Tracker::new(self.router(), self.client()).with_reservation(self.reservation())
    }

    fn reservation(&self) -> Arc<dyn ConnectionReservation> {
        Arc::new(NodeReservation(self.inner.clone()))
    }
}

impl Debug for TestNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestNode")
            .field("peer", &self.inner.peer)
            .field("known", &self.inner.table.size())
            .field("received", &self.received())
            .finish()
    }
}

struct NodeInner {
    peer: PeerAddress,
    table: SharedRoutingTable,
    storage: Mutex<BTreeMap<StorageKey, Data>>,
    tracker: Mutex<TrackerStore>,
    unreachable: AtomicBool,
    received: AtomicUsize,
    reservations: Reservations,
}

impl NodeInner {
    fn new(peer: PeerAddress) -> Self {
        Self {
            peer,
            table: SharedRoutingTable::new(peer),
            storage: Mutex::new(BTreeMap::new()),
            tracker: Mutex::new(TrackerStore::default()),
            unreachable: AtomicBool::new(false),
            received: AtomicUsize::new(0),
            reservations: Reservations::default(),
        }
    }

    /// Stored values selected by `location / domain` and an optional content key.
    fn select(&self, location: &Id, domain: &Id, content: Option<&Id>) -> BTreeMap<StorageKey, Data> {
        let storage = self.storage.lock();

        match content {
            Some(content) => {
                let key = StorageKey::new(*location, *domain, *content);

                storage
                    .get(&key)
                    .map(|data| BTreeMap::from([(key, data.clone())]))
                    .unwrap_or_default()
            }
            None => storage
                .range(StorageKey::range_start(*location, *domain)..=StorageKey::range_end(*location, *domain))
                .map(|(key, data)| (*key, data.clone()))
                .collect(),
        }
    }

    /// Stored values a get or digest request selects.
    fn select_request(&self, request: &GetRequest) -> BTreeMap<StorageKey, Data> {
        let Some((from, to)) = request.content_range else {
            return self.select(&request.location, &request.domain, request.content.as_ref());
        };

        if from > to {
            return BTreeMap::new();
        }

        let start = StorageKey::new(request.location, request.domain, from);
        let end = StorageKey::new(request.location, request.domain, to);

        self.storage
            .lock()
            .range(start..=end)
            .map(|(key, data)| (*key, data.clone()))
            .collect()
    }

    // === Request handlers ===

    fn neighbors(&self, request: &NeighborRequest) -> NeighborResponse {
        let neighbors = self.table.close_peers(&request.target, MAX_BUCKET_SIZE_K);

        let digest = match (request.kind, request.domain) {
            (RoutingKind::StorageDigest, Some(domain)) => {
                self.storage_digest(&request.target, &domain, request.content.as_ref())
            }
            (RoutingKind::TrackerDigest, Some(domain)) => self.tracker_digest(&request.target, &domain),
            _ => DigestInfo::empty(),
        };

        NeighborResponse { digest, neighbors }
    }

    fn put(&self, request: &PutRequest) -> BTreeSet<StorageKey> {
        let mut storage = self.storage.lock();

        request
            .entries
            .iter()
            .filter_map(|(content, data)| {
                let key = StorageKey::new(request.location, request.domain, *content);

                if request.put_if_absent && storage.contains_key(&key) {
                    return None;
                }

                storage.insert(key, data.clone());

                Some(key)
            })
            .collect()
    }

    fn remove(&self, request: &RemoveRequest) -> BTreeMap<StorageKey, Data> {
        let selected = self.select(&request.location, &request.domain, request.content.as_ref());

        let mut storage = self.storage.lock();

        selected
            .into_iter()
            .filter_map(|(key, data)| {
                storage.remove(&key)?;

                let data = if request.return_results {
                    data
                } else {
                    Data::new(Bytes::new())
                };

                Some((key, data))
            })
            .collect()
    }
}

impl LocalDigests for NodeInner {
    fn storage_digest(&self, location: &Id, domain: &Id, content: Option<&Id>) -> DigestInfo {
        let selected = self.select(location, domain, content);
        let hashes = selected
            .iter()
            .map(|(key, data)| (key.content, data.hash()))
            .collect::<Vec<_>>();

        DigestInfo::from_entries(hashes.iter().map(|(content, hash)| (content, hash)))
    }

    fn tracker_digest(&self, location: &Id, domain: &Id) -> DigestInfo {
        self.tracker.lock().digest(location, domain)
    }
}

/// Announced peers per `location / domain`, least recently used keys are evicted.
struct TrackerStore {
    keys: LruCache<(Id, Id), LruCache<Id, TrackerEntry>>,
    max_peers: NonZeroUsize,
}

impl TrackerStore {
    fn new(max_keys: NonZeroUsize, max_peers: NonZeroUsize) -> Self {
        Self {
            keys: LruCache::new(max_keys),
            max_peers,
        }
    }

    fn add(&mut self, location: Id, domain: Id, entry: TrackerEntry) {
        let max_peers = self.max_peers;

        self.keys
            .get_or_insert_mut((location, domain), || LruCache::new(max_peers))
            .put(entry.peer.id, entry);
    }

    fn all(&mut self, location: &Id, domain: &Id) -> Vec<TrackerEntry> {
        self.keys
            .get(&(*location, *domain))
            .map(|peers| peers.iter().map(|(_, entry)| entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Up to [MAX_TRACKER_RESULTS] entries, a uniform sample if there are more.
    fn sample(&mut self, location: &Id, domain: &Id) -> Vec<TrackerEntry> {
        let Some(peers) = self.keys.get(&(*location, *domain)) else {
            return Vec::new();
        };

        if peers.len() <= MAX_TRACKER_RESULTS {
            return peers.iter().map(|(_, entry)| entry.clone()).collect();
        }

        let mut rng = thread_rng();
        let mut results = Vec::with_capacity(MAX_TRACKER_RESULTS);

        for (index, (_, entry)) in peers.iter().enumerate() {
            // Selection sampling, each remaining entry is picked with probability
            // remaining slots / remaining entries.
            let slots = MAX_TRACKER_RESULTS - results.len();
            let remaining = peers.len() - index;

            if rng.gen_bool(slots as f64 / remaining as f64) {
                results.push(entry.clone());

                if results.len() == MAX_TRACKER_RESULTS {
                    break;
                }
            }
        }

        results
    }

    fn digest(&mut self, location: &Id, domain: &Id) -> DigestInfo {
        let entries = self
            .all(location, domain)
            .into_iter()
            .map(|entry| {
                let attachment = entry
                    .attachment
                    .as_ref()
                    .map(|attachment| Id::hash_of(attachment))
                    .unwrap_or(Id::ZERO);

                (entry.peer.id, attachment)
            })
            .collect::<Vec<_>>();

        DigestInfo::from_entries(entries.iter().map(|(peer, attachment)| (peer, attachment)))
    }
}

impl Default for TrackerStore {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            NonZeroUsize::new(100).unwrap_or(NonZeroUsize::MIN),
        )
    }
}

#[derive(Default)]
struct Reservations {
    in_use: AtomicUsize,
    refused: AtomicBool,
}

struct NodeReservation(Arc<NodeInner>);

impl ConnectionReservation for NodeReservation {
    fn reserve(&self, permits: usize) -> RequestHandle<()> {
        let reservations = &self.0.reservations;

        if reservations.refused.load(Ordering::SeqCst) {
            return RequestHandle::completed(Err(Error::Request("no connections available".into())));
        }

        reservations.in_use.fetch_add(permits, Ordering::SeqCst);

        RequestHandle::completed(Ok(()))
    }

    fn release(&self, permits: usize) {
        self.0.reservations.in_use.fetch_sub(permits, Ordering::SeqCst);
    }
}

/// Sends requests from one [TestNode] to the others.
pub struct Client {
    from: PeerAddress,
    network: Weak<Network>,
}

impl Client {
    /// Run `serve` on the node behind `to`, now or, in manual mode, on release.
    fn dispatch<T, F>(&self, to: &PeerAddress, serve: F) -> RequestHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&NodeInner) -> T + Send + 'static,
    {
        let Some(network) = self.network.upgrade() else {
            return RequestHandle::completed(Err(Error::Request("network is gone".into())));
        };

        let target = network.nodes.read().get(&to.id).cloned();
        let to = *to;

        let run = move || -> Result<T> {
            match target {
                Some(node) if !node.unreachable.load(Ordering::SeqCst) => {
                    node.received.fetch_add(1, Ordering::SeqCst);

                    Ok(serve(&node))
                }
                _ => Err(Error::Request(format!("{to:?} is unreachable"))),
            }
        };

        if !network.manual.load(Ordering::SeqCst) {
            return RequestHandle::completed(run());
        }

        trace!(from = ?self.from, ?to, "Holding request");

        let handle = RequestHandle::new();
        let pending = handle.clone();

        network.held.lock().push(Box::new(move || {
            if !pending.is_done() {
                pending.complete(run());
            }
        }));

        handle
    }
}

impl Debug for Client {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("from", &self.from).finish()
    }
}

impl NeighborRpc for Client {
    fn neighbors(&self, peer: &PeerAddress, request: &NeighborRequest) -> RequestHandle<NeighborResponse> {
        let request = request.clone();

        self.dispatch(peer, move |node| node.neighbors(&request))
    }
}

impl StorageRpc for Client {
    fn put(&self, peer: &PeerAddress, request: &PutRequest) -> RequestHandle<BTreeSet<StorageKey>> {
        let request = request.clone();

        self.dispatch(peer, move |node| node.put(&request))
    }

    fn get(&self, peer: &PeerAddress, request: &GetRequest) -> RequestHandle<BTreeMap<StorageKey, Data>> {
        let request = request.clone();

        self.dispatch(peer, move |node| node.select_request(&request))
    }

    fn digest(&self, peer: &PeerAddress, request: &GetRequest) -> RequestHandle<BTreeMap<StorageKey, Id>> {
        let request = request.clone();

        self.dispatch(peer, move |node| {
            node.select_request(&request)
                .into_iter()
                .map(|(key, data)| (key, data.hash()))
                .collect()
        })
    }

    fn remove(&self, peer: &PeerAddress, request: &RemoveRequest) -> RequestHandle<BTreeMap<StorageKey, Data>> {
        let request = request.clone();

        self.dispatch(peer, move |node| node.remove(&request))
    }
}

impl TrackerRpc for Client {
    fn add(&self, peer: &PeerAddress, request: &TrackerAddRequest) -> RequestHandle<()> {
        let entry = TrackerEntry::new(self.from, request.attachment.clone());
        let (location, domain) = (request.location, request.domain);

        self.dispatch(peer, move |node| node.tracker.lock().add(location, domain, entry))
    }

    fn get(&self, peer: &PeerAddress, request: &TrackerGetRequest) -> RequestHandle<Vec<TrackerEntry>> {
        let (location, domain) = (request.location, request.domain);

        self.dispatch(peer, move |node| node.tracker.lock().sample(&location, &domain))
    }
}

impl QuitRpc for Client {
    fn quit(&self, peer: &PeerAddress, _transport: TransportPreference) -> RequestHandle<()> {
        let from = self.from;

        self.dispatch(peer, move |node| {
            node.table.remove(&from.id);
        })
    }
}
