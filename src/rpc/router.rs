//! Iterative routing lookups.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{ClosestPeers, DigestInfo, DirectHits, Id, PeerAddress};
use crate::handle::{first_completed, RequestHandle};
use crate::{Error, Result};

use super::routing_state::{RoutingState, Slot, Verdict};
use super::{
    LocalDigests, NeighborRequest, NeighborResponse, NeighborRpc, PeerDirectory, PeerFilter,
    PostRoutingFilter, RoutingConfig, RoutingKind,
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// What a lookup is looking for.
pub struct RoutingRequest {
    /// `None` walks the network randomly instead of converging on a target.
    pub target: Option<Id>,
    pub domain: Option<Id>,
    pub content: Option<Id>,
    pub kind: RoutingKind,
    /// Initial candidates, defaults to the directory's closest peers to the target.
    pub seeds: Option<Vec<PeerAddress>>,
}

impl RoutingRequest {
    /// Find the closest peers to `target`.
    pub fn new(target: Id) -> Self {
        Self {
            target: Some(target),
            ..Default::default()
        }
    }

    /// Random walk, every responder is asked for its farthest known peers.
    pub fn random() -> Self {
        Self::default()
    }

    /// Find the peers storing values under `location / domain`.
    pub fn storage_digest(location: Id, domain: Id, content: Option<Id>) -> Self {
        Self {
            target: Some(location),
            domain: Some(domain),
            content,
            kind: RoutingKind::StorageDigest,
            seeds: None,
        }
    }

    /// Find the peers tracking `location / domain`.
    pub fn tracker_digest(location: Id, domain: Id) -> Self {
        Self {
            target: Some(location),
            domain: Some(domain),
            content: None,
            kind: RoutingKind::TrackerDigest,
            seeds: None,
        }
    }

    pub fn with_seeds(mut self, seeds: Vec<PeerAddress>) -> Self {
        self.seeds = Some(seeds);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Counters of a finished lookup.
pub struct RoutingStats {
    pub successes: usize,
    pub failures: usize,
    /// Consecutive responses without new information when the lookup stopped.
    pub no_new_info: usize,
    pub rounds: usize,
}

#[derive(Debug, Clone)]
/// Outcome of a routing lookup.
///
/// A failed lookup still carries whatever it found.
pub struct RoutingResult {
    /// Peers that claimed to hold data for the target, closest first.
    pub direct_hits: DirectHits,
    /// Every peer that responded, this node included, closest first.
    pub potential_hits: ClosestPeers,
    pub already_asked: ClosestPeers,
    pub success: bool,
    /// Why the lookup stopped, or why it failed.
    pub reason: String,
    pub stats: RoutingStats,
}

impl RoutingResult {
    pub fn direct_hits_count(&self) -> usize {
        self.direct_hits.len()
    }

    /// `Ok(self)` if the lookup succeeded, [Error::NoRoute] otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::NoRoute(self.reason))
        }
    }
}

#[derive(Clone)]
/// Runs iterative lookups against a [PeerDirectory] through a [NeighborRpc].
pub struct Router {
    directory: Arc<dyn PeerDirectory>,
    rpc: Arc<dyn NeighborRpc>,
    local_digests: Option<Arc<dyn LocalDigests>>,
    peer_filters: Vec<Arc<dyn PeerFilter>>,
    post_filters: Vec<Arc<dyn PostRoutingFilter>>,
}

impl Router {
    pub fn new(directory: Arc<dyn PeerDirectory>, rpc: Arc<dyn NeighborRpc>) -> Self {
        Self {
            directory,
            rpc,
            local_digests: None,
            peer_filters: Vec::new(),
            post_filters: Vec::new(),
        }
    }

    /// Fold this node's own digests into digest lookups.
    pub fn with_local_digests(mut self, local_digests: Arc<dyn LocalDigests>) -> Self {
        self.local_digests = Some(local_digests);
        self
    }

    pub fn with_peer_filter(mut self, filter: Arc<dyn PeerFilter>) -> Self {
        self.peer_filters.push(filter);
        self
    }

    pub fn with_post_routing_filter(mut self, filter: Arc<dyn PostRoutingFilter>) -> Self {
        self.post_filters.push(filter);
        self
    }

    // === Getters ===

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub fn local(&self) -> PeerAddress {
        self.directory.local()
    }

    // === Public Methods ===

    /// Start a lookup. The returned handle completes with the [RoutingResult], which
    /// may be unsuccessful, or fails with [Error::Cancelled] if cancelled.
    pub fn route(&self, request: RoutingRequest, config: RoutingConfig) -> RequestHandle<RoutingResult> {
        let local = self.directory.local();
        let pivot = request.target.unwrap_or(local.id);

        let seeds = request.seeds.clone().unwrap_or_else(|| {
            self.directory
                .close_peers(&pivot, config.parallelism().saturating_mul(2))
        });

        let routing_to_others = seeds.iter().any(|peer| *peer != local);

        let mut state = RoutingState::new(
            local,
            self.directory.comparator(&pivot),
            config.parallelism(),
            request.target.is_none(),
        );
        state.seed(seeds);

        trace!(target = ?request.target, kind = ?request.kind, candidates = state.queue.len(), "New routing lookup");

        let local_digest = self.local_digest(&request);

        let lookup = Arc::new(Lookup {
            router: self.clone(),
            request,
            config,
            routing_to_others,
            handle: RequestHandle::new(),
            state: Mutex::new(state),
        });

        {
            let weak = Arc::downgrade(&lookup);
            lookup.handle.on_cancel(move || {
                if let Some(lookup) = weak.upgrade() {
                    lookup.cancel();
                }
            });
        }

        let handle = lookup.handle.clone();

        if let Some(digest) = local_digest {
            let done = lookup
                .state
                .lock()
                .add_direct_hit(local, digest, &lookup.config);

            if done {
                lookup.finish("enough direct hits");
                return handle;
            }
        }

        if !routing_to_others {
            lookup.finish("no peers to route to");
            return handle;
        }

        lookup.round();

        handle
    }

    /// Two lookups: toward this node's own id starting from `seeds`, then, if that
    /// succeeded, a random walk to diversify the directory.
    pub fn bootstrap(
        &self,
        seeds: Vec<PeerAddress>,
        config: RoutingConfig,
    ) -> RequestHandle<(RoutingResult, RoutingResult)> {
        let handle = RequestHandle::new();

        let first = self.route(RoutingRequest::new(self.local().id).with_seeds(seeds), config);

        {
            let first = first.clone();
            handle.on_cancel(move || {
                first.cancel();
            });
        }

        let router = self.clone();
        let outer = handle.clone();

        first.add_listener(move |first| {
            let pass1 = match first.result() {
                Some(Ok(pass1)) if pass1.success => pass1,
                Some(Ok(pass1)) => {
                    debug!(reason = ?pass1.reason, "Bootstrap failed");
                    outer.fail(Error::NoRoute(pass1.reason));
                    return;
                }
                Some(Err(error)) => {
                    outer.fail(error);
                    return;
                }
                None => return,
            };

            if outer.is_done() {
                return;
            }

            let second = router.route(RoutingRequest::random(), config);

            {
                let second = second.clone();
                outer.on_cancel(move || {
                    second.cancel();
                });
            }

            second.add_listener(move |second| match second.result() {
                Some(Ok(pass2)) => {
                    outer.succeed((pass1, pass2));
                }
                Some(Err(error)) => {
                    outer.fail(error);
                }
                None => {}
            });
        });

        handle
    }

    // === Private Methods ===

    fn local_digest(&self, request: &RoutingRequest) -> Option<DigestInfo> {
        let local_digests = self.local_digests.as_ref()?;
        let (location, domain) = (request.target?, request.domain?);

        let digest = match request.kind {
            RoutingKind::Neighbors => return None,
            RoutingKind::StorageDigest => {
                local_digests.storage_digest(&location, &domain, request.content.as_ref())
            }
            RoutingKind::TrackerDigest => local_digests.tracker_digest(&location, &domain),
        };

        (!digest.is_empty()).then_some(digest)
    }

    fn rejected(&self, peer: &PeerAddress, known: &[PeerAddress]) -> bool {
        self.peer_filters
            .iter()
            .any(|filter| filter.reject_pre_routing(peer, known))
    }
}

impl Debug for Router {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.directory.local())
            .field("peer_filters", &self.peer_filters.len())
            .field("post_filters", &self.post_filters.len())
            .finish()
    }
}

/// A running lookup. Every mutation of its state happens under one lock, RPCs are
/// issued and handles completed outside of it.
struct Lookup {
    router: Router,
    request: RoutingRequest,
    config: RoutingConfig,
    routing_to_others: bool,
    handle: RequestHandle<RoutingResult>,
    state: Mutex<RoutingState>,
}

impl Lookup {
    /// Fill empty slots and wait for the first of the active requests to complete.
    fn round(self: &Arc<Self>) {
        let mut rng = rand::thread_rng();

        let picks = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            state.rounds += 1;

            let mut picks = Vec::new();

            if !state.stop_creating {
                state.grow_slots();

                for index in 0..state.slots.len() {
                    if state.slots[index].is_some() {
                        continue;
                    }

                    match state.next_candidate(&mut rng) {
                        Some(peer) => picks.push((index, peer)),
                        None => break,
                    }
                }
            }

            picks
        };

        let issued = picks
            .into_iter()
            .map(|(index, peer)| {
                trace!(?peer, "Asking for close neighbors");

                let handle = self.router.rpc.neighbors(&peer, &self.neighbor_request(&peer));

                (index, Slot { peer, handle })
            })
            .collect::<Vec<_>>();

        let (active, stopped) = {
            let mut state = self.state.lock();

            if state.finished {
                drop(state);

                for (_, slot) in issued {
                    slot.handle.cancel();
                }

                return;
            }

            for (index, slot) in issued {
                state.slots[index] = Some(slot);
            }

            let active = state
                .slots
                .iter()
                .flatten()
                .map(|slot| slot.handle.clone())
                .collect::<Vec<_>>();

            (active, state.stop_reason.filter(|_| state.stop_creating))
        };

        if active.is_empty() {
            self.finish(stopped.unwrap_or("no more candidates"));
            return;
        }

        let lookup = self.clone();

        first_completed(&active).add_listener(move |_| lookup.evaluate_round());
    }

    fn evaluate_round(self: &Arc<Self>) {
        let verdict = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            let completed = self.take_completed(&mut state);
            let remaining = completed.len();

            let mut verdict = None;

            for (index, slot) in completed.into_iter().enumerate() {
                // The last response of a lookup that has nothing else in flight.
                let last = index + 1 == remaining && state.idle();

                let current = self.evaluate(&mut state, slot, last);
                verdict = Some(current);

                state.stop_creating = current.stop_creating;
                if current.stop_creating && current.reason.is_some() {
                    state.stop_reason = current.reason;
                }

                if current.finished {
                    break;
                }
            }

            verdict
        };

        match verdict {
            Some(Verdict {
                finished: true,
                reason,
                ..
            }) => self.finish(reason.unwrap_or("finished")),
            _ => self.round(),
        }
    }

    fn take_completed(&self, state: &mut RoutingState) -> Vec<Slot> {
        state
            .slots
            .iter_mut()
            .filter(|slot| slot.as_ref().is_some_and(|slot| slot.handle.is_done()))
            .filter_map(Option::take)
            .collect()
    }

    fn evaluate(&self, state: &mut RoutingState, slot: Slot, last: bool) -> Verdict {
        let directory = &self.router.directory;

        match slot.handle.result() {
            Some(Ok(response)) => {
                directory.peer_found(&slot.peer, None);

                for neighbor in &response.neighbors {
                    directory.peer_found(neighbor, Some(&slot.peer));
                }

                let neighbors = response
                    .neighbors
                    .iter()
                    .filter(|peer| !self.router.rejected(peer, &response.neighbors))
                    .copied()
                    .collect::<Vec<_>>();

                trace!(
                    peer = ?slot.peer,
                    direct = !response.digest.is_empty(),
                    neighbors = neighbors.len(),
                    "Got close neighbors"
                );

                let response = NeighborResponse {
                    digest: response.digest,
                    neighbors,
                };

                state.evaluate_success(slot.peer, response, &self.config, last)
            }
            Some(Err(Error::Cancelled)) => Verdict {
                finished: false,
                stop_creating: state.stop_creating,
                reason: None,
            },
            _ => {
                trace!(peer = ?slot.peer, "Neighbor request failed");
                directory.peer_failed(&slot.peer);

                state.evaluate_failure(&self.config)
            }
        }
    }

    fn neighbor_request(&self, peer: &PeerAddress) -> NeighborRequest {
        match self.request.target {
            Some(target) => NeighborRequest {
                target,
                domain: self.request.domain,
                content: self.request.content,
                kind: self.request.kind,
                transport: self.config.transport(),
            },
            // Ask for the peers farthest from the responder.
            None => NeighborRequest {
                target: peer.id.complement(),
                domain: None,
                content: None,
                kind: RoutingKind::Neighbors,
                transport: self.config.transport(),
            },
        }
    }

    /// Complete the lookup and cancel whatever is still in flight.
    fn finish(&self, reason: &str) {
        let (result, pending) = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            state.finished = true;

            (self.result(&state, reason), state.take_slots())
        };

        debug!(
            target = ?self.request.target,
            success = result.success,
            reason = ?result.reason,
            direct_hits = result.direct_hits.len(),
            potential_hits = result.potential_hits.len(),
            stats = ?result.stats,
            "Routing done"
        );

        for slot in pending {
            slot.handle.cancel();
        }

        self.handle.succeed(result);
    }

    /// Merge what already arrived, then cancel everything still in flight.
    fn cancel(&self) {
        let pending = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            for slot in self.take_completed(&mut state) {
                self.evaluate(&mut state, slot, false);
            }

            state.finished = true;
            state.take_slots()
        };

        debug!(target = ?self.request.target, pending = pending.len(), "Routing cancelled");

        for slot in pending {
            slot.handle.cancel();
        }
    }

    fn result(&self, state: &RoutingState, reason: &str) -> RoutingResult {
        let found_nobody = state.potential_hits.len() <= 1 && state.direct_hits.is_empty();
        let success = !(self.routing_to_others && found_nobody);

        let filters = &self.router.post_filters;

        let mut direct_hits = state.direct_hits.clone();
        direct_hits.retain(|peer, digest| !filters.iter().any(|f| f.reject_direct_hit(peer, digest)));

        let mut potential_hits = state.potential_hits.clone();
        potential_hits.retain(|peer| !filters.iter().any(|f| f.reject_potential_hit(peer)));

        RoutingResult {
            direct_hits,
            potential_hits,
            already_asked: state.asked.clone(),
            success,
            reason: if success {
                reason.to_string()
            } else {
                format!("no peer responded ({reason})")
            },
            stats: RoutingStats {
                successes: state.successes,
                failures: state.failures,
                no_new_info: state.no_new_info,
                rounds: state.rounds,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;

    use crate::common::SharedRoutingTable;

    use super::*;

    fn peer(value: u64) -> PeerAddress {
        PeerAddress::new(Id::from_u64(value), SocketAddr::from(([127, 0, 0, 1], value as u16)))
    }

    /// Answers from a fixed map, unknown peers fail, listed peers stay pending.
    #[derive(Default)]
    struct Scripted {
        answers: HashMap<Id, NeighborResponse>,
        pending: Mutex<Vec<(PeerAddress, RequestHandle<NeighborResponse>)>>,
        hold: Vec<Id>,
        asked: Mutex<Vec<(PeerAddress, NeighborRequest)>>,
    }

    impl NeighborRpc for Scripted {
        fn neighbors(&self, peer: &PeerAddress, request: &NeighborRequest) -> RequestHandle<NeighborResponse> {
            self.asked.lock().push((*peer, request.clone()));

            if self.hold.contains(&peer.id) {
                let handle = RequestHandle::new();
                self.pending.lock().push((*peer, handle.clone()));
                return handle;
            }

            match self.answers.get(&peer.id) {
                Some(response) => RequestHandle::completed(Ok(response.clone())),
                None => RequestHandle::completed(Err(Error::Request("unreachable".into()))),
            }
        }
    }

    fn answer(neighbors: &[u64], size: usize) -> NeighborResponse {
        NeighborResponse {
            digest: DigestInfo::new(Id::ZERO, Id::ZERO, size),
            neighbors: neighbors.iter().copied().map(peer).collect(),
        }
    }

    fn router(rpc: Scripted, known: &[u64]) -> (Router, SharedRoutingTable) {
        let table = SharedRoutingTable::new(peer(1000));
        for value in known {
            table.add(peer(*value));
        }

        (Router::new(Arc::new(table.clone()), Arc::new(rpc)), table)
    }

    #[test]
    fn no_seeds_succeeds_immediately() {
        let (router, _) = router(Scripted::default(), &[]);

        let result = router
            .route(RoutingRequest::new(Id::from_u64(5)), RoutingConfig::default())
            .wait()
            .unwrap();

        assert!(result.success);
        assert_eq!(result.potential_hits.peers(), &[peer(1000)]);
        assert_eq!(result.stats.rounds, 0);
    }

    #[test]
    fn fails_when_every_candidate_fails() {
        let (router, table) = router(Scripted::default(), &[1, 2]);

        let config = RoutingConfig::new(1, 1, 5, 10, 2).unwrap();
        let result = router.route(RoutingRequest::new(Id::from_u64(5)), config).wait().unwrap();

        assert!(!result.success);
        assert_eq!(result.stats.failures, 2);
        assert!(result.clone().into_result().is_err());
        assert_eq!(table.size(), 0, "failed peers leave the directory");
    }

    #[test]
    fn direct_hit_cancels_pending_requests() {
        let mut rpc = Scripted::default();
        rpc.answers.insert(Id::from_u64(1), answer(&[], 3));
        rpc.hold.push(Id::from_u64(2));

        let (router, _) = router(rpc, &[1, 2]);

        let config = RoutingConfig::new(1, 5, 5, 10, 2).unwrap();
        let result = router
            .route(RoutingRequest::storage_digest(Id::from_u64(0), Id::ZERO, None), config)
            .wait()
            .unwrap();

        assert!(result.success);
        assert_eq!(result.direct_hits_count(), 1);
        assert_eq!(result.reason, "enough direct hits");
    }

    #[test]
    fn cancelling_cancels_in_flight_requests() {
        let rpc = Arc::new(Scripted {
            hold: vec![Id::from_u64(1), Id::from_u64(2), Id::from_u64(3)],
            ..Default::default()
        });

        let table = SharedRoutingTable::new(peer(1000));
        for value in [1, 2, 3] {
            table.add(peer(value));
        }

        let router = Router::new(Arc::new(table), rpc.clone());
        let config = RoutingConfig::new(1, 5, 5, 10, 3).unwrap();

        let handle = router.route(RoutingRequest::new(Id::from_u64(0)), config);

        let pending = rpc.pending.lock().clone();
        assert_eq!(pending.len(), 3);

        // One response lands before the cancellation.
        pending[0].1.succeed(answer(&[], 0));

        assert!(handle.cancel());

        let pending = rpc.pending.lock().clone();
        assert_eq!(pending.len(), 3, "no new round was scheduled");
        assert!(pending.iter().all(|(_, handle)| handle.is_done()));
        assert!(pending[1..].iter().all(|(_, handle)| handle.is_cancelled()));
    }

    #[test]
    fn random_walk_asks_for_the_complement_of_each_responder() {
        let mut rpc = Scripted::default();
        rpc.answers.insert(Id::from_u64(1), answer(&[4], 0));
        rpc.answers.insert(Id::from_u64(2), answer(&[], 0));
        rpc.answers.insert(Id::from_u64(3), answer(&[], 0));
        rpc.answers.insert(Id::from_u64(4), answer(&[], 0));

        let rpc = Arc::new(rpc);

        let table = SharedRoutingTable::new(peer(1000));
        for value in [1, 2, 3] {
            table.add(peer(value));
        }

        let router = Router::new(Arc::new(table), rpc.clone());
        let config = RoutingConfig::new(1, 10, 5, 10, 2).unwrap();

        let result = router.route(RoutingRequest::random(), config).wait().unwrap();

        assert!(result.success);

        let asked = rpc.asked.lock().clone();
        assert_eq!(asked.len(), 4);

        for (peer, request) in asked {
            assert_eq!(request.target, peer.id.complement());
            assert_eq!(request.kind, RoutingKind::Neighbors);
            assert_eq!(request.domain, None);
        }
    }

    #[test]
    fn unbounded_parallelism_asks_every_known_peer_at_once() {
        let rpc = Arc::new(Scripted {
            hold: vec![Id::from_u64(1), Id::from_u64(2), Id::from_u64(3)],
            ..Default::default()
        });

        let table = SharedRoutingTable::new(peer(1000));
        for value in [1, 2, 3] {
            table.add(peer(value));
        }

        let router = Router::new(Arc::new(table), rpc.clone());
        let config = RoutingConfig::new(1, 5, 3, 20, i64::MAX).unwrap();

        let handle = router.route(RoutingRequest::new(Id::from_u64(0)), config);

        let pending = rpc.pending.lock().clone();
        assert_eq!(pending.len(), 3);

        for (_, handle) in pending {
            handle.succeed(answer(&[], 0));
        }

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!(result.stats.successes, 3);
    }

    fn answered_at_once(config: RoutingConfig) -> RoutingResult {
        let mut rpc = Scripted::default();
        rpc.answers.insert(Id::from_u64(1), answer(&[], 0));
        rpc.answers.insert(Id::from_u64(2), answer(&[], 0));

        let (router, _) = router(rpc, &[1, 2]);

        router
            .route(RoutingRequest::new(Id::from_u64(0)), config)
            .wait()
            .unwrap()
    }

    #[test]
    fn responses_landing_together_keep_their_stop_reason() {
        let result = answered_at_once(RoutingConfig::new(1, 0, 5, 10, 2).unwrap());

        assert!(result.success);
        assert_eq!(result.reason, "no new information");
        assert_eq!(result.stats.successes, 2);

        let result = answered_at_once(RoutingConfig::new(1, 10, 5, 1, 2).unwrap());

        assert!(result.success);
        assert_eq!(result.reason, "max successes reached");
    }
}
