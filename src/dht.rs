//! Data-plane verbs: put, add, get, digest, remove and quit.
//!
//! Every verb reserves connections, routes to the peers responsible for a key, fans the
//! actual request out to them and aggregates their answers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::{Data, Id, PeerAddress, StorageKey};
use crate::handle::RequestHandle;
use crate::rpc::{
    fanout, CollectResponses, ConnectionReservation, CumulativeScheme, EvaluationScheme,
    FanoutResult, GetRequest, Operation, PutRequest, QuitRpc, RemoveRequest, RequestConfig,
    RequestTracker, Router, RoutingConfig, RoutingRequest, RoutingResult, StorageRpc,
    Unreserved, VotingScheme, QUIT_NOTIFY_COUNT,
};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where a verb is at.
pub enum VerbPhase {
    AcquiringTransport,
    Routing,
    FanningOut,
    Aggregating,
    Done,
    Failed,
}

impl VerbPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VerbPhase::Done | VerbPhase::Failed)
    }
}

struct Progress {
    phase: VerbPhase,
    routing: Option<RoutingResult>,
    /// Cancels whatever the verb is currently waiting on.
    stage: Option<Box<dyn FnOnce() + Send>>,
    reserved: usize,
    /// The configuration the fan-out runs with.
    request: Option<RequestConfig>,
}

/// A running verb.
///
/// Cancelling it cancels the stage it is currently in.
pub struct DhtFuture<O> {
    handle: RequestHandle<O>,
    progress: Arc<Mutex<Progress>>,
    tracker: RequestTracker,
    reservation: Arc<dyn ConnectionReservation>,
}

impl<O> Clone for DhtFuture<O> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            progress: self.progress.clone(),
            tracker: self.tracker.clone(),
            reservation: self.reservation.clone(),
        }
    }
}

impl<O: Clone + Send + 'static> DhtFuture<O> {
    fn new(reservation: Arc<dyn ConnectionReservation>) -> Self {
        let future = Self {
            handle: RequestHandle::new(),
            progress: Arc::new(Mutex::new(Progress {
                phase: VerbPhase::AcquiringTransport,
                routing: None,
                stage: None,
                reserved: 0,
                request: None,
            })),
            tracker: RequestTracker::new(),
            reservation,
        };

        let progress = future.progress.clone();
        let reservation = future.reservation.clone();

        future
            .handle
            .on_cancel(move || Self::abort(&progress, reservation.as_ref()));

        future
    }

    /// Fail the verb and cancel its current stage, unless it already ended.
    fn abort(progress: &Mutex<Progress>, reservation: &dyn ConnectionReservation) {
        let (stage, reserved) = {
            let mut progress = progress.lock();

            if progress.phase.is_terminal() {
                return;
            }

            progress.phase = VerbPhase::Failed;

            (progress.stage.take(), std::mem::take(&mut progress.reserved))
        };

        if let Some(stage) = stage {
            stage();
        }

        if reserved > 0 {
            reservation.release(reserved);
        }
    }

    // === Getters ===

    pub fn phase(&self) -> VerbPhase {
        self.progress.lock().phase
    }

    /// The umbrella handle of this verb.
    pub fn handle(&self) -> &RequestHandle<O> {
        &self.handle
    }

    /// The routing outcome, once routing is done.
    pub fn routing(&self) -> Option<RoutingResult> {
        self.progress.lock().routing.clone()
    }

    /// The fan-out configuration, once fanning out started.
    ///
    /// Verbs sent to direct hits may lower the configured minimum to the number of hits.
    pub fn request_config(&self) -> Option<RequestConfig> {
        self.progress.lock().request
    }

    /// Every per-peer request issued by the fan-out so far.
    pub fn requests(&self) -> Vec<(PeerAddress, RequestHandle<()>)> {
        self.tracker.requests()
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    // === Public Methods ===

    /// Block until the verb completes.
    pub fn wait(&self) -> Result<O> {
        self.handle.wait()
    }

    #[cfg(feature = "async")]
    pub async fn wait_async(&self) -> Result<O> {
        self.handle.wait_async().await
    }

    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    // === Private Methods ===

    /// Move to `phase`, waiting on `stage`. Returns `false` if the verb already ended, in
    /// which case `stage` is cancelled.
    fn enter<T: Send + 'static>(&self, phase: VerbPhase, stage: &RequestHandle<T>) -> bool {
        {
            let mut progress = self.progress.lock();

            if !progress.phase.is_terminal() {
                trace!(?phase, "Verb phase");

                progress.phase = phase;

                let stage = stage.clone();
                progress.stage = Some(Box::new(move || {
                    stage.cancel();
                }));

                return true;
            }
        }

        stage.cancel();

        false
    }

    /// Record acquired permits. Returns `false`, releasing them, if the verb already ended.
    fn reserved(&self, permits: usize) -> bool {
        {
            let mut progress = self.progress.lock();

            if !progress.phase.is_terminal() {
                progress.reserved = permits;
                return true;
            }
        }

        self.reservation.release(permits);

        false
    }

    fn set_routing(&self, routing: RoutingResult) {
        self.progress.lock().routing = Some(routing);
    }

    fn set_request(&self, request: RequestConfig) {
        self.progress.lock().request = Some(request);
    }

    fn set_phase(&self, phase: VerbPhase) {
        let mut progress = self.progress.lock();

        if !progress.phase.is_terminal() {
            progress.phase = phase;
            progress.stage = None;
        }
    }

    fn end(&self, result: Result<O>) {
        let reserved = {
            let mut progress = self.progress.lock();

            if progress.phase.is_terminal() {
                return;
            }

            progress.phase = match result {
                Ok(_) => VerbPhase::Done,
                Err(_) => VerbPhase::Failed,
            };
            progress.stage = None;

            std::mem::take(&mut progress.reserved)
        };

        if reserved > 0 {
            self.reservation.release(reserved);
        }

        if let Err(error) = &result {
            debug!(?error, "Verb failed");
        }

        self.handle.complete(result);
    }
}

impl<O> Debug for DhtFuture<O> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtFuture")
            .field("phase", &self.progress.lock().phase)
            .field("handle", &self.handle)
            .field("requests", &self.tracker)
            .finish()
    }
}

/// Which peers a verb's fan-out goes to, and how they are found.
pub(crate) enum Candidates {
    /// Everyone who answered during routing.
    PotentialHits(RoutingRequest),
    /// Peers that claimed to hold the data. With `adjust` the minimum of the request
    /// config is lowered to their count.
    DirectHits {
        routing: RoutingRequest,
        adjust: bool,
    },
    /// No routing at all.
    Fixed(Vec<PeerAddress>),
}

type Aggregate<T, O> = Box<dyn FnOnce(FanoutResult<T>, &RequestConfig) -> Result<O> + Send>;

/// Everything a verb needs besides the shared collaborators.
pub(crate) struct Plan<Op: Operation, O> {
    pub candidates: Candidates,
    pub operation: Op,
    pub request: RequestConfig,
    pub cancel_on_finish: bool,
    pub aggregate: Aggregate<Op::Output, O>,
}

#[derive(Clone)]
/// Collaborators shared by every verb of a node.
pub(crate) struct Services {
    pub router: Router,
    pub reservation: Arc<dyn ConnectionReservation>,
    pub routing: RoutingConfig,
}

impl Services {
    pub fn new(router: Router) -> Self {
        Self {
            router,
            reservation: Arc::new(Unreserved),
            routing: RoutingConfig::default(),
        }
    }

    /// Run a verb: reserve, route, fan out, aggregate.
    pub fn execute<Op, O>(&self, plan: Plan<Op, O>) -> DhtFuture<O>
    where
        Op: Operation,
        O: Clone + Send + 'static,
    {
        let future = DhtFuture::new(self.reservation.clone());

        let permits = self.routing.parallelism().max(plan.request.parallel());
        let reservation = self.reservation.reserve(permits);

        if !future.enter(VerbPhase::AcquiringTransport, &reservation) {
            return future;
        }

        let services = self.clone();
        let verb = future.clone();

        reservation.add_listener(move |reservation| {
            match reservation.error() {
                None if verb.reserved(permits) => services.route(verb, plan),
                None | Some(Error::Cancelled) => {}
                Some(error) => verb.end(Err(Error::Reservation(error.to_string()))),
            }
        });

        future
    }

    fn route<Op, O>(&self, verb: DhtFuture<O>, plan: Plan<Op, O>)
    where
        Op: Operation,
        O: Clone + Send + 'static,
    {
        let routing = match &plan.candidates {
            Candidates::Fixed(peers) => {
                let peers = peers.clone();
                let request = plan.request;

                fan_out(verb, peers, request, plan);
                return;
            }
            Candidates::PotentialHits(routing) | Candidates::DirectHits { routing, .. } => {
                routing.clone()
            }
        };

        let routing = self.router.route(routing, self.routing);

        if !verb.enter(VerbPhase::Routing, &routing) {
            return;
        }

        routing.add_listener(move |routing| {
            let result = match routing.result() {
                Some(Ok(result)) => result,
                Some(Err(Error::Cancelled)) | None => return,
                Some(Err(error)) => {
                    verb.end(Err(error));
                    return;
                }
            };

            verb.set_routing(result.clone());

            let result = match result.into_result() {
                Ok(result) => result,
                Err(error) => {
                    verb.end(Err(error));
                    return;
                }
            };

            let (peers, request) = match &plan.candidates {
                Candidates::DirectHits { adjust: true, .. } => (
                    result.direct_hits.peers().peers().to_vec(),
                    plan.request.adjust_to_actual(result.direct_hits_count()),
                ),
                Candidates::DirectHits { adjust: false, .. } => {
                    (result.direct_hits.peers().peers().to_vec(), plan.request)
                }
                _ => (result.potential_hits.peers().to_vec(), plan.request),
            };

            fan_out(verb, peers, request, plan);
        });
    }
}

fn fan_out<Op, O>(verb: DhtFuture<O>, peers: Vec<PeerAddress>, request: RequestConfig, plan: Plan<Op, O>)
where
    Op: Operation,
    O: Clone + Send + 'static,
{
    let Plan {
        operation,
        cancel_on_finish,
        aggregate,
        ..
    } = plan;

    trace!(candidates = peers.len(), minimum = request.minimum_results(), "Fanning out");

    verb.set_request(request);

    let fanout = fanout(peers, request, operation, cancel_on_finish, verb.tracker.clone());

    if !verb.enter(VerbPhase::FanningOut, &fanout) {
        return;
    }

    fanout.add_listener(move |fanout| {
        let result = match fanout.result() {
            Some(Ok(result)) => result,
            Some(Err(Error::Cancelled)) | None => return,
            Some(Err(error)) => {
                verb.end(Err(error));
                return;
            }
        };

        let result = match result.into_result() {
            Ok(result) => result,
            Err(error) => {
                verb.end(Err(error));
                return;
            }
        };

        verb.set_phase(VerbPhase::Aggregating);
        verb.end(aggregate(result, &request));
    });
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of put and add.
pub struct StoreResult {
    /// Keys each peer reported as stored.
    pub per_peer: HashMap<PeerAddress, BTreeSet<StorageKey>>,
    /// Keys stored according to the evaluation scheme.
    pub keys: BTreeSet<StorageKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of get.
pub struct GetResult {
    pub per_peer: HashMap<PeerAddress, BTreeMap<StorageKey, Data>>,
    /// Values a majority of the responders agree on.
    pub data: BTreeMap<StorageKey, Data>,
}

impl GetResult {
    fn voted(per_peer: HashMap<PeerAddress, BTreeMap<StorageKey, Data>>) -> Self {
        Self {
            data: VotingScheme.evaluate_data(&per_peer),
            per_peer,
        }
    }

    /// The first value, handy when a single value was requested.
    pub fn first(&self) -> Option<&Data> {
        self.data.values().next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of digest.
pub struct DigestResult {
    /// Content hashes each peer reported.
    pub per_peer: HashMap<PeerAddress, BTreeMap<StorageKey, Id>>,
    pub keys: BTreeSet<StorageKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of remove.
pub struct RemoveResult {
    pub per_peer: HashMap<PeerAddress, BTreeMap<StorageKey, Data>>,
    /// Keys removed according to a majority of the responders.
    pub keys: BTreeSet<StorageKey>,
    /// Removed values, only if they were asked for.
    pub data: BTreeMap<StorageKey, Data>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of quit.
pub struct QuitResult {
    /// Peers that acknowledged the notification.
    pub acknowledged: Vec<PeerAddress>,
}

#[derive(Clone)]
/// The storage verbs of a single node.
pub struct DistributedHashTable {
    services: Services,
    storage: Arc<dyn StorageRpc>,
    quit: Arc<dyn QuitRpc>,
    request: RequestConfig,
}

impl DistributedHashTable {
    pub fn new(router: Router, storage: Arc<dyn StorageRpc>, quit: Arc<dyn QuitRpc>) -> Self {
        Self {
            services: Services::new(router),
            storage,
            quit,
            request: RequestConfig::default(),
        }
    }

    pub fn with_reservation(mut self, reservation: Arc<dyn ConnectionReservation>) -> Self {
        self.services.reservation = reservation;
        self
    }

    pub fn with_routing_config(mut self, config: RoutingConfig) -> Self {
        self.services.routing = config;
        self
    }

    pub fn with_request_config(mut self, config: RequestConfig) -> Self {
        self.request = config;
        self
    }

    // === Getters ===

    pub fn router(&self) -> &Router {
        &self.services.router
    }

    pub fn local(&self) -> PeerAddress {
        self.services.router.local()
    }

    pub fn routing_config(&self) -> RoutingConfig {
        self.services.routing
    }

    pub fn request_config(&self) -> RequestConfig {
        self.request
    }

    // === Public Methods ===

    /// Store `data` under `location / domain` with the zero content key.
    pub fn put(&self, location: Id, domain: Id, data: Data) -> DhtFuture<StoreResult> {
        self.put_entries(location, domain, BTreeMap::from([(Id::ZERO, data)]))
    }

    /// Store several values under `location / domain`, keyed by content key.
    ///
    /// Fails with [Error::MinimumNotReached] if fewer peers than the configured minimum
    /// stored anything.
    pub fn put_entries(&self, location: Id, domain: Id, entries: BTreeMap<Id, Data>) -> DhtFuture<StoreResult> {
        let request = PutRequest {
            location,
            domain,
            entries,
            put_if_absent: false,
            transport: self.request.transport(),
        };

        self.store(location, request, VotingScheme)
    }

    /// Like [Self::put], but peers already holding a value under the key keep it.
    ///
    /// Peers that kept their value do not count as having stored anything, so the verb
    /// fails with [Error::MinimumNotReached] when the key is taken everywhere.
    pub fn put_if_absent(&self, location: Id, domain: Id, data: Data) -> DhtFuture<StoreResult> {
        let request = PutRequest {
            location,
            domain,
            entries: BTreeMap::from([(Id::ZERO, data)]),
            put_if_absent: true,
            transport: self.request.transport(),
        };

        self.store(location, request, VotingScheme)
    }

    /// Add values to the collection under `location / domain`, keyed by their hash.
    pub fn add(&self, location: Id, domain: Id, values: Vec<Data>) -> DhtFuture<StoreResult> {
        let request = PutRequest {
            location,
            domain,
            entries: values.into_iter().map(|data| (data.hash(), data)).collect(),
            put_if_absent: false,
            transport: self.request.transport(),
        };

        self.store(location, request, CumulativeScheme)
    }

    /// Fetch one value, or every value under `location / domain` if `content` is `None`.
    pub fn get(&self, location: Id, domain: Id, content: Option<Id>) -> DhtFuture<GetResult> {
        let request = GetRequest {
            location,
            domain,
            content,
            content_range: None,
            transport: self.request.transport(),
        };

        let storage = self.storage.clone();

        self.services.execute(Plan {
            candidates: Candidates::DirectHits {
                routing: RoutingRequest::storage_digest(location, domain, content),
                adjust: true,
            },
            operation: CollectResponses::new(move |peer: &PeerAddress| storage.get(peer, &request)),
            request: self.request,
            cancel_on_finish: true,
            aggregate: Box::new(|result, _| Ok(GetResult::voted(result.output))),
        })
    }

    /// Fetch every value under `location / domain` whose content key lies in `from..=to`.
    ///
    /// A range may be spread over peers that each hold only part of it, so every peer
    /// that answered during routing is asked, with the request config unchanged.
    pub fn get_range(&self, location: Id, domain: Id, from: Id, to: Id) -> DhtFuture<GetResult> {
        let request = GetRequest {
            location,
            domain,
            content: None,
            content_range: Some((from, to)),
            transport: self.request.transport(),
        };

        let storage = self.storage.clone();

        self.services.execute(Plan {
            candidates: Candidates::PotentialHits(RoutingRequest::storage_digest(
                location, domain, None,
            )),
            operation: CollectResponses::new(move |peer: &PeerAddress| storage.get(peer, &request)),
            request: self.request,
            cancel_on_finish: true,
            aggregate: Box::new(|result, _| Ok(GetResult::voted(result.output))),
        })
    }

    /// Like [Self::get], but peers answer with content hashes instead of values.
    ///
    /// The request config is used as configured even when fewer peers hold the data, so
    /// the outcome reflects every missing replica.
    pub fn digest(&self, location: Id, domain: Id, content: Option<Id>) -> DhtFuture<DigestResult> {
        let request = GetRequest {
            location,
            domain,
            content,
            content_range: None,
            transport: self.request.transport(),
        };

        let storage = self.storage.clone();

        self.services.execute(Plan {
            candidates: Candidates::DirectHits {
                routing: RoutingRequest::storage_digest(location, domain, content),
                adjust: false,
            },
            operation: CollectResponses::new(move |peer: &PeerAddress| {
                storage.digest(peer, &request)
            }),
            request: self.request,
            cancel_on_finish: true,
            aggregate: Box::new(|result, _| {
                let keys = VotingScheme.evaluate_digest(&result.output);

                Ok(DigestResult {
                    per_peer: result.output,
                    keys,
                })
            }),
        })
    }

    /// Remove one value, or every value under `location / domain` if `content` is `None`.
    pub fn remove(
        &self,
        location: Id,
        domain: Id,
        content: Option<Id>,
        return_results: bool,
    ) -> DhtFuture<RemoveResult> {
        let request = RemoveRequest {
            location,
            domain,
            content,
            return_results,
            transport: self.request.transport(),
        };

        let storage = self.storage.clone();

        self.services.execute(Plan {
            candidates: Candidates::DirectHits {
                routing: RoutingRequest::storage_digest(location, domain, content),
                adjust: true,
            },
            operation: CollectResponses::new(move |peer: &PeerAddress| {
                storage.remove(peer, &request)
            }),
            request: self.request,
            cancel_on_finish: return_results,
            aggregate: Box::new(move |result, _| {
                let removed_keys = result
                    .output
                    .iter()
                    .map(|(peer, removed)| (*peer, removed.keys().copied().collect()))
                    .collect::<HashMap<_, BTreeSet<_>>>();

                let keys = VotingScheme.evaluate_keys(&removed_keys);

                let data = if return_results {
                    VotingScheme.evaluate_data(&result.output)
                } else {
                    BTreeMap::new()
                };

                Ok(RemoveResult {
                    per_peer: result.output,
                    keys,
                    data,
                })
            }),
        })
    }

    /// Tell the closest known peers that this node is leaving. No routing is involved.
    ///
    /// Every peer is notified, and the verb succeeds whoever acknowledged.
    pub fn quit(&self) -> DhtFuture<QuitResult> {
        let local = self.local();
        let peers = self
            .services
            .router
            .directory()
            .close_peers(&local.id, QUIT_NOTIFY_COUNT);

        let quit = self.quit.clone();
        let transport = self.request.transport();
        let request = self.request.broadcast(peers.len());

        self.services.execute(Plan {
            candidates: Candidates::Fixed(peers),
            operation: CollectResponses::new(move |peer: &PeerAddress| quit.quit(peer, transport)),
            request,
            cancel_on_finish: false,
            aggregate: Box::new(|result, _| {
                let mut acknowledged = result.output.into_keys().collect::<Vec<_>>();
                acknowledged.sort_by_key(|peer| peer.id);

                Ok(QuitResult { acknowledged })
            }),
        })
    }

    // === Private Methods ===

    fn store<S>(&self, location: Id, request: PutRequest, scheme: S) -> DhtFuture<StoreResult>
    where
        S: EvaluationScheme + Send + 'static,
    {
        let storage = self.storage.clone();

        let routing = RoutingRequest {
            domain: Some(request.domain),
            ..RoutingRequest::new(location)
        };

        self.services.execute(Plan {
            candidates: Candidates::PotentialHits(routing),
            operation: CollectResponses::new(move |peer: &PeerAddress| storage.put(peer, &request)),
            request: self.request,
            cancel_on_finish: false,
            aggregate: Box::new(move |result, config| {
                let per_peer = result
                    .output
                    .into_iter()
                    .filter(|(_, keys)| !keys.is_empty())
                    .collect::<HashMap<_, _>>();

                if per_peer.len() < config.minimum_results() {
                    return Err(Error::MinimumNotReached {
                        expected: config.minimum_results(),
                        actual: per_peer.len(),
                    });
                }

                let keys = scheme.evaluate_keys(&per_peer);

                Ok(StoreResult { per_peer, keys })
            }),
        })
    }
}

impl Debug for DistributedHashTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedHashTable")
            .field("router", &self.services.router)
            .field("routing", &self.services.routing)
            .field("request", &self.request)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::testnet::Testnet;

    use super::*;

    /// Hands out reservations that complete only when the test says so.
    #[derive(Default)]
    struct Pending {
        handles: Mutex<Vec<RequestHandle<()>>>,
        released: AtomicUsize,
    }

    impl ConnectionReservation for Pending {
        fn reserve(&self, _permits: usize) -> RequestHandle<()> {
            let handle = RequestHandle::new();
            self.handles.lock().push(handle.clone());
            handle
        }

        fn release(&self, permits: usize) {
            self.released.fetch_add(permits, Ordering::SeqCst);
        }
    }

    #[test]
    fn waits_for_transport_before_routing() {
        let testnet = Testnet::new(4);
        let reservation = Arc::new(Pending::default());

        let dht = testnet.node(0).dht().with_reservation(reservation.clone());
        let put = dht.put(Id::random(), Id::ZERO, Data::from("value"));

        assert_eq!(put.phase(), VerbPhase::AcquiringTransport);
        assert!(testnet.nodes().iter().all(|node| node.received() == 0));

        let handle = reservation.handles.lock()[0].clone();
        handle.succeed(());

        assert!(put.wait().is_ok());
        assert_eq!(put.phase(), VerbPhase::Done);
        assert_eq!(reservation.released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelling_while_acquiring_cancels_the_reservation() {
        let testnet = Testnet::new(4);
        let reservation = Arc::new(Pending::default());

        let dht = testnet.node(0).dht().with_reservation(reservation.clone());
        let get = dht.get(Id::random(), Id::ZERO, None);

        assert!(get.cancel());

        let handle = reservation.handles.lock()[0].clone();

        assert!(handle.is_cancelled());
        assert_eq!(get.phase(), VerbPhase::Failed);
        assert_eq!(reservation.released.load(Ordering::SeqCst), 0);
        assert!(testnet.nodes().iter().all(|node| node.received() == 0));
    }

    #[test]
    fn quit_without_peers_succeeds_right_away() {
        let testnet = Testnet::new(1);

        let result = testnet.node(0).dht().quit().wait().unwrap();

        assert!(result.acknowledged.is_empty());
    }

    #[test]
    fn a_late_cancel_leaves_a_finished_verb_alone() {
        let reservation = Arc::new(Pending::default());
        let future = DhtFuture::<u8>::new(reservation.clone());

        assert!(future.reserved(2));
        future.end(Ok(7));

        // A cancel that took the hook just before the verb ended runs it afterwards.
        DhtFuture::<u8>::abort(&future.progress, reservation.as_ref());

        assert_eq!(future.phase(), VerbPhase::Done);
        assert_eq!(future.wait(), Ok(7));
        assert_eq!(reservation.released.load(Ordering::SeqCst), 2);
        assert!(!future.cancel());
    }

    #[test]
    fn terminal_phases() {
        assert!(VerbPhase::Done.is_terminal());
        assert!(VerbPhase::Failed.is_terminal());
        assert!(!VerbPhase::FanningOut.is_terminal());
    }
}
