//! Tracker verbs: announce this node under a key, and find who announced themselves.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;

use crate::common::{Id, PeerAddress, TrackerEntry, XorComparator};
use crate::dht::{Candidates, DhtFuture, Plan, Services};
use crate::rpc::{
    CollectResponses, ConnectionReservation, RequestConfig, Router, RoutingConfig, RoutingRequest,
    TrackerAddRequest, TrackerGetRequest, TrackerRpc,
};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerAddResult {
    /// Trackers that registered this node.
    pub acknowledged: Vec<PeerAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerGetResult {
    pub per_peer: HashMap<PeerAddress, Vec<TrackerEntry>>,
    /// Every entry any tracker reported, one per announced peer, closest first.
    pub entries: Vec<TrackerEntry>,
}

#[derive(Clone)]
/// The tracker verbs of a single node.
pub struct Tracker {
    services: Services,
    rpc: Arc<dyn TrackerRpc>,
    request: RequestConfig,
}

impl Tracker {
    pub fn new(router: Router, rpc: Arc<dyn TrackerRpc>) -> Self {
        Self {
            services: Services::new(router),
            rpc,
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

    // === Public Methods ===

    /// Register this node, with an optional attachment, on the trackers closest to
    /// `location`.
    pub fn add_to_tracker(
        &self,
        location: Id,
        domain: Id,
        attachment: Option<Bytes>,
    ) -> DhtFuture<TrackerAddResult> {
        let request = TrackerAddRequest {
            location,
            domain,
            attachment,
            transport: self.request.transport(),
        };

        let rpc = self.rpc.clone();

        self.services.execute(Plan {
            candidates: Candidates::PotentialHits(RoutingRequest::tracker_digest(location, domain)),
            operation: CollectResponses::new(move |peer: &PeerAddress| rpc.add(peer, &request)),
            request: self.request,
            cancel_on_finish: false,
            aggregate: Box::new(|result, config| {
                if result.output.len() < config.minimum_results() {
                    return Err(Error::MinimumNotReached {
                        expected: config.minimum_results(),
                        actual: result.output.len(),
                    });
                }

                let mut acknowledged = result.output.into_keys().collect::<Vec<_>>();
                acknowledged.sort_by_key(|peer| peer.id);

                Ok(TrackerAddResult { acknowledged })
            }),
        })
    }

    /// Ask the trackers that hold entries for `location / domain` and merge their lists.
    pub fn get_from_tracker(&self, location: Id, domain: Id) -> DhtFuture<TrackerGetResult> {
        let request = TrackerGetRequest {
            location,
            domain,
            transport: self.request.transport(),
        };

        let rpc = self.rpc.clone();

        self.services.execute(Plan {
            candidates: Candidates::DirectHits {
                routing: RoutingRequest::tracker_digest(location, domain),
                adjust: true,
            },
            operation: CollectResponses::new(move |peer: &PeerAddress| rpc.get(peer, &request)),
            request: self.request,
            cancel_on_finish: true,
            aggregate: Box::new(move |result, _| {
                // Union over every tracker, one entry per announced peer.
                let merged = result
                    .output
                    .values()
                    .flatten()
                    .map(|entry| (entry.peer.id, entry.clone()))
                    .collect::<BTreeMap<Id, TrackerEntry>>();

                let mut entries = merged.into_values().collect::<Vec<_>>();

                let comparator = XorComparator::new(location);
                entries.sort_by(|a, b| comparator.compare(&a.peer, &b.peer));

                Ok(TrackerGetResult {
                    per_peer: result.output,
                    entries,
                })
            }),
        })
    }
}

impl Debug for Tracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracker")
            .field("router", &self.services.router)
            .field("request", &self.request)
            .finish()
    }
}
