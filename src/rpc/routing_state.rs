//! Mutable state of a single routing lookup.

use rand::Rng;

use crate::common::{ClosestPeers, DigestInfo, DirectHits, PeerAddress, XorComparator};
use crate::handle::RequestHandle;

use super::{NeighborResponse, RoutingConfig};

/// A neighbor query occupying one of the lookup's parallel slots.
#[derive(Debug)]
pub(crate) struct Slot {
    pub peer: PeerAddress,
    pub handle: RequestHandle<NeighborResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a single evaluated response means for the lookup.
pub(crate) struct Verdict {
    pub finished: bool,
    pub stop_creating: bool,
    /// Why the lookup stops or stops creating requests, if it does.
    pub reason: Option<&'static str>,
}

impl Verdict {
    fn proceed() -> Self {
        Self {
            finished: false,
            stop_creating: false,
            reason: None,
        }
    }
}

/// Candidates, asked peers, hits and counters of one lookup.
///
/// `queue` and `asked` are kept disjoint: a peer leaves the queue when it is asked, and
/// merged neighbors that were already asked never enter it.
#[derive(Debug)]
pub(crate) struct RoutingState {
    pub queue: ClosestPeers,
    pub asked: ClosestPeers,
    pub direct_hits: DirectHits,
    pub potential_hits: ClosestPeers,
    pub slots: Vec<Option<Slot>>,

    pub no_new_info: usize,
    pub failures: usize,
    pub successes: usize,
    pub rounds: usize,

    pub stop_creating: bool,
    /// Why the lookup stopped creating requests, once it did.
    pub stop_reason: Option<&'static str>,
    pub finished: bool,

    parallelism: usize,
    random: bool,
}

impl RoutingState {
    /// `random` selects candidates uniformly instead of closest first.
    pub fn new(local: PeerAddress, comparator: XorComparator, parallelism: usize, random: bool) -> Self {
        let mut asked = ClosestPeers::with_comparator(comparator);
        let mut potential_hits = ClosestPeers::with_comparator(comparator);

        asked.add(local);
        potential_hits.add(local);

        Self {
            queue: ClosestPeers::with_comparator(comparator),
            asked,
            direct_hits: DirectHits::new(comparator),
            potential_hits,
            slots: Vec::new(),

            no_new_info: 0,
            failures: 0,
            successes: 0,
            rounds: 0,

            stop_creating: false,
            stop_reason: None,
            finished: false,

            parallelism,
            random,
        }
    }

    // === Public Methods ===

    /// Add initial candidates, skipping anyone already asked (this node included).
    pub fn seed<I: IntoIterator<Item = PeerAddress>>(&mut self, peers: I) {
        for peer in peers {
            if !self.asked.contains(&peer) {
                self.queue.add(peer);
            }
        }
    }

    /// Move the next candidate from the queue to the asked set.
    pub fn next_candidate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<PeerAddress> {
        let next = if self.random {
            self.queue.pop_random(rng)
        } else {
            self.queue.pop_first()
        }?;

        self.asked.add(next);

        Some(next)
    }

    /// Merge reported neighbors into the queue.
    ///
    /// Returns `true` if this is new information: the best of the merged peers is not
    /// queued yet and sorts before everything that is.
    pub fn merge<I: IntoIterator<Item = PeerAddress>>(&mut self, neighbors: I) -> bool {
        let mut fresh = ClosestPeers::with_comparator(*self.queue.comparator());
        fresh.extend(neighbors.into_iter().filter(|peer| !self.asked.contains(peer)));

        let Some(best) = fresh.first().copied() else {
            return false;
        };

        let new_information = !self.queue.contains(&best)
            && self
                .queue
                .first()
                .map(|current| self.queue.comparator().compare(&best, current).is_lt())
                .unwrap_or(true);

        self.queue.extend(fresh);

        new_information
    }

    /// Evaluate a successful neighbor response from `peer`.
    ///
    /// `last` is whether this was the only active request when the round started.
    pub fn evaluate_success(
        &mut self,
        peer: PeerAddress,
        response: NeighborResponse,
        config: &RoutingConfig,
        last: bool,
    ) -> Verdict {
        self.potential_hits.add(peer);

        if self.add_direct_hit(peer, response.digest, config) {
            return Verdict {
                finished: true,
                stop_creating: true,
                reason: Some("enough direct hits"),
            };
        }

        self.successes += 1;

        if self.successes > config.max_success() {
            return Verdict {
                finished: last,
                stop_creating: true,
                reason: Some("max successes reached"),
            };
        }

        if self.merge(response.neighbors) {
            self.no_new_info = 0;
        } else {
            self.no_new_info += 1;

            if self.no_new_info >= config.max_no_new_info() {
                return Verdict {
                    finished: last,
                    stop_creating: true,
                    reason: Some("no new information"),
                };
            }
        }

        Verdict::proceed()
    }

    /// Count a failed neighbor query.
    pub fn evaluate_failure(&mut self, config: &RoutingConfig) -> Verdict {
        self.failures += 1;

        let finished = self.failures > config.max_failures();

        Verdict {
            finished,
            stop_creating: finished,
            reason: finished.then_some("too many failures"),
        }
    }

    /// Record a non-empty digest. Returns `true` once enough direct hits were found.
    pub fn add_direct_hit(
        &mut self,
        peer: PeerAddress,
        digest: DigestInfo,
        config: &RoutingConfig,
    ) -> bool {
        self.direct_hits.insert(peer, digest) && self.direct_hits.len() >= config.max_direct_hits()
    }

    /// Open as many slots as there are candidates to fill them, up to `parallelism`.
    pub fn grow_slots(&mut self) {
        let occupied = self.slots.iter().flatten().count();
        let wanted = self
            .parallelism
            .min(occupied.saturating_add(self.queue.len()));

        if self.slots.len() < wanted {
            self.slots.resize_with(wanted, || None);
        }
    }

    /// Whether no request is in flight.
    pub fn idle(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Take every occupied slot, leaving all of them empty.
    pub fn take_slots(&mut self) -> Vec<Slot> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}
