//! Bounded fan-out: ask up to `parallel` peers at a time until enough succeeded or too
//! many failed.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::common::PeerAddress;
use crate::handle::{fork_join, ForkJoinOutcome, RequestHandle};
use crate::{Error, Result};

use super::RequestConfig;

/// The verb specific part of a fan-out.
pub trait Operation: Send + 'static {
    type Response: Clone + Send + 'static;
    type Output: Clone + Send + 'static;

    /// Issue the request to one peer.
    fn request(&mut self, peer: &PeerAddress) -> RequestHandle<Self::Response>;

    /// Called once for every request that completed while the fan-out was running,
    /// whether it succeeded or not.
    fn collect(&mut self, peer: &PeerAddress, response: Result<Self::Response>);

    /// Called exactly once, when the fan-out is done.
    fn build(&mut self) -> Self::Output;
}

/// An [Operation] sending the same kind of request to every peer and keeping the
/// successful answers.
pub struct CollectResponses<R, F> {
    send: F,
    responses: HashMap<PeerAddress, R>,
}

impl<R, F> CollectResponses<R, F>
where
    F: FnMut(&PeerAddress) -> RequestHandle<R>,
{
    pub fn new(send: F) -> Self {
        Self {
            send,
            responses: HashMap::new(),
        }
    }
}

impl<R, F> Operation for CollectResponses<R, F>
where
    R: Clone + Send + 'static,
    F: FnMut(&PeerAddress) -> RequestHandle<R> + Send + 'static,
{
    type Response = R;
    type Output = HashMap<PeerAddress, R>;

    fn request(&mut self, peer: &PeerAddress) -> RequestHandle<R> {
        (self.send)(peer)
    }

    fn collect(&mut self, peer: &PeerAddress, response: Result<R>) {
        match response {
            Ok(response) => {
                self.responses.insert(*peer, response);
            }
            Err(error) => trace!(?peer, ?error, "Request failed"),
        }
    }

    fn build(&mut self) -> Self::Output {
        std::mem::take(&mut self.responses)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutResult<T> {
    pub output: T,
    pub successes: usize,
    pub failures: usize,
    /// Whether enough requests succeeded, or the failure budget held.
    pub success: bool,
}

impl<T> FanoutResult<T> {
    /// `Ok(self)` if the fan-out succeeded, [Error::FanoutFailed] otherwise.
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::FanoutFailed {
                successes: self.successes,
                failures: self.failures,
                reason: "failure budget exhausted".to_string(),
            })
        }
    }
}

#[derive(Clone, Default)]
/// Every per-peer request an operation issued, for callers that want to follow them.
pub struct RequestTracker {
    requests: Arc<Mutex<Vec<(PeerAddress, RequestHandle<()>)>>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle`. Cancelling the tracked handle cancels the request.
    pub fn add<T: Send + 'static>(&self, peer: PeerAddress, handle: &RequestHandle<T>) {
        self.requests.lock().push((peer, handle.map(|_| ())));
    }

    /// Snapshot of every tracked request so far.
    pub fn requests(&self) -> Vec<(PeerAddress, RequestHandle<()>)> {
        self.requests.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn all_done(&self) -> bool {
        self.requests.lock().iter().all(|(_, handle)| handle.is_done())
    }
}

impl Debug for RequestTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTracker")
            .field("requests", &self.len())
            .finish()
    }
}

/// Run `operation` against `candidates`, in the order given.
///
/// With `cancel_on_finish` the requests still in flight once the fan-out is done are
/// cancelled, otherwise they are left to complete on their own and are not collected.
pub fn fanout<O, I>(
    candidates: I,
    config: RequestConfig,
    mut operation: O,
    cancel_on_finish: bool,
    tracker: RequestTracker,
) -> RequestHandle<FanoutResult<O::Output>>
where
    O: Operation,
    I: IntoIterator<Item = PeerAddress>,
{
    if config.minimum_results() == 0 {
        trace!("Fan-out without minimum results, nothing to ask");

        return RequestHandle::completed(Ok(FanoutResult {
            output: operation.build(),
            successes: 0,
            failures: 0,
            success: true,
        }));
    }

    let queue = candidates.into_iter().collect::<VecDeque<_>>();
    let slots = config.parallel().min(queue.len());

    let fanout = Arc::new(Fanout {
        config,
        cancel_on_finish,
        tracker,
        handle: RequestHandle::new(),
        state: Mutex::new(FanoutState {
            operation,
            queue,
            slots: (0..slots).map(|_| None).collect(),
            successes: 0,
            failures: 0,
            finished: false,
        }),
    });

    {
        let weak = Arc::downgrade(&fanout);
        fanout.handle.on_cancel(move || {
            if let Some(fanout) = weak.upgrade() {
                fanout.cancel();
            }
        });
    }

    let handle = fanout.handle.clone();

    fanout.round();

    handle
}

type Pending<R> = (PeerAddress, RequestHandle<R>);

struct Fanout<O: Operation> {
    config: RequestConfig,
    cancel_on_finish: bool,
    tracker: RequestTracker,
    handle: RequestHandle<FanoutResult<O::Output>>,
    state: Mutex<FanoutState<O>>,
}

struct FanoutState<O: Operation> {
    operation: O,
    queue: VecDeque<PeerAddress>,
    slots: Vec<Option<Pending<O::Response>>>,
    successes: usize,
    failures: usize,
    finished: bool,
}

impl<O: Operation> FanoutState<O> {
    /// Hand every completed request to the operation and count it.
    fn collect_completed(&mut self) {
        let completed = self
            .slots
            .iter_mut()
            .filter(|slot| slot.as_ref().is_some_and(|(_, handle)| handle.is_done()))
            .filter_map(Option::take)
            .collect::<Vec<_>>();

        for (peer, handle) in completed {
            let response = handle.result().unwrap_or(Err(Error::Cancelled));

            match &response {
                Ok(_) => self.successes += 1,
                // Cancelled requests are not held against the failure budget.
                Err(Error::Cancelled) => {}
                Err(_) => self.failures += 1,
            }

            self.operation.collect(&peer, response);
        }
    }

    fn take_pending(&mut self) -> Vec<Pending<O::Response>> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl<O: Operation> Fanout<O> {
    fn round(self: &Arc<Self>) {
        let (active, threshold) = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            for index in 0..state.slots.len() {
                if state.slots[index].is_some() {
                    continue;
                }

                let Some(peer) = state.queue.pop_front() else {
                    break;
                };

                let handle = state.operation.request(&peer);
                self.tracker.add(peer, &handle);

                state.slots[index] = Some((peer, handle));
            }

            let active = state
                .slots
                .iter()
                .flatten()
                .map(|(_, handle)| handle.clone())
                .collect::<Vec<_>>();

            let needed = self
                .config
                .minimum_results()
                .saturating_sub(state.successes);
            let threshold = needed.min(active.len());

            (active, threshold)
        };

        if active.is_empty() {
            self.finish();
            return;
        }

        trace!(active = active.len(), threshold, "Fan-out round");

        let fanout = self.clone();

        fork_join(&active, threshold).add_listener(move |join| {
            if let Some(outcome) = join.with_value(|outcome| *outcome) {
                fanout.evaluate(outcome);
            }
        });
    }

    fn evaluate(self: &Arc<Self>, outcome: ForkJoinOutcome) {
        let done = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            state.collect_completed();

            outcome.reached
                || state.successes >= self.config.minimum_results()
                || state.failures > self.config.max_failure()
        };

        if done {
            self.finish();
        } else {
            self.round();
        }
    }

    fn finish(&self) {
        let (result, pending) = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            state.finished = true;

            let success = state.successes >= self.config.minimum_results()
                || state.failures <= self.config.max_failure();

            let result = FanoutResult {
                output: state.operation.build(),
                successes: state.successes,
                failures: state.failures,
                success,
            };

            let pending = if self.cancel_on_finish {
                state.take_pending()
            } else {
                Vec::new()
            };

            (result, pending)
        };

        debug!(
            successes = result.successes,
            failures = result.failures,
            success = result.success,
            cancelled = pending.len(),
            "Fan-out done"
        );

        for (_, handle) in pending {
            handle.cancel();
        }

        self.handle.succeed(result);
    }

    fn cancel(&self) {
        let pending = {
            let mut state = self.state.lock();

            if state.finished {
                return;
            }

            state.collect_completed();
            state.finished = true;

            state.take_pending()
        };

        debug!(pending = pending.len(), "Fan-out cancelled");

        for (_, handle) in pending {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::common::Id;

    use super::*;

    type Issued = Arc<Mutex<Vec<(PeerAddress, RequestHandle<u64>)>>>;

    /// Every request stays pending until the test completes it.
    #[derive(Default)]
    struct Manual {
        issued: Issued,
        values: Vec<u64>,
        collected: usize,
    }

    impl Operation for Manual {
        type Response = u64;
        type Output = (Vec<u64>, usize);

        fn request(&mut self, peer: &PeerAddress) -> RequestHandle<u64> {
            let handle = RequestHandle::new();
            self.issued.lock().push((*peer, handle.clone()));
            handle
        }

        fn collect(&mut self, _peer: &PeerAddress, response: Result<u64>) {
            self.collected += 1;

            if let Ok(value) = response {
                self.values.push(value);
            }
        }

        fn build(&mut self) -> Self::Output {
            (std::mem::take(&mut self.values), self.collected)
        }
    }

    fn peers(count: u64) -> Vec<PeerAddress> {
        (1..=count)
            .map(|i| PeerAddress::new(Id::from_u64(i), SocketAddr::from(([127, 0, 0, 1], i as u16))))
            .collect()
    }

    fn run(count: u64, config: RequestConfig, cancel_on_finish: bool) -> (RequestHandle<FanoutResult<(Vec<u64>, usize)>>, Issued) {
        let operation = Manual::default();
        let issued = operation.issued.clone();

        let handle = fanout(peers(count), config, operation, cancel_on_finish, RequestTracker::new());

        (handle, issued)
    }

    fn request(issued: &Issued, index: usize) -> RequestHandle<u64> {
        issued.lock()[index].1.clone()
    }

    fn refused() -> Error {
        Error::Request("refused".into())
    }

    #[test]
    fn zero_minimum_builds_without_requests() {
        let (handle, issued) = run(5, RequestConfig::new(0, 0, 3).unwrap(), true);

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!(result.output, (vec![], 0));
        assert!(issued.lock().is_empty());
    }

    #[test]
    fn two_successes_one_failure_succeeds() {
        let (handle, issued) = run(4, RequestConfig::new(2, 1, 1).unwrap(), true);
        assert_eq!(issued.lock().len(), 3);

        request(&issued, 0).succeed(10);
        request(&issued, 1).fail(refused());
        assert!(!handle.is_done());
        request(&issued, 2).succeed(30);

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!((result.successes, result.failures), (2, 1));
        assert_eq!(result.output, (vec![10, 30], 3));
        assert_eq!(issued.lock().len(), 3, "the fourth peer is never asked");
    }

    #[test]
    fn second_failure_before_minimum_fails() {
        let (handle, issued) = run(5, RequestConfig::new(2, 1, 1).unwrap(), true);

        request(&issued, 0).fail(refused());
        request(&issued, 1).succeed(20);
        request(&issued, 2).fail(refused());

        let result = handle.wait().unwrap();

        assert!(!result.success);
        assert_eq!((result.successes, result.failures), (1, 2));
        assert!(matches!(
            result.into_result(),
            Err(Error::FanoutFailed {
                successes: 1,
                failures: 2,
                ..
            })
        ));
    }

    #[test]
    fn refills_slots_after_failures() {
        let (handle, issued) = run(5, RequestConfig::new(2, 5, 1).unwrap(), true);

        for index in 0..3 {
            request(&issued, index).fail(refused());
        }

        assert_eq!(issued.lock().len(), 5);

        request(&issued, 3).succeed(4);
        request(&issued, 4).succeed(5);

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!((result.successes, result.failures), (2, 3));
    }

    #[test]
    fn exhausted_candidates_report_partial_results() {
        let (handle, issued) = run(1, RequestConfig::new(3, 0, 0).unwrap(), true);

        request(&issued, 0).succeed(1);

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!(result.successes, 1);
    }

    #[test]
    fn cancel_on_finish_decides_the_fate_of_stragglers() {
        let (handle, issued) = run(3, RequestConfig::new(1, 0, 2).unwrap(), true);
        request(&issued, 0).succeed(1);

        assert!(handle.is_success());
        assert!(request(&issued, 1).is_cancelled());
        assert!(request(&issued, 2).is_cancelled());

        let (handle, issued) = run(3, RequestConfig::new(1, 0, 2).unwrap(), false);
        request(&issued, 0).succeed(1);

        assert!(handle.is_success());
        assert!(!request(&issued, 1).is_done());

        // Stragglers complete on their own and are not collected.
        request(&issued, 1).succeed(2);
        assert_eq!(handle.wait().unwrap().output, (vec![1], 1));
    }

    #[test]
    fn unbounded_parallelism_asks_every_candidate() {
        let (handle, issued) = run(2, RequestConfig::new(i64::MAX, 0, 0).unwrap(), true);
        assert_eq!(issued.lock().len(), 2);

        request(&issued, 0).succeed(1);
        request(&issued, 1).succeed(2);

        let result = handle.wait().unwrap();

        assert!(result.success);
        assert_eq!(result.successes, 2);
    }

    #[test]
    fn cancelling_cancels_every_pending_request() {
        let tracker = RequestTracker::new();
        let operation = Manual::default();
        let issued = operation.issued.clone();

        let handle = fanout(peers(3), RequestConfig::new(3, 0, 0).unwrap(), operation, false, tracker.clone());

        request(&issued, 0).succeed(1);
        assert!(handle.cancel());

        assert!(request(&issued, 1).is_cancelled());
        assert!(request(&issued, 2).is_cancelled());
        assert_eq!(tracker.len(), 3);
        assert!(tracker.all_done());
    }
}
