//! Joins over a batch of in-flight requests.

use std::sync::Arc;

use parking_lot::Mutex;

use super::RequestHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ForkJoinOutcome {
    /// Whether `threshold` successes were reached.
    pub reached: bool,
    pub successes: usize,
    pub completed: usize,
}

#[derive(Default)]
struct Tally {
    successes: usize,
    completed: usize,
}

/// Completes once `threshold` of `handles` succeeded, or once all of them completed
/// without getting there.
///
/// The join itself never fails, [ForkJoinOutcome::reached] tells the two cases apart.
pub(crate) fn fork_join<T: Send + 'static>(
    handles: &[RequestHandle<T>],
    threshold: usize,
) -> RequestHandle<ForkJoinOutcome> {
    let join = RequestHandle::new();

    if handles.is_empty() || threshold == 0 {
        join.succeed(ForkJoinOutcome {
            reached: threshold == 0,
            successes: 0,
            completed: 0,
        });

        return join;
    }

    let total = handles.len();
    let tally = Arc::new(Mutex::new(Tally::default()));

    for handle in handles {
        let join = join.clone();
        let tally = tally.clone();

        handle.add_listener(move |handle| {
            let (successes, completed) = {
                let mut tally = tally.lock();

                if handle.is_success() {
                    tally.successes += 1;
                }
                tally.completed += 1;

                (tally.successes, tally.completed)
            };

            if successes >= threshold || completed == total {
                join.succeed(ForkJoinOutcome {
                    reached: successes >= threshold,
                    successes,
                    completed,
                });
            }
        });
    }

    join
}

/// Completes as soon as any of `handles` completes, successfully or not.
pub(crate) fn first_completed<T: Send + 'static>(handles: &[RequestHandle<T>]) -> RequestHandle<()> {
    let join = RequestHandle::new();

    if handles.is_empty() {
        join.succeed(());
    }

    for handle in handles {
        let join = join.clone();

        handle.add_listener(move |_| {
            join.succeed(());
        });
    }

    join
}

#[cfg(test)]
mod tests {
    use crate::Error;

    use super::*;

    #[test]
    fn reaches_threshold_before_all_complete() {
        let handles = (0..3).map(|_| RequestHandle::<u8>::new()).collect::<Vec<_>>();
        let join = fork_join(&handles, 2);

        handles[0].succeed(1);
        assert!(!join.is_done());

        handles[1].fail(Error::Request("refused".into()));
        assert!(!join.is_done());

        handles[2].succeed(3);

        assert_eq!(
            join.result(),
            Some(Ok(ForkJoinOutcome {
                reached: true,
                successes: 2,
                completed: 3
            }))
        );
    }

    #[test]
    fn completes_unreached_when_everything_failed() {
        let handles = (0..2).map(|_| RequestHandle::<u8>::new()).collect::<Vec<_>>();
        let join = fork_join(&handles, 1);

        handles[0].fail(Error::Request("timeout".into()));
        handles[1].cancel();

        let outcome = join.result().and_then(|r| r.ok());
        assert_eq!(outcome.map(|o| o.reached), Some(false));
    }

    #[test]
    fn already_completed_handles_count() {
        let handles = vec![RequestHandle::completed(Ok(1_u8)), RequestHandle::new()];

        assert!(fork_join(&handles, 1).is_done());
        assert!(first_completed(&handles).is_done());
        assert!(!first_completed(&handles[1..]).is_done());
    }
}
