//! Reducing divergent replica answers into one result.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;

use crate::common::{Data, Id, PeerAddress, StorageKey};
use crate::{Error, Result};

/// Merges per-peer answers of one operation.
pub trait EvaluationScheme {
    fn evaluate_keys<K: Ord + Clone>(
        &self,
        responses: &HashMap<PeerAddress, BTreeSet<K>>,
    ) -> BTreeSet<K>;

    fn evaluate_data(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Data>>,
    ) -> BTreeMap<StorageKey, Data>;

    /// Answers mapping keys to content hashes.
    fn evaluate_digest(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Id>>,
    ) -> BTreeSet<StorageKey>;

    /// Single valued answers, `None` for peers that had nothing.
    fn evaluate_value<V: Eq + Hash + Clone>(
        &self,
        responses: &[(PeerAddress, Option<V>)],
    ) -> Result<Option<V>>;
}

#[derive(Debug, Clone, Copy, Default)]
/// Keeps what a majority of the responders agree on.
pub struct VotingScheme;

/// `(n + 1) / 2` of `n` responders.
pub fn majority(responders: usize) -> usize {
    (responders + 1) / 2
}

impl VotingScheme {
    /// Count every vote and keep the winners in first-seen order of reaching majority.
    fn vote<T, I>(responders: usize, votes: I) -> Vec<T>
    where
        T: Eq + Hash + Clone,
        I: IntoIterator<Item = T>,
    {
        let majority = majority(responders);
        let mut counts: HashMap<T, usize> = HashMap::new();
        let mut winners = Vec::new();

        for vote in votes {
            let count = counts.entry(vote.clone()).or_default();
            *count += 1;

            if *count == majority {
                winners.push(vote);
            }
        }

        winners
    }
}

impl EvaluationScheme for VotingScheme {
    fn evaluate_keys<K: Ord + Clone>(
        &self,
        responses: &HashMap<PeerAddress, BTreeSet<K>>,
    ) -> BTreeSet<K> {
        let majority = majority(responses.len());
        let mut counts: BTreeMap<&K, usize> = BTreeMap::new();

        for key in responses.values().flatten() {
            *counts.entry(key).or_default() += 1;
        }

        counts
            .into_iter()
            .filter(|(_, count)| *count >= majority)
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn evaluate_data(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Data>>,
    ) -> BTreeMap<StorageKey, Data> {
        // A vote is for a key together with the hash of its content.
        let votes = responses
            .values()
            .flatten()
            .map(|(key, data)| (data.hash().xor(&key.fold()), *key));

        let winners = Self::vote(responses.len(), votes);

        let mut result = BTreeMap::new();

        for (vote, key) in winners {
            let data = responses
                .values()
                .filter_map(|answer| answer.get(&key))
                .find(|&data| data.hash().xor(&key.fold()) == vote);

            if let Some(data) = data {
                result.insert(key, data.clone());
            }
        }

        result
    }

    fn evaluate_digest(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Id>>,
    ) -> BTreeSet<StorageKey> {
        let votes = responses
            .values()
            .flatten()
            .map(|(key, hash)| (hash.xor(&key.fold()), *key));

        Self::vote(responses.len(), votes)
            .into_iter()
            .map(|(_, key)| key)
            .collect()
    }

    fn evaluate_value<V: Eq + Hash + Clone>(
        &self,
        responses: &[(PeerAddress, Option<V>)],
    ) -> Result<Option<V>> {
        // value -> (count, first seen)
        let mut counts: HashMap<&V, (usize, usize)> = HashMap::new();

        for (index, value) in responses.iter().filter_map(|(_, value)| value.as_ref()).enumerate() {
            counts.entry(value).or_insert((0, index)).0 += 1;
        }

        let best = counts
            .into_iter()
            .max_by(|(_, (a_count, a_first)), (_, (b_count, b_first))| {
                a_count.cmp(b_count).then(b_first.cmp(a_first))
            })
            .map(|(value, _)| value.clone());

        Ok(best)
    }
}

#[derive(Debug, Clone, Copy, Default)]
/// Keeps everything any responder reported.
pub struct CumulativeScheme;

impl EvaluationScheme for CumulativeScheme {
    fn evaluate_keys<K: Ord + Clone>(
        &self,
        responses: &HashMap<PeerAddress, BTreeSet<K>>,
    ) -> BTreeSet<K> {
        responses.values().flatten().cloned().collect()
    }

    fn evaluate_data(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Data>>,
    ) -> BTreeMap<StorageKey, Data> {
        let mut result = BTreeMap::new();

        for (key, data) in responses.values().flatten() {
            result.entry(*key).or_insert_with(|| data.clone());
        }

        result
    }

    fn evaluate_digest(
        &self,
        responses: &HashMap<PeerAddress, BTreeMap<StorageKey, Id>>,
    ) -> BTreeSet<StorageKey> {
        responses.values().flat_map(|answer| answer.keys().copied()).collect()
    }

    fn evaluate_value<V: Eq + Hash + Clone>(
        &self,
        _responses: &[(PeerAddress, Option<V>)],
    ) -> Result<Option<V>> {
        Err(Error::Evaluation("a single value cannot be accumulated"))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn key(content: u64) -> StorageKey {
        StorageKey::new(Id::from_u64(1), Id::ZERO, Id::from_u64(content))
    }

    fn responses<V: Ord + Clone>(answers: &[&[V]]) -> HashMap<PeerAddress, BTreeSet<V>> {
        answers
            .iter()
            .map(|answer| (PeerAddress::random(), answer.iter().cloned().collect()))
            .collect()
    }

    #[test]
    fn majority_of_responders() {
        assert_eq!(majority(1), 1);
        assert_eq!(majority(2), 1);
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 2);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn voting_keeps_keys_reported_by_a_majority() {
        let answers = responses(&[&["a", "b"], &["a", "c"], &["c"]]);

        let result = VotingScheme.evaluate_keys(&answers);

        assert_eq!(result, BTreeSet::from(["a", "c"]));
    }

    #[test]
    fn cumulative_is_the_union() {
        let answers = responses(&[&["A", "B"], &["B", "C"], &["A", "C", "D"]]);

        let result = CumulativeScheme.evaluate_keys(&answers);

        assert_eq!(result, BTreeSet::from(["A", "B", "C", "D"]));
    }

    #[test]
    fn voting_on_data_needs_matching_content() {
        let agreed = Data::from("agreed");

        let answers: HashMap<_, _> = [
            BTreeMap::from([(key(1), agreed.clone()), (key(2), Data::from("x"))]),
            BTreeMap::from([(key(1), agreed.clone()), (key(2), Data::from("y"))]),
            BTreeMap::from([(key(2), Data::from("z"))]),
        ]
        .into_iter()
        .map(|answer| (PeerAddress::random(), answer))
        .collect();

        let result = VotingScheme.evaluate_data(&answers);

        assert_eq!(result, BTreeMap::from([(key(1), agreed)]));
        assert_eq!(CumulativeScheme.evaluate_data(&answers).len(), 2);
    }

    #[test]
    fn voting_on_digests() {
        let hash = Id::hash_of(b"value");

        let answers: HashMap<_, _> = [
            BTreeMap::from([(key(1), hash), (key(2), hash)]),
            BTreeMap::from([(key(1), hash)]),
            BTreeMap::from([(key(2), Id::ZERO)]),
        ]
        .into_iter()
        .map(|answer| (PeerAddress::random(), answer))
        .collect();

        assert_eq!(VotingScheme.evaluate_digest(&answers), BTreeSet::from([key(1)]));
        assert_eq!(
            CumulativeScheme.evaluate_digest(&answers),
            BTreeSet::from([key(1), key(2)])
        );
    }

    #[test]
    fn single_values_pick_the_most_frequent_then_the_first_seen() {
        let peer = PeerAddress::random;

        let answers = vec![(peer(), Some("b")), (peer(), None), (peer(), Some("a")), (peer(), Some("a"))];
        assert_eq!(VotingScheme.evaluate_value(&answers), Ok(Some("a")));

        let answers = vec![(peer(), None), (peer(), Some("b")), (peer(), Some("a"))];
        assert_eq!(VotingScheme.evaluate_value(&answers), Ok(Some("b")));

        let answers: Vec<(PeerAddress, Option<u8>)> = vec![(peer(), None)];
        assert_eq!(VotingScheme.evaluate_value(&answers), Ok(None));
    }

    #[test]
    fn cumulative_rejects_single_values() {
        let answers = vec![(PeerAddress::random(), Some(1_u8))];

        assert!(matches!(
            CumulativeScheme.evaluate_value(&answers),
            Err(Error::Evaluation(_))
        ));
    }

    proptest! {
        #[test]
        fn voting_is_a_subset_of_the_union(answers in prop::collection::vec(prop::collection::btree_set(0_u8..16, 0..8), 1..6)) {
            let answers: HashMap<_, _> = answers
                .into_iter()
                .map(|answer| (PeerAddress::random(), answer))
                .collect();

            let voted = VotingScheme.evaluate_keys(&answers);
            let union = CumulativeScheme.evaluate_keys(&answers);

            prop_assert!(voted.is_subset(&union));

            for key in &voted {
                let count = answers.values().filter(|answer| answer.contains(key)).count();
                prop_assert!(count >= majority(answers.len()));
            }
        }

        #[test]
        fn unanimous_answers_vote_like_the_union(answer in prop::collection::btree_set(0_u8..16, 0..8), responders in 1_usize..6) {
            let answers: HashMap<_, _> = (0..responders)
                .map(|_| (PeerAddress::random(), answer.clone()))
                .collect();

            prop_assert_eq!(VotingScheme.evaluate_keys(&answers), answer);
        }
    }
}
