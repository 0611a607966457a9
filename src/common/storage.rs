//! Storage keys, stored values and the digests peers report about them.
use bytes::Bytes;

use crate::common::{Id, PeerAddress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
/// Fully qualified key of a stored value: `location / domain / content`.
///
/// Ordered by location first, so all values under one location and domain form a
/// contiguous range.
pub struct StorageKey {
    pub location: Id,
    pub domain: Id,
    pub content: Id,
}

impl StorageKey {
    pub fn new(location: Id, domain: Id, content: Id) -> Self {
        Self {
            location,
            domain,
            content,
        }
    }

    /// Smallest key under `location / domain`.
    pub fn range_start(location: Id, domain: Id) -> Self {
        Self::new(location, domain, Id::ZERO)
    }

    /// Largest key under `location / domain`.
    pub fn range_end(location: Id, domain: Id) -> Self {
        Self::new(location, domain, Id::MAX)
    }

    /// All three components folded together with XOR.
    pub fn fold(&self) -> Id {
        self.location.xor(&self.domain).xor(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// An opaque stored value.
pub struct Data {
    value: Bytes,
}

impl Data {
    pub fn new<T: Into<Bytes>>(value: T) -> Self {
        Self {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// SHA-1 of the value.
    pub fn hash(&self) -> Id {
        Id::hash_of(&self.value)
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl From<&[u8]> for Data {
    fn from(value: &[u8]) -> Self {
        Data::new(Bytes::copy_from_slice(value))
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::from(value.as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
/// A compact claim from a peer about what it holds for a queried key, sent instead
/// of the data itself.
///
/// `size == 0` means "nothing here".
pub struct DigestInfo {
    pub key_digest: Id,
    pub content_digest: Id,
    pub size: usize,
}

impl DigestInfo {
    pub fn new(key_digest: Id, content_digest: Id, size: usize) -> Self {
        Self {
            key_digest,
            content_digest,
            size,
        }
    }

    /// Digest of nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Digest over `(content key, content hash)` pairs.
    pub fn from_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'a Id, &'a Id)>,
    {
        entries.into_iter().fold(
            DigestInfo::empty(),
            |digest, (content_key, content_hash)| DigestInfo {
                key_digest: digest.key_digest.xor(content_key),
                content_digest: digest.content_digest.xor(content_hash),
                size: digest.size + 1,
            },
        )
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// A peer registered on a tracker, with an optional attachment.
pub struct TrackerEntry {
    pub peer: PeerAddress,
    pub attachment: Option<Bytes>,
}

impl TrackerEntry {
    pub fn new(peer: PeerAddress, attachment: Option<Bytes>) -> Self {
        Self { peer, attachment }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn digest_from_entries() {
        let a = (Id::from_u64(1), Id::from_u64(10));
        let b = (Id::from_u64(2), Id::from_u64(20));

        let digest = DigestInfo::from_entries([(&a.0, &a.1), (&b.0, &b.1)]);

        assert_eq!(digest.size, 2);
        assert_eq!(digest.key_digest, Id::from_u64(3));
        assert_eq!(digest.content_digest, Id::from_u64(30));
        assert!(DigestInfo::from_entries(std::iter::empty()).is_empty());
    }

    #[test]
    fn storage_key_ranges() {
        let location = Id::random();
        let domain = Id::random();
        let key = StorageKey::new(location, domain, Id::random());

        assert!(StorageKey::range_start(location, domain) <= key);
        assert!(key <= StorageKey::range_end(location, domain));
    }
}
