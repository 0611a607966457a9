#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;
mod error;

pub mod dht;
pub mod handle;
pub mod rpc;
pub mod testnet;
pub mod tracker;

pub use crate::common::{
    ClosestPeers, Data, DigestInfo, DirectHits, Id, KBucket, PeerAddress, RoutingTable,
    SharedRoutingTable, StorageKey, TrackerEntry, XorComparator, ID_SIZE, MAX_BUCKET_SIZE_K,
};
pub use bytes::Bytes;
pub use dht::{DhtFuture, DistributedHashTable, VerbPhase};
pub use error::{Error, Result};
pub use handle::RequestHandle;
pub use testnet::Testnet;
pub use tracker::Tracker;
