//! Cluster topology model for the gateway.
//!
//! Snapshots describe which nodes exist, which services they run and which
//! node owns each vbucket of a bucket. A snapshot is immutable once built;
//! changes are published as a new snapshot with a strictly greater
//! `(rev_epoch, revision)` version.
//!
//! - [`Topology`]: cluster-wide membership
//! - [`BucketTopology`]: one bucket's partition map
//! - [`TopologyPublisher`]: single-writer latest-snapshot cells
//! - [`RoutingCache`]: client-side vbucket routing memo

pub mod error;
pub mod publisher;
pub mod routing_table;
pub mod server;
pub mod snapshot;

pub use error::TopologyError;
pub use publisher::TopologyPublisher;
pub use routing_table::{CacheUpdate, RoutingCache};
pub use server::{DataServer, Server};
pub use snapshot::{BucketTopology, Topology, TopologyVersion, Versioned};
