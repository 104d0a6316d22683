//! meshdb-cluster: membership.
//!
//! The peer directory tracks which nodes are alive right now; the
//! discovery service feeds it from UDP beacons and the sweeper evicts
//! peers whose beacons stopped.

pub mod directory;
pub mod discovery;

pub use directory::{PeerDescriptor, PeerDirectory};
pub use discovery::{Beacon, DiscoveryError, DiscoveryService, DiscoverySettings};
