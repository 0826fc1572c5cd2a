//! # svcmesh-gossip
//!
//! SWIM-style gossip membership engine for svcmesh node discovery and failure
//! detection.
//!
//! This crate provides:
//! - A membership table with suspicion, refutation, and dead-node reclamation
//! - A failure detector with direct and indirect probing
//! - Anti-entropy push/pull state exchange over TCP
//! - A bounded, retransmit-limited broadcast queue piggybacked on gossip
//! - Delegate and event hooks for embedders
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use svcmesh_core::MemberConfig;
//! use svcmesh_gossip::{Cluster, ClusterSize, NoopDelegate};
//!
//! # #[tokio::main]
//! # async fn main() -> svcmesh_core::Result<()> {
//! let mut config = MemberConfig::default();
//! config.service_name = "orders".to_string();
//! let cluster = Cluster::create(
//!     config,
//!     Arc::new(NoopDelegate),
//!     None,
//!     ClusterSize::new(),
//! )
//! .await?;
//! cluster.join(&["10.0.0.1:7946".to_string()]).await?;
//! # Ok(())
//! # }
//! ```

mod antientropy;
pub mod cluster;
pub mod delegate;
pub mod member;
pub mod message;
mod protocol;
pub mod queue;
pub mod transport;

// Re-export commonly used types
pub use cluster::Cluster;
pub use delegate::{Delegate, EventDelegate, NoopDelegate};
pub use member::{
    ClusterSize, Member, MemberEvent, MemberState, Membership, RemoteState, MAX_META_SIZE,
};
pub use message::{MessageType, MAX_UDP_PACKET_SIZE};
pub use queue::{QueuedBroadcast, TransmitLimitedQueue};
pub use transport::NetTransport;
