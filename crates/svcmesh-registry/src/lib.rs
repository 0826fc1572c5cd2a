//! # svcmesh-registry
//!
//! Decentralized service registry for svcmesh microservices.
//!
//! Each running process joins a peer-to-peer cluster through the
//! `svcmesh-gossip` membership engine, advertises its HTTP endpoint and
//! service metadata, detects failures of peers, and exposes the live
//! membership view to client-side load balancers.
//!
//! This crate provides:
//! - The [`Registry`] facade: create, join, leave, shutdown, member access
//! - The [`MergedMeta`]/[`NodeMeta`] advertisement model
//! - [`ServiceProvider`] subscription for load-balancing client layers
//! - Load-driven weight recomputation gossiped to peers
//!
//! ## Example
//!
//! ```rust,no_run
//! use svcmesh_registry::Registry;
//!
//! # #[tokio::main]
//! # async fn main() -> svcmesh_core::Result<()> {
//! // Reads SVCMESH_SERVICE_NAME, SVCMESH_MEM_SEED, and friends.
//! let registry = Registry::from_env(None).await?;
//! for node in registry.all_nodes()? {
//!     println!("{} -> {}", node.name, registry.base_url(&node)?);
//! }
//! registry.leave(std::time::Duration::from_secs(2)).await?;
//! registry.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod meta;
pub mod provider;
pub mod registry;
mod weight;

// Re-export commonly used types
pub use meta::{MergedMeta, NodeMeta, FRAMEWORK_VERSION};
pub use provider::ServiceProvider;
pub use registry::{NodeInfo, Registry};
pub use weight::{MAX_WEIGHT, MIN_WEIGHT};

// The engine types that appear in this crate's public surface.
pub use svcmesh_core::{Error, MemberConfig, NodeId, Result};
pub use svcmesh_gossip::{Member, MemberState};
