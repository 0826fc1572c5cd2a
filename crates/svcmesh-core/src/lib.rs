//! # svcmesh-core
//!
//! Core types, configuration, and error handling for svcmesh - a decentralized
//! cluster membership and service registry for microservices.
//!
//! This crate provides the foundational pieces shared across all other svcmesh
//! components. It includes:
//!
//! - The `NodeId` member name type
//! - A unified error type and result alias
//! - The environment-driven membership configuration
//! - An opt-in tracing subscriber initializer

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::MemberConfig;
pub use error::{Error, Result};
pub use types::NodeId;
