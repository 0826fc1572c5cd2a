//! Node meta model
//!
//! Every member advertises a [`MergedMeta`] blob in its gossip meta: the
//! framework-owned [`NodeMeta`] under `_meta` plus a free-form user mapping
//! under `data`. It is JSON on the wire and limited to
//! [`MAX_META_SIZE`](svcmesh_gossip::MAX_META_SIZE) bytes serialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use svcmesh_core::{Error, Result};
use svcmesh_gossip::{Member, MAX_META_SIZE};

/// The framework version compiled into every advertisement.
pub const FRAMEWORK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The minimum supported toolchain, advertised as the runtime version.
pub fn rust_version() -> &'static str {
    option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown")
}

/// Build user injected at compile time, empty when not stamped.
pub fn build_user() -> &'static str {
    option_env!("SVCMESH_BUILD_USER").unwrap_or("")
}

/// Build timestamp injected at compile time, empty when not stamped.
pub fn build_time() -> &'static str {
    option_env!("SVCMESH_BUILD_TIME").unwrap_or("")
}

/// Framework-owned advertisement fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Logical service name
    pub service: String,
    /// HTTP route root path
    #[serde(rename = "routeRootPath", default)]
    pub route_root_path: String,
    /// HTTP port
    pub port: u16,
    /// When the node registered
    #[serde(rename = "registerAt")]
    pub register_at: DateTime<Utc>,
    /// Runtime toolchain version
    #[serde(rename = "rustVer", default)]
    pub rust_ver: String,
    /// Framework version
    #[serde(rename = "svcmeshVer", default)]
    pub svcmesh_ver: String,
    /// Who built the binary
    #[serde(rename = "buildUser", default)]
    pub build_user: String,
    /// When the binary was built
    #[serde(rename = "buildTime", default)]
    pub build_time: String,
    /// Load-balancing weight
    #[serde(default)]
    pub weight: i32,
}

/// The full meta payload carried in a member's gossip meta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedMeta {
    /// Framework fields
    #[serde(rename = "_meta")]
    pub meta: NodeMeta,
    /// Free-form user mapping
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl MergedMeta {
    /// Pair framework meta with optional user data.
    pub fn new(meta: NodeMeta, data: Option<Map<String, Value>>) -> Self {
        Self {
            meta,
            data: data.unwrap_or_default(),
        }
    }

    /// Parse a member's advertised meta.
    pub fn from_member(member: &Member) -> Result<Self> {
        if member.meta.is_empty() {
            return Err(Error::decode(format!(
                "member {} advertises no meta",
                member.name
            )));
        }
        serde_json::from_slice(&member.meta)
            .map_err(|e| Error::decode(format!("member {} meta is not valid json: {e}", member.name)))
    }

    /// Serialize, enforcing the advertised size limit.
    pub fn encode_checked(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_META_SIZE {
            return Err(Error::config(format!(
                "serialized meta is {} bytes, limit is {MAX_META_SIZE}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// Format an uptime to its two most significant units, e.g. `2h 5m`.
pub fn format_uptime(since: DateTime<Utc>) -> String {
    let elapsed = Utc::now().signed_duration_since(since);
    let total_secs = elapsed.num_seconds().max(0) as u64;

    let units = [
        ("w", total_secs / 604_800),
        ("d", total_secs % 604_800 / 86_400),
        ("h", total_secs % 86_400 / 3_600),
        ("m", total_secs % 3_600 / 60),
        ("s", total_secs % 60),
    ];
    let significant: Vec<String> = units
        .iter()
        .skip_while(|(_, value)| *value == 0)
        .take(2)
        .map(|(unit, value)| format!("{value}{unit}"))
        .collect();
    if significant.is_empty() {
        "0s".to_string()
    } else {
        significant.join(" ")
    }
}
