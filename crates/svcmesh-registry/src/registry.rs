//! The registry facade
//!
//! A [`Registry`] owns one membership engine plus the local node's meta and
//! the service-provider subscriptions. It is constructed once at server
//! startup, joined against the configured seeds, and torn down with
//! `leave` followed by `shutdown` when the server stops.

use crate::meta::{self, MergedMeta, NodeMeta};
use crate::provider::{ProviderFanout, ServiceProvider};
use crate::weight::{self, MAX_WEIGHT};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use svcmesh_core::{Error, MemberConfig, Result};
use svcmesh_gossip::{
    Cluster, ClusterSize, Delegate, EventDelegate, Member, MemberState, MessageType,
    TransmitLimitedQueue,
};
use tracing::{debug, info, warn};

/// Presentation view of a member, as served by operational endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    /// Service name
    #[serde(rename = "svcName")]
    pub svc_name: String,
    /// Member name
    pub hostname: String,
    /// HTTP base URL
    #[serde(rename = "baseUrl")]
    pub base_url: String,
    /// `up` or `suspect`
    pub status: String,
    /// Uptime limited to two significant units
    pub uptime: String,
    /// Runtime toolchain version
    #[serde(rename = "rustVer")]
    pub rust_ver: String,
    /// Framework version
    #[serde(rename = "svcmeshVer")]
    pub svcmesh_ver: String,
    /// Who built the binary
    #[serde(rename = "buildUser")]
    pub build_user: String,
    /// When the binary was built
    #[serde(rename = "buildTime")]
    pub build_time: String,
    /// Free-form user data
    pub data: Map<String, Value>,
    /// Network address
    pub host: String,
    /// HTTP port
    #[serde(rename = "svcPort")]
    pub svc_port: u16,
    /// Membership port
    #[serde(rename = "memPort")]
    pub mem_port: u16,
}

struct MetaCache {
    merged: MergedMeta,
    bytes: Vec<u8>,
}

/// The engine-facing delegate: serves the cached local meta and drains the
/// user broadcast queue.
pub(crate) struct RegistryDelegate {
    cache: RwLock<Arc<MetaCache>>,
    queue: Arc<TransmitLimitedQueue>,
}

impl RegistryDelegate {
    fn new(merged: MergedMeta, queue: Arc<TransmitLimitedQueue>) -> Result<Self> {
        let bytes = merged.encode_checked()?;
        Ok(Self {
            cache: RwLock::new(Arc::new(MetaCache { merged, bytes })),
            queue,
        })
    }

    /// The current merged meta.
    pub(crate) fn merged(&self) -> MergedMeta {
        self.cache.read().merged.clone()
    }

    /// The currently advertised weight.
    pub(crate) fn weight(&self) -> i32 {
        self.cache.read().merged.meta.weight
    }

    /// Swap in a new meta after validating its size.
    pub(crate) fn set_meta(&self, merged: MergedMeta) -> Result<()> {
        let bytes = merged.encode_checked()?;
        *self.cache.write() = Arc::new(MetaCache { merged, bytes });
        Ok(())
    }
}

impl Delegate for RegistryDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let cache = Arc::clone(&self.cache.read());
        if cache.bytes.len() > limit {
            warn!(
                len = cache.bytes.len(),
                limit, "truncating node meta to the advertised limit"
            );
            return cache.bytes[..limit].to_vec();
        }
        cache.bytes.clone()
    }

    fn notify_msg(&self, msg: &[u8]) {
        debug!(len = msg.len(), "ignoring user broadcast without a handler");
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.queue
            .get_broadcasts(overhead, limit)
            .into_iter()
            .map(|b| b.body)
            .collect()
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        // Member meta already travels with the membership states.
        Vec::new()
    }

    fn merge_remote_state(&self, state: &[u8], _join: bool) {
        debug!(len = state.len(), "ignoring remote user state");
    }
}

/// The public surface of the membership subsystem.
///
/// Construction joins the cluster; all accessors are thread-safe. After
/// [`shutdown`](Self::shutdown) every accessor fails with a state error.
pub struct Registry {
    cluster: Arc<Cluster>,
    fanout: Arc<ProviderFanout>,
    queue: Arc<TransmitLimitedQueue>,
    config: MemberConfig,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create the local node and join the configured seeds.
    ///
    /// `data` is the optional free-form user mapping advertised in the node
    /// meta; at most one mapping is honored. Fails with a config error when
    /// the service name is missing or the meta exceeds the size limit, a
    /// transport error when the bind fails, and a join error when a
    /// non-empty seed list is entirely unreachable (after shutting the
    /// engine down). An empty seed list logs a warning and starts the node
    /// standalone.
    pub async fn new(config: MemberConfig, data: Option<Map<String, Value>>) -> Result<Registry> {
        if config.service_name.trim().is_empty() {
            return Err(Error::config("service name is required"));
        }

        let size = ClusterSize::new();
        let queue = {
            let size = size.clone();
            Arc::new(TransmitLimitedQueue::new(
                config.retransmit_mult,
                Box::new(move || size.get()),
            ))
        };

        let node_meta = NodeMeta {
            service: config.service_name.clone(),
            route_root_path: config.route_root_path.clone(),
            port: config.http_port,
            register_at: Utc::now(),
            rust_ver: meta::rust_version().to_string(),
            svcmesh_ver: meta::FRAMEWORK_VERSION.to_string(),
            build_user: meta::build_user().to_string(),
            build_time: meta::build_time().to_string(),
            // A pinned weight is advertised verbatim; auto mode starts at
            // the idle maximum until the first recomputation.
            weight: if config.weight > 0 {
                config.weight
            } else {
                MAX_WEIGHT
            },
        };
        let merged = MergedMeta::new(node_meta, data);
        let delegate = Arc::new(RegistryDelegate::new(merged, Arc::clone(&queue))?);
        let fanout = Arc::new(ProviderFanout::default());

        let cluster = Arc::new(
            Cluster::create(
                config.clone(),
                Arc::clone(&delegate) as Arc<dyn Delegate>,
                Some(Arc::clone(&fanout) as Arc<dyn EventDelegate>),
                size,
            )
            .await?,
        );

        if config.seeds.is_empty() {
            warn!("no seed configured, running standalone");
        } else if let Err(e) = cluster.join(&config.seeds).await {
            let _ = cluster.shutdown().await;
            return Err(e);
        }

        if !config.weight_interval.is_zero() {
            // The task ends on the cluster's shutdown signal.
            let _ = weight::spawn_weight_loop(
                Arc::clone(&cluster),
                Arc::clone(&delegate),
                config.weight_interval,
                cluster.shutdown_signal(),
            );
        }

        let registry = Registry {
            cluster,
            fanout,
            queue,
            config,
        };
        let local = registry.cluster.local_member();
        let base_url = registry.base_url(&local).unwrap_or_default();
        info!(
            node = %local.name,
            service = %registry.config.service_name,
            base_url = %base_url,
            mem_port = local.port,
            "node registered"
        );
        Ok(registry)
    }

    /// Create a registry from the process environment.
    pub async fn from_env(data: Option<Map<String, Value>>) -> Result<Registry> {
        Registry::new(MemberConfig::from_env()?, data).await
    }

    fn ensure_running(&self) -> Result<()> {
        if self.cluster.is_shutdown() {
            return Err(Error::state("registry is shut down"));
        }
        Ok(())
    }

    /// Broadcast a graceful departure and wait up to `deadline` for it to
    /// propagate. Sockets stay open; call [`shutdown`](Self::shutdown) next.
    pub async fn leave(&self, deadline: Duration) -> Result<()> {
        self.cluster.leave(deadline).await
    }

    /// Stop the membership engine and release its sockets. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.queue.reset();
        self.cluster.shutdown().await
    }

    /// Every member that is not dead or left.
    pub fn all_nodes(&self) -> Result<Vec<Member>> {
        self.ensure_running()?;
        Ok(self.cluster.members())
    }

    /// The local member.
    pub fn local_node(&self) -> Result<Member> {
        self.ensure_running()?;
        Ok(self.cluster.local_member())
    }

    /// Presentation fields for a member.
    pub fn info(&self, member: &Member) -> NodeInfo {
        let merged = MergedMeta::from_member(member).unwrap_or_else(|e| {
            debug!(name = %member.name, "presenting member without meta: {e}");
            MergedMeta::new(
                NodeMeta {
                    service: String::new(),
                    route_root_path: String::new(),
                    port: 0,
                    register_at: Utc::now(),
                    rust_ver: String::new(),
                    svcmesh_ver: String::new(),
                    build_user: String::new(),
                    build_time: String::new(),
                    weight: 0,
                },
                None,
            )
        });
        let status = match member.state {
            MemberState::Suspect => "suspect",
            _ => "up",
        };
        NodeInfo {
            svc_name: merged.meta.service.clone(),
            hostname: member.name.to_string(),
            base_url: compose_base_url(member, &merged),
            status: status.to_string(),
            uptime: meta::format_uptime(merged.meta.register_at),
            rust_ver: merged.meta.rust_ver.clone(),
            svcmesh_ver: merged.meta.svcmesh_ver.clone(),
            build_user: merged.meta.build_user.clone(),
            build_time: merged.meta.build_time.clone(),
            data: merged.data,
            host: member.addr.to_string(),
            svc_port: merged.meta.port,
            mem_port: member.port,
        }
    }

    /// The member's HTTP base URL: `http://{addr}:{port}{route_root_path}`.
    pub fn base_url(&self, member: &Member) -> Result<String> {
        let merged = MergedMeta::from_member(member)?;
        Ok(compose_base_url(member, &merged))
    }

    /// The member's advertised load-balancing weight.
    pub fn meta_weight(&self, member: &Member) -> Result<i32> {
        Ok(MergedMeta::from_member(member)?.meta.weight)
    }

    /// The member's service name, or empty when its meta is unreadable.
    pub fn svc_name(&self, member: &Member) -> String {
        match MergedMeta::from_member(member) {
            Ok(merged) => merged.meta.service,
            Err(e) => {
                warn!(name = %member.name, "cannot read member service name: {e}");
                String::new()
            }
        }
    }

    /// Seed `provider` with the current member list and subscribe it to
    /// future membership events, atomically.
    pub fn register_service_provider(&self, provider: Box<dyn ServiceProvider>) {
        self.cluster
            .with_member_snapshot(|members| self.fanout.register(provider, members));
    }

    /// Queue an opaque payload for cluster-wide broadcast. A newer payload
    /// with the same key supersedes a queued one.
    pub fn publish(&self, key: impl Into<String>, payload: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        self.queue.enqueue(key, MessageType::User, payload);
        Ok(())
    }

    /// The configuration this registry was built from.
    pub fn config(&self) -> &MemberConfig {
        &self.config
    }
}

fn compose_base_url(member: &Member, merged: &MergedMeta) -> String {
    let route = if merged.meta.route_root_path.is_empty() {
        "/"
    } else {
        merged.meta.route_root_path.as_str()
    };
    format!("http://{}:{}{}", member.addr, merged.meta.port, route)
}
