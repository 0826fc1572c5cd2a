//! Cluster lifecycle
//!
//! A [`Cluster`] owns the sockets, the membership table, and the protocol
//! tasks. It is created once, joined against a seed list, and torn down with
//! `leave` followed by `shutdown`.

use crate::antientropy;
use crate::delegate::{Delegate, EventDelegate};
use crate::member::{ClusterSize, Member, Membership, MAX_META_SIZE};
use crate::message::{self, LeaveBody, MessageType};
use crate::protocol::{self, ProtocolState};
use crate::transport::NetTransport;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use svcmesh_core::{config::os_hostname, Error, MemberConfig, NodeId, Result};
use tokio::net::lookup_host;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A running membership engine.
pub struct Cluster {
    state: Arc<ProtocolState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    has_shutdown: AtomicBool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("has_shutdown", &self.has_shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Cluster {
    /// Bind the transports and start the protocol tasks.
    ///
    /// The local member's meta comes from `delegate.node_meta` and must not
    /// exceed [`MAX_META_SIZE`] bytes.
    pub async fn create(
        config: MemberConfig,
        delegate: Arc<dyn Delegate>,
        events: Option<Arc<dyn EventDelegate>>,
        size: ClusterSize,
    ) -> Result<Cluster> {
        config.validate()?;

        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.bind_port);
        let transport = NetTransport::bind(bind_addr, config.tcp_timeout).await?;
        let port = transport.local_addr().port();
        let advertise_ip = resolve_advertise_ip(&config.advertise_host, port).await;
        let advertise_addr = SocketAddr::new(advertise_ip, port);

        let meta = delegate.node_meta(MAX_META_SIZE);
        if meta.len() > MAX_META_SIZE {
            return Err(Error::config(format!(
                "node meta is {} bytes, limit is {MAX_META_SIZE}",
                meta.len()
            )));
        }

        let local = Member::new(
            NodeId::new(config.node_name.clone()),
            advertise_ip,
            port,
            meta,
        );
        info!(name = %local.name, addr = %advertise_addr, "membership engine starting");
        let membership = Membership::new(local, size.clone());
        let state = Arc::new(ProtocolState::new(
            config, membership, transport, advertise_addr, delegate, events, size,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(protocol::probe_loop(Arc::clone(&state), shutdown_rx.clone())),
            tokio::spawn(protocol::gossip_loop(Arc::clone(&state), shutdown_rx.clone())),
            tokio::spawn(protocol::reaper_loop(Arc::clone(&state), shutdown_rx.clone())),
            tokio::spawn(protocol::recv_loop(Arc::clone(&state), shutdown_rx.clone())),
            tokio::spawn(antientropy::push_pull_loop(
                Arc::clone(&state),
                shutdown_rx.clone(),
            )),
            tokio::spawn(antientropy::accept_loop(Arc::clone(&state), shutdown_rx)),
        ];

        Ok(Cluster {
            state,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            has_shutdown: AtomicBool::new(false),
        })
    }

    /// Join the cluster through a list of `host:port` seeds.
    ///
    /// Returns the number of seeds successfully contacted. With a non-empty
    /// seed list and zero successes this is a join error.
    pub async fn join(&self, seeds: &[String]) -> Result<usize> {
        let mut joined = 0usize;
        let mut last_error = None;
        for seed in seeds {
            let addr = match lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        warn!(%seed, "seed resolved to nothing");
                        continue;
                    }
                },
                Err(e) => {
                    warn!(%seed, "seed resolution failed: {e}");
                    last_error = Some(Error::transport(format!("resolve {seed}: {e}")));
                    continue;
                }
            };
            match self.state.push_pull(addr, true).await {
                Ok(()) => {
                    info!(%seed, "joined via seed");
                    joined += 1;
                }
                Err(e) => {
                    warn!(%seed, "join attempt failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        if joined == 0 && !seeds.is_empty() {
            let detail = last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no seed reachable".to_string());
            return Err(Error::join(format!(
                "failed to contact any of {} seeds: {detail}",
                seeds.len()
            )));
        }
        Ok(joined)
    }

    /// Broadcast a graceful departure and wait for it to propagate.
    ///
    /// Waits at most `deadline` for the leave broadcast to drain; expiry is
    /// not an error. Sockets stay open until [`shutdown`](Self::shutdown).
    pub async fn leave(&self, deadline: Duration) -> Result<()> {
        if self.has_shutdown.load(Ordering::SeqCst) {
            return Err(Error::state("cluster already shut down"));
        }
        self.state.leaving.store(true, Ordering::SeqCst);
        let (incarnation, has_peers) = {
            let mut table = self.state.membership.write();
            let incarnation = table.local_leave();
            (incarnation, table.num_active() > 0)
        };
        let body = message::encode_body(&LeaveBody {
            name: self.state.local_name.clone(),
            incarnation,
        })?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.state.state_queue.enqueue_notify(
            self.state.local_name.as_str(),
            MessageType::Leave,
            body,
            Some(tx),
        );
        info!("leaving the cluster");
        if has_peers {
            let _ = timeout(deadline, rx).await;
        }
        Ok(())
    }

    /// Stop every protocol task and release the sockets. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.has_shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("membership engine shutting down");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if timeout(self.state.config.tcp_timeout, drain).await.is_err() {
            warn!("protocol tasks did not drain before the timeout");
        }
        self.state.state_queue.reset();
        Ok(())
    }

    /// Re-read the delegate meta, bump the incarnation, and broadcast it.
    pub fn update_meta(&self) -> Result<()> {
        let meta = self.state.delegate.node_meta(MAX_META_SIZE);
        if meta.len() > MAX_META_SIZE {
            return Err(Error::config(format!(
                "node meta is {} bytes, limit is {MAX_META_SIZE}",
                meta.len()
            )));
        }
        let member = self.state.membership.write().set_local_meta(meta);
        debug!(incarnation = member.incarnation, "local meta updated");
        self.state.enqueue_alive(&member);
        Ok(())
    }

    /// Every member that is not dead or left.
    pub fn members(&self) -> Vec<Member> {
        self.state.membership.read().active_members()
    }

    /// Run `f` over the active member list while holding the table's read
    /// lock, so no event can interleave with it.
    pub fn with_member_snapshot<R>(&self, f: impl FnOnce(&[Member]) -> R) -> R {
        let table = self.state.membership.read();
        f(&table.active_members())
    }

    /// The local member.
    pub fn local_member(&self) -> Member {
        self.state.membership.read().local()
    }

    /// Number of active members.
    pub fn num_members(&self) -> usize {
        self.state.membership.read().num_active()
    }

    /// The advertised membership endpoint.
    pub fn advertise_addr(&self) -> SocketAddr {
        self.state.advertise_addr
    }

    /// Whether `shutdown` has completed.
    pub fn is_shutdown(&self) -> bool {
        self.has_shutdown.load(Ordering::SeqCst)
    }

    /// A receiver that flips to `true` when the engine shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if !self.has_shutdown.load(Ordering::SeqCst) {
            // Tasks still hold the protocol state; tell them to stop even
            // though we cannot await them here.
            let _ = self.shutdown_tx.send(true);
            warn!("cluster dropped without shutdown");
        }
    }
}

async fn resolve_advertise_ip(advertise_host: &str, port: u16) -> IpAddr {
    if !advertise_host.is_empty() {
        if let Ok(ip) = advertise_host.parse::<IpAddr>() {
            return ip;
        }
        match lookup_host((advertise_host, port)).await {
            Ok(mut addrs) => {
                if let Some(addr) = addrs.next() {
                    return addr.ip();
                }
            }
            Err(e) => warn!(advertise_host, "advertise host resolution failed: {e}"),
        }
    }
    // Fall back to the hostname's address, then loopback.
    if let Ok(mut addrs) = lookup_host((os_hostname().as_str(), port)).await {
        if let Some(addr) = addrs.find(|a| a.is_ipv4()) {
            return addr.ip();
        }
    }
    debug!("advertising loopback; set the advertise host for multi-host clusters");
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NoopDelegate;

    fn test_config(name: &str) -> MemberConfig {
        let mut config = MemberConfig::default();
        config.service_name = "test".to_string();
        config.node_name = name.to_string();
        config.bind_port = 0;
        config.advertise_host = "127.0.0.1".to_string();
        config.probe_interval = Duration::from_millis(200);
        config.probe_timeout = Duration::from_millis(100);
        config.gossip_interval = Duration::from_millis(50);
        config.push_pull_interval = Duration::from_secs(30);
        config
    }

    async fn start(name: &str) -> Cluster {
        Cluster::create(
            test_config(name),
            Arc::new(NoopDelegate),
            None,
            ClusterSize::new(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_shutdown() {
        let cluster = start("node-a").await;
        assert_eq!(cluster.num_members(), 1);
        assert_eq!(cluster.local_member().name, NodeId::new("node-a"));
        assert_ne!(cluster.advertise_addr().port(), 0);

        cluster.shutdown().await.unwrap();
        assert!(cluster.is_shutdown());
        // Idempotent.
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let cluster = start("node-a").await;
        let err = cluster
            .join(&["127.0.0.1:1".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Join(_)));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_empty_seed_list_is_standalone() {
        let cluster = start("node-a").await;
        assert_eq!(cluster.join(&[]).await.unwrap(), 0);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_leave_without_peers_returns_quickly() {
        let cluster = start("node-a").await;
        let started = std::time::Instant::now();
        cluster.leave(Duration::from_secs(5)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_meta_is_config_error() {
        struct FatDelegate;
        impl Delegate for FatDelegate {
            fn node_meta(&self, _limit: usize) -> Vec<u8> {
                vec![0; MAX_META_SIZE + 1]
            }
            fn notify_msg(&self, _msg: &[u8]) {}
            fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
                Vec::new()
            }
            fn local_state(&self, _join: bool) -> Vec<u8> {
                Vec::new()
            }
            fn merge_remote_state(&self, _state: &[u8], _join: bool) {}
        }

        let err = Cluster::create(
            test_config("node-a"),
            Arc::new(FatDelegate),
            None,
            ClusterSize::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
