//! Anti-entropy push/pull state exchange
//!
//! Random gossip leaves gaps; every push/pull interval the engine contacts
//! one random live peer over TCP and both sides exchange their full
//! membership view plus opaque delegate state. The same exchange, flagged as
//! a join, bootstraps a node from its seeds.

use crate::member::RemoteState;
use crate::message::{self, MessageType, PushPullBody};
use crate::protocol::ProtocolState;
use std::net::SocketAddr;
use std::sync::Arc;
use svcmesh_core::{Error, Result};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, warn};

impl ProtocolState {
    fn local_push_pull(&self, join: bool) -> PushPullBody {
        let states: Vec<RemoteState> = self
            .membership
            .read()
            .snapshot_all()
            .iter()
            .map(RemoteState::from)
            .collect();
        PushPullBody {
            join,
            states,
            user_state: self.delegate.local_state(join),
        }
    }

    /// Merge a received push/pull view, firing events in table order.
    ///
    /// Accepted changes are re-queued for gossip so members learned only
    /// through push/pull still spread to the rest of the cluster.
    pub(crate) fn merge_push_pull(&self, remote: PushPullBody) {
        let join = remote.join;
        let refute = {
            let mut table = self.membership.write();
            let outcome = table.merge_remote(remote.states, self.timing());
            for event in &outcome.events {
                self.fire_event(event);
                self.enqueue_change(event);
            }
            outcome.refute_local
        };
        if refute {
            let at_least = self.membership.read().local_incarnation();
            self.refute(at_least);
        }
        if !remote.user_state.is_empty() {
            self.delegate.merge_remote_state(&remote.user_state, join);
        }
    }

    /// Run one push/pull exchange against `addr`.
    pub(crate) async fn push_pull(self: &Arc<Self>, addr: SocketAddr, join: bool) -> Result<()> {
        let body = message::encode_body(&self.local_push_pull(join))?;
        let frame_bytes = message::encode_frame(MessageType::PushPull, &body);

        let mut stream = self.transport.dial(addr).await?;
        self.transport.write_frame(&mut stream, &frame_bytes).await?;
        let frame = self.transport.read_frame(&mut stream).await?;
        if frame.msg_type != MessageType::PushPull {
            return Err(Error::decode(format!(
                "unexpected {:?} reply to push/pull",
                frame.msg_type
            )));
        }
        let remote: PushPullBody = message::decode_body(&frame.body)?;
        self.merge_push_pull(remote);
        Ok(())
    }

    /// Serve one inbound push/pull session.
    pub(crate) async fn serve_push_pull(self: &Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let frame = match self.transport.read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(%peer, "push/pull read failed: {e}");
                return;
            }
        };
        if frame.msg_type != MessageType::PushPull {
            debug!(%peer, "unexpected {:?} on push/pull listener", frame.msg_type);
            return;
        }
        let remote: PushPullBody = match message::decode_body(&frame.body) {
            Ok(remote) => remote,
            Err(e) => {
                debug!(%peer, "push/pull decode failed: {e}");
                return;
            }
        };

        // Reply with our view before merging theirs so the response is not
        // polluted by states we only just learned from them.
        let reply = self.local_push_pull(remote.join);
        let sent = message::encode_body(&reply)
            .map(|body| message::encode_frame(MessageType::PushPull, &body));
        match sent {
            Ok(frame_bytes) => {
                if let Err(e) = self.transport.write_frame(&mut stream, &frame_bytes).await {
                    debug!(%peer, "push/pull reply failed: {e}");
                }
            }
            Err(e) => {
                debug!(%peer, "push/pull encode failed: {e}");
                return;
            }
        }
        debug!(%peer, join = remote.join, "merging push/pull state");
        self.merge_push_pull(remote);
    }
}

/// Periodic anti-entropy loop.
pub(crate) async fn push_pull_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    if state.config.push_pull_interval.is_zero() {
        return;
    }
    let mut ticker = interval(state.config.push_pull_interval);
    // The first tick fires immediately; skip it so a fresh node does not
    // race its own join handshake.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let peer = {
                    let table = state.membership.read();
                    table.k_random_alive(1, &[]).into_iter().next()
                };
                if let Some(peer) = peer {
                    debug!(peer = %peer.name, "anti-entropy exchange");
                    if let Err(e) = state.push_pull(peer.address(), false).await {
                        warn!(peer = %peer.name, "push/pull failed: {e}");
                        state.suspect_member(&peer);
                    }
                }
            }
        }
    }
}

/// Inbound push/pull listener loop.
pub(crate) async fn accept_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = state.transport.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            state.serve_push_pull(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }
}
