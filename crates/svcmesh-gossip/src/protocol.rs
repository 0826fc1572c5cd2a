//! SWIM failure detection and gossip dissemination
//!
//! The probe loop pings one member per tick, falling back to indirect probes
//! through relays before suspecting the target. Suspicion timers escalate to
//! dead unless the subject refutes with a higher incarnation. Every outbound
//! probe, ack, and gossip frame piggybacks pending broadcasts.

use crate::delegate::{Delegate, EventDelegate};
use crate::member::{
    ClusterSize, Member, MemberEvent, Membership, SuspectOutcome, SuspicionTiming,
};
use crate::message::{
    self, AckBody, AliveBody, CompoundBody, CompoundPart, DeadBody, Frame, IndirectPingBody,
    LeaveBody, MessageType, PingBody, SuspectBody, COMPOUND_OVERHEAD, FRAME_HEADER_LEN,
    MAX_UDP_PACKET_SIZE,
};
use crate::queue::TransmitLimitedQueue;
use crate::transport::NetTransport;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcmesh_core::{MemberConfig, NodeId};
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

/// Slack left in each datagram for compound framing.
const PACKET_SLACK: usize = 32;

/// An in-flight probe waiting for its ack.
struct PendingAck {
    target: NodeId,
    tx: oneshot::Sender<AckBody>,
}

/// A relayed probe whose ack must be forwarded back to the requester.
struct AckForward {
    target: NodeId,
    reply_to: SocketAddr,
    registered: Instant,
}

/// Shared state of all protocol tasks.
pub(crate) struct ProtocolState {
    pub(crate) config: MemberConfig,
    pub(crate) local_name: NodeId,
    pub(crate) membership: RwLock<Membership>,
    pub(crate) transport: NetTransport,
    pub(crate) advertise_addr: SocketAddr,
    pub(crate) state_queue: TransmitLimitedQueue,
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) events: Option<Arc<dyn EventDelegate>>,
    seq: AtomicU32,
    pending_acks: DashMap<u32, PendingAck>,
    ack_forwards: DashMap<u32, AckForward>,
    pub(crate) leaving: AtomicBool,
}

impl ProtocolState {
    pub(crate) fn new(
        config: MemberConfig,
        membership: Membership,
        transport: NetTransport,
        advertise_addr: SocketAddr,
        delegate: Arc<dyn Delegate>,
        events: Option<Arc<dyn EventDelegate>>,
        size: ClusterSize,
    ) -> Self {
        let local_name = NodeId::new(config.node_name.clone());
        let state_queue = TransmitLimitedQueue::new(
            config.retransmit_mult,
            Box::new(move || size.get()),
        );
        Self {
            config,
            local_name,
            membership: RwLock::new(membership),
            transport,
            advertise_addr,
            state_queue,
            delegate,
            events,
            seq: AtomicU32::new(0),
            pending_acks: DashMap::new(),
            ack_forwards: DashMap::new(),
            leaving: AtomicBool::new(false),
        }
    }

    pub(crate) fn timing(&self) -> SuspicionTiming {
        SuspicionTiming {
            probe_interval: self.config.probe_interval,
            suspicion_mult: self.config.suspicion_mult,
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub(crate) fn fire_event(&self, event: &MemberEvent) {
        if let Some(events) = &self.events {
            match event {
                MemberEvent::Join(member) => events.notify_join(member),
                MemberEvent::Leave(member) => events.notify_leave(member),
                MemberEvent::Update(member) => events.notify_update(member),
            }
        }
    }

    /// Queue an aliveness claim for dissemination.
    pub(crate) fn enqueue_alive(&self, member: &Member) {
        let body = AliveBody {
            name: member.name.clone(),
            addr: member.addr,
            port: member.port,
            incarnation: member.incarnation,
            meta: member.meta.clone(),
        };
        match message::encode_body(&body) {
            Ok(bytes) => {
                self.state_queue
                    .enqueue(member.name.as_str(), MessageType::Alive, bytes)
            }
            Err(e) => debug!("failed to encode alive broadcast: {e}"),
        }
    }

    fn enqueue_suspect(&self, member: &Member) {
        let body = SuspectBody {
            name: member.name.clone(),
            incarnation: member.incarnation,
            from: self.local_name.clone(),
        };
        match message::encode_body(&body) {
            Ok(bytes) => {
                self.state_queue
                    .enqueue(member.name.as_str(), MessageType::Suspect, bytes)
            }
            Err(e) => debug!("failed to encode suspect broadcast: {e}"),
        }
    }

    fn enqueue_dead(&self, member: &Member) {
        let body = DeadBody {
            name: member.name.clone(),
            incarnation: member.incarnation,
            from: self.local_name.clone(),
        };
        match message::encode_body(&body) {
            Ok(bytes) => {
                self.state_queue
                    .enqueue(member.name.as_str(), MessageType::Dead, bytes)
            }
            Err(e) => debug!("failed to encode dead broadcast: {e}"),
        }
    }

    fn enqueue_leave(&self, member: &Member) {
        let body = LeaveBody {
            name: member.name.clone(),
            incarnation: member.incarnation,
        };
        match message::encode_body(&body) {
            Ok(bytes) => {
                self.state_queue
                    .enqueue(member.name.as_str(), MessageType::Leave, bytes)
            }
            Err(e) => debug!("failed to encode leave broadcast: {e}"),
        }
    }

    /// Queue the broadcast matching an observed state edge.
    pub(crate) fn enqueue_change(&self, event: &MemberEvent) {
        match event {
            MemberEvent::Join(member) | MemberEvent::Update(member) => {
                if member.state == crate::member::MemberState::Alive {
                    self.enqueue_alive(member);
                }
            }
            MemberEvent::Leave(member) => match member.state {
                crate::member::MemberState::Left => self.enqueue_leave(member),
                _ => self.enqueue_dead(member),
            },
        }
    }

    fn requeue(&self, key: &NodeId, msg_type: MessageType, body: Vec<u8>) {
        self.state_queue.enqueue(key.as_str(), msg_type, body);
    }

    /// Bump the local incarnation past `at_least` and broadcast aliveness.
    pub(crate) fn refute(&self, at_least: u32) {
        let member = self.membership.write().refute(at_least);
        info!(incarnation = member.incarnation, "refuting claim about local node");
        self.enqueue_alive(&member);
    }

    /// Drain pending broadcasts, protocol state first, then user items.
    fn collect_piggyback(&self, budget: usize) -> Vec<CompoundPart> {
        let mut parts: Vec<CompoundPart> = self
            .state_queue
            .get_broadcasts(COMPOUND_OVERHEAD, budget)
            .into_iter()
            .map(|b| CompoundPart::new(b.msg_type, b.body))
            .collect();
        let used: usize = parts
            .iter()
            .map(|p| p.body.len() + COMPOUND_OVERHEAD)
            .sum();
        for body in self
            .delegate
            .get_broadcasts(COMPOUND_OVERHEAD, budget.saturating_sub(used))
        {
            parts.push(CompoundPart::new(MessageType::User, body));
        }
        parts
    }

    /// Send a set of messages as one datagram, compounding when needed.
    async fn send_parts(&self, parts: Vec<CompoundPart>, addr: SocketAddr) {
        if parts.is_empty() {
            return;
        }
        let frame = if parts.len() == 1 {
            let part = &parts[0];
            match MessageType::from_u8(part.msg_type) {
                Some(msg_type) => message::encode_frame(msg_type, &part.body),
                None => return,
            }
        } else {
            match message::encode_body(&CompoundBody { parts }) {
                Ok(body) => message::encode_frame(MessageType::Compound, &body),
                Err(e) => {
                    debug!("failed to encode compound frame: {e}");
                    return;
                }
            }
        };
        if let Err(e) = self.transport.send_packet(&frame, addr).await {
            debug!(%addr, "gossip send failed: {e}");
        }
    }

    /// Send one message with piggybacked broadcasts.
    async fn send_with_piggyback(&self, msg_type: MessageType, body: Vec<u8>, addr: SocketAddr) {
        let budget = MAX_UDP_PACKET_SIZE
            .saturating_sub(FRAME_HEADER_LEN + PACKET_SLACK + body.len() + COMPOUND_OVERHEAD);
        let mut parts = vec![CompoundPart::new(msg_type, body)];
        parts.extend(self.collect_piggyback(budget));
        self.send_parts(parts, addr).await;
    }

    /// One failure-detector tick.
    pub(crate) async fn probe_once(self: &Arc<Self>) {
        let target = self.membership.write().next_probe_target();
        let Some(target) = target else {
            return;
        };
        let seq = self.next_seq();
        let (tx, mut rx) = oneshot::channel();
        self.pending_acks.insert(
            seq,
            PendingAck {
                target: target.name.clone(),
                tx,
            },
        );

        let ping = PingBody {
            seq,
            from: self.local_name.clone(),
        };
        let body = match message::encode_body(&ping) {
            Ok(body) => body,
            Err(e) => {
                debug!("failed to encode ping: {e}");
                self.pending_acks.remove(&seq);
                return;
            }
        };
        debug!(target = %target.name, seq, "probing member");
        self.send_with_piggyback(MessageType::Ping, body, target.address())
            .await;

        if let Ok(Ok(ack)) = timeout(self.config.probe_timeout, &mut rx).await {
            self.membership
                .write()
                .ack_received(&target.name, ack.incarnation);
            return;
        }

        // Direct probe missed; ask relays to try.
        let relays = {
            let table = self.membership.read();
            table.k_random_alive(
                self.config.indirect_checks,
                &[&target.name],
            )
        };
        if !relays.is_empty() {
            let indirect = IndirectPingBody {
                seq,
                from: self.local_name.clone(),
                reply_to: self.advertise_addr,
                target: target.name.clone(),
                target_addr: target.address(),
            };
            if let Ok(body) = message::encode_body(&indirect) {
                for relay in &relays {
                    debug!(target = %target.name, relay = %relay.name, "indirect probe");
                    self.send_with_piggyback(
                        MessageType::IndirectPing,
                        body.clone(),
                        relay.address(),
                    )
                    .await;
                }
            }
        }

        let remainder = self
            .config
            .probe_interval
            .saturating_sub(self.config.probe_timeout);
        if let Ok(Ok(ack)) = timeout(remainder, &mut rx).await {
            self.membership
                .write()
                .ack_received(&target.name, ack.incarnation);
            return;
        }

        self.pending_acks.remove(&seq);
        self.suspect_member(&target);
    }

    /// Locally accuse a member that failed direct and indirect probing.
    pub(crate) fn suspect_member(&self, target: &Member) {
        let outcome = {
            let mut table = self.membership.write();
            table.suspect(
                &target.name,
                self.local_name.clone(),
                target.incarnation,
                self.timing(),
            )
        };
        match outcome {
            SuspectOutcome::NewSuspect(member) | SuspectOutcome::Confirmed(member) => {
                warn!(name = %member.name, "member failed probing, now suspect");
                self.enqueue_suspect(&member);
            }
            SuspectOutcome::RefuteLocal => {}
            SuspectOutcome::Ignored => {}
        }
    }

    /// One gossip tick: fan queued broadcasts out to random members.
    pub(crate) async fn gossip_once(&self) {
        let targets = {
            let table = self.membership.read();
            table.gossip_targets(
                self.config.gossip_nodes,
                self.config.gossip_to_the_dead_time,
            )
        };
        for target in targets {
            let budget =
                MAX_UDP_PACKET_SIZE.saturating_sub(FRAME_HEADER_LEN + PACKET_SLACK);
            let parts = self.collect_piggyback(budget);
            if parts.is_empty() {
                break;
            }
            self.send_parts(parts, target.address()).await;
        }
    }

    /// Reap expired suspicion timers and reclaim dead members.
    pub(crate) fn reap(&self) {
        let now = Instant::now();
        {
            let mut table = self.membership.write();
            let dead = table.expired_suspects(now);
            for member in &dead {
                self.fire_event(&MemberEvent::Leave(member.clone()));
                self.enqueue_dead(member);
            }
            table.sweep(
                now,
                self.config.gossip_to_the_dead_time,
                self.config.dead_node_reclaim_time,
            );
        }
        self.ack_forwards
            .retain(|_, fwd| now.duration_since(fwd.registered) < self.config.probe_interval * 2);
    }

    /// Dispatch one inbound frame.
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: Frame, src: SocketAddr) {
        if frame.msg_type == MessageType::Compound {
            match message::decode_body::<CompoundBody>(&frame.body) {
                Ok(compound) => {
                    for part in compound.parts {
                        match MessageType::from_u8(part.msg_type) {
                            Some(MessageType::Compound) => {
                                debug!(%src, "dropping nested compound frame");
                            }
                            Some(msg_type) => {
                                self.handle_message(msg_type, part.body, src).await;
                            }
                            None => debug!(%src, "dropping unknown compound part"),
                        }
                    }
                }
                Err(e) => debug!(%src, "dropping malformed compound frame: {e}"),
            }
            return;
        }
        self.handle_message(frame.msg_type, frame.body, src).await;
    }

    async fn handle_message(self: &Arc<Self>, msg_type: MessageType, body: Vec<u8>, src: SocketAddr) {
        let result = match msg_type {
            MessageType::Ping => self.handle_ping(&body, src).await,
            MessageType::Ack => self.handle_ack(&body).await,
            MessageType::IndirectPing => self.handle_indirect_ping(&body).await,
            MessageType::Suspect => self.handle_suspect(&body),
            MessageType::Alive => self.handle_alive(&body),
            MessageType::Dead => self.handle_dead(&body),
            MessageType::Leave => self.handle_leave(&body),
            MessageType::User => {
                self.delegate.notify_msg(&body);
                Ok(())
            }
            MessageType::PushPull => {
                debug!(%src, "dropping push/pull frame on the packet path");
                Ok(())
            }
            MessageType::Encrypt => {
                debug!(%src, "dropping encrypted frame: encryption not configured");
                Ok(())
            }
            MessageType::Compound => unreachable!("compound handled by caller"),
        };
        if let Err(e) = result {
            debug!(%src, ?msg_type, "dropping message: {e}");
        }
    }

    async fn handle_ping(&self, body: &[u8], src: SocketAddr) -> svcmesh_core::Result<()> {
        let ping: PingBody = message::decode_body(body)?;
        let ack = AckBody {
            seq: ping.seq,
            from: self.local_name.clone(),
            incarnation: self.membership.read().local_incarnation(),
        };
        let bytes = message::encode_body(&ack)?;
        self.send_with_piggyback(MessageType::Ack, bytes, src).await;
        Ok(())
    }

    async fn handle_ack(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let ack: AckBody = message::decode_body(body)?;
        self.membership
            .write()
            .ack_received(&ack.from, ack.incarnation);
        let completed = match self.pending_acks.get(&ack.seq) {
            Some(pending) if pending.target == ack.from => true,
            _ => false,
        };
        if completed {
            if let Some((_, pending)) = self.pending_acks.remove(&ack.seq) {
                let _ = pending.tx.send(ack);
            }
            return Ok(());
        }
        let forward = match self.ack_forwards.get(&ack.seq) {
            Some(fwd) if fwd.target == ack.from => Some(fwd.reply_to),
            _ => None,
        };
        if let Some(reply_to) = forward {
            self.ack_forwards.remove(&ack.seq);
            let bytes = message::encode_body(&ack)?;
            debug!(target = %ack.from, %reply_to, "forwarding relayed ack");
            self.send_with_piggyback(MessageType::Ack, bytes, reply_to)
                .await;
        }
        Ok(())
    }

    async fn handle_indirect_ping(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let req: IndirectPingBody = message::decode_body(body)?;
        self.ack_forwards.insert(
            req.seq,
            AckForward {
                target: req.target.clone(),
                reply_to: req.reply_to,
                registered: Instant::now(),
            },
        );
        let ping = PingBody {
            seq: req.seq,
            from: self.local_name.clone(),
        };
        let bytes = message::encode_body(&ping)?;
        debug!(target = %req.target, on_behalf_of = %req.from, "relaying probe");
        self.send_with_piggyback(MessageType::Ping, bytes, req.target_addr)
            .await;
        Ok(())
    }

    fn handle_suspect(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let suspect: SuspectBody = message::decode_body(body)?;
        if suspect.name == self.local_name {
            if !self.leaving.load(Ordering::Relaxed) {
                self.refute(suspect.incarnation);
            }
            return Ok(());
        }
        let outcome = {
            let mut table = self.membership.write();
            table.suspect(
                &suspect.name,
                suspect.from.clone(),
                suspect.incarnation,
                self.timing(),
            )
        };
        match outcome {
            SuspectOutcome::NewSuspect(_) | SuspectOutcome::Confirmed(_) => {
                self.requeue(&suspect.name, MessageType::Suspect, body.to_vec());
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_alive(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let alive: AliveBody = message::decode_body(body)?;
        if alive.name == self.local_name {
            // Somebody claims a newer us; reassert authority over our state.
            let local_incarnation = self.membership.read().local_incarnation();
            if alive.incarnation > local_incarnation && !self.leaving.load(Ordering::Relaxed) {
                self.refute(alive.incarnation);
            }
            return Ok(());
        }
        let applied = {
            let mut table = self.membership.write();
            let applied = table.mark_alive(
                alive.name.clone(),
                alive.addr,
                alive.port,
                alive.incarnation,
                alive.meta,
            );
            if let Some(event) = &applied.event {
                self.fire_event(event);
            }
            applied
        };
        if applied.accepted {
            self.requeue(&alive.name, MessageType::Alive, body.to_vec());
        }
        Ok(())
    }

    fn handle_dead(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let dead: DeadBody = message::decode_body(body)?;
        if dead.name == self.local_name {
            if !self.leaving.load(Ordering::Relaxed) {
                self.refute(dead.incarnation);
            }
            return Ok(());
        }
        let event = {
            let mut table = self.membership.write();
            let event = table.confirm_dead(&dead.name, dead.incarnation);
            if let Some(event) = &event {
                self.fire_event(event);
            }
            event
        };
        if event.is_some() {
            self.requeue(&dead.name, MessageType::Dead, body.to_vec());
        }
        Ok(())
    }

    fn handle_leave(&self, body: &[u8]) -> svcmesh_core::Result<()> {
        let leave: LeaveBody = message::decode_body(body)?;
        if leave.name == self.local_name {
            if !self.leaving.load(Ordering::Relaxed) {
                self.refute(leave.incarnation);
            }
            return Ok(());
        }
        let applied = {
            let mut table = self.membership.write();
            let applied = table.leave(&leave.name, leave.incarnation);
            if let Some(event) = &applied.event {
                self.fire_event(event);
            }
            applied
        };
        if applied.accepted {
            self.requeue(&leave.name, MessageType::Leave, body.to_vec());
        }
        Ok(())
    }
}

/// Failure-detector loop.
pub(crate) async fn probe_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(state.config.probe_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.probe_once().await,
        }
    }
}

/// Gossip dissemination loop.
pub(crate) async fn gossip_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(state.config.gossip_interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.gossip_once().await,
        }
    }
}

/// Suspicion-timer and reclamation loop.
pub(crate) async fn reaper_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    let period = (state.config.probe_interval / 2).max(Duration::from_millis(20));
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => state.reap(),
        }
    }
}

/// Datagram receive loop.
pub(crate) async fn recv_loop(state: Arc<ProtocolState>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; 65536];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = state.transport.recv_packet(&mut buf) => {
                match received {
                    Ok((len, src)) => match message::decode_frame(&buf[..len]) {
                        Ok(frame) => state.handle_frame(frame, src).await,
                        Err(e) => debug!(%src, "dropping malformed packet: {e}"),
                    },
                    Err(e) => {
                        warn!("packet receive failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NoopDelegate;
    use crate::member::MemberState;
    use std::net::{IpAddr, Ipv4Addr};

    async fn state_with_peer() -> Arc<ProtocolState> {
        let mut config = MemberConfig::default();
        config.service_name = "test".to_string();
        config.node_name = "local".to_string();
        let size = ClusterSize::new();
        let transport = NetTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let advertise = transport.local_addr();
        let local = Member::new(
            NodeId::new("local"),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            advertise.port(),
            Vec::new(),
        );
        let membership = Membership::new(local, size.clone());
        let state = Arc::new(ProtocolState::new(
            config,
            membership,
            transport,
            advertise,
            Arc::new(NoopDelegate),
            None,
            size,
        ));
        state.membership.write().mark_alive(
            NodeId::new("peer"),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            9,
            1,
            Vec::new(),
        );
        state
    }

    #[tokio::test]
    async fn test_suspect_about_local_triggers_refutation() {
        let state = state_with_peer().await;
        let body = message::encode_body(&SuspectBody {
            name: NodeId::new("local"),
            incarnation: 0,
            from: NodeId::new("peer"),
        })
        .unwrap();
        state.handle_suspect(&body).unwrap();
        assert_eq!(state.membership.read().local_incarnation(), 1);
        // The refutation is queued for dissemination.
        assert_eq!(state.state_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_alive_claim_above_local_incarnation_is_outbid() {
        let state = state_with_peer().await;
        let body = message::encode_body(&AliveBody {
            name: NodeId::new("local"),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9,
            incarnation: 5,
            meta: Vec::new(),
        })
        .unwrap();
        state.handle_alive(&body).unwrap();
        assert_eq!(state.membership.read().local_incarnation(), 6);
    }

    #[tokio::test]
    async fn test_alive_rebroadcast_only_when_accepted() {
        let state = state_with_peer().await;
        let stale = message::encode_body(&AliveBody {
            name: NodeId::new("peer"),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9,
            incarnation: 0,
            meta: Vec::new(),
        })
        .unwrap();
        state.handle_alive(&stale).unwrap();
        assert!(state.state_queue.is_empty());

        let fresh = message::encode_body(&AliveBody {
            name: NodeId::new("peer"),
            addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 9,
            incarnation: 2,
            meta: Vec::new(),
        })
        .unwrap();
        state.handle_alive(&fresh).unwrap();
        assert_eq!(state.state_queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dead_claim_fires_and_rebroadcasts() {
        let state = state_with_peer().await;
        let body = message::encode_body(&DeadBody {
            name: NodeId::new("peer"),
            incarnation: 1,
            from: NodeId::new("other"),
        })
        .unwrap();
        state.handle_dead(&body).unwrap();
        assert_eq!(
            state
                .membership
                .read()
                .get(&NodeId::new("peer"))
                .unwrap()
                .state,
            MemberState::Dead
        );
        assert_eq!(state.state_queue.len(), 1);
        // A duplicate claim neither fires nor requeues.
        state.state_queue.reset();
        state.handle_dead(&body).unwrap();
        assert!(state.state_queue.is_empty());
    }

    #[tokio::test]
    async fn test_reap_escalates_expired_suspicion() {
        let state = state_with_peer().await;
        let peer = state.membership.read().get(&NodeId::new("peer")).unwrap();
        state.suspect_member(&peer);
        assert_eq!(
            state
                .membership
                .read()
                .get(&NodeId::new("peer"))
                .unwrap()
                .state,
            MemberState::Suspect
        );
        // Force the deadline into the past by reaping far in the future.
        let dead = state
            .membership
            .write()
            .expired_suspects(Instant::now() + Duration::from_secs(300));
        assert_eq!(dead.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_body_is_swallowed() {
        let state = state_with_peer().await;
        assert!(state.handle_suspect(&[0xff, 0x00]).is_err());
        // The table is untouched.
        assert_eq!(
            state
                .membership
                .read()
                .get(&NodeId::new("peer"))
                .unwrap()
                .state,
            MemberState::Alive
        );
    }
}
