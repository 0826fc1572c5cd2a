//! Membership table for the gossip protocol
//!
//! The table maps member names to their last known state and serializes every
//! state transition for a given name. Probe targets are drawn from a shuffled
//! round-robin ring so every peer is probed with the same frequency.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use svcmesh_core::NodeId;
use tracing::{debug, info};

/// Upper bound on serialized member meta.
pub const MAX_META_SIZE: usize = 512;

/// State of a member in the gossip protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Node is alive and responding
    Alive,
    /// Node failed probing and is under suspicion
    Suspect,
    /// Node exceeded its suspicion timeout and is treated as failed
    Dead,
    /// Node left the cluster gracefully
    Left,
}

impl MemberState {
    /// Check if the member is considered active (alive or suspect)
    pub fn is_active(&self) -> bool {
        matches!(self, MemberState::Alive | MemberState::Suspect)
    }

    /// Check if the member is considered inactive (dead or left)
    pub fn is_inactive(&self) -> bool {
        matches!(self, MemberState::Dead | MemberState::Left)
    }
}

/// An addressable cluster member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// Stable name, unique within the cluster
    pub name: NodeId,
    /// Network address
    pub addr: IpAddr,
    /// Membership port
    pub port: u16,
    /// Current state
    pub state: MemberState,
    /// Node-owned version counter; only the node itself increases it, except
    /// when refuting
    pub incarnation: u32,
    /// Opaque meta bytes, at most [`MAX_META_SIZE`] after serialization
    pub meta: Vec<u8>,
}

impl Member {
    /// Create a new alive member
    pub fn new(name: NodeId, addr: IpAddr, port: u16, meta: Vec<u8>) -> Self {
        Self {
            name,
            addr,
            port,
            state: MemberState::Alive,
            incarnation: 0,
            meta,
        }
    }

    /// The member's membership endpoint
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// A member's state as exchanged during anti-entropy push/pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteState {
    /// Member name
    pub name: NodeId,
    /// Network address
    pub addr: IpAddr,
    /// Membership port
    pub port: u16,
    /// State at the sender
    pub state: MemberState,
    /// Incarnation at the sender
    pub incarnation: u32,
    /// Meta bytes at the sender
    pub meta: Vec<u8>,
}

impl From<&Member> for RemoteState {
    fn from(member: &Member) -> Self {
        Self {
            name: member.name.clone(),
            addr: member.addr,
            port: member.port,
            state: member.state,
            incarnation: member.incarnation,
            meta: member.meta.clone(),
        }
    }
}

/// Shared gauge of the active cluster size.
///
/// Both transmit-limited queues size their retransmit limits from it without
/// holding the membership lock.
#[derive(Debug, Clone, Default)]
pub struct ClusterSize(Arc<AtomicUsize>);

impl ClusterSize {
    /// Create a gauge starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Current number of active members
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn set(&self, n: usize) {
        self.0.store(n, Ordering::Relaxed);
    }
}

/// A state edge observed by the table, delivered to the event delegate.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// A member entered the cluster
    Join(Member),
    /// A member died or left
    Leave(Member),
    /// A member's meta changed
    Update(Member),
}

/// Result of applying a state claim to the table.
#[derive(Debug, Default)]
pub struct Applied {
    /// The claim changed the table and should be rebroadcast
    pub accepted: bool,
    /// The state edge to deliver, if the change is observable
    pub event: Option<MemberEvent>,
}

impl Applied {
    fn ignored() -> Self {
        Self::default()
    }

    fn accepted(event: Option<MemberEvent>) -> Self {
        Self {
            accepted: true,
            event,
        }
    }
}

/// Outcome of applying a suspect message.
#[derive(Debug)]
pub enum SuspectOutcome {
    /// Message was stale or about an unknown/inactive member
    Ignored,
    /// The member just entered suspicion; rebroadcast it
    NewSuspect(Member),
    /// An already-suspect member got an independent confirmation
    Confirmed(Member),
    /// The message targets the local node; refute it
    RefuteLocal,
}

/// Timing inputs for suspicion timers.
#[derive(Debug, Clone, Copy)]
pub struct SuspicionTiming {
    /// Failure-detector tick interval
    pub probe_interval: Duration,
    /// Suspicion timeout multiplier
    pub suspicion_mult: u32,
}

impl SuspicionTiming {
    fn min_timeout(&self) -> Duration {
        self.probe_interval * self.suspicion_mult
    }

    fn max_timeout(&self, n: usize) -> Duration {
        let scale = ((n + 1) as f64).log10().max(1.0);
        self.min_timeout().mul_f64(scale)
    }
}

/// Suspicion timer shortened geometrically by independent confirmations.
#[derive(Debug)]
struct Suspicion {
    started: Instant,
    min: Duration,
    max: Duration,
    /// Confirmations needed to reach the minimum timeout
    expected: usize,
    confirmers: HashSet<NodeId>,
}

impl Suspicion {
    fn new(started: Instant, timing: SuspicionTiming, n: usize, from: NodeId) -> Self {
        let mut confirmers = HashSet::new();
        confirmers.insert(from);
        Self {
            started,
            min: timing.min_timeout(),
            max: timing.max_timeout(n),
            expected: n.saturating_sub(2).max(1),
            confirmers,
        }
    }

    /// Record a confirmation; returns false for duplicates.
    fn confirm(&mut self, from: NodeId) -> bool {
        self.confirmers.insert(from)
    }

    fn deadline(&self) -> Instant {
        let c = self.confirmers.len().saturating_sub(1) as f64;
        let k = self.expected as f64;
        let frac = (c + 1.0).ln() / (k + 1.0).ln();
        let max = self.max.as_secs_f64();
        let min = self.min.as_secs_f64();
        let timeout = (max - frac * (max - min)).max(min);
        self.started + Duration::from_secs_f64(timeout)
    }
}

struct MemberRecord {
    member: Member,
    /// When the member last changed state; drives dead-node retention
    last_change: Instant,
    suspicion: Option<Suspicion>,
}

/// Result of merging a remote membership view.
#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Events to deliver, in table order
    pub events: Vec<MemberEvent>,
    /// The remote view holds the local node as suspect or dead
    pub refute_local: bool,
}

/// The membership table.
///
/// Owned by the protocol behind a reader/writer lock; all methods are
/// synchronous and never block.
pub struct Membership {
    local_name: NodeId,
    members: HashMap<NodeId, MemberRecord>,
    probe_ring: Vec<NodeId>,
    probe_cursor: usize,
    size: ClusterSize,
}

impl Membership {
    /// Create a table seeded with the local member.
    pub fn new(local: Member, size: ClusterSize) -> Self {
        let local_name = local.name.clone();
        let mut members = HashMap::new();
        members.insert(
            local_name.clone(),
            MemberRecord {
                member: local,
                last_change: Instant::now(),
                suspicion: None,
            },
        );
        size.set(1);
        Self {
            local_name,
            members,
            probe_ring: Vec::new(),
            probe_cursor: 0,
            size,
        }
    }

    /// The local member.
    pub fn local(&self) -> Member {
        self.members[&self.local_name].member.clone()
    }

    /// The local node's current incarnation.
    pub fn local_incarnation(&self) -> u32 {
        self.members[&self.local_name].member.incarnation
    }

    /// A member by name.
    pub fn get(&self, name: &NodeId) -> Option<Member> {
        self.members.get(name).map(|r| r.member.clone())
    }

    /// Every member that is not dead or left.
    pub fn active_members(&self) -> Vec<Member> {
        self.members
            .values()
            .filter(|r| r.member.state.is_active())
            .map(|r| r.member.clone())
            .collect()
    }

    /// Every known member, including dead and left ones. Used by push/pull.
    pub fn snapshot_all(&self) -> Vec<Member> {
        self.members.values().map(|r| r.member.clone()).collect()
    }

    /// Number of active members.
    pub fn num_active(&self) -> usize {
        self.members
            .values()
            .filter(|r| r.member.state.is_active())
            .count()
    }

    fn note_size(&self) {
        self.size.set(self.num_active());
    }

    /// Bump the local incarnation past `at_least` and return the new value.
    pub fn refute(&mut self, at_least: u32) -> Member {
        let record = self
            .members
            .get_mut(&self.local_name)
            .expect("local member is always present");
        record.member.incarnation = record.member.incarnation.max(at_least) + 1;
        record.member.state = MemberState::Alive;
        record.last_change = Instant::now();
        record.member.clone()
    }

    /// Replace the local meta, bump the incarnation, and return the member.
    pub fn set_local_meta(&mut self, meta: Vec<u8>) -> Member {
        let record = self
            .members
            .get_mut(&self.local_name)
            .expect("local member is always present");
        record.member.meta = meta;
        record.member.incarnation += 1;
        record.last_change = Instant::now();
        record.member.clone()
    }

    /// Mark the local node as left and return its incarnation.
    pub fn local_leave(&mut self) -> u32 {
        let incarnation = {
            let record = self
                .members
                .get_mut(&self.local_name)
                .expect("local member is always present");
            record.member.state = MemberState::Left;
            record.last_change = Instant::now();
            record.member.incarnation
        };
        self.note_size();
        incarnation
    }

    /// Apply an alive claim.
    ///
    /// A strictly higher incarnation supersedes state and meta; at equal
    /// incarnation alive never supersedes suspect or dead. Claims about the
    /// local node are ignored here; the protocol handles refutation.
    pub fn mark_alive(
        &mut self,
        name: NodeId,
        addr: IpAddr,
        port: u16,
        incarnation: u32,
        meta: Vec<u8>,
    ) -> Applied {
        if name == self.local_name {
            return Applied::ignored();
        }
        if meta.len() > MAX_META_SIZE {
            debug!(%name, len = meta.len(), "rejecting alive with oversized meta");
            return Applied::ignored();
        }
        let applied = match self.members.get_mut(&name) {
            None => {
                let member = Member {
                    name: name.clone(),
                    addr,
                    port,
                    state: MemberState::Alive,
                    incarnation,
                    meta,
                };
                info!(name = %member.name, addr = %member.address(), "member joined");
                self.members.insert(
                    name.clone(),
                    MemberRecord {
                        member: member.clone(),
                        last_change: Instant::now(),
                        suspicion: None,
                    },
                );
                self.probe_ring.push(name);
                Applied::accepted(Some(MemberEvent::Join(member)))
            }
            Some(record) => {
                if incarnation <= record.member.incarnation {
                    return Applied::ignored();
                }
                let old_state = record.member.state;
                let meta_changed = record.member.meta != meta;
                record.member.addr = addr;
                record.member.port = port;
                record.member.incarnation = incarnation;
                record.member.meta = meta;
                record.member.state = MemberState::Alive;
                record.last_change = Instant::now();
                record.suspicion = None;
                let event = match old_state {
                    MemberState::Dead | MemberState::Left => {
                        info!(%name, "member rejoined");
                        Some(MemberEvent::Join(record.member.clone()))
                    }
                    _ if meta_changed => Some(MemberEvent::Update(record.member.clone())),
                    _ => None,
                };
                Applied::accepted(event)
            }
        };
        self.note_size();
        applied
    }

    /// Apply a suspect claim from `from`.
    pub fn suspect(
        &mut self,
        name: &NodeId,
        from: NodeId,
        incarnation: u32,
        timing: SuspicionTiming,
    ) -> SuspectOutcome {
        if *name == self.local_name {
            return SuspectOutcome::RefuteLocal;
        }
        let n = self.num_active();
        let outcome = match self.members.get_mut(name) {
            None => SuspectOutcome::Ignored,
            Some(record) => {
                if incarnation < record.member.incarnation || record.member.state.is_inactive() {
                    SuspectOutcome::Ignored
                } else if record.member.state == MemberState::Suspect {
                    match record.suspicion.as_mut() {
                        Some(suspicion) => {
                            if suspicion.confirm(from) {
                                SuspectOutcome::Confirmed(record.member.clone())
                            } else {
                                SuspectOutcome::Ignored
                            }
                        }
                        None => SuspectOutcome::Ignored,
                    }
                } else {
                    record.member.state = MemberState::Suspect;
                    record.member.incarnation = incarnation;
                    record.last_change = Instant::now();
                    record.suspicion = Some(Suspicion::new(Instant::now(), timing, n, from));
                    debug!(%name, incarnation, "member suspected");
                    SuspectOutcome::NewSuspect(record.member.clone())
                }
            }
        };
        self.note_size();
        outcome
    }

    /// A direct or relayed ack arrived from `name`: clear any suspicion.
    pub fn ack_received(&mut self, name: &NodeId, incarnation: u32) {
        if let Some(record) = self.members.get_mut(name) {
            if record.member.state == MemberState::Suspect
                && incarnation >= record.member.incarnation
            {
                record.member.state = MemberState::Alive;
                record.member.incarnation = incarnation;
                record.last_change = Instant::now();
                record.suspicion = None;
                debug!(%name, "suspicion cleared by ack");
            }
        }
        self.note_size();
    }

    /// Apply a dead claim. Returns the leave event when accepted.
    pub fn confirm_dead(&mut self, name: &NodeId, incarnation: u32) -> Option<MemberEvent> {
        let event = match self.members.get_mut(name) {
            Some(record)
                if record.member.state.is_active()
                    && incarnation >= record.member.incarnation =>
            {
                record.member.state = MemberState::Dead;
                record.member.incarnation = incarnation;
                record.last_change = Instant::now();
                record.suspicion = None;
                info!(%name, "member confirmed dead");
                Some(MemberEvent::Leave(record.member.clone()))
            }
            _ => None,
        };
        self.note_size();
        event
    }

    /// Apply a leave broadcast. Left is terminal.
    pub fn leave(&mut self, name: &NodeId, incarnation: u32) -> Applied {
        let applied = match self.members.get_mut(name) {
            Some(record) if record.member.state != MemberState::Left => {
                let was_active = record.member.state.is_active();
                record.member.state = MemberState::Left;
                record.member.incarnation = record.member.incarnation.max(incarnation);
                record.last_change = Instant::now();
                record.suspicion = None;
                info!(%name, "member left");
                // The dead transition already emitted a leave event.
                Applied::accepted(was_active.then(|| MemberEvent::Leave(record.member.clone())))
            }
            _ => Applied::ignored(),
        };
        self.note_size();
        applied
    }

    /// Suspects whose timer expired transition to dead; returns them.
    pub fn expired_suspects(&mut self, now: Instant) -> Vec<Member> {
        let mut dead = Vec::new();
        for record in self.members.values_mut() {
            if record.member.state == MemberState::Suspect {
                let expired = record
                    .suspicion
                    .as_ref()
                    .map(|s| s.deadline() <= now)
                    .unwrap_or(true);
                if expired {
                    record.member.state = MemberState::Dead;
                    record.last_change = now;
                    record.suspicion = None;
                    info!(name = %record.member.name, "suspicion timer expired");
                    dead.push(record.member.clone());
                }
            }
        }
        if !dead.is_empty() {
            self.note_size();
        }
        dead
    }

    /// Reclaim dead and left members.
    ///
    /// Dead members are removed once both the dead-gossip window and the
    /// reclaim time elapsed; a zero reclaim time retains them forever. Left
    /// members are removed on the first sweep when the reclaim time is zero.
    pub fn sweep(&mut self, now: Instant, gossip_to_dead: Duration, reclaim: Duration) -> Vec<NodeId> {
        let local = self.local_name.clone();
        let mut removed = Vec::new();
        self.members.retain(|name, record| {
            if *name == local {
                return true;
            }
            let elapsed = now.duration_since(record.last_change);
            let gone = match record.member.state {
                MemberState::Dead => {
                    !reclaim.is_zero() && elapsed >= gossip_to_dead && elapsed >= reclaim
                }
                MemberState::Left => reclaim.is_zero() || elapsed >= reclaim,
                _ => false,
            };
            if gone {
                debug!(%name, "reclaimed member");
                removed.push(name.clone());
            }
            !gone
        });
        removed
    }

    /// Merge a full remote view received during push/pull.
    pub fn merge_remote(
        &mut self,
        states: Vec<RemoteState>,
        timing: SuspicionTiming,
    ) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for remote in states {
            if remote.name == self.local_name {
                if remote.state != MemberState::Alive {
                    outcome.refute_local = true;
                }
                continue;
            }
            let event = match remote.state {
                MemberState::Alive => {
                    self.mark_alive(
                        remote.name,
                        remote.addr,
                        remote.port,
                        remote.incarnation,
                        remote.meta,
                    )
                    .event
                }
                MemberState::Suspect => {
                    // Unknown members arrive alive first so the suspect claim
                    // lands on an existing record.
                    if !self.members.contains_key(&remote.name) {
                        let joined = self.mark_alive(
                            remote.name.clone(),
                            remote.addr,
                            remote.port,
                            remote.incarnation,
                            remote.meta,
                        );
                        if let Some(e) = joined.event {
                            outcome.events.push(e);
                        }
                    }
                    match self.suspect(
                        &remote.name,
                        self.local_name.clone(),
                        remote.incarnation,
                        timing,
                    ) {
                        SuspectOutcome::RefuteLocal => {
                            outcome.refute_local = true;
                            None
                        }
                        _ => None,
                    }
                }
                MemberState::Dead => self.confirm_dead(&remote.name, remote.incarnation),
                MemberState::Left => self.leave(&remote.name, remote.incarnation).event,
            };
            if let Some(event) = event {
                outcome.events.push(event);
            }
        }
        outcome
    }

    /// Next failure-detector target from the shuffled round-robin ring.
    pub fn next_probe_target(&mut self) -> Option<Member> {
        if let Some(member) = self.take_from_ring() {
            return Some(member);
        }
        self.rebuild_ring();
        self.take_from_ring()
    }

    fn take_from_ring(&mut self) -> Option<Member> {
        while self.probe_cursor < self.probe_ring.len() {
            let name = self.probe_ring[self.probe_cursor].clone();
            self.probe_cursor += 1;
            if name == self.local_name {
                continue;
            }
            if let Some(record) = self.members.get(&name) {
                if record.member.state.is_active() {
                    return Some(record.member.clone());
                }
            }
        }
        None
    }

    fn rebuild_ring(&mut self) {
        self.probe_ring = self
            .members
            .values()
            .filter(|r| r.member.name != self.local_name && r.member.state.is_active())
            .map(|r| r.member.name.clone())
            .collect();
        self.probe_ring.shuffle(&mut rand::thread_rng());
        self.probe_cursor = 0;
    }

    /// Up to `k` random alive members, excluding `exclude` and the local node.
    pub fn k_random_alive(&self, k: usize, exclude: &[&NodeId]) -> Vec<Member> {
        let mut candidates: Vec<Member> = self
            .members
            .values()
            .filter(|r| {
                r.member.state == MemberState::Alive
                    && r.member.name != self.local_name
                    && !exclude.contains(&&r.member.name)
            })
            .map(|r| r.member.clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(k);
        candidates
    }

    /// Up to `k` random gossip targets.
    ///
    /// Dead members stay eligible while the dead-gossip window is open so
    /// they learn their own fate and can refute it.
    pub fn gossip_targets(&self, k: usize, gossip_to_dead: Duration) -> Vec<Member> {
        let now = Instant::now();
        let mut candidates: Vec<Member> = self
            .members
            .values()
            .filter(|r| {
                if r.member.name == self.local_name {
                    return false;
                }
                match r.member.state {
                    MemberState::Alive | MemberState::Suspect => true,
                    MemberState::Dead => now.duration_since(r.last_change) < gossip_to_dead,
                    MemberState::Left => false,
                }
            })
            .map(|r| r.member.clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(k);
        candidates
    }
}
