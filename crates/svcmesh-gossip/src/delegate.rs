//! Hook points between the membership engine and its embedder
//!
//! All hooks are synchronous and invoked from inside the protocol loops, so
//! implementations must not block; long work has to be offloaded.

use crate::member::Member;

/// Capability set the embedder provides to the engine.
pub trait Delegate: Send + Sync {
    /// The local node's serialized meta, truncated to `limit` bytes.
    ///
    /// Called at startup and whenever the local meta is invalidated.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Deliver a user-level broadcast. The engine treats the bytes as opaque.
    fn notify_msg(&self, msg: &[u8]);

    /// Drain pending user broadcasts for piggybacking, within `limit` bytes
    /// and accounting `overhead` bytes per item.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Application state shipped during push/pull exchanges.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Merge application state received during a push/pull exchange.
    fn merge_remote_state(&self, state: &[u8], join: bool);
}

/// Observer of membership state edges.
///
/// For any single member the hooks fire exactly once per observed edge, in
/// the order the table applied them.
pub trait EventDelegate: Send + Sync {
    /// A member entered the cluster.
    fn notify_join(&self, member: &Member);

    /// A member died or left the cluster.
    fn notify_leave(&self, member: &Member);

    /// A member's meta changed.
    fn notify_update(&self, member: &Member);
}

/// A delegate with no meta, no broadcasts, and no application state.
///
/// Useful for tests and for embedders that only need membership.
#[derive(Debug, Default)]
pub struct NoopDelegate;

impl Delegate for NoopDelegate {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
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
