//! Bounded, retransmit-limited broadcast queue
//!
//! Pending gossip items ride along on outgoing probe and gossip frames until
//! they have been transmitted `retransmit_mult * ceil(log10(n + 1))` times.
//! A newer broadcast for the same invalidation key replaces the queued one.

use crate::message::MessageType;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// Hard cap on queued items; beyond it the most-transmitted items are dropped.
const MAX_QUEUE_DEPTH: usize = 1024;

/// A broadcast drained from the queue, ready for compound packing.
#[derive(Debug, Clone)]
pub struct QueuedBroadcast {
    /// Wire type the body must be sent as
    pub msg_type: MessageType,
    /// Encoded body
    pub body: Vec<u8>,
}

struct Item {
    key: String,
    msg_type: MessageType,
    body: Vec<u8>,
    transmits: usize,
    notify: Option<oneshot::Sender<()>>,
}

impl Item {
    fn finish(&mut self) {
        if let Some(notify) = self.notify.take() {
            let _ = notify.send(());
        }
    }
}

/// Thread-safe queue of pending broadcasts.
pub struct TransmitLimitedQueue {
    items: Mutex<Vec<Item>>,
    retransmit_mult: usize,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
}

impl TransmitLimitedQueue {
    /// Create a queue.
    ///
    /// `num_nodes` reports the current cluster size; the retransmit limit
    /// scales with its logarithm.
    pub fn new(retransmit_mult: usize, num_nodes: Box<dyn Fn() -> usize + Send + Sync>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            retransmit_mult,
            num_nodes,
        }
    }

    /// The current per-item transmit limit.
    pub fn retransmit_limit(&self) -> usize {
        let n = (self.num_nodes)();
        let scale = (((n + 1) as f64).log10()).ceil().max(1.0) as usize;
        (self.retransmit_mult * scale).max(1)
    }

    /// Queue a broadcast, invalidating any queued item with the same key.
    pub fn enqueue(&self, key: impl Into<String>, msg_type: MessageType, body: Vec<u8>) {
        self.enqueue_notify(key, msg_type, body, None);
    }

    /// Queue a broadcast and get notified once it leaves the queue, whether
    /// fully transmitted or invalidated.
    pub fn enqueue_notify(
        &self,
        key: impl Into<String>,
        msg_type: MessageType,
        body: Vec<u8>,
        notify: Option<oneshot::Sender<()>>,
    ) {
        let key = key.into();
        let mut items = self.items.lock();
        items.retain_mut(|item| {
            if item.key == key {
                item.finish();
                false
            } else {
                true
            }
        });
        if items.len() >= MAX_QUEUE_DEPTH {
            // Drop the most-transmitted item to make room.
            if let Some((idx, _)) = items
                .iter()
                .enumerate()
                .max_by_key(|(_, item)| item.transmits)
            {
                let mut dropped = items.swap_remove(idx);
                dropped.finish();
            }
        }
        items.push(Item {
            key,
            msg_type,
            body,
            transmits: 0,
            notify,
        });
    }

    /// Drain up to `limit` bytes of broadcasts, least-transmitted first.
    ///
    /// `overhead` is the per-item framing cost counted against the budget.
    /// Every returned item has its transmit count incremented; items that
    /// reach the retransmit limit are evicted.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<QueuedBroadcast> {
        let transmit_limit = self.retransmit_limit();
        let mut items = self.items.lock();
        if items.is_empty() {
            return Vec::new();
        }
        items.sort_by_key(|item| item.transmits);

        let mut drained = Vec::new();
        let mut used = 0usize;
        let mut index = 0usize;
        while index < items.len() {
            let cost = overhead + items[index].body.len();
            if used + cost > limit {
                index += 1;
                continue;
            }
            used += cost;
            let item = &mut items[index];
            item.transmits += 1;
            drained.push(QueuedBroadcast {
                msg_type: item.msg_type,
                body: item.body.clone(),
            });
            if item.transmits >= transmit_limit {
                let mut evicted = items.remove(index);
                evicted.finish();
            } else {
                index += 1;
            }
        }
        drained
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop everything, firing pending notifications. Used on shutdown.
    pub fn reset(&self) {
        let mut items = self.items.lock();
        for item in items.iter_mut() {
            item.finish();
        }
        items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_for(nodes: usize) -> TransmitLimitedQueue {
        TransmitLimitedQueue::new(2, Box::new(move || nodes))
    }

    #[test]
    fn test_retransmit_limit_scales_with_cluster() {
        assert_eq!(queue_for(0).retransmit_limit(), 2);
        assert_eq!(queue_for(9).retransmit_limit(), 2);
        assert_eq!(queue_for(10).retransmit_limit(), 4);
        assert_eq!(queue_for(99).retransmit_limit(), 4);
        assert_eq!(queue_for(100).retransmit_limit(), 6);
    }

    #[test]
    fn test_broadcast_bound() {
        let queue = queue_for(3);
        queue.enqueue("a", MessageType::Alive, vec![1]);
        let limit = queue.retransmit_limit();
        let mut sent = 0;
        for _ in 0..limit + 3 {
            sent += queue.get_broadcasts(8, 1400).len();
        }
        assert_eq!(sent, limit);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_key_invalidates() {
        let queue = queue_for(3);
        queue.enqueue("node-1", MessageType::Suspect, vec![1]);
        queue.enqueue("node-1", MessageType::Alive, vec![2]);
        assert_eq!(queue.len(), 1);
        let drained = queue.get_broadcasts(8, 1400);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].msg_type, MessageType::Alive);
        assert_eq!(drained[0].body, vec![2]);
    }

    #[test]
    fn test_least_transmitted_first() {
        let queue = queue_for(100);
        queue.enqueue("old", MessageType::Alive, vec![1]);
        // Transmit "old" once.
        assert_eq!(queue.get_broadcasts(8, 1400).len(), 1);
        queue.enqueue("new", MessageType::Alive, vec![2]);
        let drained = queue.get_broadcasts(8, 1400);
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].body, vec![2]);
        assert_eq!(drained[1].body, vec![1]);
    }

    #[test]
    fn test_byte_budget_respected() {
        let queue = queue_for(3);
        queue.enqueue("a", MessageType::User, vec![0; 100]);
        queue.enqueue("b", MessageType::User, vec![0; 100]);
        queue.enqueue("c", MessageType::User, vec![0; 100]);
        // Budget fits two items with overhead 8.
        let drained = queue.get_broadcasts(8, 230);
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn test_small_budget_skips_large_items() {
        let queue = queue_for(3);
        queue.enqueue("big", MessageType::User, vec![0; 500]);
        queue.enqueue("small", MessageType::User, vec![0; 10]);
        let drained = queue.get_broadcasts(8, 100);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].body.len(), 10);
    }

    #[tokio::test]
    async fn test_notify_fires_on_eviction() {
        let queue = queue_for(1);
        let (tx, rx) = oneshot::channel();
        queue.enqueue_notify("a", MessageType::Leave, vec![1], Some(tx));
        let limit = queue.retransmit_limit();
        for _ in 0..limit {
            queue.get_broadcasts(8, 1400);
        }
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_notify_fires_on_invalidation() {
        let queue = queue_for(1);
        let (tx, rx) = oneshot::channel();
        queue.enqueue_notify("a", MessageType::Suspect, vec![1], Some(tx));
        queue.enqueue("a", MessageType::Alive, vec![2]);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_reset_fires_notifications() {
        let queue = queue_for(1);
        let (tx, rx) = oneshot::channel();
        queue.enqueue_notify("a", MessageType::Leave, vec![1], Some(tx));
        queue.reset();
        assert!(rx.await.is_ok());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_overflow_drops_most_transmitted() {
        let queue = queue_for(3);
        for i in 0..MAX_QUEUE_DEPTH {
            queue.enqueue(format!("k{i}"), MessageType::User, vec![1]);
        }
        // Give "k0" a transmit so it becomes the eviction candidate.
        queue.get_broadcasts(8, 16);
        queue.enqueue("overflow", MessageType::User, vec![2]);
        assert_eq!(queue.len(), MAX_QUEUE_DEPTH);
    }
}
