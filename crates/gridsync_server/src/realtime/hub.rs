use crate::realtime::BroadcastMessage;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-connection buffer depth. A subscriber that falls this far behind is
/// treated as dead and evicted rather than allowed to stall the producer.
const BROADCAST_BUFFER: usize = 64;

/// Snapshot of hub occupancy for the health surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct HubStats {
    pub active_connections: usize,
    pub active_datasets: usize,
}

/// In-process registry of live connections, keyed by dataset id.
///
/// The hub exclusively owns the subscriber sets; no other code path touches
/// them. All registry mutation happens inside one short critical section
/// under a single lock, and the lock is never held across a send.
/// Delivery is at-most-once, best-effort: a failed send evicts the
/// connection, it is never retried.
pub struct Hub {
    rooms: Mutex<HashMap<i64, HashMap<Uuid, mpsc::Sender<BroadcastMessage>>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new connection under `dataset_id`, creating the subscriber
    /// set if absent. Returns the connection id and the receiving half the
    /// socket loop forwards from.
    pub async fn subscribe(&self, dataset_id: i64) -> (Uuid, mpsc::Receiver<BroadcastMessage>) {
        let (tx, rx) = mpsc::channel(BROADCAST_BUFFER);
        let conn_id = Uuid::new_v4();

        let mut rooms = self.rooms.lock().await;
        rooms.entry(dataset_id).or_default().insert(conn_id, tx);
        info!(
            "Subscribed connection {} to dataset {} ({} connected)",
            conn_id,
            dataset_id,
            rooms.get(&dataset_id).map(|c| c.len()).unwrap_or(0)
        );

        (conn_id, rx)
    }

    /// Remove a connection. When the dataset's set becomes empty the entry
    /// is dropped entirely, so a long-running process never accumulates
    /// empty sets.
    pub async fn unsubscribe(&self, dataset_id: i64, conn_id: Uuid) {
        let mut rooms = self.rooms.lock().await;
        if let Some(conns) = rooms.get_mut(&dataset_id) {
            if conns.remove(&conn_id).is_some() {
                info!(
                    "Unsubscribed connection {} from dataset {} ({} remaining)",
                    conn_id,
                    dataset_id,
                    conns.len()
                );
            }
            if conns.is_empty() {
                rooms.remove(&dataset_id);
            }
        }
    }

    /// Deliver `message` to every live connection subscribed to
    /// `dataset_id`. Never fails: a dataset with no subscribers is a no-op,
    /// and one connection's failure never prevents delivery to the others.
    ///
    /// The subscriber set is snapshotted under the registry lock, delivery
    /// happens outside it, and dead connections are pruned in one follow-up
    /// atomic update.
    pub async fn broadcast(&self, dataset_id: i64, message: BroadcastMessage) {
        let targets: Vec<(Uuid, mpsc::Sender<BroadcastMessage>)> = {
            let rooms = self.rooms.lock().await;
            match rooms.get(&dataset_id) {
                Some(conns) => conns.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                None => return,
            }
        };

        let mut dead = Vec::new();
        for (conn_id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Evicting slow subscriber {} on dataset {}",
                        conn_id, dataset_id
                    );
                    dead.push(conn_id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        "Pruning closed subscriber {} on dataset {}",
                        conn_id, dataset_id
                    );
                    dead.push(conn_id);
                }
            }
        }

        if dead.is_empty() {
            return;
        }

        let mut rooms = self.rooms.lock().await;
        if let Some(conns) = rooms.get_mut(&dataset_id) {
            for conn_id in &dead {
                conns.remove(conn_id);
            }
            if conns.is_empty() {
                rooms.remove(&dataset_id);
            }
        }
    }

    /// Current hub occupancy.
    pub async fn stats(&self) -> HubStats {
        let rooms = self.rooms.lock().await;
        HubStats {
            active_connections: rooms.values().map(|c| c.len()).sum(),
            active_datasets: rooms.len(),
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell(value: &str) -> BroadcastMessage {
        BroadcastMessage::Cell {
            row_id: 1,
            key: "A".to_string(),
            value: json!(value),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_receive_broadcasts() {
        let hub = Hub::new();
        let (_id_a, mut rx_a) = hub.subscribe(1).await;
        let (_id_b, mut rx_b) = hub.subscribe(1).await;

        hub.broadcast(1, cell("x")).await;

        assert!(matches!(
            rx_a.recv().await,
            Some(BroadcastMessage::Cell { .. })
        ));
        assert!(matches!(
            rx_b.recv().await,
            Some(BroadcastMessage::Cell { .. })
        ));
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_the_dataset() {
        let hub = Hub::new();
        let (_id_a, mut rx_a) = hub.subscribe(1).await;
        let (_id_b, mut rx_b) = hub.subscribe(2).await;

        hub.broadcast(1, cell("x")).await;

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_with_no_subscribers_is_a_noop() {
        let hub = Hub::new();
        hub.broadcast(99, cell("x")).await;
        assert_eq!(hub.stats().await.active_datasets, 0);
    }

    #[tokio::test]
    async fn unsubscribe_drops_empty_sets() {
        let hub = Hub::new();
        let (id_a, _rx_a) = hub.subscribe(1).await;
        let (id_b, _rx_b) = hub.subscribe(1).await;
        assert_eq!(hub.stats().await.active_datasets, 1);
        assert_eq!(hub.stats().await.active_connections, 2);

        hub.unsubscribe(1, id_a).await;
        assert_eq!(hub.stats().await.active_connections, 1);
        assert_eq!(hub.stats().await.active_datasets, 1);

        hub.unsubscribe(1, id_b).await;
        assert_eq!(hub.stats().await.active_connections, 0);
        assert_eq!(hub.stats().await.active_datasets, 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_connection_is_harmless() {
        let hub = Hub::new();
        hub.unsubscribe(1, Uuid::new_v4()).await;

        let (_id, _rx) = hub.subscribe(1).await;
        hub.unsubscribe(1, Uuid::new_v4()).await;
        assert_eq!(hub.stats().await.active_connections, 1);
    }

    #[tokio::test]
    async fn broadcast_prunes_dropped_receivers() {
        let hub = Hub::new();
        let (_id_a, rx_a) = hub.subscribe(1).await;
        let (_id_b, mut rx_b) = hub.subscribe(1).await;
        drop(rx_a);

        hub.broadcast(1, cell("x")).await;

        // The dead connection is gone, the live one still got the message
        assert!(rx_b.recv().await.is_some());
        assert_eq!(hub.stats().await.active_connections, 1);
    }

    #[tokio::test]
    async fn broadcast_evicts_slow_subscribers() {
        let hub = Hub::new();
        let (_id, _rx) = hub.subscribe(1).await;

        // Fill the buffer without draining, then one more
        for _ in 0..=BROADCAST_BUFFER {
            hub.broadcast(1, cell("x")).await;
        }

        assert_eq!(hub.stats().await.active_connections, 0);
        assert_eq!(hub.stats().await.active_datasets, 0);
    }

    #[tokio::test]
    async fn pruning_last_connection_drops_the_set() {
        let hub = Hub::new();
        let (_id, rx) = hub.subscribe(1).await;
        drop(rx);

        hub.broadcast(1, cell("x")).await;
        assert_eq!(hub.stats().await.active_datasets, 0);
    }
}
