use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

/// Latched broadcast topic.
///
/// Subscribers see every message published after they subscribe; slow ones
/// lag and skip the oldest. The most recent message is also kept, so a late
/// subscriber can start from the current value. Publishing never blocks.
#[derive(Debug, Clone)]
pub struct Topic<T> {
    tx: broadcast::Sender<Arc<T>>,
    latest: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T: Send + Sync + 'static> Topic<T> {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Arc::default(),
        }
    }

    /// Returns how many subscribers the message reached.
    pub fn publish(&self, msg: T) -> usize {
        let msg = Arc::new(msg);
        *self.latest.write() = Some(Arc::clone(&msg));
        self.tx.send(msg).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<T>> {
        self.tx.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<T>> {
        self.latest.read().clone()
    }
}
