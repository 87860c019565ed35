use crate::models::ProgressEvent;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

/// Fan-out of progress events to any number of observers. Each observer gets
/// a bounded buffer; slow observers lose the oldest events instead of
/// back-pressuring the executor.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Never blocks and never fails; an event with no observers is dropped.
    pub fn broadcast(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
