//! Group listener that keeps every event for later inspection.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::wait_until;
use crate::channel::{GroupEvent, GroupListener};

/// Stores events in arrival order.
#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<GroupEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shareable trait object backed by the same event list.
    pub fn as_listener(&self) -> Arc<dyn GroupListener> {
        Arc::new(self.clone())
    }

    pub fn events(&self) -> Vec<GroupEvent> {
        self.events.lock().clone()
    }

    pub fn sent(&self) -> usize {
        self.count(|event| matches!(event, GroupEvent::Sent(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|event| matches!(event, GroupEvent::Failed(..)))
    }

    pub fn before_sending(&self) -> usize {
        self.count(|event| matches!(event, GroupEvent::BeforeSending(_)))
    }

    pub fn wait_for_sent(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.sent() >= count)
    }

    pub fn wait_for_failed(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.failed() >= count)
    }

    fn count(&self, predicate: impl Fn(&GroupEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }
}

impl GroupListener for RecordingListener {
    fn on_event(&self, event: GroupEvent) {
        self.events.lock().push(event);
    }
}
