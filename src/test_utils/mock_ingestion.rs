//! Scriptable in-memory transport.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::wait_until;
use crate::ingestion::{Completion, Ingestion, IngestionRequest, IngestionResult, ServiceCall};

struct HeldCall {
    call: ServiceCall,
    callback: Completion,
}

#[derive(Default)]
struct State {
    hold: bool,
    script: VecDeque<IngestionResult>,
    requests: Vec<Arc<IngestionRequest>>,
    held: VecDeque<HeldCall>,
    calls: Vec<ServiceCall>,
}

/// Transport recording every request.
///
/// In the default mode each send completes on a helper thread with the next
/// scripted outcome, or success once the script is empty. In holding mode
/// sends stay pending until [`complete_next`](Self::complete_next).
#[derive(Default)]
pub struct MockIngestion {
    state: Mutex<State>,
}

impl MockIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep callbacks until the test completes them.
    pub fn holding() -> Self {
        let mock = Self::default();
        mock.state.lock().hold = true;
        mock
    }

    /// Queue outcomes returned in order by later sends.
    pub fn with_script(outcomes: impl IntoIterator<Item = IngestionResult>) -> Self {
        let mock = Self::default();
        mock.state.lock().script.extend(outcomes);
        mock
    }

    pub fn push_outcome(&self, outcome: IngestionResult) {
        self.state.lock().script.push_back(outcome);
    }

    pub fn requests(&self) -> Vec<Arc<IngestionRequest>> {
        self.state.lock().requests.clone()
    }

    pub fn send_count(&self) -> usize {
        self.state.lock().requests.len()
    }

    /// Number of calls the caller cancelled.
    pub fn cancelled_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| call.is_cancelled())
            .count()
    }

    pub fn wait_for_sends(&self, count: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.send_count() >= count)
    }

    /// Complete the oldest held call on the current thread.
    ///
    /// The callback runs even if the call was cancelled, standing in for a
    /// response that was already on its way. Returns `false` if nothing is
    /// held.
    pub fn complete_next(&self, outcome: IngestionResult) -> bool {
        let held = self.state.lock().held.pop_front();
        match held {
            Some(held) => {
                (held.callback)(outcome);
                true
            }
            None => false,
        }
    }

    /// Whether the oldest held call has been cancelled.
    pub fn next_is_cancelled(&self) -> Option<bool> {
        self.state
            .lock()
            .held
            .front()
            .map(|held| held.call.is_cancelled())
    }
}

impl Ingestion for MockIngestion {
    fn send_async(&self, request: Arc<IngestionRequest>, callback: Completion) -> ServiceCall {
        let call = ServiceCall::new();
        let mut state = self.state.lock();
        state.requests.push(request);
        state.calls.push(call.clone());
        if state.hold {
            state.held.push_back(HeldCall {
                call: call.clone(),
                callback,
            });
            return call;
        }
        let outcome = state.script.pop_front().unwrap_or_else(|| Ok(String::new()));
        drop(state);
        let guard = call.clone();
        thread::spawn(move || {
            if !guard.is_cancelled() {
                callback(outcome);
            }
        });
        call
    }
}
