//! Connectivity tracking fed by the host environment.
//!
//! The host reports platform connectivity signals as individual networks
//! becoming available or lost. The monitor is connected while at least one
//! network is available and notifies listeners on every transition:
//!
//! - the first available network reports `true`;
//! - losing a network reports `false`, followed by `true` if another network
//!   remains, so listeners can reset connections bound to the lost one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use parking_lot::Mutex;

/// Receives connectivity transitions.
pub trait NetworkStateListener: Send + Sync {
    fn on_network_state_updated(&self, connected: bool);
}

impl<F> NetworkStateListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_network_state_updated(&self, connected: bool) {
        self(connected)
    }
}

/// Handle returned by [`NetworkStateMonitor::add_listener`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct State {
    running: bool,
    networks: HashSet<String>,
    listeners: Vec<(ListenerId, Arc<dyn NetworkStateListener>)>,
}

/// Process-wide connectivity flag plus subscribers.
///
/// Listeners are invoked on the thread that reported the change, outside
/// the internal lock.
pub struct NetworkStateMonitor {
    state: Mutex<State>,
    next_listener: AtomicU64,
}

impl Default for NetworkStateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkStateMonitor {
    /// Create a running monitor with no available network.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                running: true,
                ..State::default()
            }),
            next_listener: AtomicU64::new(1),
        }
    }

    /// Create a running monitor that already reports one available network.
    pub fn connected() -> Self {
        let monitor = Self::new();
        monitor.state.lock().networks.insert(DEFAULT_NETWORK.into());
        monitor
    }

    pub fn is_connected(&self) -> bool {
        !self.state.lock().networks.is_empty()
    }

    pub fn add_listener(&self, listener: Arc<dyn NetworkStateListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.state.lock().listeners.push((id, listener));
        id
    }

    /// Returns `false` if the listener was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(registered, _)| *registered != id);
        state.listeners.len() != before
    }

    /// Resume accepting signals after [`stop`](Self::stop).
    pub fn start(&self) {
        self.state.lock().running = true;
    }

    /// Stop tracking; clears known networks without notifying listeners.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.networks.clear();
    }

    /// The host reports a network becoming available.
    pub fn network_available(&self, network: &str) {
        let notify = {
            let mut state = self.state.lock();
            if !state.running || !state.networks.insert(network.to_owned()) {
                return;
            }
            debug!(
                "NetworkStateMonitor: network {network} available, {} known",
                state.networks.len()
            );
            (state.networks.len() == 1).then(|| Self::snapshot(&state))
        };
        if let Some(listeners) = notify {
            Self::notify(&listeners, &[true]);
        }
    }

    /// The host reports a network being lost.
    pub fn network_lost(&self, network: &str) {
        let (listeners, transitions) = {
            let mut state = self.state.lock();
            if !state.running || !state.networks.remove(network) {
                return;
            }
            debug!(
                "NetworkStateMonitor: network {network} lost, {} remaining",
                state.networks.len()
            );
            let transitions: &[bool] = if state.networks.is_empty() {
                &[false]
            } else {
                &[false, true]
            };
            (Self::snapshot(&state), transitions)
        };
        Self::notify(&listeners, transitions);
    }

    /// Single-network shorthand for hosts that only know on/off.
    pub fn set_connected(&self, connected: bool) {
        if connected {
            self.network_available(DEFAULT_NETWORK);
        } else {
            let networks: Vec<String> = self.state.lock().networks.iter().cloned().collect();
            for network in networks {
                self.network_lost(&network);
            }
        }
    }

    fn snapshot(state: &State) -> Vec<Arc<dyn NetworkStateListener>> {
        state
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn notify(listeners: &[Arc<dyn NetworkStateListener>], transitions: &[bool]) {
        for &connected in transitions {
            for listener in listeners {
                listener.on_network_state_updated(connected);
            }
        }
    }
}

const DEFAULT_NETWORK: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    type Recorded = Arc<Mutex<Vec<bool>>>;

    #[fixture]
    fn monitor() -> (NetworkStateMonitor, Recorded) {
        let monitor = NetworkStateMonitor::new();
        let seen: Recorded = Arc::default();
        let sink = Arc::clone(&seen);
        monitor.add_listener(Arc::new(move |connected: bool| sink.lock().push(connected)));
        (monitor, seen)
    }

    #[rstest]
    fn starts_disconnected(monitor: (NetworkStateMonitor, Recorded)) {
        let (monitor, seen) = monitor;
        assert!(!monitor.is_connected());
        assert!(seen.lock().is_empty());
    }

    #[rstest]
    fn first_network_notifies_once(monitor: (NetworkStateMonitor, Recorded)) {
        let (monitor, seen) = monitor;
        monitor.network_available("wifi");
        monitor.network_available("cell");
        monitor.network_available("wifi");
        assert!(monitor.is_connected());
        assert_eq!(*seen.lock(), vec![true]);
    }

    #[rstest]
    fn losing_one_of_two_networks_reconnects(monitor: (NetworkStateMonitor, Recorded)) {
        let (monitor, seen) = monitor;
        monitor.network_available("wifi");
        monitor.network_available("cell");
        monitor.network_lost("wifi");
        assert!(monitor.is_connected());
        assert_eq!(*seen.lock(), vec![true, false, true]);
    }

    #[rstest]
    fn losing_last_network_disconnects(monitor: (NetworkStateMonitor, Recorded)) {
        let (monitor, seen) = monitor;
        monitor.set_connected(true);
        monitor.set_connected(false);
        monitor.network_lost("unknown");
        assert!(!monitor.is_connected());
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[rstest]
    fn removed_listener_is_not_notified() {
        let monitor = NetworkStateMonitor::new();
        let seen: Recorded = Arc::default();
        let sink = Arc::clone(&seen);
        let id = monitor.add_listener(Arc::new(move |c: bool| sink.lock().push(c)));
        assert!(monitor.remove_listener(id));
        assert!(!monitor.remove_listener(id));
        monitor.set_connected(true);
        assert!(seen.lock().is_empty());
    }

    #[rstest]
    fn stop_clears_state_and_ignores_signals(monitor: (NetworkStateMonitor, Recorded)) {
        let (monitor, seen) = monitor;
        monitor.set_connected(true);
        monitor.stop();
        assert!(!monitor.is_connected());
        monitor.network_available("wifi");
        assert!(!monitor.is_connected());
        monitor.start();
        monitor.network_available("wifi");
        assert!(monitor.is_connected());
        assert_eq!(*seen.lock(), vec![true, true]);
    }
}
