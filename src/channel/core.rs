//! Channel state owned by the dispatcher thread.
//!
//! Every method here runs on the dispatcher, so group state, triggers, and
//! persistence calls are serialized without locks. Network completions are
//! re-posted onto the dispatcher and checked against the group generation
//! captured when the batch was sent; stale completions are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use super::group::{ChannelListener, GroupConfig, GroupEvent, GroupListener, GroupState, InFlight};
use crate::dispatch::{DispatcherHandle, Scheduler};
use crate::error::{CancellationError, DeliveryError};
use crate::ingestion::{Ingestion, IngestionRequest, IngestionResult};
use crate::lifecycle::TransportConfig;
use crate::log_record::{Flags, Log, PersistedLog};
use crate::network::{ListenerId, NetworkStateMonitor};
use crate::persistence::{BatchToken, Persistence};

pub(crate) type CoreScheduler = Scheduler<ChannelCore>;

/// How a trigger decides how many batches to claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Trigger {
    /// Claim only full batches.
    Threshold,
    /// Claim whatever is pending, up to the parallel limit.
    Force,
}

/// Serialized channel state: groups, persistence, and transport.
pub struct ChannelCore {
    persistence: Box<dyn Persistence>,
    ingestion: Arc<dyn Ingestion>,
    network: Arc<NetworkStateMonitor>,
    network_listener: Option<ListenerId>,
    transport: TransportConfig,
    dispatcher: DispatcherHandle<ChannelCore>,
    enabled: bool,
    groups: HashMap<String, GroupState>,
    listeners: Vec<Arc<dyn ChannelListener>>,
}

impl ChannelCore {
    pub(crate) fn new(
        persistence: Box<dyn Persistence>,
        ingestion: Arc<dyn Ingestion>,
        network: Arc<NetworkStateMonitor>,
        transport: TransportConfig,
        dispatcher: DispatcherHandle<ChannelCore>,
    ) -> Self {
        Self {
            persistence,
            ingestion,
            network,
            network_listener: None,
            transport,
            dispatcher,
            enabled: true,
            groups: HashMap::new(),
            listeners: Vec::new(),
        }
    }

    /// Recover claims left by a previous run and follow connectivity.
    pub(crate) fn start(&mut self) {
        self.persistence.clear_pending_log_state();
        let handle = self.dispatcher.clone();
        let id = self.network.add_listener(Arc::new(move |connected: bool| {
            let posted = handle.post(move |core: &mut ChannelCore, sched: &mut CoreScheduler| {
                core.on_network_state(connected, sched)
            });
            if let Err(err) = posted {
                debug!("Channel: network update not delivered: {err}");
            }
        }));
        self.network_listener = Some(id);
    }

    /// Detach from the network, abandon in-flight work, and close storage.
    pub(crate) fn stop(&mut self) {
        if let Some(id) = self.network_listener.take() {
            self.network.remove_listener(id);
        }
        for state in self.groups.values_mut() {
            state.invalidate();
        }
        self.groups.clear();
        if let Err(err) = self.persistence.close() {
            warn!("Channel: failed to close persistence: {err}");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Effective enablement of a group; `None` if unknown.
    pub fn is_group_enabled(&self, name: &str) -> Option<bool> {
        self.groups.get(name).map(|state| self.enabled && state.enabled)
    }

    /// Persisted logs of a group, claimed or not.
    pub fn count_logs(&self, name: &str) -> usize {
        self.persistence.count_logs(name)
    }

    /// Batches of a group currently in flight.
    pub fn in_flight(&self, name: &str) -> usize {
        self.groups.get(name).map_or(0, |state| state.in_flight.len())
    }

    pub(crate) fn add_listener(&mut self, listener: Arc<dyn ChannelListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn remove_listener(&mut self, listener: &Arc<dyn ChannelListener>) {
        self.listeners.retain(|known| !Arc::ptr_eq(known, listener));
    }

    pub(crate) fn add_group(
        &mut self,
        name: &str,
        config: GroupConfig,
        listener: Option<Arc<dyn GroupListener>>,
        sched: &mut CoreScheduler,
    ) {
        if self.groups.contains_key(name) {
            debug!("Channel: group '{name}' already added");
            return;
        }
        debug!("Channel: adding group '{name}' {config:?}");
        for hook in &self.listeners {
            hook.on_group_added(name, &config);
        }
        self.groups
            .insert(name.to_owned(), GroupState::new(config, listener));
        self.check_pending_logs(name, sched);
    }

    /// Forget a group; its persisted logs stay for a later `add_group`.
    pub(crate) fn remove_group(&mut self, name: &str) {
        let Some(mut state) = self.groups.remove(name) else {
            return;
        };
        for token in state.invalidate() {
            self.persistence.release_logs(name, &token);
        }
        for hook in &self.listeners {
            hook.on_group_removed(name);
        }
        debug!("Channel: removed group '{name}'");
    }

    pub(crate) fn pause_group(&mut self, name: &str) {
        if let Some(state) = self.groups.get_mut(name)
            && !state.paused
        {
            state.paused = true;
            state.cancel_timer();
            debug!("Channel: paused group '{name}'");
        }
    }

    pub(crate) fn resume_group(&mut self, name: &str, sched: &mut CoreScheduler) {
        if let Some(state) = self.groups.get_mut(name)
            && state.paused
        {
            state.paused = false;
            debug!("Channel: resumed group '{name}'");
            self.check_pending_logs(name, sched);
        }
    }

    /// Delete the persisted logs of a group, abandoning in-flight batches.
    pub(crate) fn clear(&mut self, name: &str) {
        if let Some(state) = self.groups.get_mut(name) {
            state.invalidate();
        }
        self.persistence.delete_logs(name);
    }

    pub(crate) fn set_group_enabled(
        &mut self,
        name: &str,
        enabled: bool,
        sched: &mut CoreScheduler,
    ) {
        let Some(state) = self.groups.get_mut(name) else {
            warn!("Channel: cannot change enablement of unknown group '{name}'");
            return;
        };
        if state.enabled == enabled {
            return;
        }
        state.enabled = enabled;
        if enabled {
            info!("Channel: group '{name}' enabled");
            self.check_pending_logs(name, sched);
        } else {
            info!("Channel: group '{name}' disabled");
            self.clear(name);
        }
    }

    pub(crate) fn set_enabled(&mut self, enabled: bool, sched: &mut CoreScheduler) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        info!(
            "Channel: pipeline {}",
            if enabled { "enabled" } else { "disabled" }
        );
        let names = self.group_names();
        for name in &names {
            let group_enabled = self.groups.get(name).is_some_and(|state| state.enabled);
            if !group_enabled {
                continue;
            }
            if enabled {
                self.check_pending_logs(name, sched);
            } else {
                self.clear(name);
            }
        }
    }

    /// Send pending logs of a group now, ignoring the count threshold.
    pub(crate) fn flush(&mut self, name: &str, sched: &mut CoreScheduler) {
        if !self.can_send(name) {
            return;
        }
        if !self.network.is_connected() {
            if let Some(state) = self.groups.get_mut(name) {
                state.deferred = true;
            }
            return;
        }
        self.trigger(name, Trigger::Force, sched);
    }

    pub(crate) fn enqueue(
        &mut self,
        mut log: Log,
        name: &str,
        flags: Flags,
        sched: &mut CoreScheduler,
    ) {
        let Some(state) = self.groups.get(name) else {
            warn!("Channel: unknown group '{name}', dropping log");
            return;
        };
        if !(self.enabled && state.enabled) {
            debug!("Channel: group '{name}' is disabled, dropping log");
            return;
        }
        for hook in &self.listeners {
            hook.on_enqueuing_log(&mut log, name);
        }
        if self.listeners.iter().any(|hook| hook.should_filter(&log, name)) {
            debug!("Channel: log of kind '{}' filtered from '{name}'", log.kind);
            return;
        }
        match self.persistence.put_log(name, log) {
            Ok(id) => debug!("Channel: persisted log {id} in '{name}'"),
            Err(err) => {
                warn!("Channel: failed to persist log for '{name}': {err}");
                return;
            }
        }
        match flags {
            Flags::Critical => self.flush(name, sched),
            Flags::Normal => self.check_pending_logs(name, sched),
        }
    }

    /// Logs of the group not claimed by an in-flight batch.
    fn pending(&self, name: &str) -> usize {
        self.persistence.count_pending_logs(name)
    }

    fn can_send(&self, name: &str) -> bool {
        self.groups
            .get(name)
            .is_some_and(|state| self.enabled && state.enabled && !state.paused)
    }

    fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Evaluate the count trigger and arm the interval timer.
    fn check_pending_logs(&mut self, name: &str, sched: &mut CoreScheduler) {
        if !self.can_send(name) {
            return;
        }
        let pending = self.pending(name);
        let connected = self.network.is_connected();
        let Some(state) = self.groups.get_mut(name) else {
            return;
        };
        if pending == 0 {
            state.cancel_timer();
            return;
        }
        if connected && !state.backing_off && pending >= state.config.batch_count_threshold {
            self.trigger(name, Trigger::Threshold, sched);
        } else if state.timer.is_none() {
            self.arm_timer(name, sched);
        }
    }

    fn arm_timer(&mut self, name: &str, sched: &mut CoreScheduler) {
        let Some(state) = self.groups.get_mut(name) else {
            return;
        };
        let generation = state.generation;
        let group = name.to_owned();
        let timer = sched.schedule(state.config.batch_interval, move |core, sched| {
            core.on_timer(&group, generation, sched)
        });
        state.timer = Some(timer);
    }

    fn on_timer(&mut self, name: &str, generation: u64, sched: &mut CoreScheduler) {
        let connected = self.network.is_connected();
        let Some(state) = self.groups.get_mut(name) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        state.timer = None;
        state.backing_off = false;
        if state.paused || !state.enabled || !self.enabled {
            return;
        }
        if !connected {
            debug!("Channel: offline, deferring batch for '{name}'");
            state.deferred = true;
            return;
        }
        self.trigger(name, Trigger::Force, sched);
    }

    fn on_network_state(&mut self, connected: bool, sched: &mut CoreScheduler) {
        if !connected {
            debug!("Channel: network lost, holding new batches");
            return;
        }
        debug!("Channel: network available, re-evaluating groups");
        for name in self.group_names() {
            let deferred = self
                .groups
                .get_mut(&name)
                .is_some_and(|state| std::mem::take(&mut state.deferred));
            if deferred && self.can_send(&name) {
                self.trigger(&name, Trigger::Force, sched);
            } else {
                self.check_pending_logs(&name, sched);
            }
        }
    }

    /// Claim and send batches while the parallel limit allows.
    fn trigger(&mut self, name: &str, mode: Trigger, sched: &mut CoreScheduler) {
        loop {
            let pending = self.pending(name);
            let Some(state) = self.groups.get_mut(name) else {
                return;
            };
            let config = &state.config;
            if state.in_flight.len() >= config.max_parallel_batches || pending == 0 {
                break;
            }
            if mode == Trigger::Threshold && pending < config.batch_count_threshold {
                break;
            }
            let limit = config.batch_count_threshold;
            state.cancel_timer();
            state.deferred = false;
            let mut logs = Vec::with_capacity(limit);
            let Some(token) = self.persistence.get_logs(name, limit, &mut logs) else {
                break;
            };
            self.send_batch(name, token, logs);
        }
        let has_timer = self.groups.get(name).is_some_and(|state| state.timer.is_some());
        if !has_timer && self.pending(name) > 0 {
            self.arm_timer(name, sched);
        }
    }

    fn send_batch(&mut self, name: &str, token: BatchToken, logs: Vec<PersistedLog>) {
        let Some(state) = self.groups.get_mut(name) else {
            self.persistence.release_logs(name, &token);
            return;
        };
        for log in &logs {
            state.notify(GroupEvent::BeforeSending(log.clone()));
        }
        debug!(
            "Channel: sending batch {token} of {} logs for '{name}'",
            logs.len()
        );
        let request = Arc::new(IngestionRequest {
            install_id: self.transport.install_id,
            credentials: self.transport.credentials.clone(),
            logs: logs.iter().map(|persisted| persisted.log.clone()).collect(),
        });
        let generation = state.generation;
        let handle = self.dispatcher.clone();
        let group = name.to_owned();
        let call = self.ingestion.send_async(
            request,
            Box::new(move |result: IngestionResult| {
                let target = group.clone();
                let posted = handle.post(move |core: &mut ChannelCore, sched: &mut CoreScheduler| {
                    core.handle_send_result(&target, generation, token, result, sched)
                });
                if let Err(err) = posted {
                    warn!("Channel: completion for batch {token} in '{group}' lost: {err}");
                }
            }),
        );
        state.in_flight.insert(token, InFlight { logs, call });
    }

    fn handle_send_result(
        &mut self,
        name: &str,
        generation: u64,
        token: BatchToken,
        result: IngestionResult,
        sched: &mut CoreScheduler,
    ) {
        let Some(state) = self.groups.get_mut(name) else {
            debug!("Channel: completion for removed group '{name}' ignored");
            return;
        };
        if state.generation != generation {
            let stale = CancellationError {
                stale: generation,
                current: state.generation,
            };
            debug!("Channel: batch {token} in '{name}': {stale}");
            return;
        }
        let Some(batch) = state.in_flight.remove(&token) else {
            debug!("Channel: unknown batch {token} in '{name}'");
            return;
        };
        match result {
            Ok(_) => {
                self.persistence.delete_batch(name, &token);
                state.backing_off = false;
                debug!("Channel: batch {token} of '{name}' delivered");
                for log in batch.logs {
                    state.notify(GroupEvent::Sent(log));
                }
                self.check_pending_logs(name, sched);
            }
            Err(err) => {
                let error = DeliveryError::from(err);
                warn!(
                    "Channel: batch of {} logs for '{name}' failed: {error}",
                    batch.logs.len()
                );
                if !error.is_fatal() {
                    self.persistence.release_logs(name, &token);
                    state.backing_off = true;
                }
                for log in batch.logs {
                    state.notify(GroupEvent::Failed(log, error.clone()));
                }
                if error.is_fatal() {
                    self.set_group_enabled(name, false, sched);
                } else if state.timer.is_none() {
                    self.arm_timer(name, sched);
                }
            }
        }
    }
}
