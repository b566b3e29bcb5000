//! Producer-facing channel.
//!
//! [`Channel`] is a cheap, cloneable handle. Every call validates what it
//! can on the calling thread and then posts the work onto the dispatcher,
//! where [`ChannelCore`] owns group state. No call returns an error or waits
//! for persistence or network I/O; failures are logged.
//!
//! Calls made before the pipeline has started are rejected immediately.

pub mod core;
pub mod group;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::bounded;
use log::warn;
use once_cell::sync::OnceCell;

use crate::dispatch::DispatcherHandle;
use crate::error::{DispatchError, ValidationError};
use crate::log_record::{Flags, Log};
use crate::rate_limited_warner::RateLimitedWarner;

pub use self::core::ChannelCore;
pub use self::group::{ChannelListener, GroupConfig, GroupEvent, GroupListener};
use self::core::CoreScheduler;

struct Shared {
    dispatcher: OnceCell<DispatcherHandle<ChannelCore>>,
    started: AtomicBool,
    max_log_size: usize,
    not_started: RateLimitedWarner,
    queue_full: RateLimitedWarner,
}

/// Handle used by producers and the host to drive the pipeline.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(max_log_size: usize, warn_interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher: OnceCell::new(),
                started: AtomicBool::new(false),
                max_log_size,
                not_started: RateLimitedWarner::new(warn_interval),
                queue_full: RateLimitedWarner::new(warn_interval),
            }),
        }
    }

    /// Bind the dispatcher; returns `false` if one was already bound.
    pub(crate) fn attach(&self, handle: DispatcherHandle<ChannelCore>) -> bool {
        self.shared.dispatcher.set(handle).is_ok()
    }

    pub(crate) fn set_started(&self, started: bool) {
        self.shared.started.store(started, Ordering::Release);
    }

    /// Whether producer calls are currently accepted.
    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
    }

    fn handle(&self) -> Option<&DispatcherHandle<ChannelCore>> {
        if !self.is_started() {
            return None;
        }
        self.shared.dispatcher.get()
    }

    /// Persist `log` in `group` and schedule its delivery.
    ///
    /// Fire and forget: invalid logs, unknown groups, a full queue, or a
    /// pipeline that has not started are logged and the log is dropped.
    pub fn enqueue(&self, log: Log, group: &str, flags: Flags) {
        let Some(handle) = self.handle() else {
            let warner = &self.shared.not_started;
            warner.record_drop();
            warner.warn_if_due(|count| {
                warn!("Channel: pipeline not started, dropped {count} logs");
            });
            return;
        };
        if group.is_empty() {
            warn!("Channel: rejected log: {}", ValidationError::EmptyGroup);
            return;
        }
        if let Err(err) = log.validate(self.shared.max_log_size) {
            warn!("Channel: rejected log for '{group}': {err}");
            return;
        }
        let name = group.to_owned();
        let posted = handle.try_post(move |core: &mut ChannelCore, sched: &mut CoreScheduler| {
            core.enqueue(log, &name, flags, sched)
        });
        match posted {
            Ok(()) => {}
            Err(DispatchError::QueueFull) => {
                let warner = &self.shared.queue_full;
                warner.record_drop();
                warner.warn_if_due(|count| {
                    warn!("Channel: dispatch queue full, dropped {count} logs");
                });
            }
            Err(DispatchError::Closed) => {
                warn!("Channel: dispatcher closed, dropping log for '{group}'");
            }
        }
    }

    /// Register a group; ignored if the name is taken or the config invalid.
    pub fn add_group(
        &self,
        name: &str,
        config: GroupConfig,
        listener: Option<Arc<dyn GroupListener>>,
    ) {
        if let Err(err) = config.validate() {
            warn!("Channel: not adding group '{name}': {err}");
            return;
        }
        let name = name.to_owned();
        self.control("add_group", move |core, sched| {
            core.add_group(&name, config, listener, sched)
        });
    }

    /// Forget a group, keeping its persisted logs.
    pub fn remove_group(&self, name: &str) {
        let name = name.to_owned();
        self.control("remove_group", move |core, _| core.remove_group(&name));
    }

    /// Stop sending for a group; logs keep accumulating.
    pub fn pause_group(&self, name: &str) {
        let name = name.to_owned();
        self.control("pause_group", move |core, _| core.pause_group(&name));
    }

    pub fn resume_group(&self, name: &str) {
        let name = name.to_owned();
        self.control("resume_group", move |core, sched| {
            core.resume_group(&name, sched)
        });
    }

    /// Delete every persisted log of a group.
    pub fn clear(&self, name: &str) {
        let name = name.to_owned();
        self.control("clear", move |core, _| core.clear(&name));
    }

    /// Enable or disable one group. Disabling drops its logs and turns any
    /// outstanding completion into a no-op.
    pub fn set_group_enabled(&self, name: &str, enabled: bool) {
        let name = name.to_owned();
        self.control("set_group_enabled", move |core, sched| {
            core.set_group_enabled(&name, enabled, sched)
        });
    }

    /// Enable or disable every group at once.
    pub fn set_enabled(&self, enabled: bool) {
        self.control("set_enabled", move |core, sched| {
            core.set_enabled(enabled, sched)
        });
    }

    /// Send a group's pending logs now, ignoring the count threshold.
    pub fn flush(&self, name: &str) {
        let name = name.to_owned();
        self.control("flush", move |core, sched| core.flush(&name, sched));
    }

    pub fn add_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.control("add_listener", move |core, _| core.add_listener(listener));
    }

    pub fn remove_listener(&self, listener: Arc<dyn ChannelListener>) {
        self.control("remove_listener", move |core, _| {
            core.remove_listener(&listener)
        });
    }

    /// Wait until every call made before this one has been processed.
    pub fn flush_queue(&self, timeout: Duration) -> bool {
        self.handle().is_some_and(|handle| handle.flush(timeout))
    }

    /// Persisted log count of a group, read on the dispatcher.
    pub fn count_logs(&self, name: &str, timeout: Duration) -> Option<usize> {
        let name = name.to_owned();
        self.query(timeout, move |core| core.count_logs(&name))
    }

    /// Effective enablement of a group; `None` if unknown or unreachable.
    pub fn is_group_enabled(&self, name: &str, timeout: Duration) -> Option<bool> {
        let name = name.to_owned();
        self.query(timeout, move |core| core.is_group_enabled(&name))
            .flatten()
    }

    fn control(
        &self,
        op: &'static str,
        task: impl FnOnce(&mut ChannelCore, &mut CoreScheduler) + Send + 'static,
    ) {
        let Some(handle) = self.handle() else {
            warn!("Channel: {op} ignored, pipeline not started");
            return;
        };
        if let Err(err) = handle.post(task) {
            warn!("Channel: {op} dropped: {err}");
        }
    }

    fn query<R: Send + 'static>(
        &self,
        timeout: Duration,
        read: impl FnOnce(&ChannelCore) -> R + Send + 'static,
    ) -> Option<R> {
        let handle = self.handle()?;
        if handle.is_worker_thread() {
            warn!("Channel: blocking query from the dispatcher thread refused");
            return None;
        }
        let (tx, rx) = bounded(1);
        handle
            .post(move |core: &mut ChannelCore, _: &mut CoreScheduler| {
                let _ = tx.send(read(core));
            })
            .ok()?;
        rx.recv_timeout(timeout).ok()
    }
}
