//! Group configuration, listener hooks, and per-group runtime state.

use std::collections::HashMap;
use std::time::Duration;

use crossbeam_channel::{Sender, TrySendError};
use log::debug;

use crate::dispatch::TimerHandle;
use crate::error::{ConfigError, DeliveryError};
use crate::ingestion::ServiceCall;
use crate::log_record::{Log, PersistedLog};
use crate::persistence::BatchToken;

/// Logs that trigger an immediate send once pending.
pub const DEFAULT_BATCH_COUNT_THRESHOLD: usize = 50;
/// Time a pending log waits before a partial batch is sent.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(3);
/// Concurrent batches per group.
pub const DEFAULT_MAX_PARALLEL_BATCHES: usize = 3;

/// Batching parameters of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupConfig {
    pub batch_count_threshold: usize,
    pub batch_interval: Duration,
    pub max_parallel_batches: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            batch_count_threshold: DEFAULT_BATCH_COUNT_THRESHOLD,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_parallel_batches: DEFAULT_MAX_PARALLEL_BATCHES,
        }
    }
}

impl GroupConfig {
    pub fn new(
        batch_count_threshold: usize,
        batch_interval: Duration,
        max_parallel_batches: usize,
    ) -> Self {
        Self {
            batch_count_threshold,
            batch_interval,
            max_parallel_batches,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_count_threshold == 0 {
            return Err(ConfigError::Invalid(
                "batch_count_threshold must be greater than zero".into(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "batch_interval must be greater than zero".into(),
            ));
        }
        if self.max_parallel_batches == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_batches must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Delivery progress reported to a group listener.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupEvent {
    /// The log was claimed into a batch and is about to be sent.
    BeforeSending(PersistedLog),
    /// The collector acknowledged the batch containing the log.
    Sent(PersistedLog),
    /// The batch containing the log failed terminally.
    Failed(PersistedLog, DeliveryError),
}

impl GroupEvent {
    pub fn log(&self) -> &PersistedLog {
        match self {
            Self::BeforeSending(log) | Self::Sent(log) | Self::Failed(log, _) => log,
        }
    }
}

/// Receives delivery events for one group on the dispatcher thread.
///
/// Implementations must not block; hand heavy work to another thread.
pub trait GroupListener: Send + Sync {
    fn on_event(&self, event: GroupEvent);
}

/// Forward events into a channel; a full channel drops the event.
impl GroupListener for Sender<GroupEvent> {
    fn on_event(&self, event: GroupEvent) {
        if let Err(TrySendError::Full(event)) = self.try_send(event) {
            debug!(
                "Channel: listener queue full, dropping event for log {}",
                event.log().id
            );
        }
    }
}

/// Hooks observing every group, run on the dispatcher thread.
pub trait ChannelListener: Send + Sync {
    /// Called before a log is validated against filters and persisted.
    fn on_enqueuing_log(&self, _log: &mut Log, _group: &str) {}

    /// Return `true` to drop the log before it is persisted.
    fn should_filter(&self, _log: &Log, _group: &str) -> bool {
        false
    }

    fn on_group_added(&self, _group: &str, _config: &GroupConfig) {}

    fn on_group_removed(&self, _group: &str) {}
}

pub(crate) struct InFlight {
    pub logs: Vec<PersistedLog>,
    pub call: ServiceCall,
}

/// Mutable state of one group, owned by the channel core.
pub(crate) struct GroupState {
    pub config: GroupConfig,
    pub listener: Option<std::sync::Arc<dyn GroupListener>>,
    pub enabled: bool,
    pub paused: bool,
    /// Bumped on every disable; completions from older generations are stale.
    pub generation: u64,
    pub in_flight: HashMap<BatchToken, InFlight>,
    pub timer: Option<TimerHandle>,
    /// The interval timer fired while offline.
    pub deferred: bool,
    /// A retryable failure happened; wait for the timer before sending again.
    pub backing_off: bool,
}

impl GroupState {
    pub fn new(config: GroupConfig, listener: Option<std::sync::Arc<dyn GroupListener>>) -> Self {
        Self {
            config,
            listener,
            enabled: true,
            paused: false,
            generation: 0,
            in_flight: HashMap::new(),
            timer: None,
            deferred: false,
            backing_off: false,
        }
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }

    /// Invalidate outstanding work and return the tokens that were in flight.
    pub fn invalidate(&mut self) -> Vec<BatchToken> {
        self.generation += 1;
        self.cancel_timer();
        self.deferred = false;
        self.backing_off = false;
        self.in_flight
            .drain()
            .map(|(token, batch)| {
                batch.call.cancel();
                token
            })
            .collect()
    }

    pub fn notify(&self, event: GroupEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(event);
        }
    }
}
