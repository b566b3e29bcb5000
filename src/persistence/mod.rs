//! Durable, capacity-bounded log storage keyed by group.
//!
//! Persistence owns every log between enqueue and acknowledgement. The
//! channel claims batches with [`Persistence::get_logs`], then either deletes
//! them after a successful send or releases them so they can be batched
//! again.
//!
//! Two implementations are provided:
//!
//! - [`FilePersistence`]: one MessagePack file per log, survives restarts.
//! - [`MemoryPersistence`]: volatile, for tests and hosts without storage.
//!
//! Claim state is volatile in both. Call
//! [`Persistence::clear_pending_log_state`] when dispatch restarts so logs
//! claimed by a batch that never completed become eligible again.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::log_record::{Log, LogId, PersistedLog};

mod file;
mod index;
mod memory;

#[cfg(test)]
mod tests;

pub use file::FilePersistence;
pub use memory::MemoryPersistence;

/// Default number of logs retained per group.
pub const DEFAULT_CAPACITY: usize = 300;

/// Identifies one claimed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchToken(Uuid);

impl BatchToken {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Storage contract used by the channel.
///
/// All calls happen on the dispatcher thread, so implementations take
/// `&mut self` and need no internal locking.
pub trait Persistence: Send {
    /// Append a log to `group`, evicting the oldest logs past capacity.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] when the log cannot be stored; the log is
    /// dropped.
    fn put_log(&mut self, group: &str, log: Log) -> Result<LogId, PersistenceError>;

    /// Claim up to `limit` unclaimed logs in insertion order.
    ///
    /// Appends the claimed logs to `out` and returns the claim's token, or
    /// `None` if nothing was available.
    fn get_logs(
        &mut self,
        group: &str,
        limit: usize,
        out: &mut Vec<PersistedLog>,
    ) -> Option<BatchToken>;

    /// Permanently remove the logs claimed under `token`.
    fn delete_batch(&mut self, group: &str, token: &BatchToken);

    /// Remove every log of `group`, claimed or not.
    fn delete_logs(&mut self, group: &str);

    /// Release one claim without deleting its logs.
    fn release_logs(&mut self, group: &str, token: &BatchToken);

    /// Release every claim without deleting data.
    fn clear_pending_log_state(&mut self);

    /// Number of logs stored for `group`, claimed and unclaimed.
    fn count_logs(&self, group: &str) -> usize;

    /// Number of logs of `group` not held by any claim.
    fn count_pending_logs(&self, group: &str) -> usize;

    /// Release underlying resources. Later writes fail with
    /// [`PersistenceError::Closed`].
    fn close(&mut self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Reject group names that cannot be used as a directory name.
pub(crate) fn validate_group_name(group: &str) -> Result<(), PersistenceError> {
    let invalid = group.is_empty()
        || group.starts_with('.')
        || group
            .chars()
            .any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if invalid {
        return Err(PersistenceError::InvalidGroup(group.to_owned()));
    }
    Ok(())
}
