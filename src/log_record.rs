//! Log record representation for the delivery pipeline.
//!
//! A [`Log`] is the unit producers hand to the channel. It carries a kind,
//! a UTC timestamp, and an opaque JSON payload. Persistence assigns a
//! [`LogId`] when the log is stored and hands it back wrapped in a
//! [`PersistedLog`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Default upper bound for the serialized size of a single log.
pub const DEFAULT_MAX_LOG_SIZE: usize = 256 * 1024;

/// Identifier assigned to a log when it is persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogId(pub u64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Log {
    /// Kind of the log, for example `"event"` or `"startService"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Time the log was created.
    pub timestamp: DateTime<Utc>,
    /// Opaque record content.
    #[serde(default)]
    pub payload: Value,
}

impl Log {
    /// Construct a log stamped with the current time.
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Construct a log with an explicit timestamp.
    pub fn with_timestamp(kind: &str, timestamp: DateTime<Utc>, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            timestamp,
            payload,
        }
    }

    /// Check the log is well formed before it reaches persistence.
    ///
    /// # Errors
    ///
    /// * [`ValidationError::EmptyKind`] - the kind is blank
    /// * [`ValidationError::TooLarge`] - the serialized log exceeds `max_size`
    /// * [`ValidationError::Unserializable`] - the payload cannot be encoded
    pub fn validate(&self, max_size: usize) -> Result<(), ValidationError> {
        if self.kind.trim().is_empty() {
            return Err(ValidationError::EmptyKind);
        }
        let size = serde_json::to_vec(self)
            .map_err(|err| ValidationError::Unserializable(err.to_string()))?
            .len();
        if size > max_size {
            return Err(ValidationError::TooLarge {
                size,
                limit: max_size,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.kind, self.timestamp.to_rfc3339())
    }
}

/// A log owned by persistence together with its identifier and group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedLog {
    pub id: LogId,
    pub group: String,
    pub log: Log,
}

/// Delivery hints supplied with [`Channel::enqueue`](crate::channel::Channel::enqueue).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flags {
    /// Batch under the group's normal count and interval triggers.
    #[default]
    Normal,
    /// Persist, then request an immediate flush of the group.
    Critical,
}
