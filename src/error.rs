//! Error taxonomy shared by the pipeline components.
//!
//! Producer-facing calls never return these values; they are logged or
//! delivered to group listeners as [`DeliveryError`].

use std::io;

use thiserror::Error;

/// A log was rejected before reaching persistence.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("log kind must not be empty")]
    EmptyKind,
    #[error("group name must not be empty")]
    EmptyGroup,
    #[error("log is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("log cannot be serialized: {0}")]
    Unserializable(String),
}

/// Storage failure reported by a [`Persistence`](crate::persistence::Persistence).
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("failed to encode log: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode log: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("invalid group name '{0}'")]
    InvalidGroup(String),
    #[error("persistence is closed")]
    Closed,
}

/// Classification used by the retryer to decide whether to try again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, connection failures, 5xx, and 429.
    Retryable,
    /// 4xx other than 429 and requests that can never succeed.
    Fatal,
}

/// Failure of a single ingestion attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestionError {
    #[error("collector returned {status}{}", body_suffix(.body))]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed to serialize batch: {0}")]
    Serialization(String),
    #[error("ingestion is closed")]
    Closed,
}

fn body_suffix(body: &str) -> String {
    if body.is_empty() {
        String::new()
    } else {
        format!(" - {body}")
    }
}

impl IngestionError {
    /// Classify the failure for retry decisions.
    ///
    /// * **429** and **5xx** are retryable
    /// * other HTTP statuses are fatal
    /// * transport errors are retryable
    /// * serialization failures and a closed transport are fatal
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Http { status, .. } => match *status {
                429 | 500..=599 => ErrorClass::Retryable,
                _ => ErrorClass::Fatal,
            },
            Self::Transport(_) => ErrorClass::Retryable,
            Self::Serialization(_) | Self::Closed => ErrorClass::Fatal,
        }
    }
}

/// Terminal outcome reported to a group listener when a batch fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The batch could not be delivered yet; its logs stay persisted.
    #[error("delivery failed, will retry later: {0}")]
    Retryable(IngestionError),
    /// The collector rejected the batch permanently; the group was disabled.
    #[error("delivery rejected: {0}")]
    Fatal(IngestionError),
}

impl From<IngestionError> for DeliveryError {
    fn from(err: IngestionError) -> Self {
        match err.classify() {
            ErrorClass::Retryable => Self::Retryable(err),
            ErrorClass::Fatal => Self::Fatal(err),
        }
    }
}

impl DeliveryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// A completion arrived for a batch whose group generation moved on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("completion for generation {stale} discarded, group is at {current}")]
pub struct CancellationError {
    pub stale: u64,
    pub current: u64,
}

/// A task could not be handed to the dispatcher.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// The bounded queue is at capacity; the task was dropped.
    #[error("dispatch queue is full")]
    QueueFull,
    /// The dispatcher has shut down; the task was dropped.
    #[error("dispatcher is closed")]
    Closed,
}

/// Errors raised while building configuration or starting the pipeline.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid user supplied configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The configuration file could not be read or parsed.
    #[error("failed to load {path}: {reason}")]
    Load { path: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("pipeline is already {0}")]
    AlreadyInState(&'static str),
    #[error("pipeline has no dispatcher; call on_starting first")]
    NotStarting,
    #[error("dispatcher is no longer running")]
    DispatcherClosed,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}
