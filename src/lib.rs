//! Client-side telemetry delivery pipeline.
//!
//! Producers hand [`Log`] records to a [`Channel`]. The channel persists
//! them per group, batches them under count and time triggers, and sends
//! them to a collector through an [`Ingestion`] with retry and backoff. All
//! channel state lives on one dispatcher thread; producers never block on
//! storage or network I/O.
//!
//! ```no_run
//! use std::sync::Arc;
//! use logship::{
//!     Flags, Log, NetworkStateMonitor, Pipeline, PipelineComponents, PipelineConfig,
//!     TransportConfig,
//! };
//!
//! let config = PipelineConfig::from_ini_str("[group.analytics]\nbatch_count_threshold = 10\n")?;
//! let network = Arc::new(NetworkStateMonitor::connected());
//! let components = PipelineComponents::from_config(&config, network)?;
//! let pipeline = Pipeline::new(config);
//! pipeline.start(TransportConfig::new("app-secret"), components)?;
//!
//! pipeline
//!     .channel()
//!     .enqueue(Log::new("event", serde_json::json!({ "name": "launch" })), "analytics", Flags::Normal);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod channel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ingestion;
pub mod lifecycle;
pub mod log_record;
pub mod network;
pub mod persistence;
pub mod rate_limited_warner;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

pub use channel::{Channel, ChannelListener, GroupConfig, GroupEvent, GroupListener};
pub use config::{GroupDefinition, PipelineConfig, PipelineConfigBuilder};
pub use dispatch::{Dispatcher, DispatcherConfig, DispatcherHandle, TimerHandle};
pub use error::{
    CancellationError, ConfigError, DeliveryError, DispatchError, ErrorClass, IngestionError,
    LifecycleError, PersistenceError, ValidationError,
};
pub use ingestion::{
    HttpIngestion, HttpIngestionConfig, Ingestion, IngestionRequest, Jitter, RetryPolicy,
    RetryingIngestion, ServiceCall,
};
pub use lifecycle::{GroupSpec, Pipeline, PipelineComponents, TransportConfig};
pub use log_record::{Flags, Log, LogId, PersistedLog};
pub use network::{ListenerId, NetworkStateListener, NetworkStateMonitor};
pub use persistence::{BatchToken, FilePersistence, MemoryPersistence, Persistence};
