//! Pipeline lifecycle: two-phase start, global enablement, shutdown.
//!
//! A [`Pipeline`] is the single context object tying the components
//! together. It starts inert; [`Pipeline::on_starting`] registers the
//! dispatcher and [`Pipeline::on_started`] installs the channel state and
//! opens the producer gate. Until then every [`Channel`] call is rejected.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::channel::core::CoreScheduler;
use crate::channel::{Channel, ChannelCore, GroupConfig, GroupListener};
use crate::config::PipelineConfig;
use crate::dispatch::{Dispatcher, DispatcherConfig};
use crate::error::LifecycleError;
use crate::ingestion::{HttpIngestion, Ingestion, RetryingIngestion};
use crate::network::NetworkStateMonitor;
use crate::persistence::{FilePersistence, MemoryPersistence, Persistence};

/// Identity and credentials sent with every batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    pub install_id: Uuid,
    /// Application secret sent as the `App-Secret` header.
    pub credentials: String,
}

impl TransportConfig {
    /// Credentials with a freshly generated install id.
    pub fn new(credentials: impl Into<String>) -> Self {
        Self {
            install_id: Uuid::new_v4(),
            credentials: credentials.into(),
        }
    }
}

/// Collaborators installed into the channel at start.
pub struct PipelineComponents {
    pub persistence: Box<dyn Persistence>,
    pub ingestion: Arc<dyn Ingestion>,
    pub network: Arc<NetworkStateMonitor>,
}

impl PipelineComponents {
    /// Production components: file or memory storage per `storage_path`
    /// and HTTP ingestion wrapped in the retry policy.
    pub fn from_config(
        config: &PipelineConfig,
        network: Arc<NetworkStateMonitor>,
    ) -> Result<Self, LifecycleError> {
        let persistence: Box<dyn Persistence> = match &config.storage_path {
            Some(path) => Box::new(FilePersistence::with_capacity(
                path,
                config.persistence_capacity,
            )?),
            None => Box::new(MemoryPersistence::new(config.persistence_capacity)),
        };
        let http = HttpIngestion::new(config.ingestion.clone())?;
        Ok(Self {
            persistence,
            ingestion: Arc::new(RetryingIngestion::new(http, config.retry.clone())),
            network,
        })
    }
}

/// A group registered when the pipeline starts.
pub struct GroupSpec {
    pub name: String,
    pub config: GroupConfig,
    pub listener: Option<Arc<dyn GroupListener>>,
}

impl GroupSpec {
    pub fn new(name: impl Into<String>, config: GroupConfig) -> Self {
        Self {
            name: name.into(),
            config,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn GroupListener>) -> Self {
        self.listener = Some(listener);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Created,
    Starting,
    Started,
    Stopped,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Explicit pipeline context replacing process-wide singletons.
pub struct Pipeline {
    config: PipelineConfig,
    channel: Channel,
    dispatcher: OnceCell<Dispatcher<ChannelCore>>,
    ingestion: Mutex<Option<Arc<dyn Ingestion>>>,
    phase: Mutex<Phase>,
    enabled: AtomicBool,
}

impl Pipeline {
    /// Create an inert pipeline.
    pub fn new(config: PipelineConfig) -> Self {
        let channel = Channel::new(config.max_log_size, config.warn_interval);
        Self {
            config,
            channel,
            dispatcher: OnceCell::new(),
            ingestion: Mutex::new(None),
            phase: Mutex::new(Phase::Created),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Producer handle; usable at any time, effective once started.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Spawn a dispatcher sized by the configuration.
    pub fn spawn_dispatcher(&self) -> io::Result<Dispatcher<ChannelCore>> {
        Dispatcher::spawn(DispatcherConfig {
            capacity: self.config.queue_capacity,
            ..DispatcherConfig::default()
        })
    }

    /// First phase: register the serialized execution context.
    pub fn on_starting(&self, dispatcher: Dispatcher<ChannelCore>) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock();
        if *phase != Phase::Created {
            return Err(LifecycleError::AlreadyInState(phase.name()));
        }
        let handle = dispatcher.handle();
        if self.dispatcher.set(dispatcher).is_err() {
            return Err(LifecycleError::AlreadyInState(Phase::Starting.name()));
        }
        self.channel.attach(handle);
        *phase = Phase::Starting;
        Ok(())
    }

    /// Second phase: install the channel state, recover claims left by a
    /// previous run, register `groups`, and open the producer gate.
    pub fn on_started(
        &self,
        transport: TransportConfig,
        components: PipelineComponents,
        groups: Vec<GroupSpec>,
    ) -> Result<(), LifecycleError> {
        let mut phase = self.phase.lock();
        match *phase {
            Phase::Starting => {}
            Phase::Created => return Err(LifecycleError::NotStarting),
            other => return Err(LifecycleError::AlreadyInState(other.name())),
        }
        for group in &groups {
            group.config.validate()?;
        }
        let dispatcher = self.dispatcher.get().ok_or(LifecycleError::NotStarting)?;
        let handle = dispatcher.handle();

        let PipelineComponents {
            persistence,
            ingestion,
            network,
        } = components;
        let core = ChannelCore::new(
            persistence,
            Arc::clone(&ingestion),
            network,
            transport,
            handle.clone(),
        );
        handle
            .install(core)
            .map_err(|_| LifecycleError::DispatcherClosed)?;

        let enabled = self.enabled.load(Ordering::Acquire);
        handle
            .post(move |core: &mut ChannelCore, sched: &mut CoreScheduler| {
                core.start();
                core.set_enabled(enabled, sched);
                for group in groups {
                    core.add_group(&group.name, group.config, group.listener, sched);
                }
            })
            .map_err(|_| LifecycleError::DispatcherClosed)?;

        *self.ingestion.lock() = Some(ingestion);
        self.channel.set_started(true);
        *phase = Phase::Started;
        info!("Pipeline: started");
        Ok(())
    }

    /// Run both phases with a dispatcher and the groups from the config.
    pub fn start(
        &self,
        transport: TransportConfig,
        components: PipelineComponents,
    ) -> Result<(), LifecycleError> {
        let dispatcher = self.spawn_dispatcher().map_err(crate::error::ConfigError::from)?;
        self.on_starting(dispatcher)?;
        let groups = self
            .config
            .groups
            .iter()
            .map(|group| GroupSpec::new(group.name.clone(), group.config.clone()))
            .collect();
        self.on_started(transport, components, groups)
    }

    pub fn is_started(&self) -> bool {
        *self.phase.lock() == Phase::Started
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Global switch; before start the value is applied when starting.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        if self.is_started() {
            self.channel.set_enabled(enabled);
        }
    }

    /// Close the gate, stop the channel, join the dispatcher, and close the
    /// transport. Returns `false` if the dispatcher did not stop in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let mut phase = self.phase.lock();
        if *phase == Phase::Stopped {
            return true;
        }
        self.channel.set_started(false);
        let Some(dispatcher) = self.dispatcher.get() else {
            *phase = Phase::Stopped;
            return true;
        };
        if *phase == Phase::Started {
            let stopped = dispatcher
                .handle()
                .post(|core: &mut ChannelCore, _: &mut CoreScheduler| core.stop());
            if let Err(err) = stopped {
                warn!("Pipeline: could not stop channel: {err}");
            }
        }
        let joined = dispatcher.shutdown(timeout);
        if let Some(ingestion) = self.ingestion.lock().take() {
            ingestion.close();
        }
        *phase = Phase::Stopped;
        info!("Pipeline: stopped");
        joined
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}
