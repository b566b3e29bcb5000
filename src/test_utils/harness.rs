//! A started pipeline over in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::{Channel, GroupConfig};
use crate::config::PipelineConfig;
use crate::lifecycle::{GroupSpec, Pipeline, PipelineComponents, TransportConfig};
use crate::network::NetworkStateMonitor;
use crate::persistence::{MemoryPersistence, Persistence};

use super::{MockIngestion, RecordingListener};

pub const GROUP: &str = "group_test";
pub const TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub channel: Channel,
    pub ingestion: Arc<MockIngestion>,
    pub network: Arc<NetworkStateMonitor>,
    pub listener: RecordingListener,
}

impl TestPipeline {
    /// Start with one group named [`GROUP`], connected, memory storage.
    pub fn start(config: GroupConfig, ingestion: MockIngestion) -> Self {
        Self::start_with(
            config,
            ingestion,
            NetworkStateMonitor::connected(),
            Box::new(MemoryPersistence::default()),
        )
    }

    pub fn start_with(
        config: GroupConfig,
        ingestion: MockIngestion,
        network: NetworkStateMonitor,
        persistence: Box<dyn Persistence>,
    ) -> Self {
        let pipeline = Pipeline::new(PipelineConfig::default());
        let ingestion = Arc::new(ingestion);
        let network = Arc::new(network);
        let listener = RecordingListener::new();
        let dispatcher = pipeline.spawn_dispatcher().expect("spawn dispatcher");
        pipeline.on_starting(dispatcher).expect("on_starting");
        pipeline
            .on_started(
                TransportConfig::new("app-secret"),
                PipelineComponents {
                    persistence,
                    ingestion: ingestion.clone(),
                    network: Arc::clone(&network),
                },
                vec![GroupSpec::new(GROUP, config).with_listener(listener.as_listener())],
            )
            .expect("on_started");
        let channel = pipeline.channel();
        Self {
            pipeline,
            channel,
            ingestion,
            network,
            listener,
        }
    }

    /// Wait for queued channel work to run.
    pub fn settle(&self) {
        assert!(self.channel.flush_queue(TIMEOUT), "dispatcher did not settle");
    }

    pub fn count_logs(&self) -> usize {
        self.channel
            .count_logs(GROUP, TIMEOUT)
            .expect("count_logs answered")
    }
}
