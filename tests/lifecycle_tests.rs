//! Two-phase start, the producer gate, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use logship::test_utils::{MockIngestion, RecordingListener};
use logship::{
    Flags, GroupConfig, GroupSpec, LifecycleError, Log, MemoryPersistence, NetworkStateMonitor,
    Pipeline, PipelineComponents, PipelineConfig, TransportConfig,
};
use logtest::Logger;
use rstest::{fixture, rstest};
use serial_test::serial;

const TIMEOUT: Duration = Duration::from_secs(5);

#[fixture]
fn ingestion() -> Arc<MockIngestion> {
    Arc::new(MockIngestion::new())
}

fn components(ingestion: &Arc<MockIngestion>) -> PipelineComponents {
    PipelineComponents {
        persistence: Box::new(MemoryPersistence::default()),
        ingestion: ingestion.clone(),
        network: Arc::new(NetworkStateMonitor::connected()),
    }
}

fn group(threshold: usize) -> GroupConfig {
    GroupConfig::new(threshold, Duration::from_secs(10), 1)
}

fn event() -> Log {
    Log::new("event", serde_json::json!({}))
}

/// `Logger::start` installs a global logger and panics if called twice in one
/// process, so install it once and hand out handles to the shared queue.
fn start_logger() -> Logger {
    static START: std::sync::Once = std::sync::Once::new();
    START.call_once(|| {
        Logger::start();
    });
    Logger
}

fn drain_warnings(logger: &mut Logger) -> Vec<String> {
    let mut found = Vec::new();
    while let Some(record) = logger.pop() {
        if record.level() == log::Level::Warn {
            found.push(record.args().to_owned());
        }
    }
    found
}

#[rstest]
#[serial]
fn enqueue_before_start_is_rejected_with_warning(ingestion: Arc<MockIngestion>) {
    let mut logger = start_logger();
    drain_warnings(&mut logger);

    let pipeline = Pipeline::new(PipelineConfig::default());
    let channel = pipeline.channel();
    channel.enqueue(event(), "g", Flags::Normal);
    assert!(!channel.is_started());
    let warnings = drain_warnings(&mut logger);
    assert!(
        warnings
            .iter()
            .any(|w| w.contains("pipeline not started, dropped 1 logs")),
        "warnings: {warnings:?}"
    );

    // nothing was buffered: starting afterwards sends nothing
    let dispatcher = pipeline.spawn_dispatcher().expect("spawn dispatcher");
    pipeline.on_starting(dispatcher).expect("on_starting");
    channel.enqueue(event(), "g", Flags::Normal);
    pipeline
        .on_started(
            TransportConfig::new("secret"),
            components(&ingestion),
            vec![GroupSpec::new("g", group(1))],
        )
        .expect("on_started");
    assert!(channel.flush_queue(TIMEOUT));
    assert_eq!(channel.count_logs("g", TIMEOUT), Some(0));
    assert_eq!(ingestion.send_count(), 0);
}

#[rstest]
#[serial]
fn control_calls_before_start_are_ignored() {
    let mut logger = start_logger();
    drain_warnings(&mut logger);

    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.channel().pause_group("g");
    let warnings = drain_warnings(&mut logger);
    assert!(warnings.iter().any(|w| w.contains("pause_group ignored")));
}

#[rstest]
fn on_started_requires_on_starting(ingestion: Arc<MockIngestion>) {
    let pipeline = Pipeline::new(PipelineConfig::default());
    let err = pipeline
        .on_started(TransportConfig::new("secret"), components(&ingestion), Vec::new())
        .expect_err("must register dispatcher first");
    assert!(matches!(err, LifecycleError::NotStarting));
}

#[rstest]
fn phases_cannot_repeat(ingestion: Arc<MockIngestion>) {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn"))
        .expect("first on_starting");
    let err = pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn"))
        .expect_err("second on_starting");
    assert!(matches!(err, LifecycleError::AlreadyInState("starting")));

    pipeline
        .on_started(TransportConfig::new("secret"), components(&ingestion), Vec::new())
        .expect("on_started");
    let err = pipeline
        .on_started(TransportConfig::new("secret"), components(&ingestion), Vec::new())
        .expect_err("second on_started");
    assert!(matches!(err, LifecycleError::AlreadyInState("started")));
}

#[rstest]
fn invalid_group_config_fails_start(ingestion: Arc<MockIngestion>) {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn"))
        .expect("on_starting");
    let err = pipeline
        .on_started(
            TransportConfig::new("secret"),
            components(&ingestion),
            vec![GroupSpec::new("g", group(0))],
        )
        .expect_err("zero threshold");
    assert!(matches!(err, LifecycleError::Config(_)));
    assert!(!pipeline.channel().is_started());
}

#[rstest]
fn disabled_before_start_stays_disabled(ingestion: Arc<MockIngestion>) {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline.set_enabled(false);
    pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn"))
        .expect("on_starting");
    pipeline
        .on_started(
            TransportConfig::new("secret"),
            components(&ingestion),
            vec![GroupSpec::new("g", group(1))],
        )
        .expect("on_started");
    let channel = pipeline.channel();
    channel.enqueue(event(), "g", Flags::Normal);
    assert!(channel.flush_queue(TIMEOUT));
    assert_eq!(channel.is_group_enabled("g", TIMEOUT), Some(false));
    assert_eq!(ingestion.send_count(), 0);

    pipeline.set_enabled(true);
    channel.enqueue(event(), "g", Flags::Normal);
    assert!(ingestion.wait_for_sends(1, TIMEOUT));
}

#[rstest]
fn shutdown_closes_the_gate(ingestion: Arc<MockIngestion>) {
    let listener = RecordingListener::new();
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn"))
        .expect("on_starting");
    pipeline
        .on_started(
            TransportConfig::new("secret"),
            components(&ingestion),
            vec![GroupSpec::new("g", group(1)).with_listener(listener.as_listener())],
        )
        .expect("on_started");
    let channel = pipeline.channel();
    channel.enqueue(event(), "g", Flags::Normal);
    assert!(listener.wait_for_sent(1, TIMEOUT));

    assert!(pipeline.shutdown(TIMEOUT));
    assert!(!pipeline.is_started());
    assert!(!channel.is_started());
    channel.enqueue(event(), "g", Flags::Normal);
    assert_eq!(ingestion.send_count(), 1);
    assert!(pipeline.shutdown(TIMEOUT));
}
