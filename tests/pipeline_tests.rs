//! End-to-end delivery over HTTP and recovery from disk.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use logship::test_utils::{MockIngestion, RecordingListener};
use logship::{
    FilePersistence, Flags, GroupConfig, GroupSpec, HttpIngestion, HttpIngestionConfig, Jitter,
    Log, NetworkStateMonitor, Pipeline, PipelineComponents, PipelineConfig, RetryPolicy,
    RetryingIngestion, TransportConfig,
};
use rstest::{fixture, rstest};
use serde_json::{Value, json};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Captured {
    path: String,
    install_id: Option<String>,
    app_secret: Option<String>,
    body: Value,
}

fn read_request(stream: &mut TcpStream) -> Captured {
    let _ = stream.set_read_timeout(Some(TIMEOUT));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
    let mut request_line = String::new();
    reader.read_line(&mut request_line).expect("request line");
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or_default()
        .to_owned();

    let mut install_id = None;
    let mut app_secret = None;
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).expect("header line");
        if line.trim().is_empty() {
            break;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_owned();
        match key.trim().to_lowercase().as_str() {
            "content-length" => content_length = value.parse().unwrap_or(0),
            "install-id" => install_id = Some(value),
            "app-secret" => app_secret = Some(value),
            _ => {}
        }
    }
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).expect("body");
    Captured {
        path,
        install_id,
        app_secret,
        body: serde_json::from_slice(&body).expect("json body"),
    }
}

/// Answer one request per status in order.
fn collector(statuses: Vec<u16>) -> (SocketAddr, mpsc::Receiver<Captured>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind collector");
    let addr = listener.local_addr().expect("collector address");
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for status in statuses {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let captured = read_request(&mut stream);
            let response =
                format!("HTTP/1.1 {status} X\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok");
            let _ = stream.write_all(response.as_bytes());
            let _ = tx.send(captured);
        }
    });
    (addr, rx)
}

fn quick_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        base: Duration::from_millis(20),
        cap: Duration::from_millis(100),
        max_retries,
        jitter: Jitter::None,
    }
}

#[fixture]
fn storage() -> TempDir {
    TempDir::new().expect("temp dir")
}

fn http_components(
    addr: SocketAddr,
    retry: RetryPolicy,
    storage: &TempDir,
) -> PipelineComponents {
    let http = HttpIngestion::new(HttpIngestionConfig {
        log_url: format!("http://{addr}"),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        workers: 1,
        ..HttpIngestionConfig::default()
    })
    .expect("http ingestion");
    PipelineComponents {
        persistence: Box::new(FilePersistence::open(storage.path()).expect("open storage")),
        ingestion: Arc::new(RetryingIngestion::new(http, retry)),
        network: Arc::new(NetworkStateMonitor::connected()),
    }
}

fn start(
    components: PipelineComponents,
    transport: TransportConfig,
    group: GroupSpec,
) -> Pipeline {
    let pipeline = Pipeline::new(PipelineConfig::default());
    pipeline
        .on_starting(pipeline.spawn_dispatcher().expect("spawn dispatcher"))
        .expect("on_starting");
    pipeline
        .on_started(transport, components, vec![group])
        .expect("on_started");
    pipeline
}

fn event(name: &str) -> Log {
    Log::new("event", json!({ "name": name }))
}

#[rstest]
fn batch_reaches_collector_and_is_deleted(storage: TempDir) {
    let (addr, requests) = collector(vec![200]);
    let listener = RecordingListener::new();
    let transport = TransportConfig::new("0123456789abcdef");
    let install_id = transport.install_id.to_string();
    let pipeline = start(
        http_components(addr, RetryPolicy::no_retry(), &storage),
        transport,
        GroupSpec::new("analytics", GroupConfig::new(2, Duration::from_secs(10), 1))
            .with_listener(listener.as_listener()),
    );
    let channel = pipeline.channel();
    channel.enqueue(event("A"), "analytics", Flags::Normal);
    channel.enqueue(event("B"), "analytics", Flags::Normal);

    let request = requests.recv_timeout(TIMEOUT).expect("collector request");
    assert_eq!(request.path, "/logs?api-version=1.0.0");
    assert_eq!(request.install_id.as_deref(), Some(install_id.as_str()));
    assert_eq!(request.app_secret.as_deref(), Some("0123456789abcdef"));
    let logs = request.body["logs"].as_array().expect("logs array");
    let names: Vec<&str> = logs
        .iter()
        .filter_map(|log| log["payload"]["name"].as_str())
        .collect();
    assert_eq!(names, ["A", "B"]);
    assert_eq!(logs[0]["type"], "event");

    assert!(listener.wait_for_sent(2, TIMEOUT));
    assert_eq!(channel.count_logs("analytics", TIMEOUT), Some(0));
    assert!(pipeline.shutdown(TIMEOUT));
}

#[rstest]
fn transient_errors_are_retried_within_one_send(storage: TempDir) {
    let (addr, requests) = collector(vec![503, 503, 200]);
    let listener = RecordingListener::new();
    let pipeline = start(
        http_components(addr, quick_retry(3), &storage),
        TransportConfig::new("secret"),
        GroupSpec::new("analytics", GroupConfig::new(1, Duration::from_secs(10), 1))
            .with_listener(listener.as_listener()),
    );
    pipeline
        .channel()
        .enqueue(event("A"), "analytics", Flags::Normal);

    assert!(listener.wait_for_sent(1, TIMEOUT));
    let bodies: Vec<Value> = (0..3)
        .map(|_| requests.recv_timeout(TIMEOUT).expect("attempt").body)
        .collect();
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(listener.failed(), 0);
}

#[rstest]
fn unauthorized_response_disables_group(storage: TempDir) {
    let (addr, _requests) = collector(vec![401]);
    let listener = RecordingListener::new();
    let pipeline = start(
        http_components(addr, quick_retry(3), &storage),
        TransportConfig::new("secret"),
        GroupSpec::new("analytics", GroupConfig::new(1, Duration::from_secs(10), 1))
            .with_listener(listener.as_listener()),
    );
    let channel = pipeline.channel();
    channel.enqueue(event("A"), "analytics", Flags::Normal);

    assert!(listener.wait_for_failed(1, TIMEOUT));
    assert!(channel.flush_queue(TIMEOUT));
    assert_eq!(channel.is_group_enabled("analytics", TIMEOUT), Some(false));
    assert_eq!(channel.count_logs("analytics", TIMEOUT), Some(0));
}

#[rstest]
fn claimed_logs_are_resent_after_restart(storage: TempDir) {
    let group = || GroupConfig::new(2, Duration::from_secs(10), 1);

    let stalled = Arc::new(MockIngestion::holding());
    let first = start(
        PipelineComponents {
            persistence: Box::new(FilePersistence::open(storage.path()).expect("open storage")),
            ingestion: stalled.clone(),
            network: Arc::new(NetworkStateMonitor::connected()),
        },
        TransportConfig::new("secret"),
        GroupSpec::new("analytics", group()),
    );
    let channel = first.channel();
    channel.enqueue(event("A"), "analytics", Flags::Normal);
    channel.enqueue(event("B"), "analytics", Flags::Normal);
    assert!(stalled.wait_for_sends(1, TIMEOUT));
    assert!(first.shutdown(TIMEOUT));
    drop(first);

    let delivered = Arc::new(MockIngestion::new());
    let listener = RecordingListener::new();
    let second = start(
        PipelineComponents {
            persistence: Box::new(FilePersistence::open(storage.path()).expect("reopen storage")),
            ingestion: delivered.clone(),
            network: Arc::new(NetworkStateMonitor::connected()),
        },
        TransportConfig::new("secret"),
        GroupSpec::new("analytics", group()).with_listener(listener.as_listener()),
    );
    assert!(listener.wait_for_sent(2, TIMEOUT));
    let resent: Vec<String> = delivered.requests()[0]
        .logs
        .iter()
        .filter_map(|log| log.payload["name"].as_str().map(str::to_owned))
        .collect();
    assert_eq!(resent, ["A", "B"]);
    assert_eq!(second.channel().count_logs("analytics", TIMEOUT), Some(0));
}
