//! HTTP transport posting batches to the collector.
//!
//! A small pool of worker threads shares one `ureq::Agent` for connection
//! pooling and pulls jobs from a bounded crossbeam channel. Each job is one
//! attempt; retrying belongs to [`RetryingIngestion`](super::RetryingIngestion).

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use log::{trace, warn};
use parking_lot::Mutex;
use ureq::{Agent, AgentBuilder};

use super::{Completion, Ingestion, IngestionRequest, IngestionResult, LogContainer, ServiceCall};
use crate::error::{ConfigError, IngestionError};

/// Default collector base URL.
pub const DEFAULT_LOG_URL: &str = "https://in.appcenter.ms";
/// Path and query appended to the base URL.
pub const LOGS_PATH: &str = "/logs?api-version=1.0.0";
/// Characters of the secret left visible in trace output.
const VISIBLE_SECRET_CHARS: usize = 8;

/// Configuration for [`HttpIngestion`].
#[derive(Clone, Debug)]
pub struct HttpIngestionConfig {
    /// Collector base URL without the logs path.
    pub log_url: String,
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub request_timeout: Duration,
    /// Number of I/O worker threads.
    pub workers: usize,
    /// Bounded job queue capacity.
    pub capacity: usize,
}

impl Default for HttpIngestionConfig {
    fn default() -> Self {
        Self {
            log_url: DEFAULT_LOG_URL.into(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            workers: 3,
            capacity: 64,
        }
    }
}

impl HttpIngestionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.log_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "log_url must be an http(s) URL, got '{}'",
                self.log_url
            )));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("request_timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.workers == 0 || self.capacity == 0 {
            return Err(ConfigError::Invalid(
                "workers and capacity must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Full endpoint URL for batch uploads.
    pub fn endpoint(&self) -> String {
        format!("{}{LOGS_PATH}", self.log_url.trim().trim_end_matches('/'))
    }
}

struct Job {
    request: Arc<IngestionRequest>,
    call: ServiceCall,
    callback: Completion,
}

/// Production transport speaking HTTP to the collector.
pub struct HttpIngestion {
    tx: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpIngestion {
    /// Build the agent and spawn the worker pool.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration is invalid, the TLS
    /// connector cannot be created, or a worker thread fails to spawn.
    pub fn new(config: HttpIngestionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let tls = native_tls::TlsConnector::new()
            .map_err(|err| ConfigError::Invalid(format!("TLS setup failed: {err}")))?;
        let agent = AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout(config.request_timeout)
            .tls_connector(Arc::new(tls))
            .build();
        let endpoint = Arc::new(config.endpoint());

        let (tx, rx) = bounded(config.capacity);
        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let worker = Worker {
                agent: agent.clone(),
                endpoint: Arc::clone(&endpoint),
            };
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("logship-http-{index}"))
                .spawn(move || worker.run(rx))
                .map_err(|err: io::Error| {
                    warn!("HttpIngestion: failed to spawn worker {index}: {err}");
                    ConfigError::Io(err)
                })?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }
}

impl Ingestion for HttpIngestion {
    fn send_async(&self, request: Arc<IngestionRequest>, callback: Completion) -> ServiceCall {
        let call = ServiceCall::new();
        let job = Job {
            request,
            call: call.clone(),
            callback,
        };
        let sent = match self.tx.lock().as_ref() {
            Some(tx) => tx.try_send(job),
            None => Err(TrySendError::Disconnected(job)),
        };
        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!("HttpIngestion: request queue full, failing batch for retry");
                (job.callback)(Err(IngestionError::Transport(
                    "ingestion queue is full".into(),
                )));
            }
            Err(TrySendError::Disconnected(job)) => (job.callback)(Err(IngestionError::Closed)),
        }
        call
    }

    /// Stop accepting work and join the workers after they finish queued jobs.
    ///
    /// When called from a worker (the last owner dropped inside a
    /// completion) that worker is not joined; it exits once its callback
    /// returns and the queue is closed.
    fn close(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("HttpIngestion: worker thread panicked");
            }
        }
    }
}

impl Drop for HttpIngestion {
    fn drop(&mut self) {
        self.close();
    }
}

struct Worker {
    agent: Agent,
    endpoint: Arc<String>,
}

impl Worker {
    fn run(self, rx: Receiver<Job>) {
        for job in rx {
            if job.call.is_cancelled() {
                continue;
            }
            let result = self.execute(&job.request);
            if !job.call.is_cancelled() {
                (job.callback)(result);
            }
        }
    }

    fn execute(&self, request: &IngestionRequest) -> IngestionResult {
        let body = serde_json::to_string(&LogContainer {
            logs: &request.logs,
        })
        .map_err(|err| IngestionError::Serialization(err.to_string()))?;
        let install_id = request.install_id.to_string();
        trace!(
            "HttpIngestion: POST {} Install-ID={install_id} App-Secret={} ({} logs)",
            self.endpoint,
            mask_secret(&request.credentials),
            request.logs.len()
        );
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Install-ID", &install_id)
            .set("App-Secret", &request.credentials)
            .send_string(&body);
        match response {
            Ok(response) => classify_response(response.status(), response.into_string().unwrap_or_default()),
            Err(ureq::Error::Status(status, response)) => {
                classify_response(status, response.into_string().unwrap_or_default())
            }
            Err(ureq::Error::Transport(err)) => Err(IngestionError::Transport(err.to_string())),
        }
    }
}

/// Map a status and body to the attempt outcome; 2xx is success.
pub fn classify_response(status: u16, body: String) -> IngestionResult {
    if (200..300).contains(&status) {
        Ok(body)
    } else {
        Err(IngestionError::Http { status, body })
    }
}

/// Replace all but the last few characters of `secret` with `*`.
pub fn mask_secret(secret: &str) -> String {
    let total = secret.chars().count();
    let hidden = total.saturating_sub(VISIBLE_SECRET_CHARS);
    secret
        .chars()
        .enumerate()
        .map(|(i, c)| if i < hidden { '*' } else { c })
        .collect()
}
