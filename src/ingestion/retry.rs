//! Retry decorator for any [`Ingestion`].
//!
//! Failures classified [`ErrorClass::Retryable`] are retried after the
//! policy's backoff; fatal failures and the last retryable failure are
//! surfaced to the caller. Each pending retry waits on its own timer thread
//! that selects between the delay and the call's cancel signal.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, after, bounded, select};
use log::{debug, warn};
use parking_lot::Mutex;

use super::backoff::{BackoffState, RetryPolicy};
use super::{Completion, Ingestion, IngestionRequest, IngestionResult, ServiceCall};
use crate::error::{ErrorClass, IngestionError};

/// Wraps a transport with classification and exponential backoff.
pub struct RetryingIngestion<I> {
    inner: Arc<I>,
    policy: RetryPolicy,
}

impl<I: Ingestion + 'static> RetryingIngestion<I> {
    pub fn new(inner: I, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(inner),
            policy,
        }
    }

    /// The wrapped transport.
    pub fn inner(&self) -> &I {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<I: Ingestion + 'static> Ingestion for RetryingIngestion<I> {
    fn send_async(&self, request: Arc<IngestionRequest>, callback: Completion) -> ServiceCall {
        let call = ServiceCall::new();
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let current: Arc<Mutex<Option<ServiceCall>>> = Arc::default();

        let attempts = Arc::new(RetryCall {
            inner: Arc::clone(&self.inner) as Arc<dyn Ingestion>,
            request,
            call: call.clone(),
            current: Arc::clone(&current),
            backoff: Mutex::new(BackoffState::new(self.policy.clone())),
            callback: Mutex::new(Some(callback)),
            cancel_rx,
        });

        let cancel_tx: Mutex<Option<Sender<()>>> = Mutex::new(Some(cancel_tx));
        call.on_cancel(move || {
            // disconnecting wakes every timer waiting on the receiver
            drop(cancel_tx.lock().take());
            if let Some(attempt) = current.lock().take() {
                attempt.cancel();
            }
        });

        attempts.start_attempt();
        call
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct RetryCall {
    inner: Arc<dyn Ingestion>,
    request: Arc<IngestionRequest>,
    call: ServiceCall,
    current: Arc<Mutex<Option<ServiceCall>>>,
    backoff: Mutex<BackoffState>,
    callback: Mutex<Option<Completion>>,
    cancel_rx: Receiver<()>,
}

impl RetryCall {
    fn start_attempt(self: Arc<Self>) {
        if self.call.is_cancelled() {
            return;
        }
        let this = Arc::clone(&self);
        let attempt = self
            .inner
            .send_async(Arc::clone(&self.request), Box::new(move |result| this.on_result(result)));
        *self.current.lock() = Some(attempt.clone());
        // a cancel racing with the store above may have missed this attempt
        if self.call.is_cancelled() {
            attempt.cancel();
        }
    }

    fn on_result(self: Arc<Self>, result: IngestionResult) {
        if self.call.is_cancelled() {
            return;
        }
        let err = match result {
            Ok(body) => return self.finish(Ok(body)),
            Err(err) => err,
        };
        if err.classify() == ErrorClass::Fatal {
            return self.finish(Err(err));
        }
        let delay = self.backoff.lock().next_delay();
        match delay {
            Some(delay) => {
                debug!("RetryingIngestion: attempt failed ({err}), retrying in {delay:?}");
                self.schedule_retry(delay, err);
            }
            None => {
                let retries = self.backoff.lock().retries();
                warn!("RetryingIngestion: giving up after {retries} retries: {err}");
                self.finish(Err(err));
            }
        }
    }

    fn schedule_retry(self: Arc<Self>, delay: Duration, last_err: IngestionError) {
        let this = Arc::clone(&self);
        let cancelled = self.cancel_rx.clone();
        let spawned = thread::Builder::new()
            .name("logship-retry".into())
            .spawn(move || {
                select! {
                    recv(cancelled) -> _ => {}
                    recv(after(delay)) -> _ => this.start_attempt(),
                }
            });
        if let Err(err) = spawned {
            warn!("RetryingIngestion: failed to spawn retry timer: {err}");
            self.finish(Err(last_err));
        }
    }

    fn finish(&self, result: IngestionResult) {
        if self.call.is_cancelled() {
            return;
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}
