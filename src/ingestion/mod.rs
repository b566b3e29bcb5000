//! Network boundary to the remote collector.
//!
//! An [`Ingestion`] performs exactly one attempt per call and reports the
//! outcome through a completion callback. [`RetryingIngestion`] layers
//! backoff and retry classification on top of any transport.

pub mod backoff;
pub mod http;
pub mod retry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use crate::error::IngestionError;
use crate::log_record::Log;

pub use backoff::{BackoffState, Jitter, RetryPolicy};
pub use http::{HttpIngestion, HttpIngestionConfig};
pub use retry::RetryingIngestion;

/// Batch handed to the collector.
#[derive(Clone, Debug, PartialEq)]
pub struct IngestionRequest {
    pub install_id: Uuid,
    pub credentials: String,
    pub logs: Vec<Log>,
}

/// JSON body sent on the wire; credentials travel as headers.
#[derive(Serialize)]
pub(crate) struct LogContainer<'a> {
    pub logs: &'a [Log],
}

/// Outcome of one send: the response body or the failure.
pub type IngestionResult = Result<String, IngestionError>;

/// Completion callback, invoked at most once.
pub type Completion = Box<dyn FnOnce(IngestionResult) + Send>;

/// Single-attempt transport.
pub trait Ingestion: Send + Sync {
    /// Start sending `request`.
    ///
    /// `callback` runs exactly once on a transport thread, or never when
    /// the returned call is cancelled before the attempt completes.
    fn send_async(&self, request: Arc<IngestionRequest>, callback: Completion) -> ServiceCall;

    /// Stop accepting requests and release transport resources.
    fn close(&self) {}
}

impl<T: Ingestion + ?Sized> Ingestion for Arc<T> {
    fn send_async(&self, request: Arc<IngestionRequest>, callback: Completion) -> ServiceCall {
        (**self).send_async(request, callback)
    }

    fn close(&self) {
        (**self).close()
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CallState {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<CancelHook>>,
}

/// Cancellable handle for an in-progress send.
///
/// Clones share the same cancellation flag.
#[derive(Clone, Default)]
pub struct ServiceCall {
    state: Arc<CallState>,
}

impl ServiceCall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the call and run its cancel hooks once.
    pub fn cancel(&self) {
        if self.state.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.state.hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Register work to run on cancellation; runs immediately if the call
    /// is already cancelled.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.state.hooks.lock();
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl std::fmt::Debug for ServiceCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCall")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
