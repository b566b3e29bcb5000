//! Single serialized worker that owns pipeline state.
//!
//! The dispatcher runs one thread which holds the state `S` and executes
//! posted tasks against it one at a time, so the state needs no locking.
//! Tasks may schedule delayed follow-ups through the [`Scheduler`] they
//! receive; those timers live in the worker's own heap, which keeps
//! scheduling from the worker non-blocking.
//!
//! Tasks posted from the worker itself bypass the bounded queue and go to
//! an unbounded local queue the worker drains before it waits again, so a
//! completion delivered on the worker is never refused.
//!
//! State is installed after the worker starts. Tasks that arrive before
//! [`DispatcherHandle::install`] are dropped with a warning.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded, unbounded};
use log::warn;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::DispatchError;

/// Default bounded queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Work executed on the dispatcher thread.
pub type Task<S> = Box<dyn FnOnce(&mut S, &mut Scheduler<S>) + Send>;

enum Command<S> {
    Install(Box<S>),
    Task(Task<S>),
    Flush(Sender<()>),
    Shutdown(Sender<()>),
}

/// Configuration for [`Dispatcher::spawn`].
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Worker thread name.
    pub name: String,
    /// Bounded queue capacity.
    pub capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "logship-dispatch".into(),
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Cancels a delayed task scheduled through [`Scheduler::schedule`].
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct Timer<S> {
    deadline: Instant,
    seq: u64,
    handle: TimerHandle,
    task: Task<S>,
}

impl<S> PartialEq for Timer<S> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<S> Eq for Timer<S> {}

impl<S> PartialOrd for Timer<S> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Timer<S> {
    // reversed so the earliest deadline sits at the top of the max-heap
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delayed-task queue available to tasks running on the dispatcher.
pub struct Scheduler<S> {
    timers: BinaryHeap<Timer<S>>,
    seq: u64,
}

impl<S> Scheduler<S> {
    fn new() -> Self {
        Self {
            timers: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Run `task` on the dispatcher after `delay` unless cancelled first.
    pub fn schedule(
        &mut self,
        delay: Duration,
        task: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) -> TimerHandle {
        let handle = TimerHandle::default();
        self.seq += 1;
        self.timers.push(Timer {
            deadline: Instant::now() + delay,
            seq: self.seq,
            handle: handle.clone(),
            task: Box::new(task),
        });
        handle
    }

    /// Number of timers not yet fired, cancelled ones included.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|timer| timer.deadline)
    }

    fn pop_due(&mut self, now: Instant) -> Option<Timer<S>> {
        if self.timers.peek()?.deadline <= now {
            self.timers.pop()
        } else {
            None
        }
    }
}

/// Cloneable sender side of a dispatcher.
pub struct DispatcherHandle<S> {
    tx: Sender<Command<S>>,
    local: Sender<Task<S>>,
    worker: Arc<OnceCell<ThreadId>>,
}

impl<S> Clone for DispatcherHandle<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            local: self.local.clone(),
            worker: Arc::clone(&self.worker),
        }
    }
}

impl<S: Send + 'static> DispatcherHandle<S> {
    /// Replace the worker's state.
    pub fn install(&self, state: S) -> Result<(), DispatchError> {
        self.send(Command::Install(Box::new(state)))
    }

    /// Queue a task without blocking.
    ///
    /// # Errors
    ///
    /// * [`DispatchError::QueueFull`] - the queue is at capacity
    /// * [`DispatchError::Closed`] - the worker has shut down
    pub fn try_post(
        &self,
        task: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) -> Result<(), DispatchError> {
        match self.tx.try_send(Command::Task(Box::new(task))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }

    /// Queue a task, waiting for space when called off the worker thread.
    ///
    /// On the worker thread itself this never blocks and never fails while
    /// the worker runs: the task joins the local queue and runs before the
    /// worker next waits for commands.
    pub fn post(
        &self,
        task: impl FnOnce(&mut S, &mut Scheduler<S>) + Send + 'static,
    ) -> Result<(), DispatchError> {
        self.send(Command::Task(Box::new(task)))
    }

    /// Wait until every task queued before this call has run.
    ///
    /// Returns `false` if the acknowledgement did not arrive within
    /// `timeout`, or if called from the worker thread.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_worker_thread() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let (ack_tx, ack_rx) = bounded(1);
        if self
            .tx
            .send_timeout(Command::Flush(ack_tx), timeout)
            .is_err()
        {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        ack_rx.recv_timeout(remaining).is_ok()
    }

    /// Whether the caller is running on the dispatcher thread.
    pub fn is_worker_thread(&self) -> bool {
        self.worker.get() == Some(&thread::current().id())
    }

    fn send(&self, command: Command<S>) -> Result<(), DispatchError> {
        if self.is_worker_thread() {
            let command = match command {
                Command::Task(task) => {
                    return self.local.send(task).map_err(|_| DispatchError::Closed);
                }
                other => other,
            };
            return match self.tx.try_send(command) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
                Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
            };
        }
        self.tx.send(command).map_err(|_| DispatchError::Closed)
    }
}

/// Owner of the dispatcher thread.
///
/// Dropping the dispatcher requests shutdown and joins the worker.
pub struct Dispatcher<S: Send + 'static> {
    handle: DispatcherHandle<S>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + 'static> Dispatcher<S> {
    /// Spawn the worker thread with no state installed.
    pub fn spawn(config: DispatcherConfig) -> io::Result<Self> {
        let (tx, rx) = bounded(config.capacity.max(1));
        let (local, local_rx) = unbounded();
        let worker = Arc::new(OnceCell::new());
        let registered = Arc::clone(&worker);
        let join = thread::Builder::new()
            .name(config.name)
            .spawn(move || {
                let _ = registered.set(thread::current().id());
                worker_loop(rx, local_rx);
            })?;
        Ok(Self {
            handle: DispatcherHandle { tx, local, worker },
            join: Mutex::new(Some(join)),
        })
    }

    pub fn handle(&self) -> DispatcherHandle<S> {
        self.handle.clone()
    }

    /// Drain queued tasks, stop the worker, and join it.
    ///
    /// Returns `false` if the worker did not acknowledge within `timeout`;
    /// the thread is then left to finish on its own.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let Some(join) = self.join.lock().take() else {
            return true;
        };
        if self.handle.is_worker_thread() {
            warn!("Dispatcher: shutdown requested from the worker thread; ignoring");
            *self.join.lock() = Some(join);
            return false;
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self
            .handle
            .tx
            .send_timeout(Command::Shutdown(ack_tx), timeout)
            .is_err()
        {
            return join.join().is_ok();
        }
        if ack_rx.recv_timeout(timeout).is_err() {
            warn!("Dispatcher: worker did not acknowledge shutdown in {timeout:?}");
            return false;
        }
        if join.join().is_err() {
            warn!("Dispatcher: worker thread panicked");
            return false;
        }
        true
    }
}

impl<S: Send + 'static> Drop for Dispatcher<S> {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

struct Worker<S> {
    state: Option<S>,
    scheduler: Scheduler<S>,
    local: Receiver<Task<S>>,
}

impl<S> Worker<S> {
    fn run_task(&mut self, task: Task<S>) {
        match self.state.as_mut() {
            Some(state) => task(state, &mut self.scheduler),
            None => warn!("Dispatcher: dropping task posted before state was installed"),
        }
    }

    /// Run tasks the worker posted to itself, including ones they post.
    fn run_local(&mut self) {
        while let Ok(task) = self.local.try_recv() {
            self.run_task(task);
        }
    }

    fn run_due_timers(&mut self) {
        let now = Instant::now();
        while let Some(timer) = self.scheduler.pop_due(now) {
            if !timer.handle.is_cancelled() {
                self.run_task(timer.task);
            }
        }
    }

    fn handle(&mut self, command: Command<S>, rx: &Receiver<Command<S>>) -> bool {
        match command {
            Command::Install(state) => self.state = Some(*state),
            Command::Task(task) => {
                self.run_task(task);
                self.run_local();
            }
            Command::Flush(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown(ack) => {
                self.drain(rx);
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn drain(&mut self, rx: &Receiver<Command<S>>) {
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Install(state) => self.state = Some(*state),
                Command::Task(task) => self.run_task(task),
                Command::Flush(ack) | Command::Shutdown(ack) => {
                    let _ = ack.send(());
                }
            }
            self.run_local();
        }
        self.run_local();
    }
}

fn worker_loop<S>(rx: Receiver<Command<S>>, local: Receiver<Task<S>>) {
    let mut worker = Worker {
        state: None,
        scheduler: Scheduler::new(),
        local,
    };
    loop {
        worker.run_due_timers();
        worker.run_local();
        let command = match worker.scheduler.next_deadline() {
            Some(deadline) => {
                let wait = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(command) => command,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(command) => command,
                Err(_) => break,
            },
        };
        if !worker.handle(command, &rx) {
            break;
        }
    }
}
