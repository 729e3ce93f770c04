//! Bounded worker pool with per-connection FIFO lanes.
//!
//! Every connection owns a [`Lane`]. Work submitted to a lane runs in
//! submission order and never overlaps with other work on the same lane, while
//! different lanes make progress in parallel on the shared workers.

use std::{
    collections::VecDeque,
    future::Future,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
    thread::JoinHandle,
};

use tokio::sync::oneshot;

use crate::DatabaseError;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of work handed to the [`Dispatcher`].
///
/// Can be awaited from async code or collected with [`Pending::wait`] from
/// plain threads.
#[must_use = "the outcome of the work is only observable through the Pending handle"]
pub struct Pending<T> {
    receiver: oneshot::Receiver<Result<T, DatabaseError>>,
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending").finish_non_exhaustive()
    }
}

impl<T> Pending<T> {
    /// Already resolved handle, used when work is rejected before it is queued.
    pub(crate) fn ready(result: Result<T, DatabaseError>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Blocks the current thread until the work finishes.
    ///
    /// # Errors
    ///
    /// * The error produced by the work itself
    /// * [`DatabaseError::Canceled`] if the work was dropped without running
    ///
    /// # Panics
    ///
    /// * If called from within an async runtime; `.await` the handle instead
    pub fn wait(self) -> Result<T, DatabaseError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(DatabaseError::Canceled))
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, DatabaseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(DatabaseError::Canceled)))
    }
}

#[derive(Default)]
struct LaneState {
    queue: VecDeque<Job>,
    running: bool,
}

/// FIFO queue of work for a single connection.
#[derive(Default)]
pub struct Lane {
    state: Mutex<LaneState>,
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Lane")
            .field("queued", &state.queue.len())
            .field("running", &state.running)
            .finish()
    }
}

impl Lane {
    fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of work items waiting behind the one currently running.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }
}

pub struct Dispatcher {
    sender: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Starts `size` worker threads (at least one).
    ///
    /// # Errors
    ///
    /// * If a worker thread fails to spawn
    pub fn new(size: usize) -> Result<Self, DatabaseError> {
        let size = size.max(1);
        let (sender, receiver) = flume::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("switchy_sqlite-worker-{i}"))
                .spawn(move || {
                    log::trace!("worker {i} started");
                    while let Ok(job) = receiver.recv() {
                        job();
                    }
                    log::trace!("worker {i} stopped");
                })?;
            workers.push(handle);
        }

        log::debug!("Dispatcher started with {size} worker(s)");

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Runs `work` on any free worker, outside of every lane.
    pub fn spawn<T, F>(&self, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, DatabaseError> + Send + 'static,
    {
        let (job, pending) = wrap(work);
        if let Some(sender) = self.sender() {
            // A failed send drops the job, which resolves the handle as canceled.
            let _ = sender.send(job);
        }
        pending
    }

    /// Queues `work` on `lane`. It starts once everything submitted to the
    /// lane before it has finished.
    pub fn submit<T, F>(&self, lane: &Arc<Lane>, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, DatabaseError> + Send + 'static,
    {
        let Some(sender) = self.sender() else {
            return Pending::ready(Err(DatabaseError::Canceled));
        };

        let (job, pending) = wrap(work);

        let start = {
            let mut state = lane.lock();
            state.queue.push_back(job);
            !std::mem::replace(&mut state.running, true)
        };

        if start {
            schedule_drain(Arc::clone(lane), sender);
        }

        pending
    }

    /// Stops accepting work, lets queued work finish and joins the workers.
    ///
    /// Called from a worker thread it only stops accepting work, since a
    /// worker cannot join itself.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = std::thread::current().id();

        if workers.iter().any(|x| x.thread().id() == current) {
            log::debug!("shutdown: called from a worker thread, not joining");
            return;
        }

        for worker in workers {
            if worker.join().is_err() {
                log::error!("shutdown: worker thread panicked");
            }
        }

        log::debug!("Dispatcher shut down");
    }

    fn sender(&self) -> Option<flume::Sender<Job>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wrap<T, F>(work: F) -> (Job, Pending<T>)
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DatabaseError> + Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let job: Job = Box::new(move || {
        let result = std::panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|panic| {
            log::error!("work item panicked: {}", panic_message(&*panic));
            Err(DatabaseError::Canceled)
        });
        // The caller may have stopped listening.
        let _ = sender.send(result);
    });

    (job, Pending { receiver })
}

fn schedule_drain(lane: Arc<Lane>, sender: flume::Sender<Job>) {
    let retry = Arc::clone(&lane);
    let next = sender.clone();

    if sender.send(Box::new(move || drain(lane, next))).is_err() {
        log::error!("schedule_drain: workers are gone, canceling queued work");
        let mut state = retry.lock();
        state.queue.clear();
        state.running = false;
    }
}

/// Runs the next item of `lane`, then yields the worker back to the pool.
fn drain(lane: Arc<Lane>, sender: flume::Sender<Job>) {
    let next = lane.lock().queue.pop_front();

    if let Some(job) = next {
        job();
    }

    let more = {
        let mut state = lane.lock();
        if state.queue.is_empty() {
            state.running = false;
            false
        } else {
            true
        }
    };

    if more {
        schedule_drain(lane, sender);
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "callback panicked".to_string())
}
