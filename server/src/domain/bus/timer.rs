//! Deferred and recurring job scheduler
//!
//! A single background worker owns a min-heap of `(due_time, job_id)`.
//! Scheduling wakes the worker when the new head is sooner; cancellation is
//! O(1) — the job is dropped from the table and the stale heap entry becomes
//! a no-op when popped. Job errors go to the registered error callback and
//! the worker keeps running.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

type JobFn = Box<dyn FnMut() -> Result<(), anyhow::Error> + Send>;
type ErrorFn = Box<dyn Fn(&anyhow::Error) + Send + Sync>;

enum JobKind {
    Once,
    Every(Duration),
}

struct Job {
    f: JobFn,
    kind: JobKind,
}

struct TimerState {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    /// Ids cancelled while their job was off the table (mid-execution)
    cancelled: HashSet<u64>,
    next_id: u64,
    stopped: bool,
}

struct TimerInner {
    state: Mutex<TimerState>,
    notify: Notify,
    on_error: Mutex<Option<ErrorFn>>,
}

/// Handle cancelling a scheduled job; dropping it does NOT cancel
pub struct CancelHandle {
    id: u64,
    inner: Weak<TimerInner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock();
            if state.jobs.remove(&self.id).is_none() {
                // Job is currently executing; block its reschedule
                state.cancelled.insert(self.id);
            }
        }
    }
}

/// Background job scheduler
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Create the timer and start its worker task
    ///
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                jobs: HashMap::new(),
                cancelled: HashSet::new(),
                next_id: 1,
                stopped: false,
            }),
            notify: Notify::new(),
            on_error: Mutex::new(None),
        });

        tokio::spawn(run_worker(Arc::clone(&inner)));

        Self { inner }
    }

    /// Run a job once after `delay`
    pub fn queue(
        &self,
        delay: Duration,
        f: impl FnMut() -> Result<(), anyhow::Error> + Send + 'static,
    ) -> CancelHandle {
        self.schedule(delay, Box::new(f), JobKind::Once)
    }

    /// Run a job every `interval`, rescheduling after each execution
    pub fn every(
        &self,
        interval: Duration,
        f: impl FnMut() -> Result<(), anyhow::Error> + Send + 'static,
    ) -> CancelHandle {
        self.schedule(interval, Box::new(f), JobKind::Every(interval))
    }

    /// Register the callback invoked when a job returns an error
    pub fn on_error(&self, f: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
        *self.inner.on_error.lock() = Some(Box::new(f));
    }

    /// Stop the worker; pending jobs are discarded
    pub fn stop(&self) {
        self.inner.state.lock().stopped = true;
        self.inner.notify.notify_one();
    }

    fn schedule(&self, delay: Duration, f: JobFn, kind: JobKind) -> CancelHandle {
        let id = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.jobs.insert(id, Job { f, kind });
            state.heap.push(Reverse((Instant::now() + delay, id)));
            id
        };
        // Wake the worker in case the new job is the earliest
        self.inner.notify.notify_one();
        CancelHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }
}

enum NextAction {
    Stop,
    Idle,
    Wait(Instant),
    Run(u64),
}

async fn run_worker(inner: Arc<TimerInner>) {
    loop {
        let action = {
            let mut state = inner.state.lock();
            if state.stopped {
                NextAction::Stop
            } else {
                match state.heap.peek() {
                    None => NextAction::Idle,
                    Some(Reverse((due, _))) if *due <= Instant::now() => {
                        let Reverse((_, id)) = state.heap.pop().unwrap();
                        state.cancelled.remove(&id);
                        NextAction::Run(id)
                    }
                    Some(Reverse((due, _))) => NextAction::Wait(*due),
                }
            }
        };

        match action {
            NextAction::Stop => break,
            NextAction::Idle => inner.notify.notified().await,
            NextAction::Wait(due) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(due)) => {}
                    _ = inner.notify.notified() => {}
                }
            }
            NextAction::Run(id) => {
                // Take the job off the table while it runs; a cancel in the
                // meantime lands in the cancelled set
                let job = inner.state.lock().jobs.remove(&id);
                let Some(mut job) = job else { continue };

                if let Err(e) = (job.f)() {
                    match inner.on_error.lock().as_ref() {
                        Some(cb) => cb(&e),
                        None => tracing::warn!(error = %e, "timer job failed"),
                    }
                }

                let mut state = inner.state.lock();
                if let JobKind::Every(interval) = job.kind {
                    if !state.stopped && !state.cancelled.remove(&id) {
                        state.jobs.insert(id, job);
                        state.heap.push(Reverse((Instant::now() + interval, id)));
                    }
                } else {
                    // A cancel that raced the execution left a marker behind
                    state.cancelled.remove(&id);
                }
            }
        }
    }
}
