//! Recurring jobs on tokio tasks.
//!
//! Every job owns its own interval; there is no shared tick. A job added with
//! `run_immediately` fires as soon as the scheduler is started, then every
//! interval after each run began (a slow run delays the next one rather than
//! stacking runs). Jobs added before [`Scheduler::start`] are held until then,
//! so callers can finish wiring before anything fires.
//!
//! Job bodies are never aborted. Cancellation is a signal the body observes
//! through its [`JobContext`]; [`JobHandle::cancel_and_wait`] returns only once
//! the body has finished whatever it decided to complete.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type JobFn = Arc<dyn Fn(JobContext) -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Control {
    interval: Duration,
    paused: bool,
    cancelled: bool,
}

/// Explicitly constructed, cheaply cloneable scheduler service.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    next_id: AtomicU64,
    started: watch::Sender<bool>,
    jobs: Mutex<HashMap<JobId, JobHandle>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// A held scheduler: jobs may be added but none fires before [`Scheduler::start`].
    pub fn new() -> Self {
        let (started, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                next_id: AtomicU64::new(1),
                started,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn start(&self) {
        if !self.inner.started.send_replace(true) {
            tracing::info!(jobs = self.job_count(), "scheduler started");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.inner.started.borrow()
    }

    /// Spawn a recurring job. Must be called from within a tokio runtime.
    pub fn add_job<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        body: F,
    ) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_job(name.into(), interval, run_immediately, false, body)
    }

    /// Like [`Scheduler::add_job`], but the job starts paused. With
    /// `run_immediately`, the first run happens as soon as it is resumed.
    pub fn add_paused_job<F, Fut>(
        &self,
        name: impl Into<String>,
        interval: Duration,
        run_immediately: bool,
        body: F,
    ) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn_job(name.into(), interval, run_immediately, true, body)
    }

    fn spawn_job<F, Fut>(
        &self,
        name: String,
        interval: Duration,
        run_immediately: bool,
        paused: bool,
        body: F,
    ) -> JobHandle
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let body: JobFn = Arc::new(move |ctx| Box::pin(body(ctx)) as JobFuture);

        let (control, control_rx) = watch::channel(Control {
            interval,
            paused,
            cancelled: false,
        });
        let (done, done_rx) = watch::channel(false);
        let runs = Arc::new(AtomicU64::new(0));

        let handle = JobHandle {
            shared: Arc::new(JobShared {
                id,
                name: name.clone(),
                control,
                finished: done_rx,
                runs: Arc::clone(&runs),
            }),
        };

        {
            let mut jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.insert(id, handle.clone());
        }

        let guard = FinishGuard {
            id,
            done,
            scheduler: Arc::downgrade(&self.inner),
        };
        let started = self.inner.started.subscribe();
        tokio::spawn(drive(
            id,
            name.clone(),
            body,
            control_rx,
            started,
            runs,
            run_immediately,
            guard,
        ));

        tracing::debug!(job = %id, name = %name, interval_secs = interval.as_secs_f64(), "job scheduled");
        handle
    }

    /// Jobs that have not finished yet.
    pub fn job_count(&self) -> usize {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Cancel every remaining job and wait for all of them to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<JobHandle> = {
            let jobs = self.inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.values().cloned().collect()
        };
        for handle in &handles {
            handle.cancel();
        }
        for handle in &handles {
            handle.stopped().await;
        }
    }
}

struct JobShared {
    id: JobId,
    name: String,
    control: watch::Sender<Control>,
    finished: watch::Receiver<bool>,
    runs: Arc<AtomicU64>,
}

/// Stable reference to a scheduled job, usable for pause/reschedule/cancel.
#[derive(Clone)]
pub struct JobHandle {
    shared: Arc<JobShared>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let control = *self.shared.control.borrow();
        f.debug_struct("JobHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("interval", &control.interval)
            .field("paused", &control.paused)
            .field("cancelled", &control.cancelled)
            .finish()
    }
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn interval(&self) -> Duration {
        self.shared.control.borrow().interval
    }

    pub fn is_paused(&self) -> bool {
        self.shared.control.borrow().paused
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.control.borrow().cancelled
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.finished.borrow()
    }

    /// Number of times the body has been started.
    pub fn run_count(&self) -> u64 {
        self.shared.runs.load(Ordering::Relaxed)
    }

    /// Suspend future runs; the next-run time is kept.
    pub fn pause(&self) {
        self.shared.control.send_if_modified(|c| {
            let changed = !c.paused;
            c.paused = true;
            changed
        });
    }

    pub fn resume(&self) {
        self.shared.control.send_if_modified(|c| {
            let changed = c.paused;
            c.paused = false;
            changed
        });
    }

    /// Change the interval; the next run is one new interval from now.
    pub fn reschedule(&self, interval: Duration) {
        self.shared.control.send_if_modified(|c| {
            let changed = c.interval != interval;
            c.interval = interval;
            changed
        });
    }

    /// Signal cancellation. Idempotent; does not wait.
    pub fn cancel(&self) {
        self.shared.control.send_if_modified(|c| {
            let changed = !c.cancelled;
            c.cancelled = true;
            changed
        });
    }

    /// Wait until the job's task has exited.
    pub async fn stopped(&self) {
        let mut finished = self.shared.finished.clone();
        let _ = finished.wait_for(|done| *done).await;
    }

    pub async fn cancel_and_wait(&self) {
        self.cancel();
        self.stopped().await;
    }

    /// Context bound to this job's cancellation state, for running its body by hand.
    pub fn context(&self) -> JobContext {
        JobContext {
            job: self.shared.id,
            control: self.shared.control.subscribe(),
        }
    }
}

/// Passed to each run of a job body.
#[derive(Clone)]
pub struct JobContext {
    job: JobId,
    control: watch::Receiver<Control>,
}

impl JobContext {
    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.borrow().cancelled
    }

    /// Resolves once the job is cancelled (or its handle is gone).
    pub async fn cancelled(&self) {
        let mut control = self.control.clone();
        let _ = control.wait_for(|c| c.cancelled).await;
    }
}

struct FinishGuard {
    id: JobId,
    done: watch::Sender<bool>,
    scheduler: Weak<SchedulerInner>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.done.send_replace(true);
        if let Some(inner) = self.scheduler.upgrade() {
            let mut jobs = inner.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.remove(&self.id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    id: JobId,
    name: String,
    body: JobFn,
    mut control: watch::Receiver<Control>,
    mut started: watch::Receiver<bool>,
    runs: Arc<AtomicU64>,
    run_immediately: bool,
    _guard: FinishGuard,
) {
    // Held until the scheduler starts, unless cancelled first.
    loop {
        if control.borrow().cancelled {
            return;
        }
        if *started.borrow_and_update() {
            break;
        }
        tokio::select! {
            res = started.changed() => {
                if res.is_err() {
                    return;
                }
            }
            res = control.changed() => {
                if res.is_err() {
                    return;
                }
            }
        }
    }

    let first = control.borrow().interval;
    let mut next_run = if run_immediately {
        Instant::now()
    } else {
        Instant::now() + first
    };

    loop {
        let state = *control.borrow_and_update();
        if state.cancelled {
            break;
        }
        if state.paused {
            if control.changed().await.is_err() {
                break;
            }
            let updated = *control.borrow();
            if updated.interval != state.interval {
                next_run = Instant::now() + updated.interval;
            }
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(next_run) => {}
            res = control.changed() => {
                if res.is_err() {
                    break;
                }
                let updated = *control.borrow();
                if updated.interval != state.interval {
                    next_run = Instant::now() + updated.interval;
                }
                continue;
            }
        }

        runs.fetch_add(1, Ordering::Relaxed);
        let began = Instant::now();
        body(JobContext {
            job: id,
            control: control.clone(),
        })
        .await;

        let interval = control.borrow().interval;
        next_run = (began + interval).max(Instant::now());
    }

    tracing::debug!(job = %id, name = %name, "job stopped");
}
