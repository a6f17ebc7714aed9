//!
//! src/scheduler.rs  Andrew Belles  Oct 16th, 2026
//!
//! Serial, rate limited task queues. A scheduler dispatches one task per
//! cycle at a fixed cadence plus whatever extra delay the shared rate
//! window imposes. Tasks are fire and forget; failures come back as new
//! tasks pushed onto the head of the queue.
//!

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::config::LaneConfig;
use crate::errors::LinkerError;
use crate::rate::RateWindow;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Lookup,
    Submission
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Lookup     => "lookup",
            TaskKind::Submission => "submission"
        }
    }

    /// Rate window charge per dispatch
    pub fn weight(self) -> u32 {
        match self {
            TaskKind::Lookup     => 1,
            TaskKind::Submission => 2
        }
    }

    pub fn base_interval(self) -> Duration {
        match self {
            TaskKind::Lookup     => Duration::from_millis(1000),
            TaskKind::Submission => Duration::from_millis(1500)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Priority {
    #[default]
    Normal,
    Urgent
}

/// Deferred unit of work. The closure runs at dispatch time and the
/// future it returns is spawned without being awaited by the scheduler.
pub struct Task {
    kind: TaskKind,
    priority: Priority,
    run: Box<dyn FnOnce() -> TaskFuture + Send + 'static>
}

impl Task {
    pub fn new<F, Fut>(kind: TaskKind, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            kind,
            priority: Priority::Normal,
            run: Box::new(move || -> TaskFuture { Box::pin(f()) })
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn urgent(self) -> Self {
        self.with_priority(Priority::Urgent)
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn weight(&self) -> u32 {
        self.kind.weight()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Pending tasks in dispatch order. Pausing keeps every queued task.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
    paused: bool
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn prepend(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    /// Urgent tasks jump the queue, normal ones wait their turn
    pub fn insert(&mut self, task: Task) {
        match task.priority {
            Priority::Urgent => self.prepend(task),
            Priority::Normal => self.append(task)
        }
    }

    /// Next task to dispatch, none while paused
    pub fn pop(&mut self) -> Option<Task> {
        if self.paused {
            return None;
        }
        self.tasks.pop_front()
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[derive(Debug)]
struct SchedulerState {
    queue: TaskQueue,
    running: bool,
    last_dispatch: Option<Instant>,
    dispatched: u64
}

struct Inner {
    kind: TaskKind,
    lane: LaneConfig,
    rate: Arc<RateWindow>,
    state: Mutex<SchedulerState>
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("kind", &self.inner.kind)
            .field("lane", &self.inner.lane)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(kind: TaskKind, lane: LaneConfig, rate: Arc<RateWindow>) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                lane,
                rate,
                state: Mutex::new(SchedulerState {
                    queue: TaskQueue::new(),
                    running: false,
                    last_dispatch: None,
                    dispatched: 0
                })
            })
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.inner.kind
    }

    /// Queues a task by its priority and starts draining if idle
    pub fn enqueue(&self, task: Task) {
        self.check_kind(&task);
        let mut state = self.inner.state();
        state.queue.insert(task);
        self.maybe_start(&mut state);
    }

    /// Queues a task ahead of everything not yet dispatched (retries)
    pub fn enqueue_front(&self, task: Task) {
        self.check_kind(&task);
        let mut state = self.inner.state();
        state.queue.prepend(task);
        self.maybe_start(&mut state);
    }

    /// No new dispatch starts until `resume`. A wait already in progress
    /// still runs out, the cycle after it stops.
    pub fn pause(&self) {
        let mut state = self.inner.state();
        state.queue.pause();
        info!(scheduler = self.inner.kind.as_str(), queued = state.queue.len(),
            "scheduler.pause");
    }

    pub fn resume(&self) {
        let mut state = self.inner.state();
        state.queue.resume();
        info!(scheduler = self.inner.kind.as_str(), queued = state.queue.len(),
            "scheduler.resume");
        self.maybe_start(&mut state);
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state().queue.is_paused()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().running
    }

    pub fn pending(&self) -> usize {
        self.inner.state().queue.len()
    }

    pub fn dispatched(&self) -> u64 {
        self.inner.state().dispatched
    }

    /// Wraps a fallible operation into a task. Transient failures are
    /// re-queued at the head as a fresh task, without limit; the receiver
    /// resolves with the first success or the first permanent error.
    pub fn submit<T, F, Fut>(&self, priority: Priority, op: F)
        -> oneshot::Receiver<Result<T, LinkerError>>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, LinkerError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = attempt_task(self.clone(), Arc::new(op), tx, 1, priority);
        self.enqueue(task);
        rx
    }

    fn check_kind(&self, task: &Task) {
        if task.kind != self.inner.kind {
            warn!(
                scheduler = self.inner.kind.as_str(),
                task = task.kind.as_str(),
                "scheduler.kind.mismatch"
            );
        }
    }

    fn maybe_start(&self, state: &mut SchedulerState) {
        if state.running || state.queue.is_paused() || state.queue.is_empty() {
            return;
        }
        state.running = true;

        // after an idle gap only the remainder of the base interval is owed
        let base = self.inner.lane.base_interval;
        let delay = match state.last_dispatch {
            Some(last) => base.saturating_sub(last.elapsed()),
            None => Duration::ZERO
        };

        debug!(scheduler = self.inner.kind.as_str(), delay_ms = delay.as_millis() as u64,
            "scheduler.start");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(drain(inner, delay));
    }
}

async fn drain(inner: Arc<Inner>, mut delay: Duration) {
    loop {
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let (task, queued) = {
            let mut state = inner.state();
            match state.queue.pop() {
                Some(task) => {
                    state.last_dispatch = Some(Instant::now());
                    state.dispatched += 1;
                    (task, state.queue.len())
                }
                None => {
                    state.running = false;
                    debug!(scheduler = inner.kind.as_str(),
                        paused = state.queue.is_paused(), "scheduler.idle");
                    return;
                }
            }
        };

        // run outside the lock, the closure may enqueue
        let priority = task.priority;
        let future = (task.run)();
        tokio::spawn(future);

        let load = inner.rate.charge(inner.lane.weight);
        delay = inner.lane.base_interval + inner.rate.extra_delay();
        debug!(
            scheduler = inner.kind.as_str(),
            urgent = priority == Priority::Urgent,
            queued, load,
            next_ms = delay.as_millis() as u64,
            "scheduler.dispatch"
        );
    }
}

fn attempt_task<T, F, Fut>(
    scheduler: Scheduler,
    op: Arc<F>,
    tx: oneshot::Sender<Result<T, LinkerError>>,
    attempt: u32,
    priority: Priority
) -> Task
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, LinkerError>> + Send + 'static,
{
    let kind = scheduler.kind();
    Task::new(kind, move || {
        let fut = op();
        async move {
            match fut.await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(scheduler = kind.as_str(), attempt, "task.recovered");
                    }
                    let _ = tx.send(Ok(value));
                }
                Err(e) if e.is_retryable() => {
                    warn!(scheduler = kind.as_str(), attempt, error = %e, "task.retry");
                    let retry = attempt_task(
                        scheduler.clone(), op, tx, attempt + 1, priority
                    );
                    scheduler.enqueue_front(retry);
                }
                Err(e) => {
                    error!(scheduler = kind.as_str(), attempt, error = %e, "task.failed");
                    let _ = tx.send(Err(e));
                }
            }
        }
    })
    .with_priority(priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Log = Arc<Mutex<Vec<(&'static str, u64)>>>;

    fn lookup(rate: &Arc<RateWindow>) -> Scheduler {
        Scheduler::new(TaskKind::Lookup, LaneConfig::for_kind(TaskKind::Lookup), rate.clone())
    }

    fn recording_task(kind: TaskKind, label: &'static str, log: &Log, start: Instant) -> Task {
        let log = log.clone();
        Task::new(kind, move || {
            let at = start.elapsed().as_millis() as u64;
            log.lock().unwrap().push((label, at));
            async {}
        })
    }

    fn labels(log: &Log) -> Vec<&'static str> {
        log.lock().unwrap().iter().map(|(l, _)| *l).collect()
    }

    fn times(log: &Log) -> Vec<u64> {
        log.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    #[test]
    fn queue_orders_by_priority() {
        let mut queue = TaskQueue::new();
        queue.insert(Task::new(TaskKind::Lookup, || async {}));
        queue.insert(Task::new(TaskKind::Lookup, || async {}).urgent());
        assert_eq!(queue.len(), 2);
        queue.pause();
        assert!(queue.pop().is_none());
        assert_eq!(queue.len(), 2);
        queue.resume();
        assert_eq!(queue.pop().map(|t| t.priority()), Some(Priority::Urgent));
        assert_eq!(queue.pop().map(|t| t.priority()), Some(Priority::Normal));
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_in_queue_order_with_urgent_first() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let log: Log = Arc::default();
        let start = Instant::now();

        scheduler.enqueue(recording_task(TaskKind::Lookup, "a", &log, start));
        scheduler.enqueue(recording_task(TaskKind::Lookup, "b", &log, start));
        scheduler.enqueue(recording_task(TaskKind::Lookup, "c", &log, start));
        scheduler.enqueue(recording_task(TaskKind::Lookup, "d", &log, start).urgent());

        sleep(Duration::from_millis(10_000)).await;
        assert_eq!(labels(&log), vec!["d", "a", "b", "c"]);
        assert_eq!(times(&log), vec![0, 1000, 2000, 3000]);
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.dispatched(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_jump_ahead_of_waiting_tasks() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let log: Log = Arc::default();
        let start = Instant::now();
        let failures = Arc::new(AtomicU32::new(2));

        let flaky_log = log.clone();
        let flaky = scheduler.submit(Priority::Normal, move || {
            let at = start.elapsed().as_millis() as u64;
            flaky_log.lock().unwrap().push(("flaky", at));
            let failures = failures.clone();
            async move {
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(LinkerError::TransientIo("503".into()));
                }
                Ok(7_u32)
            }
        });
        scheduler.enqueue(recording_task(TaskKind::Lookup, "next", &log, start));

        assert_eq!(flaky.await.unwrap().unwrap(), 7);
        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(labels(&log), vec!["flaky", "flaky", "flaky", "next"]);
        assert_eq!(times(&log), vec![0, 1000, 2000, 3000]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let rx = scheduler.submit(Priority::Normal, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(LinkerError::Parse("bad json".into())) }
        });

        assert!(matches!(rx.await.unwrap(), Err(LinkerError::Parse(_))));
        sleep(Duration::from_millis(3_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn twelve_lookups_follow_the_rate_window() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let log: Log = Arc::default();
        let start = Instant::now();

        for _ in 0..12 {
            scheduler.enqueue(recording_task(TaskKind::Lookup, "t", &log, start));
        }
        sleep(Duration::from_millis(30_000)).await;

        // nine free slots, then each unit over budget adds a second
        assert_eq!(
            times(&log),
            vec![0, 1000, 2000, 3000, 4000, 5000, 6000, 7000, 8000, 9000, 11000, 14000]
        );
        assert_eq!(rate.load(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_new_dispatches_until_resume() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let log: Log = Arc::default();
        let start = Instant::now();

        scheduler.enqueue(recording_task(TaskKind::Lookup, "a", &log, start));
        scheduler.enqueue(recording_task(TaskKind::Lookup, "b", &log, start));
        tokio::task::yield_now().await;
        scheduler.pause();

        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(labels(&log), vec!["a"]);
        assert_eq!(scheduler.pending(), 1);
        assert!(!scheduler.is_running());

        // retries queued while paused wait as well
        scheduler.enqueue_front(recording_task(TaskKind::Lookup, "retry", &log, start));
        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(labels(&log), vec!["a"]);

        scheduler.resume();
        sleep(Duration::from_millis(5_000)).await;
        assert_eq!(labels(&log), vec!["a", "retry", "b"]);
        assert_eq!(times(&log), vec![0, 7000, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_restart_dispatches_without_bursting() {
        let rate = RateWindow::new(RateConfig::default());
        let scheduler = lookup(&rate);
        let log: Log = Arc::default();
        let start = Instant::now();

        scheduler.enqueue(recording_task(TaskKind::Lookup, "a", &log, start));
        sleep(Duration::from_millis(400)).await;

        // still inside the interval, b waits for the cadence
        scheduler.enqueue(recording_task(TaskKind::Lookup, "b", &log, start));
        sleep(Duration::from_millis(3_100)).await;
        assert!(!scheduler.is_running());

        // idle for longer than the interval, c goes out at once
        scheduler.enqueue(recording_task(TaskKind::Lookup, "c", &log, start));
        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(times(&log), vec![0, 1000, 3500]);
    }

    #[tokio::test(start_paused = true)]
    async fn schedulers_share_the_rate_window() {
        let rate = RateWindow::new(RateConfig::default());
        let lookups = lookup(&rate);
        let edits = Scheduler::new(
            TaskKind::Submission,
            LaneConfig::for_kind(TaskKind::Submission),
            rate.clone()
        );
        let log: Log = Arc::default();
        let start = Instant::now();
        rate.charge(8);

        edits.enqueue(recording_task(TaskKind::Submission, "edit", &log, start));
        while rate.load() < 10 {
            tokio::task::yield_now().await;
        }

        lookups.enqueue(recording_task(TaskKind::Lookup, "l1", &log, start));
        lookups.enqueue(recording_task(TaskKind::Lookup, "l2", &log, start));
        sleep(Duration::from_millis(10_000)).await;

        // l1 pushes the load to 11, two units over budget
        assert_eq!(labels(&log), vec!["edit", "l1", "l2"]);
        assert_eq!(times(&log), vec![0, 0, 3000]);
    }
}
