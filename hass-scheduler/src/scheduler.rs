//! The scheduler loop
//!
//! A single background task sleeps until the earliest `next_trigger_at`,
//! fires every due task on its own tokio task and recomputes the next
//! trigger. Registering or cancelling a task wakes the loop early so a new
//! earliest trigger is never slept through.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc, Weekday};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError, TaskError};
use crate::solar::{Location, SolarCalculator, SolarEventKind, SunriseCalculator};
use crate::time_of_day::TimeOfDay;
use crate::trigger::{Trigger, TriggerContext};

/// Seconds before retrying a trigger whose next time could not be computed
const RETRY_AFTER_SECS: i64 = 3600;

/// Callback invoked every time a task fires
pub type TaskCallback = Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), TaskError>> + Send + Sync>;

/// Identifier of a scheduled task, unique per scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A registered task
pub struct ScheduledTask {
    id: TaskId,
    trigger: Trigger,
    next_trigger_at: DateTime<Utc>,
    callback: TaskCallback,
}

impl ScheduledTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn next_trigger_at(&self) -> DateTime<Utc> {
        self.next_trigger_at
    }
}

impl fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("trigger", &self.trigger)
            .field("next_trigger_at", &self.next_trigger_at)
            .finish_non_exhaustive()
    }
}

/// Handle returned on registration, used to cancel the task
///
/// Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    inner: Weak<Inner>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Remove the task; returns false if it already fired (one-shot),
    /// was cancelled before, or the scheduler is gone
    pub fn cancel(&self) -> bool {
        match self.inner.upgrade() {
            Some(inner) => inner.remove(self.id),
            None => false,
        }
    }

    /// Whether the task is still registered
    pub fn is_scheduled(&self) -> bool {
        self.inner
            .upgrade()
            .map(|inner| inner.tasks.lock().contains_key(&self.id))
            .unwrap_or(false)
    }
}

struct Inner {
    tasks: Mutex<HashMap<TaskId, ScheduledTask>>,
    wake: Notify,
    clock: Arc<dyn Clock>,
    solar: Arc<dyn SolarCalculator>,
    location: RwLock<Option<Location>>,
    next_id: AtomicU64,
    running: AtomicBool,
    shutdown: AtomicBool,
}

impl Inner {
    fn remove(&self, id: TaskId) -> bool {
        let removed = self.tasks.lock().remove(&id).is_some();
        if removed {
            debug!(task = %id, "Cancelled scheduled task");
            self.wake.notify_one();
        }
        removed
    }

    fn earliest(&self) -> Option<DateTime<Utc>> {
        self.tasks.lock().values().map(|task| task.next_trigger_at).min()
    }

    /// Fire every due task and move its trigger into the future
    fn fire_due(&self) {
        let now = self.clock.now();
        let context = TriggerContext {
            solar: self.solar.as_ref(),
            location: *self.location.read(),
        };

        let mut due = Vec::new();
        {
            let mut tasks = self.tasks.lock();
            let mut spent = Vec::new();

            for task in tasks.values_mut() {
                if task.next_trigger_at > now {
                    continue;
                }
                due.push((task.id, Arc::clone(&task.callback)));

                match context.next_fire(&task.trigger, Some(task.next_trigger_at), now) {
                    Ok(Some(next)) => {
                        debug!(task = %task.id, next = %next, "Rescheduled task");
                        task.next_trigger_at = next;
                    }
                    Ok(None) => spent.push(task.id),
                    Err(e) => {
                        warn!(task = %task.id, error = %e, "Could not compute next trigger, retrying later");
                        task.next_trigger_at = now + Duration::seconds(RETRY_AFTER_SECS);
                    }
                }
            }

            for id in spent {
                tasks.remove(&id);
            }
        }

        for (id, callback) in due {
            tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { callback().await })
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(task = %id, error = %e, "Scheduled task failed"),
                    Err(_) => error!(task = %id, "Scheduled task panicked"),
                }
            });
        }
    }
}

/// Runs callbacks at intervals, daily times and solar-relative times
///
/// Cloning is cheap; all clones share the same task table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.len())
            .field("location", &self.location())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    /// Scheduler on the system clock with astronomical solar times
    pub fn new() -> Self {
        Self::with_sources(Arc::new(SunriseCalculator::new()), Arc::new(SystemClock))
    }

    /// Scheduler with explicit solar and time sources
    pub fn with_sources(solar: Arc<dyn SolarCalculator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                clock,
                solar,
                location: RwLock::new(None),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Set the observer location used by solar triggers
    ///
    /// Solar tasks already registered are rescheduled against the new
    /// location.
    pub fn set_location(&self, location: Location) -> Result<()> {
        location.validate()?;
        *self.inner.location.write() = Some(location);
        info!(latitude = location.latitude, longitude = location.longitude, "Scheduler location set");

        let now = self.inner.clock.now();
        let context = TriggerContext {
            solar: self.inner.solar.as_ref(),
            location: Some(location),
        };
        let mut tasks = self.inner.tasks.lock();
        for task in tasks.values_mut() {
            if !matches!(task.trigger, Trigger::Solar { .. }) {
                continue;
            }
            match context.next_fire(&task.trigger, None, now) {
                Ok(Some(next)) => task.next_trigger_at = next,
                Ok(None) => {}
                Err(e) => warn!(task = %task.id, error = %e, "Could not reschedule solar task"),
            }
        }
        drop(tasks);

        self.inner.wake.notify_one();
        Ok(())
    }

    pub fn location(&self) -> Option<Location> {
        *self.inner.location.read()
    }

    /// Current time according to the scheduler's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Register a task with an arbitrary trigger
    pub fn schedule<F, Fut>(&self, trigger: Trigger, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        trigger.validate()?;

        let now = self.inner.clock.now();
        if let Trigger::Once(at) = trigger {
            if at < now {
                return Err(SchedulerError::InPast(at));
            }
        }

        let context = TriggerContext {
            solar: self.inner.solar.as_ref(),
            location: *self.inner.location.read(),
        };
        let next_trigger_at = context
            .next_fire(&trigger, None, now)?
            .ok_or(SchedulerError::InPast(now))?;

        let id = TaskId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: TaskCallback = Arc::new(move || callback().boxed());

        debug!(task = %id, trigger = ?trigger, next = %next_trigger_at, "Scheduled task");
        self.inner.tasks.lock().insert(
            id,
            ScheduledTask {
                id,
                trigger,
                next_trigger_at,
                callback,
            },
        );
        self.inner.wake.notify_one();

        Ok(TaskHandle {
            id,
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Every `period`, first firing one period from now
    pub fn run_every<F, Fut>(&self, period: StdDuration, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::interval(period), callback)
    }

    /// Every `period` on the grid anchored at `align`
    pub fn run_every_aligned<F, Fut>(
        &self,
        period: StdDuration,
        align: DateTime<Utc>,
        callback: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::interval_aligned(period, align), callback)
    }

    /// Every day at a local wall-clock time
    pub fn run_every_day_at<F, Fut>(&self, time: TimeOfDay, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::daily_at(time), callback)
    }

    /// Every week on `weekday` at a local wall-clock time
    pub fn run_every_week_at<F, Fut>(
        &self,
        weekday: Weekday,
        time: TimeOfDay,
        callback: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::weekly_at(weekday, time), callback)
    }

    /// Every day at a solar event shifted by `offset`
    ///
    /// Fails with [`SchedulerError::MissingLocation`] until a location is set.
    pub fn run_every_day_at_solar<F, Fut>(
        &self,
        kind: SolarEventKind,
        offset: Duration,
        callback: F,
    ) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::solar(kind, offset), callback)
    }

    /// Once, after `delay`
    pub fn run_in<F, Fut>(&self, delay: StdDuration, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        let at = Duration::from_std(delay)
            .ok()
            .and_then(|offset| self.inner.clock.now().checked_add_signed(offset))
            .ok_or(SchedulerError::InvalidPeriod(delay))?;
        self.schedule(Trigger::once(at), callback)
    }

    /// Once, at `at`
    pub fn run_at<F, Fut>(&self, at: DateTime<Utc>, callback: F) -> Result<TaskHandle>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), TaskError>> + Send + 'static,
    {
        self.schedule(Trigger::once(at), callback)
    }

    pub fn cancel(&self, handle: &TaskHandle) -> bool {
        self.inner.remove(handle.id)
    }

    /// Next firing time of a registered task
    pub fn next_trigger_at(&self, handle: &TaskHandle) -> Option<DateTime<Utc>> {
        self.inner
            .tasks
            .lock()
            .get(&handle.id)
            .map(|task| task.next_trigger_at)
    }

    /// Earliest pending trigger across all tasks
    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.inner.earliest()
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn the scheduler loop on the current runtime
    ///
    /// The scheduler counts as running as soon as this returns.
    pub fn start(&self) -> JoinHandle<()> {
        let claimed = self.claim();
        let scheduler = self.clone();
        tokio::spawn(async move {
            if claimed {
                scheduler.run_loop().await;
            }
        })
    }

    /// Run the scheduler loop until [`Scheduler::shutdown`]
    ///
    /// Returns immediately if another loop is already running.
    pub async fn run(&self) {
        if self.claim() {
            self.run_loop().await;
        }
    }

    fn claim(&self) -> bool {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("Scheduler loop already running");
            return false;
        }
        self.inner.shutdown.store(false, Ordering::Release);
        true
    }

    async fn run_loop(&self) {
        info!(tasks = self.len(), "Scheduler started");

        loop {
            if self.inner.shutdown.load(Ordering::Acquire) {
                break;
            }

            match self.inner.earliest() {
                Some(next) => {
                    let delay = (next - self.inner.clock.now())
                        .to_std()
                        .unwrap_or(StdDuration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.inner.wake.notified() => continue,
                    }
                }
                None => {
                    self.inner.wake.notified().await;
                    continue;
                }
            }

            self.inner.fire_due();
        }

        self.inner.running.store(false, Ordering::Release);
        info!("Scheduler stopped");
    }

    /// Stop the loop; registered tasks are kept
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake.notify_one();
    }

    /// Remove every task
    pub fn clear(&self) {
        self.inner.tasks.lock().clear();
        self.inner.wake.notify_one();
    }
}
