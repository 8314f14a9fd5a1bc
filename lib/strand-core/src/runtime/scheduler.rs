use std::time::Duration;

use tokio::runtime::Handle;
use tracing::error;

use crate::EffectError;

/// A unit of work handed to a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes run-loop steps.
///
/// Schedulers never run a task inline: `execute` must return before the task starts, so that a fiber resuming another
/// fiber never nests one run-loop inside another.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` for execution.
    fn execute(&self, task: Task);

    /// Reports a failure that has no listener, such as an error raised by a detached fiber.
    fn report_failure(&self, error: &EffectError) {
        error!(error = %error, "Unhandled failure in effect with no listener.");
    }
}

/// Schedules tasks after a delay.
pub trait Timer: Send + Sync {
    /// Runs `task` once `delay` has elapsed, unless the returned handle is canceled first.
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

/// A handle to a scheduled timer task.
///
/// Dropping the handle leaves the task scheduled.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send>,
}

impl TimerHandle {
    /// Creates a handle that runs `cancel` when the task is canceled.
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Box::new(cancel),
        }
    }

    /// Cancels the scheduled task, if it has not run yet.
    pub fn cancel(self) {
        (self.cancel)()
    }
}

/// A scheduler and timer backed by a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Creates a new `TokioScheduler` that spawns onto the runtime behind `handle`.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

impl Timer for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let sleeper = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });

        let abort = sleeper.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}
