//! Runtime: schedulers, timers, and the fiber run-loop.
use std::sync::Arc;

use snafu::Snafu;
use tokio::{runtime::Handle, sync::oneshot};

mod cancel;
pub use self::cancel::{CancelTokenError, ForwardCancelable};

mod dedicated;
pub use self::dedicated::DedicatedRuntime;

mod run_loop;
pub(crate) use self::run_loop::{ResumeCallback, Suspension};
use self::run_loop::{Completion, RunLoop};

mod scheduler;
pub use self::scheduler::{Scheduler, Task, Timer, TimerHandle, TokioScheduler};

use crate::{
    effect::node::unbox,
    fiber::{FiberCore, FiberId, OutcomeSlot},
    trace::TraceBuffer,
    EffectError, Fiber, FiberError, Io, Outcome, RuntimeConfiguration,
};

/// Runtime error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RuntimeError {
    /// No Tokio runtime is active on the current thread.
    #[snafu(display("No ambient Tokio runtime is available on the current thread."))]
    NoAmbientRuntime,

    /// The dedicated runtime could not be built.
    #[snafu(display("Failed to build dedicated runtime: {}", source))]
    Build {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// What an effect can observe about the fiber evaluating it.
pub(crate) struct FiberEnv<'a> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) fiber_id: FiberId,
    pub(crate) trace: Option<&'a TraceBuffer>,
}

struct Inner {
    scheduler: Arc<dyn Scheduler>,
    timer: Arc<dyn Timer>,
    config: RuntimeConfiguration,
}

/// Evaluates effects on fibers.
///
/// A `Runtime` bundles the [`Scheduler`] that drives run-loops, the [`Timer`] behind [`Io::sleep`], and the runtime
/// configuration. It is cheap to clone, and every fiber carries the runtime it was started on, so fibers started from
/// within an effect share it.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl Runtime {
    /// Creates a new `Runtime` from an explicit scheduler and timer.
    pub fn new(scheduler: Arc<dyn Scheduler>, timer: Arc<dyn Timer>, config: RuntimeConfiguration) -> Self {
        Self {
            inner: Arc::new(Inner {
                scheduler,
                timer,
                config,
            }),
        }
    }

    /// Creates a new `Runtime` that schedules fibers onto the Tokio runtime behind `handle`.
    pub fn from_handle(handle: Handle, config: RuntimeConfiguration) -> Self {
        let scheduler = Arc::new(TokioScheduler::new(handle));
        Self::new(scheduler.clone(), scheduler, config)
    }

    /// Creates a new `Runtime`, with the default configuration, on the Tokio runtime of the current thread.
    ///
    /// ## Errors
    ///
    /// If no Tokio runtime is active on the current thread, an error is returned.
    pub fn try_current() -> Result<Self, RuntimeError> {
        let handle = Handle::try_current().map_err(|_| NoAmbientRuntime.build())?;
        Ok(Self::from_handle(handle, RuntimeConfiguration::default()))
    }

    /// Returns the runtime configuration.
    pub fn config(&self) -> &RuntimeConfiguration {
        &self.inner.config
    }

    pub(crate) fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.inner.scheduler
    }

    pub(crate) fn timer(&self) -> &Arc<dyn Timer> {
        &self.inner.timer
    }

    /// Starts `io` on a new fiber.
    ///
    /// The fiber is scheduled, not run inline: this returns immediately.
    pub fn spawn<A: Send + 'static>(&self, io: Io<A>) -> Fiber<A> {
        let core = Arc::new(FiberCore::new(self.clone()));
        let slot = Arc::new(OutcomeSlot::new());

        let completed = Arc::clone(&slot);
        self.start(
            Arc::clone(&core),
            io,
            Box::new(move |outcome, trace| completed.complete(typed_outcome(outcome), trace)),
        );

        Fiber::new(core, slot)
    }

    /// Runs `io` on a new fiber and waits for its outcome.
    ///
    /// Dropping the returned future does not cancel the fiber.
    pub async fn run<A: Send + 'static>(&self, io: Io<A>) -> Outcome<A> {
        let (tx, rx) = oneshot::channel();
        let core = Arc::new(FiberCore::new(self.clone()));
        self.start(
            core,
            io,
            Box::new(move |outcome, _| {
                let _ = tx.send(typed_outcome(outcome));
            }),
        );

        rx.await
            .unwrap_or_else(|_| Outcome::Errored(EffectError::new(FiberError::Abandoned)))
    }

    /// Runs `io` on a new fiber without waiting for it.
    ///
    /// A failure of the fiber is reported to the scheduler.
    pub fn run_and_forget<A: Send + 'static>(&self, io: Io<A>) {
        let core = Arc::new(FiberCore::new(self.clone()));
        let scheduler = Arc::clone(self.scheduler());
        self.start(
            core,
            io,
            Box::new(move |outcome, _| {
                if let Outcome::Errored(e) = outcome {
                    scheduler.report_failure(&e);
                }
            }),
        );
    }

    fn start<A: Send + 'static>(&self, core: Arc<FiberCore>, io: Io<A>, completion: Completion) {
        RunLoop::start(core, io.into_node(), completion);
    }
}

fn typed_outcome<A: 'static>(outcome: Outcome<crate::effect::node::Value>) -> Outcome<A> {
    match outcome {
        Outcome::Succeeded(value) => match unbox::<A>(value) {
            Ok(value) => Outcome::Succeeded(value),
            Err(e) => Outcome::Errored(e),
        },
        Outcome::Errored(e) => Outcome::Errored(e),
        Outcome::Canceled => Outcome::Canceled,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use strand_error::generic_error;

    use super::*;
    use crate::effect::Callback;

    // -- Test infrastructure -----------------------------------------------------------------------------------------

    /// Delegates to Tokio, keeping every failure reported through the fallback channel.
    struct RecordingScheduler {
        inner: TokioScheduler,
        reported: Mutex<Vec<String>>,
    }

    impl RecordingScheduler {
        fn reported(&self) -> Vec<String> {
            self.reported.lock().unwrap().clone()
        }
    }

    impl Scheduler for RecordingScheduler {
        fn execute(&self, task: Task) {
            self.inner.execute(task);
        }

        fn report_failure(&self, error: &EffectError) {
            self.reported.lock().unwrap().push(error.to_string());
        }
    }

    fn recording_runtime() -> (Runtime, Arc<RecordingScheduler>) {
        let scheduler = Arc::new(RecordingScheduler {
            inner: TokioScheduler::new(Handle::current()),
            reported: Mutex::new(Vec::new()),
        });
        let timer = Arc::new(TokioScheduler::new(Handle::current()));
        let runtime = Runtime::new(scheduler.clone(), timer, RuntimeConfiguration::default());
        (runtime, scheduler)
    }

    fn deep_chain(depth: usize) -> Io<u64> {
        (0..depth).fold(Io::pure(0u64), |io, _| io.map(|v| v + 1))
    }

    // -- Tests -------------------------------------------------------------------------------------------------------

    #[test]
    fn try_current_without_tokio_fails() {
        assert!(matches!(Runtime::try_current(), Err(RuntimeError::NoAmbientRuntime)));
    }

    #[tokio::test]
    async fn run_returns_outcome() {
        let runtime = Runtime::try_current().unwrap();
        assert!(matches!(runtime.run(Io::pure(3)).await, Outcome::Succeeded(3)));
    }

    #[tokio::test]
    async fn spawned_fibers_start_other_fibers_on_same_runtime() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::pure(2)
            .start()
            .flat_map(|fiber| fiber.join())
            .map(|outcome| outcome.succeeded());
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded(Some(2))));
    }

    #[tokio::test(start_paused = true)]
    async fn run_and_forget_still_runs() {
        let runtime = Runtime::try_current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        runtime.run_and_forget(Io::delay(move || counter.fetch_add(1, Ordering::SeqCst)));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn low_yield_threshold_still_completes() {
        let config = RuntimeConfiguration::default().with_auto_yield_threshold(1);
        let runtime = Runtime::from_handle(Handle::current(), config);
        let program = (0..100).fold(Io::pure(0u32), |io, _| io.map(|v| v + 1));
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded(100)));
    }

    #[tokio::test]
    async fn cancellation_is_observed_at_auto_yield() {
        fn spin(counter: Arc<AtomicUsize>) -> Io<()> {
            Io::delay(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                counter
            })
            .flat_map(spin)
        }

        let config = RuntimeConfiguration::default().with_auto_yield_threshold(16);
        let runtime = Runtime::from_handle(Handle::current(), config);
        let spins = Arc::new(AtomicUsize::new(0));
        let fiber = runtime.spawn(spin(Arc::clone(&spins)));

        let outcome = runtime.run(Io::cede().then(fiber.cancel()).then(fiber.join())).await;
        assert!(matches!(outcome, Outcome::Succeeded(Outcome::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_and_forget_reports_failures() {
        let (runtime, scheduler) = recording_runtime();

        runtime.run_and_forget(Io::<()>::raise_error(generic_error!("nobody is listening")));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(scheduler.reported(), vec!["nobody is listening".to_string()]);
    }

    #[tokio::test]
    async fn late_async_failure_after_cancellation_is_reported() {
        let (runtime, scheduler) = recording_runtime();
        let parked = Arc::new(Mutex::new(None::<Callback<u8>>));
        let (registered_tx, registered_rx) = oneshot::channel();

        let slot = Arc::clone(&parked);
        let fiber = runtime.spawn(Io::async_(move |callback| {
            *slot.lock().unwrap() = Some(callback);
            let _ = registered_tx.send(());
            None
        }));
        registered_rx.await.unwrap();

        let outcome = runtime.run(fiber.cancel().then(fiber.join())).await;
        assert!(matches!(outcome, Outcome::Succeeded(Outcome::Canceled)));
        assert!(scheduler.reported().is_empty());

        let callback = parked.lock().unwrap().take().unwrap();
        callback.fail(generic_error!("arrived too late"));

        assert_eq!(scheduler.reported(), vec!["arrived too late".to_string()]);
    }

    #[tokio::test]
    async fn failing_finalizer_during_cancellation_is_reported() {
        let (runtime, scheduler) = recording_runtime();
        let (started_tx, started_rx) = oneshot::channel();

        let body = Io::delay(move || {
            let _ = started_tx.send(());
        })
        .then(Io::<()>::never());
        let fiber = runtime.spawn(body.on_cancel(Io::raise_error(generic_error!("finalizer failed"))));
        started_rx.await.unwrap();

        let outcome = runtime.run(fiber.cancel().then(fiber.join())).await;
        assert!(matches!(outcome, Outcome::Succeeded(Outcome::Canceled)));
        assert_eq!(scheduler.reported(), vec!["finalizer failed".to_string()]);
    }

    #[tokio::test]
    async fn error_skipping_a_deep_chain_discards_it() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::<()>::raise_error(generic_error!("early")).then(deep_chain(200_000));

        match runtime.run(program).await {
            Outcome::Errored(e) => assert_eq!(e.to_string(), "early"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_skipping_a_deep_chain_discards_it() {
        let runtime = Runtime::try_current().unwrap();
        let fiber = runtime.spawn(Io::<()>::never().then(deep_chain(200_000)));

        let outcome = runtime.run(Io::cede().then(fiber.cancel()).then(fiber.join())).await;
        assert!(matches!(outcome, Outcome::Succeeded(Outcome::Canceled)));
    }
}
