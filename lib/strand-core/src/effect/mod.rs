use std::{
    marker::PhantomData,
    panic::Location,
    sync::{Arc, Mutex},
    time::Duration,
};

use snafu::Snafu;
use strand_error::GenericError;

mod concurrent;
pub use self::concurrent::Either;

pub(crate) mod node;
use self::node::{unbox, Node, NodeKind, Site, Value};

mod outcome;
pub use self::outcome::{ExitCase, Outcome};

use crate::{
    fiber::{Fiber, FiberId},
    resource::Resource,
    runtime::{FiberEnv, ResumeCallback},
    sync::lock,
    trace::{FiberTrace, TraceKind},
    EffectError,
};

/// Timeout error.
#[derive(Debug, Snafu)]
pub enum TimeoutError {
    /// The guarded effect did not complete in time.
    #[snafu(display("Effect did not complete within {:?}.", duration))]
    Elapsed {
        /// The timeout that elapsed.
        duration: Duration,
    },
}

/// A description of a computation producing a value of type `A`.
///
/// Building an `Io` performs no work. Effects are only evaluated when handed to a [`Runtime`][crate::Runtime], and the
/// same description can never be evaluated twice: every combinator consumes its receiver. To repeat a computation,
/// build it again, typically from a function returning a fresh `Io`.
///
/// Constructors that capture user code (`pure`, `delay`, `map`, `flat_map`, `async_`) record their call site, which
/// fibers report through execution tracing when enabled.
#[must_use = "effects do nothing unless run"]
pub struct Io<A> {
    node: Node,
    _value: PhantomData<fn() -> A>,
}

impl<A> Io<A> {
    pub(crate) fn from_node(node: Node) -> Self {
        Self {
            node,
            _value: PhantomData,
        }
    }

    pub(crate) fn into_node(self) -> Node {
        self.node
    }

    fn from_kind(kind: NodeKind) -> Self {
        Self::from_kind(NodeKind::from(kind))
    }
}

impl<A: Send + 'static> Io<A> {
    /// Lifts an already-computed value.
    #[track_caller]
    pub fn pure(value: A) -> Self {
        Self::pure_at(Some(Location::caller()), value)
    }

    pub(crate) fn pure_at(site: Site, value: A) -> Self {
        Self::from_kind(NodeKind::Pure(Box::new(value), site))
    }

    /// Suspends a synchronous computation.
    ///
    /// The closure runs each time the effect is evaluated, on whichever worker thread is driving the fiber. A panic in
    /// the closure fails the effect with [`FiberError::Panicked`][crate::FiberError::Panicked].
    #[track_caller]
    pub fn delay<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::delay_at(Some(Location::caller()), f)
    }

    pub(crate) fn delay_at<F>(site: Site, f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_kind(NodeKind::Delay(Box::new(move || Ok(Box::new(f()) as Value)), site))
    }

    /// Suspends a synchronous computation that can fail.
    #[track_caller]
    pub fn try_delay<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, GenericError> + Send + 'static,
    {
        let thunk = move || f().map(|value| Box::new(value) as Value).map_err(EffectError::from);
        Self::from_kind(NodeKind::Delay(Box::new(thunk), Some(Location::caller())))
    }

    /// Builds the effect lazily, at evaluation time.
    pub fn defer<F>(f: F) -> Self
    where
        F: FnOnce() -> Io<A> + Send + 'static,
    {
        Self::from_kind(NodeKind::Defer(Box::new(move || f().node)))
    }

    /// Fails with the given error.
    pub fn raise_error<E>(error: E) -> Self
    where
        E: Into<EffectError>,
    {
        Self::from_kind(NodeKind::RaiseError(error.into()))
    }

    /// Suspends forever.
    ///
    /// The effect can still be canceled.
    pub fn never() -> Self {
        Self::async_at(None, |callback| Some(Io::delay_at(None, move || drop(callback))))
    }

    /// Bridges a callback-based asynchronous operation.
    ///
    /// `register` is called with a [`Callback`] once the fiber has suspended. The operation completes the effect by
    /// invoking the callback, at most once, from any thread. `register` may return a cancellation action, which runs if
    /// the fiber is canceled while suspended and is otherwise discarded.
    #[track_caller]
    pub fn async_<F>(register: F) -> Self
    where
        F: FnOnce(Callback<A>) -> Option<Io<()>> + Send + 'static,
    {
        Self::async_at(Some(Location::caller()), register)
    }

    pub(crate) fn async_at<F>(site: Site, register: F) -> Self
    where
        F: FnOnce(Callback<A>) -> Option<Io<()>> + Send + 'static,
    {
        Self::from_kind(NodeKind::Async(
            Box::new(move |resume| register(Callback::new(resume)).map(Io::into_node)),
            site,
        ))
    }

    /// Runs `body` with cancellation masked.
    ///
    /// `body` receives a [`Poll`], which restores cancelability for the effect it wraps. Regions nest: a `Poll` only
    /// unmasks the region it was created for, never an enclosing one.
    pub fn uncancelable<F>(body: F) -> Self
    where
        F: FnOnce(Poll) -> Io<A> + Send + 'static,
    {
        Self::from_kind(NodeKind::Uncancelable(Box::new(move |poll| body(poll).node)))
    }

    pub(crate) fn traced(self, kind: TraceKind, location: &'static Location<'static>) -> Self {
        Self::from_kind(NodeKind::Trace(Box::new(self.node), kind, location))
    }

    /// Transforms the produced value.
    #[track_caller]
    pub fn map<B, F>(self, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.map_at(Some(Location::caller()), f)
    }

    pub(crate) fn map_at<B, F>(self, site: Site, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        let map = move |value: Value| unbox::<A>(value).map(|value| Box::new(f(value)) as Value);
        Io::from_kind(NodeKind::Map(Box::new(self.node), Box::new(map), site))
    }

    /// Sequences a dependent effect built from the produced value.
    #[track_caller]
    pub fn flat_map<B, F>(self, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Io<B> + Send + 'static,
    {
        self.flat_map_at(Some(Location::caller()), f)
    }

    pub(crate) fn flat_map_at<B, F>(self, site: Site, f: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Io<B> + Send + 'static,
    {
        let bind = move |value: Value| match unbox::<A>(value) {
            Ok(value) => f(value).node,
            Err(e) => Node::from(NodeKind::RaiseError(e)),
        };
        Io::from_kind(NodeKind::Bind(Box::new(self.node), Box::new(bind), site))
    }

    /// Runs `next` after this effect, discarding the produced value.
    pub fn then<B>(self, next: Io<B>) -> Io<B>
    where
        B: Send + 'static,
    {
        self.flat_map_at(None, move |_| next)
    }

    /// Discards the produced value.
    pub fn void(self) -> Io<()> {
        self.map_at(None, |_| ())
    }

    /// Recovers from a failure with an effect built from the error.
    pub fn handle_error_with<F>(self, f: F) -> Self
    where
        F: FnOnce(EffectError) -> Io<A> + Send + 'static,
    {
        Self::from_kind(NodeKind::HandleErrorWith(Box::new(self.node), Box::new(move |e| f(e).node)))
    }

    /// Recovers from a failure with a value computed from the error.
    pub fn handle_error<F>(self, f: F) -> Self
    where
        F: FnOnce(EffectError) -> A + Send + 'static,
    {
        self.handle_error_with(move |e| Io::pure_at(None, f(e)))
    }

    /// Exposes failure as a value.
    pub fn attempt(self) -> Io<Result<A, EffectError>> {
        self.map_at(None, Ok).handle_error_with(|e| Io::pure_at(None, Err(e)))
    }

    /// Folds success and failure into a single value.
    pub fn redeem<B, R, F>(self, recover: R, f: F) -> Io<B>
    where
        B: Send + 'static,
        R: FnOnce(EffectError) -> B + Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.attempt().map_at(None, move |result| match result {
            Ok(value) => f(value),
            Err(e) => recover(e),
        })
    }

    /// Runs `f` when this effect fails, then re-raises the original error.
    ///
    /// A failure of `f` is attached to the original error as a suppressed error.
    pub fn on_error<F>(self, f: F) -> Self
    where
        F: FnOnce(EffectError) -> Io<()> + Send + 'static,
    {
        self.handle_error_with(move |e| {
            f(e.clone())
                .attempt()
                .flat_map_at(None, move |handled| Io::raise_error(e.suppressing(handled.err())))
        })
    }

    /// Registers `finalizer` to run if the fiber is canceled while this effect runs.
    ///
    /// The finalizer runs uncancelably, and does not run if the effect completes or fails.
    pub fn on_cancel(self, finalizer: Io<()>) -> Self {
        Self::from_kind(NodeKind::OnCancel(Box::new(self.node), Box::new(finalizer.node)))
    }

    /// Runs `finalizer` once this effect terminates, however it terminates.
    pub fn guarantee(self, finalizer: Io<()>) -> Self {
        self.guarantee_case(move |_| finalizer)
    }

    /// Runs the finalizer built from the [`ExitCase`] once this effect terminates, however it terminates.
    ///
    /// The finalizer runs exactly once and uncancelably. If the effect failed, a failure of the finalizer is attached to
    /// the original error as a suppressed error. Otherwise, a failure of the finalizer becomes the result.
    pub fn guarantee_case<F>(self, finalizer: F) -> Self
    where
        F: FnOnce(ExitCase) -> Io<()> + Send + 'static,
    {
        let finalizer = Arc::new(Mutex::new(Some(finalizer)));
        let on_cancel = Arc::clone(&finalizer);
        let on_error = Arc::clone(&finalizer);

        Io::uncancelable(move |poll| {
            poll.apply(self)
                .on_cancel(Io::defer(move || run_once(&on_cancel, ExitCase::Canceled)))
                .handle_error_with(move |e| {
                    let release = run_once(&on_error, ExitCase::Errored(e.clone()));
                    release
                        .attempt()
                        .flat_map_at(None, move |released| Io::raise_error(e.suppressing(released.err())))
                })
                .flat_map_at(None, move |value| {
                    run_once(&finalizer, ExitCase::Succeeded).map_at(None, move |_| value)
                })
        })
    }

    /// Uses this effect as the acquisition of a resource, runs `use_` with it, and always runs `release` afterwards.
    #[track_caller]
    pub fn bracket<B, U, R>(self, use_: U, release: R) -> Io<B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Io<B> + Send + 'static,
        R: FnOnce(A) -> Io<()> + Send + 'static,
    {
        Resource::make(self, release).use_(use_)
    }

    /// Like [`bracket`][Self::bracket], with the release action receiving the [`ExitCase`] of `use_`.
    #[track_caller]
    pub fn bracket_case<B, U, R>(self, use_: U, release: R) -> Io<B>
    where
        A: Clone,
        B: Send + 'static,
        U: FnOnce(A) -> Io<B> + Send + 'static,
        R: FnOnce(A, ExitCase) -> Io<()> + Send + 'static,
    {
        Resource::make_case(self, release).use_(use_)
    }

    /// Starts this effect on a new fiber, returning a handle to it.
    ///
    /// The new fiber runs concurrently with the current one, and is not canceled when the current one is.
    pub fn start(self) -> Io<Fiber<A>> {
        Io::from_kind(NodeKind::Env(Box::new(move |env: &FiberEnv<'_>| {
            Io::pure_at(None, env.runtime.spawn(self)).node
        })))
    }
}

impl Io<()> {
    /// An effect that does nothing.
    pub fn unit() -> Self {
        Self::from_node(Node::unit())
    }

    /// Requests cancellation of the current fiber.
    ///
    /// Inside an uncancelable region, the request is recorded and honored once the region exits.
    pub fn canceled() -> Self {
        Self::from_kind(NodeKind::Canceled)
    }

    /// Yields back to the scheduler, letting other fibers run.
    pub fn cede() -> Self {
        Self::from_kind(NodeKind::Cede)
    }

    /// Suspends the fiber for the given duration.
    pub fn sleep(duration: Duration) -> Self {
        Self::from_kind(NodeKind::Env(Box::new(move |env: &FiberEnv<'_>| {
            let timer = Arc::clone(env.runtime.timer());
            Io::async_at(None, move |callback: Callback<()>| {
                let handle = timer.schedule(duration, Box::new(move || callback.succeed(())));
                Some(Io::delay_at(None, move || handle.cancel()))
            })
            .node
        })))
    }
}

impl Io<FiberTrace> {
    /// Returns a snapshot of the current fiber's execution trace.
    ///
    /// The snapshot is empty when tracing is disabled.
    pub fn trace() -> Self {
        Self::from_kind(NodeKind::Env(Box::new(|env: &FiberEnv<'_>| {
            let trace = env.trace.map(|buffer| buffer.snapshot()).unwrap_or_default();
            Io::pure_at(None, trace).node
        })))
    }
}

impl Io<FiberId> {
    /// Returns the identifier of the current fiber.
    pub fn fiber_id() -> Self {
        Self::from_kind(NodeKind::Env(Box::new(|env: &FiberEnv<'_>| Io::pure_at(None, env.fiber_id).node)))
    }
}

fn run_once<F>(finalizer: &Mutex<Option<F>>, case: ExitCase) -> Io<()>
where
    F: FnOnce(ExitCase) -> Io<()>,
{
    let finalizer = lock(finalizer).take();
    match finalizer {
        Some(finalizer) => finalizer(case),
        None => Io::unit(),
    }
}

/// Restores cancelability inside an uncancelable region.
///
/// Obtained from [`Io::uncancelable`].
#[derive(Clone, Copy, Debug)]
pub struct Poll {
    depth: u32,
}

impl Poll {
    pub(crate) fn new(depth: u32) -> Self {
        Self { depth }
    }

    /// Wraps `io` so that it runs cancelably.
    pub fn apply<A: Send + 'static>(&self, io: Io<A>) -> Io<A> {
        Io::from_kind(NodeKind::Unmask(Box::new(io.node), self.depth))
    }
}

/// Completes a suspended [`Io::async_`] effect.
pub struct Callback<A> {
    resume: ResumeCallback,
    _value: PhantomData<fn(A)>,
}

impl<A: Send + 'static> Callback<A> {
    fn new(resume: ResumeCallback) -> Self {
        Self {
            resume,
            _value: PhantomData,
        }
    }

    /// Completes the effect with the given result.
    pub fn complete(self, result: Result<A, EffectError>) {
        self.resume.resume(result.map(|value| Box::new(value) as Value));
    }

    /// Completes the effect with a value.
    pub fn succeed(self, value: A) {
        self.complete(Ok(value));
    }

    /// Completes the effect with a failure.
    pub fn fail<E>(self, error: E)
    where
        E: Into<EffectError>,
    {
        self.complete(Err(error.into()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use strand_error::generic_error;

    use super::*;
    use crate::{FiberError, Runtime};

    #[tokio::test]
    async fn map_and_flat_map_chain() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::pure(20).map(|v| v + 1).flat_map(|v| Io::delay(move || v * 2));
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded(42)));
    }

    #[tokio::test]
    async fn deep_flat_map_chain_is_stack_safe() {
        fn count_down(n: u64) -> Io<u64> {
            if n == 0 {
                Io::pure(0)
            } else {
                Io::unit().flat_map(move |_| count_down(n - 1)).map(|v| v + 1)
            }
        }

        let runtime = Runtime::try_current().unwrap();
        let program = Io::defer(|| count_down(100_000));
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded(100_000)));
    }

    #[tokio::test]
    async fn descriptions_are_lazy() {
        let runtime = Runtime::try_current().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let program = Io::delay(move || counter.fetch_add(1, Ordering::SeqCst));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        runtime.run(program).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_skip_transformations_until_handled() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::<u32>::raise_error(generic_error!("bad input"))
            .map(|v| v + 1)
            .handle_error(|e| e.to_string().len() as u32);
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded(9)));
    }

    #[tokio::test]
    async fn try_delay_failure_is_raised() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::<u8>::try_delay(|| Err(generic_error!("nope"))).attempt();
        match runtime.run(program).await {
            Outcome::Succeeded(Err(e)) => assert_eq!(e.to_string(), "nope"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn redeem_folds_both_channels() {
        let runtime = Runtime::try_current().unwrap();
        let failed = Io::<u8>::raise_error(generic_error!("nope")).redeem(|e| e.to_string(), |v| v.to_string());
        let succeeded = Io::pure(4u8).redeem(|e| e.to_string(), |v| v.to_string());

        let outcome = runtime.run(failed.both(succeeded)).await;
        match outcome {
            Outcome::Succeeded((failed, succeeded)) => {
                assert_eq!(failed, "nope");
                assert_eq!(succeeded, "4");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::<u8>::delay(|| panic!("exploded"));
        match runtime.run(program).await {
            Outcome::Errored(e) => match e.downcast_ref::<FiberError>() {
                Some(FiberError::Panicked { message }) => assert_eq!(message, "exploded"),
                other => panic!("unexpected error: {:?}", other),
            },
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn async_callback_from_another_task() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::async_(|callback: Callback<&'static str>| {
            tokio::spawn(async move { callback.succeed("done") });
            None
        });
        assert!(matches!(runtime.run(program).await, Outcome::Succeeded("done")));
    }

    #[tokio::test]
    async fn async_synchronous_callback() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::async_(|callback: Callback<u8>| {
            callback.fail(generic_error!("refused"));
            None
        });
        match runtime.run(program).await {
            Outcome::Errored(e) => assert_eq!(e.to_string(), "refused"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn guarantee_runs_on_success_and_error() {
        let runtime = Runtime::try_current().unwrap();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        let ok = Io::pure(1).guarantee(Io::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(runtime.run(ok).await.is_succeeded());

        let counter = Arc::clone(&runs);
        let failed = Io::<u8>::raise_error(generic_error!("boom")).guarantee(Io::delay(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(runtime.run(failed).await.is_errored());

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn guarantee_case_keeps_original_error() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::<u8>::raise_error(generic_error!("use failed"))
            .guarantee_case(|case| {
                assert!(case.is_errored());
                Io::raise_error(generic_error!("release failed"))
            });

        match runtime.run(program).await {
            Outcome::Errored(e) => {
                assert_eq!(e.as_generic().to_string(), "use failed");
                assert_eq!(e.suppressed().len(), 1);
                assert_eq!(e.suppressed()[0].to_string(), "release failed");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn on_error_reraises() {
        let runtime = Runtime::try_current().unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let program = Io::<u8>::raise_error(generic_error!("broken")).on_error(move |e| {
            Io::delay(move || {
                *sink.lock().unwrap() = Some(e.to_string());
            })
        });

        assert!(runtime.run(program).await.is_errored());
        assert_eq!(seen.lock().unwrap().as_deref(), Some("broken"));
    }

    #[tokio::test]
    async fn canceled_inside_uncancelable_completes_region() {
        let runtime = Runtime::try_current().unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);

        let program = Io::uncancelable(move |_| {
            Io::canceled().then(Io::delay(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
        })
        .then(Io::pure(7));

        assert!(runtime.run(program).await.is_canceled());
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fiber_id_is_stable_within_a_fiber() {
        let runtime = Runtime::try_current().unwrap();
        let program = Io::fiber_id().flat_map(|first| Io::cede().then(Io::fiber_id()).map(move |second| (first, second)));
        match runtime.run(program).await {
            Outcome::Succeeded((first, second)) => assert_eq!(first, second),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
