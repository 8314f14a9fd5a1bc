use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use slab::Slab;
use snafu::Snafu;
use tracing::{debug, debug_span, Span};

use crate::{
    runtime::{Runtime, Suspension},
    sync::lock,
    trace::FiberTrace,
    Callback, EffectError, Io, Outcome,
};

static FIBER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Fiber error.
#[derive(Debug, Snafu)]
pub enum FiberError {
    /// The fiber was canceled.
    #[snafu(display("Fiber was canceled."))]
    Canceled,

    /// The fiber's outcome was already handed out.
    #[snafu(display("Fiber outcome was already taken."))]
    OutcomeTaken,

    /// User code panicked while the fiber was evaluating it.
    #[snafu(display("Effect panicked: {}", message))]
    Panicked {
        /// The panic message.
        message: String,
    },

    /// The fiber was dropped before it terminated, usually because the scheduler driving it shut down.
    #[snafu(display("Fiber was dropped before it terminated."))]
    Abandoned,
}

/// A fiber identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FiberId(u64);

impl FiberId {
    fn next() -> Self {
        Self(FIBER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the numeric value of the identifier.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State shared between a fiber's run-loop and everyone holding a handle to it.
pub(crate) struct FiberCore {
    id: FiberId,
    runtime: Runtime,
    span: Span,
    cancel_requested: AtomicBool,
    suspension: Mutex<Weak<Suspension>>,
}

impl FiberCore {
    pub(crate) fn new(runtime: Runtime) -> Self {
        let id = FiberId::next();
        Self {
            id,
            runtime,
            span: debug_span!("fiber", fiber_id = id.0),
            cancel_requested: AtomicBool::new(false),
            suspension: Mutex::new(Weak::new()),
        }
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn span(&self) -> &Span {
        &self.span
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Records a cancellation request without trying to interrupt a suspended run-loop.
    pub(crate) fn mark_canceled(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_suspension(&self, suspension: &Arc<Suspension>) {
        *lock(&self.suspension) = Arc::downgrade(suspension);
    }

    pub(crate) fn clear_suspension(&self) {
        *lock(&self.suspension) = Weak::new();
    }

    /// Requests cancellation of the fiber.
    ///
    /// If the fiber is parked at a cancelable asynchronous boundary, its run-loop is taken back from the boundary and
    /// rescheduled to run its finalizers. Otherwise, the request is observed at the next interruption point.
    pub(crate) fn request_cancel(&self) {
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let suspension = lock(&self.suspension).upgrade();
        let Some(suspension) = suspension else {
            return;
        };
        if !suspension.is_cancelable() {
            return;
        }

        if let Some(run_loop) = suspension.take_run_loop() {
            self.clear_suspension();
            debug!(fiber_id = %self.id, "Interrupting suspended fiber.");

            let cancel_action = suspension.cancel_token().cancel_node();
            self.runtime
                .scheduler()
                .execute(Box::new(move || run_loop.resume_canceled(cancel_action)));
        }
    }
}

type Waiter<A> = Box<dyn FnOnce(Option<&Outcome<A>>) + Send>;

enum SlotState<A> {
    Pending(Slab<Waiter<A>>),
    Done(Option<Outcome<A>>),
}

/// Holds the outcome of a fiber once it terminates, and the waiters registered before that.
pub(crate) struct OutcomeSlot<A> {
    state: Mutex<SlotState<A>>,
    trace: Mutex<Option<FiberTrace>>,
}

impl<A> OutcomeSlot<A> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending(Slab::new())),
            trace: Mutex::new(None),
        }
    }

    /// Stores the outcome and notifies every waiter.
    ///
    /// Waiters run while the slot is locked, so they must not call back into it.
    pub(crate) fn complete(&self, outcome: Outcome<A>, trace: Option<FiberTrace>) {
        *lock(&self.trace) = trace;

        let mut state = lock(&self.state);
        let waiters = match std::mem::replace(&mut *state, SlotState::Done(Some(outcome))) {
            SlotState::Pending(waiters) => waiters,
            done => {
                *state = done;
                return;
            }
        };

        let outcome = match &*state {
            SlotState::Done(outcome) => outcome.as_ref(),
            SlotState::Pending(_) => None,
        };
        for (_, waiter) in waiters {
            waiter(outcome);
        }
    }

    /// Registers a waiter, returning its key, or runs it immediately if the outcome is already available.
    fn register(&self, waiter: Waiter<A>) -> Option<usize> {
        let mut state = lock(&self.state);
        match &mut *state {
            SlotState::Pending(waiters) => Some(waiters.insert(waiter)),
            SlotState::Done(outcome) => {
                waiter(outcome.as_ref());
                None
            }
        }
    }

    fn deregister(&self, key: usize) {
        if let SlotState::Pending(waiters) = &mut *lock(&self.state) {
            waiters.try_remove(key);
        }
    }

    fn is_done(&self) -> bool {
        matches!(&*lock(&self.state), SlotState::Done(_))
    }

    fn take(&self) -> Option<Outcome<A>> {
        match &mut *lock(&self.state) {
            SlotState::Done(outcome) => outcome.take(),
            SlotState::Pending(_) => None,
        }
    }

    fn trace(&self) -> Option<FiberTrace> {
        lock(&self.trace).clone()
    }
}

/// A handle to a running fiber.
///
/// Handles are cheap to clone. Dropping every handle does not cancel the fiber: it keeps running until it terminates.
pub struct Fiber<A> {
    core: Arc<FiberCore>,
    slot: Arc<OutcomeSlot<A>>,
}

impl<A> Clone for Fiber<A> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<A> fmt::Debug for Fiber<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.core.id)
            .field("done", &self.slot.is_done())
            .finish()
    }
}

impl<A: Send + 'static> Fiber<A> {
    pub(crate) fn new(core: Arc<FiberCore>, slot: Arc<OutcomeSlot<A>>) -> Self {
        Self { core, slot }
    }

    /// Returns the fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.core.id
    }

    /// Returns `true` if the fiber has terminated.
    pub fn is_done(&self) -> bool {
        self.slot.is_done()
    }

    /// Returns the fiber's execution trace, captured when it terminated.
    ///
    /// Returns `None` while the fiber is running, or if tracing is disabled.
    pub fn trace(&self) -> Option<FiberTrace> {
        self.slot.trace()
    }

    /// Returns an effect which requests cancellation of the fiber and waits for it to terminate.
    ///
    /// If the fiber already terminated, its outcome is left untouched. Canceling is idempotent.
    pub fn cancel(&self) -> Io<()> {
        let core = Arc::clone(&self.core);
        let waiting = self.await_done();
        Io::delay_at(None, move || core.request_cancel()).then(waiting)
    }

    /// Returns an effect which waits for the fiber to terminate and yields its outcome.
    ///
    /// Canceling the joining fiber only stops the wait: the joined fiber keeps running.
    pub fn join(&self) -> Io<Outcome<A>>
    where
        A: Clone,
    {
        self.wait(|outcome| match outcome {
            Some(outcome) => Ok(outcome.clone()),
            None => Err(EffectError::new(FiberError::OutcomeTaken)),
        })
    }

    /// Returns an effect which waits for the fiber to terminate and yields its value.
    ///
    /// A failure of the fiber is raised as-is, and cancellation is raised as [`FiberError::Canceled`].
    pub fn join_with_value(&self) -> Io<A>
    where
        A: Clone,
    {
        self.join().flat_map_at(None, |outcome| match outcome.into_result() {
            Ok(value) => Io::pure_at(None, value),
            Err(e) => Io::raise_error(e),
        })
    }

    /// Waits for the fiber to terminate and moves its outcome out of the slot.
    ///
    /// Only used for fibers whose handle never escapes, such as the winner of a race.
    pub(crate) fn join_taken(&self) -> Io<Outcome<A>> {
        let slot = Arc::clone(&self.slot);
        self.await_done().flat_map_at(None, move |_| match slot.take() {
            Some(outcome) => Io::pure_at(None, outcome),
            None => Io::raise_error(EffectError::new(FiberError::OutcomeTaken)),
        })
    }

    /// Returns an effect which waits for the fiber to terminate.
    pub(crate) fn await_done(&self) -> Io<()> {
        self.wait(|_| Ok(()))
    }

    pub(crate) fn request_cancel(&self) {
        self.core.request_cancel();
    }

    /// Registers a notification for when the fiber terminates.
    pub(crate) fn on_done(&self, notify: Box<dyn FnOnce() + Send>) -> Option<usize> {
        self.slot.register(Box::new(move |_: Option<&Outcome<A>>| notify()))
    }

    pub(crate) fn remove_waiter(&self, key: usize) {
        self.slot.deregister(key);
    }

    fn wait<B, F>(&self, extract: F) -> Io<B>
    where
        B: Send + 'static,
        F: FnOnce(Option<&Outcome<A>>) -> Result<B, EffectError> + Send + 'static,
    {
        let slot = Arc::clone(&self.slot);
        Io::async_at(None, move |callback: Callback<B>| {
            let key = slot.register(Box::new(move |outcome: Option<&Outcome<A>>| {
                callback.complete(extract(outcome))
            }))?;
            Some(Io::delay_at(None, move || slot.deregister(key)))
        })
    }
}
