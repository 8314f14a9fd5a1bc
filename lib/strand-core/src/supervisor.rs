//! Scoped fiber supervision.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use snafu::Snafu;
use strand_common::collections::FastHashMap;
use tracing::debug;

use crate::{EffectError, Fiber, Io, Resource};

static SUPERVISOR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
static SUPERVISION_TOKEN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Supervisor errors.
#[derive(Debug, Snafu)]
pub enum SupervisorError {
    /// The supervisor's scope has exited.
    #[snafu(display("Supervisor {} is closed and cannot supervise new fibers.", supervisor_id))]
    Closed {
        /// The supervisor that rejected the fiber.
        supervisor_id: SupervisorId,
    },
}

/// A supervisor identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SupervisorId(u64);

impl fmt::Display for SupervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one supervised fiber within the registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
struct SupervisionToken(u64);

impl SupervisionToken {
    fn next() -> Self {
        Self(SUPERVISION_TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// The type-erased view of a supervised fiber.
trait SupervisedFiber: Send + Sync {
    fn request_cancel(&self);
    fn await_done(&self) -> Io<()>;
}

impl<A: Send + 'static> SupervisedFiber for Fiber<A> {
    fn request_cancel(&self) {
        Fiber::request_cancel(self);
    }

    fn await_done(&self) -> Io<()> {
        Fiber::await_done(self)
    }
}

type Registry = FastHashMap<SupervisionToken, Arc<dyn SupervisedFiber>>;

struct Inner {
    id: SupervisorId,
    registry: ArcSwap<Registry>,
    closed: AtomicBool,
    await_on_exit: bool,
}

impl Inner {
    fn insert(&self, token: SupervisionToken, fiber: Arc<dyn SupervisedFiber>) {
        self.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            next.insert(token, Arc::clone(&fiber));
            next
        });
    }

    fn remove(&self, token: SupervisionToken) {
        self.registry.rcu(|current| {
            let mut next = Registry::clone(current);
            next.remove(&token);
            next
        });
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Binds the lifecycle of fibers to a scope.
///
/// Fibers started through [`supervise`][Self::supervise] are tracked until they terminate. When the supervisor's scope
/// exits, every fiber still running is canceled, or awaited when the supervisor was created with
/// [`awaiting_scope`][Self::awaiting_scope], and the scope only completes once all of them have terminated.
///
/// Once the scope has exited, the supervisor rejects new fibers with [`SupervisorError::Closed`].
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    fn new(await_on_exit: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: SupervisorId(SUPERVISOR_ID_COUNTER.fetch_add(1, Ordering::Relaxed)),
                registry: ArcSwap::from_pointee(Registry::default()),
                closed: AtomicBool::new(false),
                await_on_exit,
            }),
        }
    }

    /// Returns a scoped supervisor that cancels its remaining fibers when the scope exits.
    pub fn scope() -> Resource<Supervisor> {
        Self::scoped(false)
    }

    /// Returns a scoped supervisor that waits for its remaining fibers to complete when the scope exits.
    pub fn awaiting_scope() -> Resource<Supervisor> {
        Self::scoped(true)
    }

    fn scoped(await_on_exit: bool) -> Resource<Supervisor> {
        Resource::make(Io::delay_at(None, move || Supervisor::new(await_on_exit)), |supervisor| {
            supervisor.finalize()
        })
    }

    /// Returns the supervisor's identifier.
    pub fn id(&self) -> SupervisorId {
        self.inner.id
    }

    /// Returns the number of supervised fibers that have not terminated yet.
    pub fn active_count(&self) -> usize {
        self.inner.registry.load().len()
    }

    /// Returns an effect which starts `io` on a supervised fiber.
    ///
    /// The fiber is registered before the effect completes, and removes itself from the registry when it terminates.
    ///
    /// ## Errors
    ///
    /// If the supervisor's scope has exited, the effect fails with [`SupervisorError::Closed`].
    pub fn supervise<A: Send + 'static>(&self, io: Io<A>) -> Io<Fiber<A>> {
        let inner = Arc::clone(&self.inner);
        Io::uncancelable(move |_| {
            Io::defer(move || {
                if inner.is_closed() {
                    return Io::raise_error(EffectError::new(SupervisorError::Closed {
                        supervisor_id: inner.id,
                    }));
                }

                let token = SupervisionToken::next();
                io.start().flat_map_at(None, move |fiber| {
                    inner.insert(token, Arc::new(fiber.clone()));

                    // Runs at once if the child terminated before it was registered.
                    let remover = Arc::clone(&inner);
                    fiber.on_done(Box::new(move || remover.remove(token)));

                    // The scope may have exited while the child was being registered.
                    if inner.is_closed() {
                        inner.remove(token);
                        return fiber.cancel().map_at(None, move |_| fiber);
                    }

                    Io::pure_at(None, fiber)
                })
            })
        })
    }

    fn finalize(&self) -> Io<()> {
        let inner = Arc::clone(&self.inner);
        Io::defer(move || {
            inner.closed.store(true, Ordering::Release);
            let registry = inner.registry.swap(Arc::new(Registry::default()));
            let fibers = registry.values().cloned().collect::<Vec<_>>();
            debug!(
                supervisor_id = %inner.id,
                active = fibers.len(),
                await_on_exit = inner.await_on_exit,
                "Supervisor scope exiting."
            );

            // Request every cancellation up front so the fibers unwind concurrently.
            if !inner.await_on_exit {
                for fiber in &fibers {
                    fiber.request_cancel();
                }
            }

            Io::par_sequence_discard(fibers.iter().map(|fiber| fiber.await_done()).collect())
        })
    }
}
